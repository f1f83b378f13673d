//! Tree reduction across the threads of a group.

use super::constants::KernelConstants;
use super::virtualize::group_chunk_loop;
use crate::ir::{Exp, Fence, MemRef, NameSource, PrimType, Stmt, VName};
use crate::segop::Lambda;

/// Where the elements of a collective operation live.
#[derive(Clone, PartialEq, Debug)]
pub enum Layout {
    /// One scalar per element in local memory, element `e` at `base + e`.
    Local { base: Exp },
    /// `lanes` values per element in global scratch memory. Element `e` of a group is the row
    /// of global thread `group_base + e`; region `r` starts at `r * region_len`.
    Rows { lanes: Exp, region_len: Exp },
}

impl Layout {
    pub fn local() -> Self {
        Layout::Local { base: Exp::int(0) }
    }

    pub fn is_rows(&self) -> bool {
        matches!(self, Layout::Rows { .. })
    }

    pub fn fence(&self) -> Fence {
        match self {
            Layout::Local { .. } => Fence::Local,
            Layout::Rows { .. } => Fence::Global,
        }
    }

    /// Index of lane `lane` of element `e` in `region`. Local layouts have one region and lane.
    pub fn address(&self, consts: &KernelConstants, region: i64, e: Exp, lane: Exp) -> Exp {
        match self {
            Layout::Local { base } => base.clone() + e,
            Layout::Rows { lanes, region_len } => {
                Exp::int(region) * region_len.clone()
                    + (consts.group_base() + e) * lanes.clone()
                    + lane
            }
        }
    }
}

/// A loop over the lanes of a [`Layout`], omitted for scalar layouts.
pub(super) struct Lanes {
    lane_loop: Option<(VName, Exp)>,
}

impl Lanes {
    pub(super) fn new(names: &mut NameSource, layout: &Layout) -> Self {
        let lane_loop = match layout {
            Layout::Local { .. } => None,
            Layout::Rows { lanes, .. } => Some((names.fresh("lane"), lanes.clone())),
        };
        Lanes { lane_loop }
    }

    pub(super) fn lane(&self) -> Exp {
        match &self.lane_loop {
            Some((j, _)) => Exp::var(j),
            None => Exp::int(0),
        }
    }

    pub(super) fn wrap(self, body: Stmt) -> Stmt {
        match self.lane_loop {
            Some((j, lanes)) => Stmt::for_loop(&j, lanes, body),
            None => body,
        }
    }
}

fn view(mem: &MemRef, volatile: bool) -> MemRef {
    if volatile {
        mem.clone().volatile()
    } else {
        mem.clone()
    }
}

/// An element position: region and element index.
pub(super) type Pos = (i64, Exp);

/// `dst = op(left, right)` for every component and lane, or `dst = right` where `keep_right`
/// holds.
#[allow(clippy::too_many_arguments)]
pub(super) fn combine(
    names: &mut NameSource,
    consts: &KernelConstants,
    lam: &Lambda,
    mems: &[MemRef],
    layout: &Layout,
    dst: Pos,
    left: Pos,
    right: Pos,
    keep_right: Option<Exp>,
    volatile: bool,
) -> Stmt {
    let lanes = Lanes::new(names, layout);
    let lane = lanes.lane();
    let mut code = vec![];
    let mut xs = vec![];
    let mut ys = vec![];
    for (mem, param) in mems.iter().zip(lam.x_params()) {
        let mem = view(mem, volatile);
        let x = names.fresh("x");
        let y = names.fresh("y");
        code.push(Stmt::declare(&x, param.ty));
        code.push(mem.read(&x, layout.address(consts, left.0, left.1.clone(), lane.clone())));
        code.push(Stmt::declare(&y, param.ty));
        code.push(mem.read(&y, layout.address(consts, right.0, right.1.clone(), lane.clone())));
        xs.push(Exp::var(&x));
        ys.push(Exp::var(&y));
    }
    let results = lam.apply(&xs, &ys);
    for ((mem, res), y) in mems.iter().zip(results).zip(&ys) {
        let value = match &keep_right {
            Some(keep) => Exp::select(keep.clone(), y.clone(), res),
            None => res,
        };
        let index = layout.address(consts, dst.0, dst.1.clone(), lane.clone());
        code.push(view(mem, volatile).write(index, value));
    }
    lanes.wrap(Stmt::seq(code))
}

/// `dst = src` for every component and lane.
pub(super) fn copy_element(
    names: &mut NameSource,
    consts: &KernelConstants,
    lam: &Lambda,
    mems: &[MemRef],
    layout: &Layout,
    dst: Pos,
    src: Pos,
) -> Stmt {
    let lanes = Lanes::new(names, layout);
    let lane = lanes.lane();
    let volatile = layout.is_rows();
    let mut code = vec![];
    for (mem, param) in mems.iter().zip(lam.x_params()) {
        let mem = view(mem, volatile);
        let v = names.fresh("v");
        code.push(Stmt::declare(&v, param.ty));
        code.push(mem.read(&v, layout.address(consts, src.0, src.1.clone(), lane.clone())));
        code.push(mem.write(
            layout.address(consts, dst.0, dst.1.clone(), lane.clone()),
            Exp::var(&v),
        ));
    }
    lanes.wrap(Stmt::seq(code))
}

fn first_of_pair(id: Exp, stride: Exp) -> Exp {
    (id & (Exp::int(2) * stride - Exp::int(1))).equals(Exp::int(0))
}

/// Reduces the first `w` elements of `mems` into element 0.
///
/// Every element must have been written, and made visible by a barrier, before this runs.
/// `w` must not exceed the group size. Within a wave the doubling steps run without barriers;
/// across waves every step starts with one. A lockstep width of 0 is treated as 1.
pub fn group_reduce(
    names: &mut NameSource,
    consts: &KernelConstants,
    w: Exp,
    lam: &Lambda,
    mems: &[MemRef],
    layout: &Layout,
) -> Stmt {
    let wave = names.fresh("wave");
    let wave_id = names.fresh("wave_id");
    let in_wave_id = names.fresh("in_wave_id");
    let num_waves = names.fresh("num_waves");
    let offset = names.fresh("offset");
    let skip_waves = names.fresh("skip_waves");

    let ltid = consts.ltid();
    let off = Exp::var(&offset);
    let partner = (0, ltid.clone() + off.clone());
    let arg_in_bounds = (ltid.clone() + off.clone()).lt(w);
    let own = (0, ltid.clone());
    let in_wave_step = combine(
        names,
        consts,
        lam,
        mems,
        layout,
        own.clone(),
        own.clone(),
        partner.clone(),
        None,
        true,
    );
    let cross_wave_step = combine(
        names,
        consts,
        lam,
        mems,
        layout,
        own.clone(),
        own,
        partner,
        None,
        layout.is_rows(),
    );

    let i64 = PrimType::I64;
    let in_wave = Stmt::while_loop(
        off.clone().lt(Exp::var(&wave)),
        Stmt::seq(vec![
            Stmt::when(
                arg_in_bounds
                    .clone()
                    .and(first_of_pair(Exp::var(&in_wave_id), off.clone())),
                in_wave_step,
            ),
            Stmt::set(&offset, off.clone() * Exp::int(2)),
        ]),
    );
    let cross_wave = Stmt::while_loop(
        Exp::var(&skip_waves).lt(Exp::var(&num_waves)),
        Stmt::seq(vec![
            Stmt::barrier(layout.fence()),
            Stmt::set(&offset, Exp::var(&skip_waves) * Exp::var(&wave)),
            Stmt::when(
                arg_in_bounds
                    .and(Exp::var(&in_wave_id).equals(Exp::int(0)))
                    .and(first_of_pair(Exp::var(&wave_id), Exp::var(&skip_waves))),
                cross_wave_step,
            ),
            Stmt::set(&skip_waves, Exp::var(&skip_waves) * Exp::int(2)),
        ]),
    );
    Stmt::comment(
        "group reduction",
        Stmt::seq(vec![
            Stmt::declare_init(&wave, i64, consts.wave_size().maximum(Exp::int(1))),
            Stmt::declare_init(&wave_id, i64, ltid.clone().quot(Exp::var(&wave))),
            Stmt::declare_init(
                &in_wave_id,
                i64,
                ltid - Exp::var(&wave_id) * Exp::var(&wave),
            ),
            Stmt::declare_init(
                &num_waves,
                i64,
                consts.group_size.clone().div_up(Exp::var(&wave)),
            ),
            Stmt::declare_init(&offset, i64, Exp::int(1)),
            Stmt::declare_init(&skip_waves, i64, Exp::int(1)),
            Stmt::comment("in-wave reductions", in_wave),
            Stmt::comment("cross-wave reductions", cross_wave),
        ]),
    )
}

/// Reduces `w` scalar elements of local memory, `w` possibly larger than the group, into
/// element 0.
///
/// The group reduces one group-sized chunk at a time; thread 0 folds the running result into
/// the first element of the next chunk before it is reduced.
pub fn virtualised_group_reduce(
    names: &mut NameSource,
    consts: &KernelConstants,
    w: Exp,
    lam: &Lambda,
    mems: &[MemRef],
) -> Stmt {
    let (chunk_start, chunk_size, nest) = group_chunk_loop(names, consts, w);
    let whole = Layout::local();
    let carrier = chunk_start
        .clone()
        .gt(Exp::int(0))
        .and(consts.ltid().equals(Exp::int(0)));
    let carry_in = combine(
        names,
        consts,
        lam,
        mems,
        &whole,
        (0, chunk_start.clone()),
        (0, Exp::int(0)),
        (0, chunk_start.clone()),
        None,
        false,
    );
    let chunk = Layout::Local {
        base: chunk_start.clone(),
    };
    let reduce = group_reduce(names, consts, chunk_size, lam, mems, &chunk);
    let carry_out = copy_element(
        names,
        consts,
        lam,
        mems,
        &whole,
        (0, Exp::int(0)),
        (0, chunk_start),
    );
    nest.wrap(Stmt::seq(vec![
        Stmt::comment("possibly incorporate carry", Stmt::when(carrier.clone(), carry_in)),
        Stmt::barrier(Fence::Local),
        reduce,
        Stmt::barrier(Fence::Local),
        Stmt::when(carrier, carry_out),
        Stmt::barrier(Fence::Local),
    ]))
}
