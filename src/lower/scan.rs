//! Inclusive prefix scans across the threads of a group.
//!
//! The group is split into blocks of [`SCAN_BLOCK_SIZE`] threads. Blocks scan themselves, the
//! last thread of every block publishes the block total, the first block scans those totals,
//! and every other block folds in the total of its predecessors.

use super::apply_lambda;
use super::constants::KernelConstants;
use super::reduce::{combine, copy_element, Layout};
use super::virtualize::group_chunk_loop;
use crate::ir::{Exp, Fence, MemRef, NameSource, PrimType, Stmt, VName};
use crate::segop::Lambda;

/// At least the square root of the largest group size of any supported device, so one level of
/// carry propagation suffices.
pub const SCAN_BLOCK_SIZE: i64 = 32;

/// Whether a segment boundary lies strictly between two element indices.
pub type SegFlag<'a> = &'a dyn Fn(Exp, Exp) -> Exp;

/// The segment predicate of a flattened space whose innermost dimension has `segment_size`
/// elements.
pub fn crosses_segment(segment_size: Exp) -> impl Fn(Exp, Exp) -> Exp {
    move |from: Exp, to: Exp| (to.clone() - from).gt(to.rem(segment_size.clone()))
}

struct BlockIds {
    block_id: VName,
    in_block_id: VName,
    in_bounds: VName,
}

impl BlockIds {
    fn declare(names: &mut NameSource, consts: &KernelConstants, w: Exp) -> (Self, Stmt) {
        let ids = BlockIds {
            block_id: names.fresh("block_id"),
            in_block_id: names.fresh("in_block_id"),
            in_bounds: names.fresh("ltid_in_bounds"),
        };
        let b = Exp::int(SCAN_BLOCK_SIZE);
        let code = Stmt::seq(vec![
            Stmt::declare_init(&ids.block_id, PrimType::I64, consts.ltid().quot(b.clone())),
            Stmt::declare_init(
                &ids.in_block_id,
                PrimType::I64,
                consts.ltid() - Exp::var(&ids.block_id) * b,
            ),
            Stmt::declare_init(&ids.in_bounds, PrimType::Bool, consts.ltid().lt(w)),
        ]);
        (ids, code)
    }

    fn block_id(&self) -> Exp {
        Exp::var(&self.block_id)
    }

    fn in_block_id(&self) -> Exp {
        Exp::var(&self.in_block_id)
    }

    fn in_bounds(&self) -> Exp {
        Exp::var(&self.in_bounds)
    }

    fn is_first_block(&self) -> Exp {
        self.block_id().equals(Exp::int(0))
    }

    fn is_last_in_block(&self) -> Exp {
        self.in_block_id().equals(Exp::int(SCAN_BLOCK_SIZE - 1))
    }
}

/// Scans the first `w` elements of `mems` in place. `w` must not exceed the group size.
///
/// Finishes with a barrier.
#[allow(clippy::too_many_arguments)]
pub fn group_scan(
    names: &mut NameSource,
    consts: &KernelConstants,
    seg_flag: Option<SegFlag<'_>>,
    w: Exp,
    lam: &Lambda,
    mems: &[MemRef],
    layout: &Layout,
) -> Stmt {
    let code = match layout {
        Layout::Local { .. } => register_scan(names, consts, seg_flag, w, lam, mems, layout),
        Layout::Rows { .. } => rows_scan(names, consts, seg_flag, w, lam, mems, layout),
    };
    Stmt::comment("group scan", code)
}

/// Scans `w` scalar elements of local memory, `w` possibly larger than the group, one
/// group-sized chunk at a time.
pub fn virtualised_group_scan(
    names: &mut NameSource,
    consts: &KernelConstants,
    seg_flag: Option<SegFlag<'_>>,
    w: Exp,
    lam: &Lambda,
    mems: &[MemRef],
) -> Stmt {
    let (chunk_start, chunk_size, nest) = group_chunk_loop(names, consts, w);
    let prev = chunk_start.clone() - Exp::int(1);
    let crosses = match seg_flag {
        Some(flag) => flag(prev.clone(), chunk_start.clone()),
        None => Exp::bool(false),
    };
    let carrier = chunk_start
        .clone()
        .gt(Exp::int(0))
        .and(consts.ltid().equals(Exp::int(0)))
        .and(crosses.not());
    let carry_in = combine(
        names,
        consts,
        lam,
        mems,
        &Layout::local(),
        (0, chunk_start.clone()),
        (0, prev),
        (0, chunk_start.clone()),
        None,
        false,
    );
    let shifted = seg_flag.map(|flag| {
        let start = chunk_start.clone();
        move |from: Exp, to: Exp| flag(from + start.clone(), to + start.clone())
    });
    let shifted_flag = shifted.as_ref().map(|f| f as SegFlag<'_>);
    let chunk = Layout::Local {
        base: chunk_start.clone(),
    };
    let scan = group_scan(names, consts, shifted_flag, chunk_size, lam, mems, &chunk);
    nest.wrap(Stmt::seq(vec![
        Stmt::comment("possibly incorporate carry", Stmt::when(carrier, carry_in)),
        Stmt::barrier(Fence::Local),
        scan,
    ]))
}

fn declare_all(vars: &[VName], tys: &[PrimType]) -> Stmt {
    Stmt::seq(
        vars.iter()
            .zip(tys)
            .map(|(v, ty)| Stmt::declare(v, *ty))
            .collect(),
    )
}

fn set_all(dests: &[VName], srcs: &[VName]) -> Stmt {
    Stmt::seq(
        dests
            .iter()
            .zip(srcs)
            .map(|(d, s)| Stmt::set(d, Exp::var(s)))
            .collect(),
    )
}

fn vars(names: &[VName]) -> Vec<Exp> {
    names.iter().map(Exp::var).collect()
}

/// In-block scan of register-held values; returns the code and the variables that hold each
/// thread's scanned value afterwards.
///
/// When a whole block runs in one wave the steps need no barriers.
#[allow(clippy::too_many_arguments)]
fn in_block_register_scan(
    names: &mut NameSource,
    consts: &KernelConstants,
    seg_flag: Option<SegFlag<'_>>,
    lam: &Lambda,
    mems: &[MemRef],
    base: &Exp,
    ids: &BlockIds,
    active: Exp,
) -> (Stmt, Vec<VName>) {
    let tys = lam.result_types();
    let xs: Vec<VName> = tys.iter().map(|_| names.fresh("x")).collect();
    let ys: Vec<VName> = tys.iter().map(|_| names.fresh("y")).collect();
    let skip = names.fresh("skip_threads");
    let inactive = names.fresh("inactive");
    let mems: Vec<MemRef> = mems.iter().map(|m| m.clone().volatile()).collect();
    let ltid = consts.ltid();
    let skip_e = Exp::var(&skip);

    let read_initial = Stmt::when(
        active.clone(),
        Stmt::seq(vec![
            Stmt::seq(
                mems.iter()
                    .zip(&ys)
                    .map(|(m, y)| m.read(y, base.clone() + ltid.clone()))
                    .collect(),
            ),
            Stmt::when(ids.in_block_id().equals(Exp::int(0)), set_all(&xs, &ys)),
        ]),
    );

    let thread_active = skip_e.clone().le(ids.in_block_id()).and(active);
    // a block shares one wave only if the wave is at least a block wide
    let maybe_barrier = Stmt::when(
        consts.wave_size().lt(Exp::int(SCAN_BLOCK_SIZE)),
        Stmt::barrier(Fence::Local),
    );
    let read_operands = Stmt::when(
        thread_active.clone(),
        Stmt::seq(
            mems.iter()
                .zip(&xs)
                .map(|(m, x)| m.read(x, base.clone() + ltid.clone() - skip_e.clone()))
                .collect(),
        ),
    );
    let apply = apply_lambda(names, lam, &vars(&xs), &vars(&ys), &xs);
    let op_to_x = match seg_flag {
        None => Stmt::when(thread_active.clone(), apply),
        Some(flag) => Stmt::seq(vec![
            Stmt::set(
                &inactive,
                thread_active
                    .clone()
                    .and(flag(ltid.clone() - skip_e.clone(), ltid.clone())),
            ),
            Stmt::when(Exp::var(&inactive), set_all(&xs, &ys)),
            Stmt::when(
                thread_active.clone().and(Exp::var(&inactive).not()),
                apply,
            ),
        ]),
    };
    let write_result = Stmt::when(
        thread_active,
        Stmt::seq(vec![
            Stmt::seq(
                mems.iter()
                    .zip(&xs)
                    .map(|(m, x)| m.write(base.clone() + ltid.clone(), Exp::var(x)))
                    .collect(),
            ),
            set_all(&ys, &xs),
        ]),
    );

    let code = Stmt::seq(vec![
        declare_all(&xs, &tys),
        declare_all(&ys, &tys),
        Stmt::declare(&skip, PrimType::I64),
        Stmt::declare(&inactive, PrimType::Bool),
        Stmt::comment("read input for in-block scan", read_initial),
        Stmt::set(&skip, Exp::int(1)),
        Stmt::comment(
            "in-block scan",
            Stmt::while_loop(
                skip_e.clone().lt(Exp::int(SCAN_BLOCK_SIZE)),
                Stmt::seq(vec![
                    read_operands,
                    maybe_barrier.clone(),
                    op_to_x,
                    maybe_barrier.clone(),
                    write_result,
                    maybe_barrier,
                    Stmt::set(&skip, skip_e * Exp::int(2)),
                ]),
            ),
        ),
    ]);
    (code, xs)
}

fn register_scan(
    names: &mut NameSource,
    consts: &KernelConstants,
    seg_flag: Option<SegFlag<'_>>,
    w: Exp,
    lam: &Lambda,
    mems: &[MemRef],
    layout: &Layout,
) -> Stmt {
    let base = match layout {
        Layout::Local { base } => base.clone(),
        Layout::Rows { .. } => Exp::int(0),
    };
    let ltid = consts.ltid();
    let b = Exp::int(SCAN_BLOCK_SIZE);
    let (ids, ids_code) = BlockIds::declare(names, consts, w);
    let volatile: Vec<MemRef> = mems.iter().map(|m| m.clone().volatile()).collect();

    let (block_scan, xs) =
        in_block_register_scan(names, consts, seg_flag, lam, mems, &base, &ids, ids.in_bounds());

    let publish = Stmt::when(
        ids.is_last_in_block().and(ids.in_bounds()),
        Stmt::seq(
            volatile
                .iter()
                .zip(&xs)
                .map(|(m, x)| m.write(base.clone() + ids.block_id(), Exp::var(x)))
                .collect(),
        ),
    );

    let carry_flag = seg_flag.map(|flag| {
        let b = b.clone();
        move |from: Exp, to: Exp| {
            flag(
                from * b.clone() + b.clone() - Exp::int(1),
                to * b.clone() + b.clone() - Exp::int(1),
            )
        }
    });
    let carry_flag = carry_flag.as_ref().map(|f| f as SegFlag<'_>);
    let (carry_scan, _) = in_block_register_scan(
        names,
        consts,
        carry_flag,
        lam,
        mems,
        &base,
        &ids,
        ids.is_first_block().and(ids.in_bounds()),
    );

    let tys = lam.result_types();
    let own: Vec<VName> = tys.iter().map(|_| names.fresh("own")).collect();
    let no_carry_in = names.fresh("no_carry_in");
    let has_carry = Exp::var(&no_carry_in).not();
    let read_carry_in = Stmt::when(
        has_carry.clone(),
        Stmt::seq(vec![
            set_all(&own, &xs),
            Stmt::seq(
                volatile
                    .iter()
                    .zip(&xs)
                    .map(|(m, x)| m.read(x, base.clone() + ids.block_id() - Exp::int(1)))
                    .collect(),
            ),
        ]),
    );
    let apply = apply_lambda(names, lam, &vars(&xs), &vars(&own), &xs);
    let op_to_x = match seg_flag {
        None => Stmt::when(has_carry.clone(), apply),
        Some(flag) => {
            let inactive = names.fresh("inactive");
            Stmt::seq(vec![
                Stmt::declare_init(
                    &inactive,
                    PrimType::Bool,
                    has_carry
                        .clone()
                        .and(flag(ids.block_id() * b - Exp::int(1), ltid.clone())),
                ),
                Stmt::when(Exp::var(&inactive), set_all(&xs, &own)),
                Stmt::when(has_carry.clone().and(Exp::var(&inactive).not()), apply),
            ])
        }
    };
    let write_back = |mems: &[MemRef]| {
        Stmt::seq(
            mems.iter()
                .zip(&xs)
                .map(|(m, x)| m.write(base.clone() + ltid.clone(), Exp::var(x)))
                .collect(),
        )
    };

    Stmt::seq(vec![
        ids_code,
        block_scan,
        Stmt::barrier(Fence::Local),
        Stmt::comment("last thread of block 'i' writes its result to offset 'i'", publish),
        Stmt::barrier(Fence::Local),
        Stmt::comment(
            "scan the first block, after which offset 'i' contains carry-in for block 'i+1'",
            carry_scan,
        ),
        Stmt::barrier(Fence::Local),
        declare_all(&own, &tys),
        Stmt::declare_init(
            &no_carry_in,
            PrimType::Bool,
            ids.is_first_block().or(ids.in_bounds().not()),
        ),
        Stmt::comment(
            "carry-in for every block except the first",
            Stmt::seq(vec![
                read_carry_in,
                op_to_x,
                Stmt::when(has_carry, write_back(mems)),
            ]),
        ),
        Stmt::barrier(Fence::Local),
        Stmt::comment(
            "restore correct values for first block",
            Stmt::when(
                ids.is_first_block().and(ids.in_bounds()),
                write_back(mems),
            ),
        ),
        Stmt::barrier(Fence::Local),
    ])
}

const MAIN: i64 = 0;
const TEMP: i64 = 1;
const SAVED: i64 = 2;

/// In-block scan of memory-resident rows. Every step stages its results in the temporary
/// region so no thread overwrites an operand another thread has yet to read.
#[allow(clippy::too_many_arguments)]
fn in_block_rows_scan(
    names: &mut NameSource,
    consts: &KernelConstants,
    seg_flag: Option<SegFlag<'_>>,
    lam: &Lambda,
    mems: &[MemRef],
    layout: &Layout,
    ids: &BlockIds,
    active: Exp,
) -> Stmt {
    let skip = names.fresh("skip_threads");
    let skip_e = Exp::var(&skip);
    let ltid = consts.ltid();
    let thread_active = skip_e.clone().le(ids.in_block_id()).and(active);
    let keep_own = seg_flag.map(|flag| flag(ltid.clone() - skip_e.clone(), ltid.clone()));
    let step = combine(
        names,
        consts,
        lam,
        mems,
        layout,
        (TEMP, ltid.clone()),
        (MAIN, ltid.clone() - skip_e.clone()),
        (MAIN, ltid.clone()),
        keep_own,
        true,
    );
    let commit = copy_element(
        names,
        consts,
        lam,
        mems,
        layout,
        (MAIN, ltid.clone()),
        (TEMP, ltid),
    );
    Stmt::seq(vec![
        Stmt::declare_init(&skip, PrimType::I64, Exp::int(1)),
        Stmt::while_loop(
            skip_e.clone().lt(Exp::int(SCAN_BLOCK_SIZE)),
            Stmt::seq(vec![
                Stmt::when(thread_active.clone(), step),
                Stmt::barrier(Fence::Global),
                Stmt::when(thread_active, commit),
                Stmt::barrier(Fence::Global),
                Stmt::set(&skip, skip_e * Exp::int(2)),
            ]),
        ),
    ])
}

/// The scan of non-scalar elements. Values are never held in registers, so the first block is
/// saved before its slots receive the block totals and restored afterwards.
fn rows_scan(
    names: &mut NameSource,
    consts: &KernelConstants,
    seg_flag: Option<SegFlag<'_>>,
    w: Exp,
    lam: &Lambda,
    mems: &[MemRef],
    layout: &Layout,
) -> Stmt {
    let ltid = consts.ltid();
    let b = Exp::int(SCAN_BLOCK_SIZE);
    let (ids, ids_code) = BlockIds::declare(names, consts, w.clone());
    let full_blocks = w.quot(b.clone());

    let block_scan = in_block_rows_scan(
        names,
        consts,
        seg_flag,
        lam,
        mems,
        layout,
        &ids,
        ids.in_bounds(),
    );
    let first_in_bounds = ids.is_first_block().and(ids.in_bounds());
    let save = copy_element(
        names,
        consts,
        lam,
        mems,
        layout,
        (SAVED, ltid.clone()),
        (MAIN, ltid.clone()),
    );
    let publish = copy_element(
        names,
        consts,
        lam,
        mems,
        layout,
        (TEMP, ids.block_id()),
        (MAIN, ltid.clone()),
    );
    let is_carry_slot = ids.is_first_block().and(ltid.clone().lt(full_blocks));
    let gather = copy_element(
        names,
        consts,
        lam,
        mems,
        layout,
        (MAIN, ltid.clone()),
        (TEMP, ltid.clone()),
    );
    let carry_flag = seg_flag.map(|flag| {
        let b = b.clone();
        move |from: Exp, to: Exp| {
            flag(
                from * b.clone() + b.clone() - Exp::int(1),
                to * b.clone() + b.clone() - Exp::int(1),
            )
        }
    });
    let carry_flag = carry_flag.as_ref().map(|f| f as SegFlag<'_>);
    let carry_scan = in_block_rows_scan(
        names,
        consts,
        carry_flag,
        lam,
        mems,
        layout,
        &ids,
        is_carry_slot.clone(),
    );
    let has_carry = ids.is_first_block().not().and(ids.in_bounds());
    let keep_own = seg_flag.map(|flag| flag(ids.block_id() * b - Exp::int(1), ltid.clone()));
    let carry_in = combine(
        names,
        consts,
        lam,
        mems,
        layout,
        (MAIN, ltid.clone()),
        (MAIN, ids.block_id() - Exp::int(1)),
        (MAIN, ltid.clone()),
        keep_own,
        true,
    );
    let restore = copy_element(
        names,
        consts,
        lam,
        mems,
        layout,
        (MAIN, ltid.clone()),
        (SAVED, ltid),
    );

    Stmt::seq(vec![
        ids_code,
        block_scan,
        Stmt::comment(
            "save correct values for first block",
            Stmt::when(first_in_bounds.clone(), save),
        ),
        Stmt::barrier(Fence::Global),
        Stmt::comment(
            "last thread of block 'i' stages its result for offset 'i'",
            Stmt::when(ids.is_last_in_block().and(ids.in_bounds()), publish),
        ),
        Stmt::barrier(Fence::Global),
        Stmt::when(is_carry_slot, gather),
        Stmt::barrier(Fence::Global),
        Stmt::comment(
            "scan the first block, after which offset 'i' contains carry-in for block 'i+1'",
            carry_scan,
        ),
        Stmt::comment(
            "carry-in for every block except the first",
            Stmt::when(has_carry, carry_in),
        ),
        Stmt::barrier(Fence::Global),
        Stmt::comment(
            "restore correct values for first block",
            Stmt::when(first_in_bounds, restore),
        ),
        Stmt::barrier(Fence::Global),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_boundaries_of_rows_of_three() {
        let flag = crosses_segment(Exp::int(3));
        assert_eq!(flag(Exp::int(2), Exp::int(3)), Exp::bool(true));
        assert_eq!(flag(Exp::int(3), Exp::int(5)), Exp::bool(false));
        assert_eq!(flag(Exp::int(0), Exp::int(2)), Exp::bool(false));
        assert_eq!(flag(Exp::int(1), Exp::int(4)), Exp::bool(true));
    }
}
