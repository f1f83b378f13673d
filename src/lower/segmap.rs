use super::body::{compile_stms, BodyCtx};
use super::constants::{kernel_init, precompute_constants, unflatten, KernelConstants};
use super::error::LowerResult;
use super::results::{group_results, thread_results};
use super::virtualize::{virtualise_groups, Nest};
use super::Lowerer;
use crate::ir::{Exp, NameSource, PrimType, Stmt, VName};
use crate::segop::{Level, PatElem, SegLevel, SegOp, SegSpace, SegVirt};

fn space_dims(space: &SegSpace) -> Vec<(VName, Exp)> {
    space
        .dims
        .iter()
        .map(|(i, d)| (i.clone(), d.to_exp()))
        .collect()
}

/// Gives every point of a thread-level space to one thread, binding the space's indices.
pub(crate) struct ThreadSpace {
    nest: Nest,
    bind: Stmt,
    active: Exp,
}

impl ThreadSpace {
    pub fn new(
        names: &mut NameSource,
        consts: &KernelConstants,
        virt: SegVirt,
        space: &SegSpace,
    ) -> Self {
        let required = space.size().div_up(consts.group_size.clone());
        let (vgid, nest) = virtualise_groups(names, consts, virt, required);
        let gtid = vgid * consts.group_size.clone() + consts.ltid();
        let bind = Stmt::seq(vec![
            Stmt::declare_init(&space.flat, PrimType::I64, gtid),
            unflatten(&space_dims(space), Exp::var(&space.flat)),
        ]);
        let active = match virt {
            SegVirt::FullNoPredicate => Exp::bool(true),
            SegVirt::None | SegVirt::Virtualize => Exp::var(&space.flat).lt(space.size()),
        };
        ThreadSpace { nest, bind, active }
    }

    pub fn wrap(self, body: Stmt) -> Stmt {
        self.nest
            .wrap(Stmt::seq(vec![self.bind, Stmt::when(self.active, body)]))
    }
}

fn level_sizes(level: &SegLevel) -> (Exp, Exp) {
    (level.num_groups.to_exp(), level.group_size.to_exp())
}

pub(crate) fn thread_map(lw: &mut Lowerer, pat: &[PatElem], op: &SegOp) -> LowerResult<()> {
    let (num_groups, group_size) = level_sizes(&op.level);
    let (consts, init) = kernel_init(&mut lw.names, num_groups.clone(), group_size.clone());
    let threads = ThreadSpace::new(&mut lw.names, &consts, op.level.virt, &op.space);
    let mut ctx = BodyCtx::new(&consts, Level::Thread, op.span);
    let body = compile_stms(lw, &mut ctx, &op.body.stms)?;
    let results = thread_results(lw, &ctx, &op.space, pat, &op.body.results)?;
    let code = Stmt::seq(vec![init, threads.wrap(Stmt::seq(vec![body, results]))]);
    lw.emit_kernel("segmap", num_groups, group_size, code)
}

/// A map whose body is executed by whole groups, one group per point of the space.
pub(crate) fn group_map(lw: &mut Lowerer, pat: &[PatElem], op: &SegOp) -> LowerResult<()> {
    let (num_groups, group_size) = level_sizes(&op.level);
    let (consts, init) = kernel_init(&mut lw.names, num_groups.clone(), group_size.clone());
    let env = lw.env();
    let (consts, precomputed) = precompute_constants(&mut lw.names, env, &consts, &op.body.stms);
    let (vgid, nest) = virtualise_groups(&mut lw.names, &consts, op.level.virt, op.space.size());
    let bind = Stmt::seq(vec![
        Stmt::declare_init(&op.space.flat, PrimType::I64, vgid),
        unflatten(&space_dims(&op.space), Exp::var(&op.space.flat)),
    ]);
    let active = match op.level.virt {
        SegVirt::FullNoPredicate => Exp::bool(true),
        SegVirt::None | SegVirt::Virtualize => Exp::var(&op.space.flat).lt(op.space.size()),
    };
    let mut ctx = BodyCtx::new(&consts, Level::Group, op.span);
    let body = compile_stms(lw, &mut ctx, &op.body.stms)?;
    let results = group_results(lw, &ctx, &op.space.index_exps(), pat, &op.body.results)?;
    let code = Stmt::seq(vec![
        init,
        precomputed,
        nest.wrap(Stmt::seq(vec![
            bind,
            Stmt::when(active, Stmt::seq(vec![body, results])),
        ])),
    ]);
    lw.emit_kernel("segmap_intragroup", num_groups, group_size, code)
}
