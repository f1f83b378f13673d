//! Reductions over a whole thread-level space, in two kernels: per-group partial results, then
//! one group folding the partials.

use super::body::{compile_stms, BodyCtx};
use super::constants::{kernel_init, KernelConstants};
use super::error::{LowerError, LowerResult};
use super::reduce::{group_reduce, Layout};
use super::results::thread_results;
use super::{apply_lambda, Lowerer};
use crate::ir::{Exp, Fence, MemRef, NameSource, PrimType, Space, Stmt, VName};
use crate::segop::{KernelResult, Level, PatElem, SegBinOp, SegOp};

/// One private accumulator per operator component.
struct Accumulators(Vec<Vec<VName>>);

impl Accumulators {
    fn new(names: &mut NameSource, ops: &[SegBinOp]) -> Self {
        Accumulators(
            ops.iter()
                .map(|op| op.neutral.iter().map(|_| names.fresh("acc")).collect())
                .collect(),
        )
    }

    fn declare(&self, ops: &[SegBinOp]) -> Stmt {
        let mut code = vec![];
        for (accs, op) in self.0.iter().zip(ops) {
            for ((acc, ty), ne) in accs
                .iter()
                .zip(op.lambda.result_types())
                .zip(&op.neutral)
            {
                code.push(Stmt::declare_init(acc, ty, ne.to_exp()));
            }
        }
        Stmt::seq(code)
    }

    /// `acc = op(acc, value)` for every operator; `values` holds every component in order.
    fn fold(&self, names: &mut NameSource, ops: &[SegBinOp], values: &[Exp]) -> Stmt {
        let mut code = vec![];
        let mut offset = 0;
        for (accs, op) in self.0.iter().zip(ops) {
            let xs: Vec<Exp> = accs.iter().map(Exp::var).collect();
            let ys = &values[offset..offset + accs.len()];
            code.push(apply_lambda(names, &op.lambda, &xs, ys, accs));
            offset += accs.len();
        }
        Stmt::seq(code)
    }
}

/// Combines the accumulators of all threads of the group and lets thread 0 store the
/// results at `dests[index]`.
fn combine_group(
    names: &mut NameSource,
    consts: &KernelConstants,
    ops: &[SegBinOp],
    accs: &Accumulators,
    dests: &[MemRef],
    index: Exp,
) -> Stmt {
    let mut code = vec![];
    let mut dests = dests.iter();
    for (accs, op) in accs.0.iter().zip(ops) {
        let mems: Vec<MemRef> = accs
            .iter()
            .zip(op.lambda.result_types())
            .map(|(_, ty)| MemRef::new(&names.fresh("red_arr"), ty, Space::Local))
            .collect();
        for (mem, acc) in mems.iter().zip(accs) {
            code.push(Stmt::declare_array(
                &mem.name,
                mem.ty,
                consts.group_size.clone(),
                Space::Local,
            ));
            code.push(mem.write(consts.ltid(), Exp::var(acc)));
        }
        code.push(Stmt::barrier(Fence::Local));
        code.push(group_reduce(
            names,
            consts,
            consts.group_size.clone(),
            &op.lambda,
            &mems,
            &Layout::local(),
        ));
        code.push(Stmt::barrier(Fence::Local));
        let mut store = vec![];
        for (mem, dest) in mems.iter().zip(&mut dests) {
            let v = names.fresh("red_res");
            store.push(Stmt::declare(&v, mem.ty));
            store.push(mem.read(&v, Exp::int(0)));
            store.push(dest.write(index.clone(), Exp::var(&v)));
        }
        code.push(Stmt::when(
            consts.ltid().equals(Exp::int(0)),
            Stmt::seq(store),
        ));
    }
    Stmt::seq(code)
}

pub(crate) fn thread_red(
    lw: &mut Lowerer,
    pat: &[PatElem],
    op: &SegOp,
    ops: &[SegBinOp],
) -> LowerResult<()> {
    if op.space.rank() != 1 {
        return Err(LowerError::limitation(
            format!("{}-dimensional segred at thread level", op.space.rank()),
            op.span,
        ));
    }
    if let Some(bad) = ops.iter().find(|o| !o.is_scalar()) {
        return Err(LowerError::limitation(
            "non-scalar reduction operator at thread level",
            bad.lambda.span.or(op.span),
        ));
    }
    let num_red: usize = ops.iter().map(|o| o.lambda.arity()).sum();
    if pat.len() < num_red || op.body.results.len() != pat.len() {
        return Err(LowerError::bug(
            format!(
                "{} results and {} destinations for {} reduction components",
                op.body.results.len(),
                pat.len(),
                num_red
            ),
            "segred",
            op.span,
        ));
    }
    let contributions = op.body.results[..num_red]
        .iter()
        .map(|res| match res {
            KernelResult::Returns(se) => Ok(se.to_exp()),
            _ => Err(LowerError::bug(
                "reduction contribution is not a plain value",
                "segred",
                op.span,
            )),
        })
        .collect::<LowerResult<Vec<Exp>>>()?;
    let dests = pat[..num_red]
        .iter()
        .map(|pe| {
            lw.global_array(&pe.name).map(|a| a.mem).ok_or_else(|| {
                LowerError::bug(format!("unknown array `{}`", pe.name), "segred", op.span)
            })
        })
        .collect::<LowerResult<Vec<MemRef>>>()?;

    let num_groups = op.level.num_groups.to_exp();
    let group_size = op.level.group_size.to_exp();
    let partials: Vec<MemRef> = ops
        .iter()
        .flat_map(|o| o.lambda.result_types())
        .map(|ty| lw.alloc("segred_partials", ty, num_groups.clone()))
        .collect();

    let i64 = PrimType::I64;
    let (consts, init) = kernel_init(&mut lw.names, num_groups.clone(), group_size.clone());
    let accs = Accumulators::new(&mut lw.names, ops);
    let n = op.space.dims[0].1.to_exp();
    let per_thread = lw.names.fresh("elems_per_thread");
    let k = lw.names.fresh("k");
    let point = if ops.iter().all(|o| o.commutative) {
        Exp::var(&k) * consts.num_threads.clone() + consts.gtid()
    } else {
        consts.gtid() * Exp::var(&per_thread) + Exp::var(&k)
    };
    let mut ctx = BodyCtx::new(&consts, Level::Thread, op.span);
    let body = compile_stms(lw, &mut ctx, &op.body.stms)?;
    let mapped = thread_results(
        lw,
        &ctx,
        &op.space,
        &pat[num_red..],
        &op.body.results[num_red..],
    )?;
    let fold = accs.fold(&mut lw.names, ops, &contributions);
    let visit = Stmt::seq(vec![
        Stmt::declare_init(&op.space.flat, i64, point.clone()),
        Stmt::declare_init(&op.space.dims[0].0, i64, Exp::var(&op.space.flat)),
        body,
        mapped,
        fold,
    ]);
    let store = combine_group(&mut lw.names, &consts, ops, &accs, &partials, consts.gid());
    let stage_one = Stmt::seq(vec![
        init,
        accs.declare(ops),
        Stmt::declare_init(&per_thread, i64, n.clone().div_up(consts.num_threads.clone())),
        Stmt::comment(
            "fold this thread's chunk",
            Stmt::for_loop(&k, Exp::var(&per_thread), Stmt::when(point.lt(n), visit)),
        ),
        store,
    ]);
    lw.emit_kernel("segred_stage1", num_groups.clone(), group_size.clone(), stage_one)?;

    let (consts, init) = kernel_init(&mut lw.names, Exp::int(1), group_size.clone());
    let accs = Accumulators::new(&mut lw.names, ops);
    let per_thread = lw.names.fresh("partials_per_thread");
    let k = lw.names.fresh("k");
    let point = consts.ltid() * Exp::var(&per_thread) + Exp::var(&k);
    let mut read = vec![];
    let mut values = vec![];
    for mem in &partials {
        let v = lw.names.fresh("partial");
        read.push(Stmt::declare(&v, mem.ty));
        read.push(mem.read(&v, point.clone()));
        values.push(Exp::var(&v));
    }
    read.push(accs.fold(&mut lw.names, ops, &values));
    let store = combine_group(&mut lw.names, &consts, ops, &accs, &dests, Exp::int(0));
    let stage_two = Stmt::seq(vec![
        init,
        accs.declare(ops),
        Stmt::declare_init(&per_thread, i64, num_groups.clone().div_up(group_size.clone())),
        Stmt::comment(
            "fold this thread's partials",
            Stmt::for_loop(
                &k,
                Exp::var(&per_thread),
                Stmt::when(point.lt(num_groups), Stmt::seq(read)),
            ),
        ),
        store,
    ]);
    lw.emit_kernel("segred_stage2", Exp::int(1), group_size, stage_two)
}
