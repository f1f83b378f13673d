use super::atomic::{atomic_update, select_strategy, Locking};
use super::body::{compile_stms, in_bounds, BodyCtx};
use super::builtin;
use super::constants::kernel_init;
use super::error::{LowerError, LowerResult};
use super::results::thread_results;
use super::segmap::ThreadSpace;
use super::Lowerer;
use crate::ir::{Exp, MemRef, PrimType, Stmt};
use crate::segop::{exps, HistOp, KernelResult, Level, PatElem, SegOp, SegSpace};
use tracing::trace;

fn plain_results(results: &[KernelResult], op: &SegOp) -> LowerResult<Vec<Exp>> {
    results
        .iter()
        .map(|res| match res {
            KernelResult::Returns(se) => Ok(se.to_exp()),
            _ => Err(LowerError::bug(
                "histogram bucket or value is not a plain value",
                "seghist",
                op.span,
            )),
        })
        .collect()
}

/// Bucket coordinates of one update: the outer space indices, then the computed bin.
pub(super) fn coordinates(
    space: &SegSpace,
    hist: &HistOp,
    bin: Exp,
    op: &SegOp,
) -> LowerResult<Vec<Exp>> {
    let outer = hist.extra_shape.len();
    if outer + 1 > space.rank().max(1) {
        return Err(LowerError::bug(
            format!(
                "histogram of rank {} in a {}-dimensional space",
                outer + 1,
                space.rank()
            ),
            "seghist",
            op.span,
        ));
    }
    let mut coords: Vec<Exp> = space.index_exps()[..outer].to_vec();
    coords.push(bin.convert(PrimType::I64));
    Ok(coords)
}

pub(crate) fn thread_hist(
    lw: &mut Lowerer,
    pat: &[PatElem],
    op: &SegOp,
    hists: &[HistOp],
) -> LowerResult<()> {
    let num_buckets = hists.len();
    let num_values: usize = hists.iter().map(|h| h.lambda.arity()).sum();
    if op.body.results.len() < num_buckets + num_values
        || pat.len() + num_buckets != op.body.results.len()
    {
        return Err(LowerError::bug(
            format!(
                "{} results and {} destinations for {} histograms of {} components",
                op.body.results.len(),
                pat.len(),
                num_buckets,
                num_values
            ),
            "seghist",
            op.span,
        ));
    }
    let buckets = plain_results(&op.body.results[..num_buckets], op)?;
    let values = plain_results(&op.body.results[num_buckets..num_buckets + num_values], op)?;

    let updates: Vec<_> = hists
        .iter()
        .map(|h| select_strategy(&lw.config().atomics, &h.lambda))
        .collect();
    let locking = if updates.iter().any(|u| u.needs_locks()) {
        let largest = hists
            .iter()
            .zip(&updates)
            .filter(|(_, u)| u.needs_locks())
            .map(|(h, _)| Exp::product(exps(&h.dest_shape())))
            .reduce(Exp::maximum)
            .unwrap_or_else(|| Exp::int(1));
        let num_locks = largest.minimum(Exp::int(lw.config().max_locks));
        let locks = lw.alloc("hist_locks", PrimType::I32, num_locks.clone());
        trace!(locks = %locks.name, num_locks = %num_locks, "histogram needs a lock array");
        Some(Locking::new(locks, num_locks))
    } else {
        None
    };

    let mut dests: Vec<Vec<MemRef>> = vec![];
    let mut offset = 0;
    for hist in hists {
        let arity = hist.lambda.arity();
        if hist.dests.len() != arity {
            return Err(LowerError::bug(
                format!(
                    "histogram with {} destinations for an operator of arity {}",
                    hist.dests.len(),
                    arity
                ),
                "seghist",
                hist.lambda.span.or(op.span),
            ));
        }
        let mut mems = vec![];
        for (pe, initial) in pat[offset..offset + arity].iter().zip(&hist.dests) {
            if &pe.name != initial {
                builtin::copy(lw, &pe.name, initial)?;
            }
            let info = lw.global_array(&pe.name).ok_or_else(|| {
                LowerError::bug(format!("unknown array `{}`", pe.name), "seghist", op.span)
            })?;
            mems.push(info.mem);
        }
        dests.push(mems);
        offset += arity;
    }
    if let Some(locking) = &locking {
        builtin::replicate_mem(
            lw,
            locking.locks.clone(),
            locking.num_locks.clone(),
            Exp::i32(locking.unlocked),
        )?;
    }

    let num_groups = op.level.num_groups.to_exp();
    let group_size = op.level.group_size.to_exp();
    let (consts, init) = kernel_init(&mut lw.names, num_groups.clone(), group_size.clone());
    let threads = ThreadSpace::new(&mut lw.names, &consts, op.level.virt, &op.space);
    let mut ctx = BodyCtx::new(&consts, Level::Thread, op.span);
    let body = compile_stms(lw, &mut ctx, &op.body.stms)?;

    let mut code = vec![body];
    let mut offset = 0;
    for (((hist, update), mems), bin) in hists.iter().zip(&updates).zip(&dests).zip(buckets) {
        let arity = hist.lambda.arity();
        let shape = exps(&hist.dest_shape());
        let coords = coordinates(&op.space, hist, bin, op)?;
        let index = Exp::flatten_index(&shape, &coords);
        let update = atomic_update(
            &mut lw.names,
            update,
            &hist.lambda,
            locking.as_ref(),
            mems,
            index,
            &values[offset..offset + arity],
        )?;
        code.push(Stmt::when(in_bounds(&shape, &coords), update));
        offset += arity;
    }
    code.push(thread_results(
        lw,
        &ctx,
        &op.space,
        &pat[num_values..],
        &op.body.results[num_buckets + num_values..],
    )?);
    let code = Stmt::seq(vec![init, threads.wrap(Stmt::seq(code))]);
    lw.emit_kernel("seghist", num_groups, group_size, code)
}
