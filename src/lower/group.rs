//! Operations nested in a group-level body, executed cooperatively by the threads of the group.

use super::atomic::{atomic_update, select_strategy, Locking};
use super::body::{compile_stms, in_bounds, BodyCtx};
use super::constants::KernelConstants;
use super::error::{LowerError, LowerResult};
use super::reduce::{group_reduce, virtualised_group_reduce, Layout};
use super::results::write_value;
use super::scan::{crosses_segment, group_scan, virtualised_group_scan, SegFlag};
use super::seghist::coordinates;
use super::virtualize::{group_cover_space, group_loop};
use super::{ArrayInfo, Lowerer};
use crate::ir::{Exp, Fence, MemRef, PrimType, Space, Stmt, VName};
use crate::segop::{
    exps, HistOp, KernelResult, Level, PatElem, SegBinOp, SegOp, SegOpKind, SegSpace, SegVirt,
    SubExp,
};

/// Destinations of a nested operation: local arrays for shaped elements, per-thread scalars
/// otherwise.
fn declare_outputs(pat: &[PatElem]) -> (Stmt, Vec<(VName, ArrayInfo)>) {
    let mut decls = vec![];
    let mut arrays = vec![];
    for pe in pat {
        if pe.shape.is_empty() {
            decls.push(Stmt::declare(&pe.name, pe.ty));
        } else {
            let shape = exps(&pe.shape);
            decls.push(Stmt::declare_array(
                &pe.name,
                pe.ty,
                Exp::product(shape.clone()),
                Space::Local,
            ));
            let mem = MemRef::new(&pe.name, pe.ty, Space::Local);
            arrays.push((pe.name.clone(), ArrayInfo { mem, shape }));
        }
    }
    (Stmt::seq(decls), arrays)
}

pub(crate) fn compile_group_op(
    lw: &mut Lowerer,
    ctx: &mut BodyCtx,
    pat: &[PatElem],
    op: &SegOp,
) -> LowerResult<Stmt> {
    let name = op.kind.name();
    if op.level.level != Level::Thread {
        return Err(LowerError::bug(
            format!("group-level {} nested in a group body", name),
            name,
            op.span,
        ));
    }
    let (decls, arrays) = declare_outputs(pat);
    ctx.arrays.extend(arrays);
    let ctx: &BodyCtx = ctx;
    let code = match &op.kind {
        SegOpKind::Map => map(lw, ctx, pat, op)?,
        SegOpKind::Scan(ops) => scan(lw, ctx, pat, op, ops)?,
        SegOpKind::Red(ops) => red(lw, ctx, pat, op, ops)?,
        SegOpKind::Hist(hists) => hist(lw, ctx, pat, op, hists)?,
    };
    Ok(Stmt::comment(
        name,
        Stmt::seq(vec![decls, code, Stmt::barrier(Fence::Local)]),
    ))
}

fn output<'c>(ctx: &'c BodyCtx, pe: &PatElem, op: &SegOp) -> LowerResult<&'c ArrayInfo> {
    ctx.arrays.get(&pe.name).ok_or_else(|| {
        LowerError::bug(
            format!(
                "result `{}` of an intra-group {} is not an array",
                pe.name,
                op.kind.name()
            ),
            op.kind.name(),
            op.span,
        )
    })
}

fn plain<'r>(res: &'r KernelResult, op: &SegOp) -> LowerResult<&'r SubExp> {
    match res {
        KernelResult::Returns(se) => Ok(se),
        _ => Err(LowerError::bug(
            "operator contribution is not a plain value",
            op.kind.name(),
            op.span,
        )),
    }
}

/// Writes the mapped results of the current point of `space`.
fn mapped_writes(
    lw: &mut Lowerer,
    inner: &BodyCtx,
    op: &SegOp,
    pat: &[PatElem],
    results: &[KernelResult],
) -> LowerResult<Stmt> {
    let is = op.space.index_exps();
    let mut code = vec![];
    for (pe, res) in pat.iter().zip(results) {
        match res {
            KernelResult::Returns(se) => {
                let dest = output(inner, pe, op)?.clone();
                code.push(write_value(lw, inner, &dest, &is, se)?);
            }
            _ => {
                return Err(LowerError::limitation(
                    format!(
                        "intra-group {} results other than plain values",
                        op.kind.name()
                    ),
                    op.span,
                ))
            }
        }
    }
    Ok(Stmt::seq(code))
}

fn map(lw: &mut Lowerer, ctx: &BodyCtx, pat: &[PatElem], op: &SegOp) -> LowerResult<Stmt> {
    let mut inner = ctx.nested(op.span);
    let body = compile_stms(lw, &mut inner, &op.body.stms)?;
    let writes = mapped_writes(lw, &inner, op, pat, &op.body.results)?;
    let nest = group_cover_space(&mut lw.names, ctx.consts, op.level.virt, &op.space);
    Ok(nest.wrap(Stmt::seq(vec![body, writes])))
}

/// Global scratch memory for a non-scalar operator, addressed by global thread id.
fn scratch(
    lw: &mut Lowerer,
    consts: &KernelConstants,
    sop: &SegBinOp,
    regions: i64,
) -> (Vec<MemRef>, Layout) {
    let lanes = sop.lanes();
    let region_len = consts.num_threads.clone() * lanes.clone();
    let mems = sop
        .lambda
        .result_types()
        .into_iter()
        .map(|ty| lw.alloc("group_scratch", ty, Exp::int(regions) * region_len.clone()))
        .collect();
    (mems, Layout::Rows { lanes, region_len })
}

/// Local memory holding one element per point of the space.
fn local_temps(
    lw: &mut Lowerer,
    sop: &SegBinOp,
    len: &Exp,
    decls: &mut Vec<Stmt>,
) -> Vec<MemRef> {
    sop.lambda
        .result_types()
        .into_iter()
        .map(|ty| {
            let mem = MemRef::new(&lw.names.fresh("red_arr"), ty, Space::Local);
            decls.push(Stmt::declare_array(&mem.name, ty, len.clone(), Space::Local));
            mem
        })
        .collect()
}

/// Stores the contribution `se` of the current point as element `e` of `mem`.
#[allow(clippy::too_many_arguments)]
fn store_contribution(
    lw: &mut Lowerer,
    consts: &KernelConstants,
    inner: &BodyCtx,
    mem: &MemRef,
    layout: &Layout,
    e: Exp,
    se: &SubExp,
    op: &SegOp,
) -> LowerResult<Stmt> {
    match layout {
        Layout::Local { .. } => Ok(mem.write(
            layout.address(consts, 0, e, Exp::int(0)),
            se.to_exp(),
        )),
        Layout::Rows { lanes, .. } => {
            let src = inner.kernel_array(se).cloned().ok_or_else(|| {
                LowerError::bug(
                    "non-scalar operator applied to a scalar contribution",
                    op.kind.name(),
                    op.span,
                )
            })?;
            let j = lw.names.fresh("lane");
            let v = lw.names.fresh("elem");
            Ok(Stmt::for_loop(
                &j,
                lanes.clone(),
                Stmt::seq(vec![
                    Stmt::declare(&v, src.mem.ty),
                    src.mem.read(&v, Exp::var(&j)),
                    mem.write(layout.address(consts, 0, e, Exp::var(&j)), Exp::var(&v)),
                ]),
            ))
        }
    }
}

fn innermost_segments(space: &SegSpace) -> Option<Exp> {
    match space.dims.as_slice() {
        [] | [_] => None,
        [.., (_, inner)] => Some(inner.to_exp()),
    }
}

/// Checks that the pattern and results of a nested scan or reduction cover every operator
/// component, and that every operator has one neutral element per component.
fn check_components(pat: &[PatElem], op: &SegOp, ops: &[SegBinOp]) -> LowerResult<()> {
    let name = op.kind.name();
    if let Some(sop) = ops.iter().find(|sop| sop.neutral.len() != sop.lambda.arity()) {
        return Err(LowerError::bug(
            format!(
                "{} neutral elements for an operator of arity {}",
                sop.neutral.len(),
                sop.lambda.arity()
            ),
            name,
            sop.lambda.span.or(op.span),
        ));
    }
    let components: usize = ops.iter().map(|sop| sop.lambda.arity()).sum();
    if pat.len() < components || op.body.results.len() != pat.len() {
        return Err(LowerError::bug(
            format!(
                "{} results and {} destinations for {} {} components",
                op.body.results.len(),
                pat.len(),
                components,
                name
            ),
            name,
            op.span,
        ));
    }
    Ok(())
}

fn scan(
    lw: &mut Lowerer,
    ctx: &BodyCtx,
    pat: &[PatElem],
    op: &SegOp,
    ops: &[SegBinOp],
) -> LowerResult<Stmt> {
    check_components(pat, op, ops)?;
    let consts = ctx.consts;
    let w = op.space.size();
    let e = Exp::var(&op.space.flat);
    let virtualised = op.level.virt == SegVirt::Virtualize;
    let flag = innermost_segments(&op.space).map(crosses_segment);
    let seg_flag: Option<SegFlag<'_>> = flag.as_ref().map(|f| f as SegFlag<'_>);

    let mut inner = ctx.nested(op.span);
    let body = compile_stms(lw, &mut inner, &op.body.stms)?;
    let mut stores = vec![];
    let mut steps = vec![];
    let mut fence = Fence::Local;
    let mut offset = 0;
    for sop in ops {
        let arity = sop.lambda.arity();
        let outs = &pat[offset..offset + arity];
        let contribs = &op.body.results[offset..offset + arity];
        if sop.is_scalar() {
            let mems = outs
                .iter()
                .map(|pe| output(ctx, pe, op).map(|a| a.mem.clone()))
                .collect::<LowerResult<Vec<_>>>()?;
            let layout = Layout::local();
            for (mem, res) in mems.iter().zip(contribs) {
                let se = plain(res, op)?;
                stores.push(store_contribution(
                    lw, consts, &inner, mem, &layout, e.clone(), se, op,
                )?);
            }
            steps.push(if virtualised {
                virtualised_group_scan(
                    &mut lw.names,
                    consts,
                    seg_flag,
                    w.clone(),
                    &sop.lambda,
                    &mems,
                )
            } else {
                group_scan(
                    &mut lw.names,
                    consts,
                    seg_flag,
                    w.clone(),
                    &sop.lambda,
                    &mems,
                    &layout,
                )
            });
        } else {
            if virtualised {
                return Err(LowerError::limitation(
                    "virtualised intra-group segscan with a non-scalar operator",
                    op.span,
                ));
            }
            fence = Fence::Global;
            let (mems, layout) = scratch(lw, consts, sop, 3);
            for (mem, res) in mems.iter().zip(contribs) {
                let se = plain(res, op)?;
                stores.push(store_contribution(
                    lw, consts, &inner, mem, &layout, e.clone(), se, op,
                )?);
            }
            steps.push(group_scan(
                &mut lw.names,
                consts,
                seg_flag,
                w.clone(),
                &sop.lambda,
                &mems,
                &layout,
            ));
            steps.push(copy_back(lw, consts, &mems, &layout, outs, ctx, op, &w)?);
        }
        offset += arity;
    }
    let mapped = mapped_writes(lw, &inner, op, &pat[offset..], &op.body.results[offset..])?;
    let nest = group_cover_space(&mut lw.names, consts, op.level.virt, &op.space);
    Ok(Stmt::seq(vec![
        nest.wrap(Stmt::seq(vec![body, Stmt::seq(stores), mapped])),
        Stmt::barrier(fence),
        Stmt::seq(steps),
    ]))
}

/// Copies the scanned scratch rows of the first `w` threads into the local destinations.
#[allow(clippy::too_many_arguments)]
fn copy_back(
    lw: &mut Lowerer,
    consts: &KernelConstants,
    mems: &[MemRef],
    layout: &Layout,
    outs: &[PatElem],
    ctx: &BodyCtx,
    op: &SegOp,
    w: &Exp,
) -> LowerResult<Stmt> {
    let lanes = match layout {
        Layout::Rows { lanes, .. } => lanes.clone(),
        Layout::Local { .. } => Exp::int(1),
    };
    let j = lw.names.fresh("lane");
    let mut code = vec![];
    for (mem, pe) in mems.iter().zip(outs) {
        let dest = output(ctx, pe, op)?;
        let v = lw.names.fresh("elem");
        code.push(Stmt::declare(&v, mem.ty));
        code.push(mem.read(&v, layout.address(consts, 0, consts.ltid(), Exp::var(&j))));
        code.push(dest.mem.write(
            consts.ltid() * lanes.clone() + Exp::var(&j),
            Exp::var(&v),
        ));
    }
    Ok(Stmt::when(
        consts.ltid().lt(w.clone()),
        Stmt::for_loop(&j, lanes, Stmt::seq(code)),
    ))
}

fn red(
    lw: &mut Lowerer,
    ctx: &BodyCtx,
    pat: &[PatElem],
    op: &SegOp,
    ops: &[SegBinOp],
) -> LowerResult<Stmt> {
    check_components(pat, op, ops)?;
    let consts = ctx.consts;
    let w = op.space.size();
    let e = Exp::var(&op.space.flat);
    let virtualised = op.level.virt == SegVirt::Virtualize;
    let segment = innermost_segments(&op.space);

    let mut inner = ctx.nested(op.span);
    let body = compile_stms(lw, &mut inner, &op.body.stms)?;
    let mut decls = vec![];
    let mut stores = vec![];
    let mut steps = vec![];
    let mut fence = Fence::Local;
    let mut offset = 0;
    for sop in ops {
        let arity = sop.lambda.arity();
        let outs = &pat[offset..offset + arity];
        let contribs = &op.body.results[offset..offset + arity];
        let (mems, layout) = if sop.is_scalar() {
            (local_temps(lw, sop, &w, &mut decls), Layout::local())
        } else {
            if virtualised {
                return Err(LowerError::limitation(
                    "virtualised intra-group segred with a non-scalar operator",
                    op.span,
                ));
            }
            fence = Fence::Global;
            scratch(lw, consts, sop, if segment.is_some() { 3 } else { 1 })
        };
        for (mem, res) in mems.iter().zip(contribs) {
            let se = plain(res, op)?;
            stores.push(store_contribution(
                lw, consts, &inner, mem, &layout, e.clone(), se, op,
            )?);
        }
        match &segment {
            None => {
                steps.push(if virtualised {
                    virtualised_group_reduce(
                        &mut lw.names,
                        consts,
                        w.clone(),
                        &sop.lambda,
                        &mems,
                    )
                } else {
                    group_reduce(
                        &mut lw.names,
                        consts,
                        w.clone(),
                        &sop.lambda,
                        &mems,
                        &layout,
                    )
                });
                steps.push(Stmt::barrier(layout.fence()));
                steps.push(read_totals(
                    lw,
                    consts,
                    ctx,
                    op,
                    sop,
                    &mems,
                    &layout,
                    outs,
                    Exp::int(1),
                    &|_| Exp::int(0),
                    w.clone().gt(Exp::int(0)),
                )?);
            }
            Some(m) => {
                let flag = crosses_segment(m.clone());
                let seg_flag: SegFlag<'_> = &flag;
                let seg_flag = Some(seg_flag);
                steps.push(if virtualised {
                    virtualised_group_scan(
                        &mut lw.names,
                        consts,
                        seg_flag,
                        w.clone(),
                        &sop.lambda,
                        &mems,
                    )
                } else {
                    group_scan(
                        &mut lw.names,
                        consts,
                        seg_flag,
                        w.clone(),
                        &sop.lambda,
                        &mems,
                        &layout,
                    )
                });
                let outer = op.space.dim_exps()[..op.space.rank() - 1].to_vec();
                let last = |s: Exp| s * m.clone() + m.clone() - Exp::int(1);
                steps.push(read_totals(
                    lw,
                    consts,
                    ctx,
                    op,
                    sop,
                    &mems,
                    &layout,
                    outs,
                    Exp::product(outer),
                    &last,
                    m.clone().gt(Exp::int(0)),
                )?);
            }
        }
        offset += arity;
    }
    let mapped = mapped_writes(lw, &inner, op, &pat[offset..], &op.body.results[offset..])?;
    let nest = group_cover_space(&mut lw.names, consts, op.level.virt, &op.space);
    Ok(Stmt::seq(vec![
        Stmt::seq(decls),
        nest.wrap(Stmt::seq(vec![body, Stmt::seq(stores), mapped])),
        Stmt::barrier(fence),
        Stmt::seq(steps),
    ]))
}

/// Reads `count` totals out of the temporaries; total `s` is element `position(s)`, or the
/// neutral element unless `nonempty` holds.
#[allow(clippy::too_many_arguments)]
fn read_totals(
    lw: &mut Lowerer,
    consts: &KernelConstants,
    ctx: &BodyCtx,
    op: &SegOp,
    sop: &SegBinOp,
    mems: &[MemRef],
    layout: &Layout,
    outs: &[PatElem],
    count: Exp,
    position: &dyn Fn(Exp) -> Exp,
    nonempty: Exp,
) -> LowerResult<Stmt> {
    let scalar_outs = outs.iter().all(|pe| pe.shape.is_empty());
    if scalar_outs && sop.is_scalar() && count == Exp::int(1) {
        let at = layout.address(consts, 0, position(Exp::int(0)), Exp::int(0));
        let mut code = vec![];
        for ((mem, pe), ne) in mems.iter().zip(outs).zip(&sop.neutral) {
            code.push(Stmt::if_else(
                nonempty.clone(),
                mem.read(&pe.name, at.clone()),
                Stmt::set(&pe.name, ne.to_exp()),
            ));
        }
        return Ok(Stmt::seq(code));
    }
    let lanes = if sop.is_scalar() {
        Exp::int(1)
    } else {
        sop.lanes()
    };
    let (i, nest) = group_loop(&mut lw.names, consts, count * lanes.clone());
    let at = layout.address(
        consts,
        0,
        position(i.clone().quot(lanes.clone())),
        i.clone().rem(lanes),
    );
    let mut code = vec![];
    for ((mem, pe), ne) in mems.iter().zip(outs).zip(&sop.neutral) {
        let dest = output(ctx, pe, op)?;
        let v = lw.names.fresh("total");
        code.push(Stmt::declare(&v, mem.ty));
        code.push(Stmt::if_else(
            nonempty.clone(),
            mem.read(&v, at.clone()),
            Stmt::set(&v, ne.to_exp()),
        ));
        code.push(dest.mem.write(i.clone(), Exp::var(&v)));
    }
    Ok(nest.wrap(Stmt::seq(code)))
}

fn hist(
    lw: &mut Lowerer,
    ctx: &BodyCtx,
    pat: &[PatElem],
    op: &SegOp,
    hists: &[HistOp],
) -> LowerResult<Stmt> {
    let consts = ctx.consts;
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

    let mut seed = vec![];
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
            let dest = output(ctx, pe, op)?;
            let src = ctx.lookup(lw, initial).map_err(|_| {
                LowerError::bug(
                    format!("unknown histogram destination `{}`", initial),
                    "seghist",
                    op.span,
                )
            })?;
            let (i, nest) = group_loop(&mut lw.names, consts, dest.len());
            let v = lw.names.fresh("bin");
            seed.push(nest.wrap(Stmt::seq(vec![
                Stmt::declare(&v, src.mem.ty),
                src.mem.read(&v, i.clone()),
                dest.mem.write(i, Exp::var(&v)),
            ])));
            mems.push(dest.mem.clone());
        }
        dests.push(mems);
        offset += arity;
    }
    let updates: Vec<_> = hists
        .iter()
        .map(|h| select_strategy(&lw.config().atomics, &h.lambda))
        .collect();
    let locking = if updates.iter().any(|u| u.needs_locks()) {
        let locks = MemRef::new(&lw.names.fresh("locks"), PrimType::I32, Space::Local);
        seed.push(Stmt::declare_array(
            &locks.name,
            PrimType::I32,
            consts.group_size.clone(),
            Space::Local,
        ));
        let locking = Locking::new(locks, consts.group_size.clone());
        let (i, nest) = group_loop(&mut lw.names, consts, consts.group_size.clone());
        seed.push(nest.wrap(locking.locks.write(i, Exp::i32(locking.unlocked))));
        Some(locking)
    } else {
        None
    };
    seed.push(Stmt::barrier(Fence::Local));

    let mut inner = ctx.nested(op.span);
    let body = compile_stms(lw, &mut inner, &op.body.stms)?;
    let mut code = vec![body];
    let mut offset = 0;
    for (((hist, update), mems), bucket) in hists
        .iter()
        .zip(&updates)
        .zip(&dests)
        .zip(&op.body.results[..num_buckets])
    {
        let arity = hist.lambda.arity();
        let bin = plain(bucket, op)?.to_exp();
        let values = op.body.results[num_buckets + offset..num_buckets + offset + arity]
            .iter()
            .map(|res| plain(res, op).map(SubExp::to_exp))
            .collect::<LowerResult<Vec<_>>>()?;
        let shape = exps(&hist.dest_shape());
        let coords = coordinates(&op.space, hist, bin, op)?;
        let update = atomic_update(
            &mut lw.names,
            update,
            &hist.lambda,
            locking.as_ref(),
            mems,
            Exp::flatten_index(&shape, &coords),
            &values,
        )?;
        code.push(Stmt::when(in_bounds(&shape, &coords), update));
        offset += arity;
    }
    code.push(mapped_writes(
        lw,
        &inner,
        op,
        &pat[num_values..],
        &op.body.results[num_buckets + num_values..],
    )?);
    let nest = group_cover_space(&mut lw.names, consts, op.level.virt, &op.space);
    Ok(Stmt::seq(vec![
        Stmt::seq(seed),
        nest.wrap(Stmt::seq(code)),
    ]))
}
