//! Writing body results to their destinations.

use super::body::{in_bounds, BodyCtx};
use super::error::{LowerError, LowerResult};
use super::virtualize::{group_cover_space, group_loop};
use super::{ArrayInfo, Lowerer};
use crate::ir::{Exp, Space, Stmt};
use crate::segop::{KernelResult, PatElem, SegSpace, SegVirt, Split, SubExp};

fn check_rank(dest: &ArrayInfo, at_least: usize, ctx: &BodyCtx, what: &str) -> LowerResult<()> {
    if dest.shape.len() < at_least {
        return Err(LowerError::bug(
            format!(
                "destination `{}` of rank {} cannot hold {}",
                dest.mem.name,
                dest.shape.len(),
                what
            ),
            "kernel result",
            ctx.span,
        ));
    }
    Ok(())
}

/// Row-major index of element `inner` of the subarray `is` of `dest`.
fn dest_index(dest: &ArrayInfo, is: &[Exp], inner: Exp) -> Exp {
    let k = is.len().min(dest.shape.len());
    let row = Exp::flatten_index(&dest.shape[..k], &is[..k]);
    row * Exp::product(dest.shape[k..].to_vec()) + inner
}

/// `dest[is] = value`, copying element-wise when `value` is a kernel array.
pub(crate) fn write_value(
    lw: &mut Lowerer,
    ctx: &BodyCtx,
    dest: &ArrayInfo,
    is: &[Exp],
    value: &SubExp,
) -> LowerResult<Stmt> {
    check_rank(dest, is.len(), ctx, "a per-thread result")?;
    Ok(match ctx.kernel_array(value) {
        Some(src) => {
            let j = lw.names.fresh("j");
            let v = lw.names.fresh("elem");
            Stmt::for_loop(
                &j,
                src.len(),
                Stmt::seq(vec![
                    Stmt::declare(&v, src.mem.ty),
                    src.mem.read(&v, Exp::var(&j)),
                    dest.mem
                        .write(dest_index(dest, is, Exp::var(&j)), Exp::var(&v)),
                ]),
            )
        }
        None => dest.mem.write(dest_index(dest, is, Exp::int(0)), value.to_exp()),
    })
}

/// Results of a body executed by every thread of `space` on its own.
pub(crate) fn thread_results(
    lw: &mut Lowerer,
    ctx: &BodyCtx,
    space: &SegSpace,
    pat: &[PatElem],
    results: &[KernelResult],
) -> LowerResult<Stmt> {
    let is = space.index_exps();
    let mut code = vec![];
    for (pe, res) in pat.iter().zip(results) {
        let dest = ctx.lookup(lw, &pe.name)?;
        let stmt = match res {
            KernelResult::Returns(se) => write_value(lw, ctx, &dest, &is, se)?,
            KernelResult::WriteReturns { shape, writes } => {
                lw.mark_scatter();
                let extents: Vec<Exp> = shape.iter().map(SubExp::to_exp).collect();
                let mut scattered = vec![];
                for (idxs, v) in writes {
                    if idxs.len() != extents.len() {
                        return Err(LowerError::bug(
                            format!(
                                "scatter into `{}` with {} indices for rank {}",
                                pe.name,
                                idxs.len(),
                                extents.len()
                            ),
                            "WriteReturns",
                            ctx.span,
                        ));
                    }
                    let idxs: Vec<Exp> = idxs.iter().map(SubExp::to_exp).collect();
                    scattered.push(Stmt::when(
                        in_bounds(&extents, &idxs),
                        dest.mem
                            .write(Exp::flatten_index(&extents, &idxs), v.to_exp()),
                    ));
                }
                Stmt::seq(scattered)
            }
            KernelResult::ConcatReturns {
                split,
                per_thread,
                array,
            } => {
                let src = ctx.lookup(lw, array)?;
                let j = lw.names.fresh("j");
                let v = lw.names.fresh("elem");
                let tid = Exp::var(&space.flat);
                let pos = match split {
                    Split::Contiguous => tid * per_thread.to_exp() + Exp::var(&j),
                    Split::Strided(stride) => tid + Exp::var(&j) * stride.to_exp(),
                };
                Stmt::for_loop(
                    &j,
                    per_thread.to_exp(),
                    Stmt::when(
                        pos.clone().lt(dest.len()),
                        Stmt::seq(vec![
                            Stmt::declare(&v, src.mem.ty),
                            src.mem.read(&v, Exp::var(&j)),
                            dest.mem.write(pos, Exp::var(&v)),
                        ]),
                    ),
                )
            }
            KernelResult::TileReturns { .. } => {
                return Err(LowerError::limitation(
                    "TileReturns at thread level",
                    ctx.span,
                ))
            }
        };
        code.push(stmt);
    }
    Ok(Stmt::seq(code))
}

/// Results of a body executed by a whole group; `is` are the group's indices in the space.
pub(crate) fn group_results(
    lw: &mut Lowerer,
    ctx: &BodyCtx,
    is: &[Exp],
    pat: &[PatElem],
    results: &[KernelResult],
) -> LowerResult<Stmt> {
    let consts = ctx.consts;
    let mut code = vec![];
    for (pe, res) in pat.iter().zip(results) {
        let dest = ctx.lookup(lw, &pe.name)?;
        let stmt = match res {
            KernelResult::Returns(se) => match ctx.kernel_array(se) {
                Some(src) if src.mem.space == Space::Local => {
                    check_rank(&dest, is.len(), ctx, "a group result")?;
                    let src = src.clone();
                    let (i, nest) = group_loop(&mut lw.names, consts, src.len());
                    let v = lw.names.fresh("elem");
                    nest.wrap(Stmt::seq(vec![
                        Stmt::declare(&v, src.mem.ty),
                        src.mem.read(&v, i.clone()),
                        dest.mem.write(dest_index(&dest, is, i), Exp::var(&v)),
                    ]))
                }
                _ => Stmt::when(
                    consts.ltid().equals(Exp::int(0)),
                    write_value(lw, ctx, &dest, is, se)?,
                ),
            },
            KernelResult::TileReturns { tiles, array } => {
                if tiles.len() != is.len() {
                    return Err(LowerError::bug(
                        format!(
                            "{}-dimensional tile in a {}-dimensional group space",
                            tiles.len(),
                            is.len()
                        ),
                        "TileReturns",
                        ctx.span,
                    ));
                }
                let src = ctx.lookup(lw, array)?;
                let locals: Vec<String> = tiles
                    .iter()
                    .map(|_| lw.names.fresh("tile_i").to_string())
                    .collect();
                let flat = lw.names.fresh("tile_flat").to_string();
                let tile_space = SegSpace::new(
                    &flat,
                    locals
                        .iter()
                        .zip(tiles)
                        .map(|(l, (_, tile))| (l.as_str(), tile.clone()))
                        .collect(),
                );
                let extents: Vec<Exp> = tiles.iter().map(|(e, _)| e.to_exp()).collect();
                let pos: Vec<Exp> = is
                    .iter()
                    .zip(tiles)
                    .zip(tile_space.index_exps())
                    .map(|((g, (_, tile)), l)| g.clone() * tile.to_exp() + l)
                    .collect();
                let v = lw.names.fresh("elem");
                let nest =
                    group_cover_space(&mut lw.names, consts, SegVirt::Virtualize, &tile_space);
                nest.wrap(Stmt::when(
                    in_bounds(&extents, &pos),
                    Stmt::seq(vec![
                        Stmt::declare(&v, src.mem.ty),
                        src.mem.read(&v, Exp::var(&tile_space.flat)),
                        dest.mem
                            .write(Exp::flatten_index(&extents, &pos), Exp::var(&v)),
                    ]),
                ))
            }
            KernelResult::WriteReturns { .. } => {
                return Err(LowerError::limitation(
                    "WriteReturns at group level",
                    ctx.span,
                ))
            }
            KernelResult::ConcatReturns { .. } => {
                return Err(LowerError::limitation(
                    "ConcatReturns at group level",
                    ctx.span,
                ))
            }
        };
        code.push(stmt);
    }
    Ok(Stmt::seq(code))
}
