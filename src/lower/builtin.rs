//! Host-side array operations, each lowered to one size-driven kernel.

use super::constants::simple_kernel_init;
use super::error::{LowerError, LowerResult};
use super::{ArrayInfo, Lowerer};
use crate::ir::{Exp, MemRef, PrimType, Stmt, VName};
use crate::segop::SubExp;

fn array(lw: &Lowerer, name: &VName, op: &str) -> LowerResult<ArrayInfo> {
    lw.global_array(name)
        .ok_or_else(|| LowerError::bug(format!("unknown array `{}`", name), op, None))
}

/// One thread per element of an `n`-element array; `element` produces the code for the
/// element at the given flat index.
fn elementwise<F>(lw: &mut Lowerer, kernel: &str, n: Exp, element: F) -> LowerResult<()>
where
    F: FnOnce(&mut Lowerer, Exp) -> Stmt,
{
    let config = lw.config();
    let (consts, init, param) = simple_kernel_init(&mut lw.names, config, kernel, n);
    let group_size = Exp::var(&param.name);
    let num_groups = consts.num_groups.clone();
    lw.add_tuning_param(param);
    let body = element(lw, consts.gtid());
    let body = Stmt::seq(vec![init, Stmt::when(consts.active.clone(), body)]);
    lw.emit_kernel(kernel, num_groups, group_size, body)
}

pub(crate) fn replicate_mem(
    lw: &mut Lowerer,
    mem: MemRef,
    len: Exp,
    value: Exp,
) -> LowerResult<()> {
    elementwise(lw, "replicate", len, |_, i| mem.write(i, value))
}

pub(crate) fn replicate(lw: &mut Lowerer, dest: &VName, value: &SubExp) -> LowerResult<()> {
    let dest = array(lw, dest, "replicate")?;
    replicate_mem(lw, dest.mem.clone(), dest.len(), value.to_exp())
}

pub(crate) fn iota(
    lw: &mut Lowerer,
    dest: &VName,
    start: &SubExp,
    step: &SubExp,
) -> LowerResult<()> {
    let dest = array(lw, dest, "iota")?;
    let ty = dest.mem.ty;
    let (start, step) = (start.to_exp(), step.to_exp());
    elementwise(lw, "iota", dest.len(), |_, i| {
        let value = start.convert(PrimType::I64) + i.clone() * step.convert(PrimType::I64);
        dest.mem.write(i, value.convert(ty))
    })
}

pub(crate) fn copy(lw: &mut Lowerer, dest: &VName, src: &VName) -> LowerResult<()> {
    let to = array(lw, dest, "copy")?;
    let from = array(lw, src, "copy")?;
    if to.mem.ty != from.mem.ty {
        return Err(LowerError::bug(
            format!("copy of {} `{}` into {} `{}`", from.mem.ty, src, to.mem.ty, dest),
            "copy",
            None,
        ));
    }
    if let (Some(a), Some(b)) = (to.len().as_int(), from.len().as_int()) {
        if a != b {
            return Err(LowerError::bug(
                format!("copy of {} elements into an array of {}", b, a),
                "copy",
                None,
            ));
        }
    }
    elementwise(lw, "copy", to.len(), |lw, i| {
        let v = lw.names.fresh("elem");
        Stmt::seq(vec![
            Stmt::declare(&v, from.mem.ty),
            from.mem.read(&v, i.clone()),
            to.mem.write(i, Exp::var(&v)),
        ])
    })
}
