use super::constants::KernelConstants;
use super::error::{LowerError, LowerResult};
use super::{group, ArrayInfo, Lowerer};
use crate::ir::{Exp, MemRef, Space, Span, Stmt, VName};
use crate::segop::{exps, BodyStm, Level, SubExp};
use std::collections::HashMap;

/// What the code of one kernel body can see.
#[derive(Clone, Debug)]
pub(crate) struct BodyCtx<'c> {
    pub consts: &'c KernelConstants,
    /// Who executes the body: every thread on its own, or a whole group together.
    pub level: Level,
    /// Arrays declared inside the kernel.
    pub arrays: HashMap<VName, ArrayInfo>,
    pub span: Option<Span>,
}

impl<'c> BodyCtx<'c> {
    pub fn new(consts: &'c KernelConstants, level: Level, span: Option<Span>) -> Self {
        BodyCtx {
            consts,
            level,
            arrays: HashMap::new(),
            span,
        }
    }

    /// The scope of a nested operation's body, executed by single threads.
    pub fn nested(&self, span: Option<Span>) -> Self {
        BodyCtx {
            consts: self.consts,
            level: Level::Thread,
            arrays: self.arrays.clone(),
            span: span.or(self.span),
        }
    }

    pub fn lookup(&self, lw: &Lowerer, name: &VName) -> LowerResult<ArrayInfo> {
        match self.arrays.get(name) {
            Some(info) => Ok(info.clone()),
            None => lw.global_array(name).ok_or_else(|| {
                LowerError::bug(format!("unknown array `{}`", name), "kernel body", self.span)
            }),
        }
    }

    /// The array `se` names, if it names one in local or private memory.
    pub fn kernel_array(&self, se: &SubExp) -> Option<&ArrayInfo> {
        match se {
            SubExp::Var(name) => self.arrays.get(name),
            SubExp::Const(_) => None,
        }
    }
}

/// Bounds check of `is` against `shape`.
pub(crate) fn in_bounds(shape: &[Exp], is: &[Exp]) -> Exp {
    Exp::all(
        shape
            .iter()
            .zip(is)
            .map(|(d, i)| Exp::int(0).le(i.clone()).and(i.clone().lt(d.clone())))
            .collect(),
    )
}

pub(crate) fn compile_stms(
    lw: &mut Lowerer,
    ctx: &mut BodyCtx,
    stms: &[BodyStm],
) -> LowerResult<Stmt> {
    let mut code = vec![];
    for stm in stms {
        code.push(compile_stm(lw, ctx, stm)?);
    }
    Ok(Stmt::seq(code))
}

fn compile_stm(lw: &mut Lowerer, ctx: &mut BodyCtx, stm: &BodyStm) -> LowerResult<Stmt> {
    match stm {
        BodyStm::Let { name, ty, exp } => Ok(Stmt::declare_init(name, *ty, exp.clone())),
        BodyStm::Index {
            name,
            ty,
            array,
            index,
        } => {
            let info = ctx.lookup(lw, array)?;
            if info.shape.len() != index.len() {
                return Err(LowerError::bug(
                    format!(
                        "`{}` has rank {} but is indexed with {} indices",
                        array,
                        info.shape.len(),
                        index.len()
                    ),
                    "index",
                    ctx.span,
                ));
            }
            if info.mem.ty != *ty {
                return Err(LowerError::bug(
                    format!("`{}` holds {} but is read as {}", array, info.mem.ty, ty),
                    "index",
                    ctx.span,
                ));
            }
            let flat = Exp::flatten_index(&info.shape, index);
            let read = info.mem.read(name, flat);
            let read = if lw.config().idx_checks {
                Stmt::when(in_bounds(&info.shape, index), read)
            } else {
                read
            };
            Ok(Stmt::seq(vec![Stmt::declare(name, *ty), read]))
        }
        BodyStm::ArrayLit { name, ty, elems } => {
            let len = Exp::int(elems.len() as i64);
            let mem = MemRef::new(name, *ty, Space::Private);
            let mut code = vec![Stmt::declare_array(name, *ty, len.clone(), Space::Private)];
            for (i, e) in exps(elems).into_iter().enumerate() {
                code.push(mem.write(Exp::int(i as i64), e));
            }
            ctx.arrays.insert(
                name.clone(),
                ArrayInfo {
                    mem,
                    shape: vec![len],
                },
            );
            Ok(Stmt::seq(code))
        }
        BodyStm::Op { pat, op } => match ctx.level {
            Level::Group => group::compile_group_op(lw, ctx, pat, op),
            Level::Thread => Err(LowerError::bug(
                format!("nested {} in a thread-level body", op.kind.name()),
                op.kind.name(),
                op.span,
            )),
        },
    }
}
