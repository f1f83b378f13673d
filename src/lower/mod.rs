//! Lowering of segmented operations to kernels.
//!
//! [`lower_module`] turns every host operation of a [`Module`] into allocations and kernels of
//! one [`Program`]. Each kernel body starts with the reads of its hardware identifiers
//! ([`constants`]), covers its logical iteration space with [`virtualize`], and combines the
//! work of its threads with the collectives of [`reduce`], [`scan`] and [`atomic`].

pub mod atomic;
mod body;
mod builtin;
pub mod constants;
mod error;
mod group;
mod hoist;
pub mod reduce;
mod results;
pub mod scan;
mod segmap;
mod seghist;
mod segred;
pub mod virtualize;

pub use error::{LowerError, LowerResult};

use crate::config::LowerConfig;
use crate::ir::free_vars::free_vars;
use crate::ir::visit::{walk_kernel_op, Visit};
use crate::ir::{
    Alloc, Exp, Kernel, KernelOp, KernelUse, MemRef, NameSource, PrimType, Program, Space, Stmt,
    TuningParam, VName,
};
use crate::segop::{exps, HostEnv, HostOp, Lambda, Level, Module, PatElem, SegOp, SegOpKind};
use tracing::debug;

/// An array in scope of a kernel body.
#[derive(Clone, PartialEq, Debug)]
pub(crate) struct ArrayInfo {
    pub mem: MemRef,
    pub shape: Vec<Exp>,
}

impl ArrayInfo {
    pub fn len(&self) -> Exp {
        Exp::product(self.shape.clone())
    }
}

pub struct Lowerer<'a> {
    config: &'a LowerConfig,
    env: &'a HostEnv,
    pub(crate) names: NameSource,
    program: Program,
    /// Whether the kernel under construction performs scattered writes.
    scatters: bool,
}

impl<'a> Lowerer<'a> {
    pub fn new(config: &'a LowerConfig, env: &'a HostEnv) -> Self {
        Lowerer {
            config,
            env,
            names: NameSource::new(),
            program: Program::default(),
            scatters: false,
        }
    }

    pub fn lower_op(&mut self, op: &HostOp) -> LowerResult<()> {
        match op {
            HostOp::Seg { pat, op } => self.lower_segop(pat, op),
            HostOp::Replicate { dest, value } => builtin::replicate(self, dest, value),
            HostOp::Iota { dest, start, step } => builtin::iota(self, dest, start, step),
            HostOp::Copy { dest, src } => builtin::copy(self, dest, src),
        }
    }

    fn lower_segop(&mut self, pat: &[PatElem], op: &SegOp) -> LowerResult<()> {
        match (&op.kind, op.level.level) {
            (SegOpKind::Map, Level::Thread) => segmap::thread_map(self, pat, op),
            (SegOpKind::Map, Level::Group) => segmap::group_map(self, pat, op),
            (SegOpKind::Red(ops), Level::Thread) => segred::thread_red(self, pat, op, ops),
            (SegOpKind::Hist(ops), Level::Thread) => seghist::thread_hist(self, pat, op, ops),
            (SegOpKind::Scan(_), Level::Thread) => Err(LowerError::limitation(
                "segscan at thread level; scans are only lowered inside group bodies",
                op.span,
            )),
            (kind, Level::Group) => Err(LowerError::bug(
                format!("group-level {} outside a group body", kind.name()),
                kind.name(),
                op.span,
            )),
        }
    }

    pub fn finish(self) -> Program {
        self.program
    }

    pub(crate) fn config(&self) -> &'a LowerConfig {
        self.config
    }

    pub(crate) fn env(&self) -> &'a HostEnv {
        self.env
    }

    pub(crate) fn mark_scatter(&mut self) {
        self.scatters = true;
    }

    pub(crate) fn alloc(&mut self, base: &str, ty: PrimType, len: Exp) -> MemRef {
        let name = self.names.fresh(base);
        self.program.allocs.push(Alloc {
            name: name.clone(),
            ty,
            len,
        });
        MemRef::new(&name, ty, Space::Global)
    }

    pub(crate) fn add_tuning_param(&mut self, param: TuningParam) {
        if !self.program.tuning_params.iter().any(|p| p.name == param.name) {
            self.program.tuning_params.push(param);
        }
    }

    /// A global array of the host environment or of this program's allocations.
    pub(crate) fn global_array(&self, name: &VName) -> Option<ArrayInfo> {
        if let Some((ty, shape)) = self.env.arrays.get(name) {
            return Some(ArrayInfo {
                mem: MemRef::new(name, *ty, Space::Global),
                shape: exps(shape),
            });
        }
        self.program
            .allocs
            .iter()
            .find(|a| &a.name == name)
            .map(|a| ArrayInfo {
                mem: MemRef::new(name, a.ty, Space::Global),
                shape: vec![a.len.clone()],
            })
    }

    fn classify(
        &self,
        scalars: Vec<VName>,
        memory: Vec<VName>,
        kernel: &str,
    ) -> LowerResult<Vec<KernelUse>> {
        let mut uses = vec![];
        for name in scalars {
            let class = if let Some(v) = self.env.constants.get(&name) {
                KernelUse::Constant(name, *v)
            } else if let Some(ty) = self.env.scalars.get(&name) {
                KernelUse::Scalar(name, *ty)
            } else if self.program.tuning_params.iter().any(|p| p.name == name) {
                KernelUse::Scalar(name, PrimType::I64)
            } else {
                return Err(LowerError::bug(
                    format!("kernel uses undeclared scalar `{}`", name),
                    kernel,
                    None,
                ));
            };
            uses.push(class);
        }
        for name in memory {
            if self.global_array(&name).is_none() {
                return Err(LowerError::bug(
                    format!("kernel uses unknown memory `{}`", name),
                    kernel,
                    None,
                ));
            }
            uses.push(KernelUse::Memory(name));
        }
        Ok(uses)
    }

    /// Finishes a kernel: hoists its local arrays, captures its free names and appends it
    /// to the program.
    pub(crate) fn emit_kernel(
        &mut self,
        base: &str,
        num_groups: Exp,
        group_size: Exp,
        body: Stmt,
    ) -> LowerResult<()> {
        let name = self.names.fresh(base).to_string();
        let body = hoist::hoist_local_arrays(body, &name)?;
        let free = free_vars(&body);
        let uses = self.classify(free.scalars, free.memory, &name)?;
        let failure_tolerant = !uses_atomics(&body) && !self.scatters;
        self.scatters = false;
        debug!(
            kernel = %name,
            num_groups = %num_groups,
            group_size = %group_size,
            uses = uses.len(),
            failure_tolerant,
            "emitted kernel"
        );
        self.program.kernels.push(Kernel {
            name,
            body,
            uses,
            num_groups,
            group_size,
            failure_tolerant,
        });
        Ok(())
    }
}

/// Lowers every operation of `module`, in order, into one program.
pub fn lower_module(config: &LowerConfig, module: &Module) -> LowerResult<Program> {
    let mut lowerer = Lowerer::new(config, &module.env);
    for op in &module.ops {
        lowerer.lower_op(op)?;
    }
    Ok(lowerer.finish())
}

struct AtomicsUsed(bool);

impl Visit for AtomicsUsed {
    fn visit_kernel_op(&mut self, op: &KernelOp) {
        if let KernelOp::Atomic(_) = op {
            self.0 = true;
        }
        walk_kernel_op(self, op)
    }
}

fn uses_atomics(body: &Stmt) -> bool {
    let mut found = AtomicsUsed(false);
    found.visit_stmt(body);
    found.0
}

/// Sets `dests` to the results of `lam` applied to `xs` and `ys`. The destinations may be
/// among the operands.
pub(crate) fn apply_lambda(
    names: &mut NameSource,
    lam: &Lambda,
    xs: &[Exp],
    ys: &[Exp],
    dests: &[VName],
) -> Stmt {
    let results = lam.apply(xs, ys);
    if results.len() == 1 {
        return Stmt::seq(
            dests
                .iter()
                .zip(results)
                .map(|(d, r)| Stmt::set(d, r))
                .collect(),
        );
    }
    let temps: Vec<VName> = results.iter().map(|_| names.fresh("res")).collect();
    let mut code: Vec<Stmt> = temps
        .iter()
        .zip(results)
        .zip(lam.result_types())
        .map(|((t, r), ty)| Stmt::declare_init(t, ty, r))
        .collect();
    code.extend(
        dests
            .iter()
            .zip(&temps)
            .map(|(d, t)| Stmt::set(d, Exp::var(t))),
    );
    Stmt::seq(code)
}
