//! Per-kernel identifiers and sizes.

use crate::config::LowerConfig;
use crate::ir::{Exp, KernelOp, NameSource, PrimType, Stmt, TuningParam, VName};
use crate::segop::{exps, BodyStm, HostEnv, SegVirt, SubExp};
use std::collections::HashMap;

/// Everything lowering needs to know about the kernel it is emitting code for.
///
/// The value is immutable for the duration of a kernel body. Entering a scope that knows more
/// (such as the precomputed ids of nested iteration spaces) yields a new value.
#[derive(Clone, PartialEq, Debug)]
pub struct KernelConstants {
    pub global_tid: VName,
    pub local_tid: VName,
    pub group_id: VName,
    pub wave_size_var: VName,
    pub num_groups: Exp,
    pub group_size: Exp,
    pub num_threads: Exp,
    /// Whether the thread has work at all; only the size-driven form narrows it.
    pub active: Exp,
    local_id_map: HashMap<Vec<SubExp>, Vec<Exp>>,
    chunk_iters_map: HashMap<Vec<SubExp>, Exp>,
}

impl KernelConstants {
    pub fn gtid(&self) -> Exp {
        Exp::var(&self.global_tid)
    }

    pub fn ltid(&self) -> Exp {
        Exp::var(&self.local_tid)
    }

    pub fn gid(&self) -> Exp {
        Exp::var(&self.group_id)
    }

    /// Hardware lockstep width; 0 when the device gives no such guarantee.
    pub fn wave_size(&self) -> Exp {
        Exp::var(&self.wave_size_var)
    }

    /// Global thread id of local thread 0 of this group.
    pub fn group_base(&self) -> Exp {
        self.gtid() - self.ltid()
    }

    pub fn local_ids(&self, shape: &[SubExp]) -> Option<&Vec<Exp>> {
        self.local_id_map.get(shape)
    }

    pub fn chunk_iters(&self, shape: &[SubExp]) -> Option<&Exp> {
        self.chunk_iters_map.get(shape)
    }

    pub fn with_precomputed(
        &self,
        local_ids: HashMap<Vec<SubExp>, Vec<Exp>>,
        chunk_iters: HashMap<Vec<SubExp>, Exp>,
    ) -> KernelConstants {
        KernelConstants {
            local_id_map: local_ids,
            chunk_iters_map: chunk_iters,
            ..self.clone()
        }
    }
}

fn read_id(name: &VName, op: KernelOp) -> Stmt {
    Stmt::seq(vec![Stmt::declare(name, PrimType::I64), Stmt::Op(op)])
}

/// Reads the hardware identifiers of a kernel of `num_groups` groups of `group_size` threads.
///
/// The returned statement must come first in the kernel body.
pub fn kernel_init(
    names: &mut NameSource,
    num_groups: Exp,
    group_size: Exp,
) -> (KernelConstants, Stmt) {
    let global_tid = names.fresh("global_tid");
    let local_tid = names.fresh("local_tid");
    let group_id = names.fresh("group_id");
    let wave_size_var = names.fresh("wave_size");
    let init = Stmt::comment(
        "kernel constants",
        Stmt::seq(vec![
            read_id(&global_tid, KernelOp::GetGlobalId(global_tid.clone())),
            read_id(&local_tid, KernelOp::GetLocalId(local_tid.clone())),
            read_id(&group_id, KernelOp::GetGroupId(group_id.clone())),
            read_id(&wave_size_var, KernelOp::GetLockstepWidth(wave_size_var.clone())),
        ]),
    );
    let consts = KernelConstants {
        global_tid,
        local_tid,
        group_id,
        wave_size_var,
        num_threads: num_groups.clone() * group_size.clone(),
        num_groups,
        group_size,
        active: Exp::bool(true),
        local_id_map: HashMap::new(),
        chunk_iters_map: HashMap::new(),
    };
    (consts, init)
}

/// The name of the group-size tuning parameter of a built-in kernel.
pub fn group_size_param(kernel: &str) -> String {
    format!("builtin#{}.group_size", kernel)
}

/// Size-driven constants: `n` threads are wanted, the group size is a tuning parameter whose
/// default comes from the size-class table, and the group count follows from both.
pub fn simple_kernel_init(
    names: &mut NameSource,
    config: &LowerConfig,
    kernel: &str,
    n: Exp,
) -> (KernelConstants, Stmt, TuningParam) {
    let key = group_size_param(kernel);
    let param = TuningParam {
        name: VName::new(&key),
        default: config.size_classes.group_size(&key),
    };
    let group_size = Exp::var(&param.name);
    let num_groups = n.clone().div_up(group_size.clone());
    let (mut consts, init) = kernel_init(names, num_groups, group_size);
    consts.active = consts.gtid().lt(n);
    (consts, init, param)
}

/// Declares `dims`' indices as the row-major unflattening of `flat`.
pub fn unflatten(dims: &[(VName, Exp)], flat: Exp) -> Stmt {
    let sizes: Vec<Exp> = dims.iter().map(|(_, d)| d.clone()).collect();
    let mut stmts = vec![];
    for (k, (name, _)) in dims.iter().enumerate() {
        let stride = Exp::product(sizes[k + 1..].to_vec());
        let mut ind = flat.clone().quot(stride);
        if k > 0 {
            ind = ind.rem(sizes[k].clone());
        }
        stmts.push(Stmt::declare_init(name, PrimType::I64, ind));
    }
    Stmt::seq(stmts)
}

/// Ids and chunk counts of every kernel-invariant nested iteration space in `stms`, computed
/// once at kernel entry.
pub fn precompute_constants(
    names: &mut NameSource,
    env: &HostEnv,
    consts: &KernelConstants,
    stms: &[BodyStm],
) -> (KernelConstants, Stmt) {
    let mut local_ids = HashMap::new();
    let mut chunk_iters = HashMap::new();
    let mut code = vec![];
    for stm in stms {
        let op = match stm {
            BodyStm::Op { op, .. } => op,
            _ => continue,
        };
        let shape = op.space.shape();
        if !shape.iter().all(|d| env.is_invariant(d)) {
            continue;
        }
        let dims = exps(&shape);
        match op.level.virt {
            SegVirt::Virtualize => {
                if chunk_iters.contains_key(&shape) {
                    continue;
                }
                let iters = names.fresh("chunk_iters");
                code.push(Stmt::declare_init(
                    &iters,
                    PrimType::I64,
                    Exp::product(dims).div_up(consts.group_size.clone()),
                ));
                chunk_iters.insert(shape, Exp::var(&iters));
            }
            SegVirt::None | SegVirt::FullNoPredicate => {
                if local_ids.contains_key(&shape) {
                    continue;
                }
                let ids: Vec<(VName, Exp)> = dims
                    .into_iter()
                    .map(|d| (names.fresh("ltid_pre"), d))
                    .collect();
                code.push(unflatten(&ids, consts.ltid()));
                local_ids.insert(shape, ids.iter().map(|(i, _)| Exp::var(i)).collect());
            }
        }
    }
    let code = if code.is_empty() {
        Stmt::Skip
    } else {
        Stmt::comment("precomputed nested ids", Stmt::seq(code))
    };
    (consts.with_precomputed(local_ids, chunk_iters), code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_of_identical_kernels_are_identical() {
        let build = || kernel_init(&mut NameSource::new(), Exp::int(4), Exp::int(64));
        assert_eq!(build(), build(), "constants setup leaked state between runs");
    }

    #[test]
    fn num_threads_is_folded_for_static_sizes() {
        let (consts, _) = kernel_init(&mut NameSource::new(), Exp::int(4), Exp::int(64));
        assert_eq!(consts.num_threads, Exp::int(256));
        assert_eq!(consts.active, Exp::bool(true));
    }

    #[test]
    fn size_driven_group_size_is_tunable() {
        let config = LowerConfig::default();
        let (consts, _, param) =
            simple_kernel_init(&mut NameSource::new(), &config, "replicate", Exp::int(1000));
        assert_eq!(param.name.as_str(), "builtin#replicate.group_size");
        assert_eq!(param.default, 256);
        assert_eq!(consts.group_size, Exp::var(&param.name));
        assert_ne!(consts.active, Exp::bool(true));
    }
}
