//! Covering more logical work than there is physical parallelism.
//!
//! Every function here returns the index it binds together with a [`Nest`]: the code that
//! must surround the body using that index.

use super::constants::{unflatten, KernelConstants};
use crate::ir::{Exp, Fence, KernelOp, NameSource, PrimType, Stmt, VName};
use crate::segop::{SegSpace, SegVirt};

/// Code enclosing a body: setup, an optional counted loop, and a guarded body inside it.
#[must_use]
#[derive(Debug)]
pub struct Nest {
    setup: Vec<Stmt>,
    counted: Option<(VName, Exp)>,
    prefix: Vec<Stmt>,
    guard: Exp,
    suffix: Vec<Stmt>,
}

impl Nest {
    fn straight(prefix: Vec<Stmt>, guard: Exp) -> Self {
        Nest {
            setup: vec![],
            counted: None,
            prefix,
            guard,
            suffix: vec![],
        }
    }

    pub fn wrap(self, body: Stmt) -> Stmt {
        let mut inner = self.prefix;
        inner.push(Stmt::when(self.guard, body));
        inner.extend(self.suffix);
        let mut code = self.setup;
        match self.counted {
            Some((iter, bound)) => code.push(Stmt::for_loop(&iter, bound, Stmt::seq(inner))),
            None => code.extend(inner),
        }
        Stmt::seq(code)
    }
}

/// Runs the body once per logical group id in `0..required_groups`.
///
/// Without virtualisation every physical group is one logical group. Otherwise physical group
/// `p` visits `p, p + P, p + 2P, ...` and a barrier separates consecutive visits so no group
/// observes the local memory of its predecessor.
pub fn virtualise_groups(
    names: &mut NameSource,
    consts: &KernelConstants,
    virt: SegVirt,
    required_groups: Exp,
) -> (Exp, Nest) {
    match virt {
        SegVirt::None => (consts.gid(), Nest::straight(vec![], Exp::bool(true))),
        SegVirt::Virtualize | SegVirt::FullNoPredicate => {
            let phys = names.fresh("phys_group_id");
            let iterations = names.fresh("iterations");
            let i = names.fresh("i");
            let virt_group_id = names.fresh("virt_group_id");
            let setup = vec![
                Stmt::declare(&phys, PrimType::I64),
                Stmt::Op(KernelOp::GetGroupId(phys.clone())),
                Stmt::declare_init(
                    &iterations,
                    PrimType::I64,
                    (required_groups - Exp::var(&phys)).div_up(consts.num_groups.clone()),
                ),
            ];
            let prefix = vec![Stmt::declare_init(
                &virt_group_id,
                PrimType::I64,
                Exp::var(&phys) + Exp::var(&i) * consts.num_groups.clone(),
            )];
            let nest = Nest {
                setup,
                counted: Some((i, Exp::var(&iterations))),
                prefix,
                guard: Exp::bool(true),
                suffix: vec![Stmt::barrier(Fence::Global)],
            };
            (Exp::var(&virt_group_id), nest)
        }
    }
}

/// Lets the threads of a group cover `0..n` with a strided loop; no loop when `n` is the group
/// size.
pub fn group_loop(names: &mut NameSource, consts: &KernelConstants, n: Exp) -> (Exp, Nest) {
    if n == consts.group_size {
        return (consts.ltid(), Nest::straight(vec![], Exp::bool(true)));
    }
    let num_chunks = names.fresh("num_chunks");
    let chunk_i = names.fresh("chunk_i");
    let i = names.fresh("i");
    let nest = Nest {
        setup: vec![Stmt::declare_init(
            &num_chunks,
            PrimType::I64,
            n.clone().div_up(consts.group_size.clone()),
        )],
        counted: Some((chunk_i.clone(), Exp::var(&num_chunks))),
        prefix: vec![Stmt::declare_init(
            &i,
            PrimType::I64,
            Exp::var(&chunk_i) * consts.group_size.clone() + consts.ltid(),
        )],
        guard: Exp::var(&i).lt(n),
        suffix: vec![],
    };
    (Exp::var(&i), nest)
}

/// Covers the group-sized chunks of `0..w`. Binds the chunk start and the chunk size.
pub fn group_chunk_loop(
    names: &mut NameSource,
    consts: &KernelConstants,
    w: Exp,
) -> (Exp, Exp, Nest) {
    let num_chunks = names.fresh("num_chunks");
    let chunk_i = names.fresh("chunk_i");
    let chunk_start = names.fresh("chunk_start");
    let chunk_size = names.fresh("chunk_size");
    let group_size = consts.group_size.clone();
    let nest = Nest {
        setup: vec![Stmt::declare_init(
            &num_chunks,
            PrimType::I64,
            w.clone().div_up(group_size.clone()),
        )],
        counted: Some((chunk_i.clone(), Exp::var(&num_chunks))),
        prefix: vec![
            Stmt::declare_init(
                &chunk_start,
                PrimType::I64,
                Exp::var(&chunk_i) * group_size.clone(),
            ),
            Stmt::declare_init(
                &chunk_size,
                PrimType::I64,
                w.minimum(Exp::var(&chunk_start) + group_size) - Exp::var(&chunk_start),
            ),
        ],
        guard: Exp::bool(true),
        suffix: vec![],
    };
    (Exp::var(&chunk_start), Exp::var(&chunk_size), nest)
}

fn in_bounds(space: &SegSpace) -> Exp {
    Exp::all(
        space
            .dims
            .iter()
            .map(|(i, d)| Exp::var(i).lt(d.to_exp()))
            .collect(),
    )
}

/// Lets the threads of a group cover the points of `space`, binding its indices and its flat
/// index.
pub fn group_cover_space(
    names: &mut NameSource,
    consts: &KernelConstants,
    virt: SegVirt,
    space: &SegSpace,
) -> Nest {
    let dims: Vec<(VName, Exp)> = space
        .dims
        .iter()
        .map(|(i, d)| (i.clone(), d.to_exp()))
        .collect();
    let shape = space.shape();
    let virt = if space.size() == consts.group_size {
        SegVirt::FullNoPredicate
    } else {
        virt
    };
    let bind_flat = |flat: Exp| Stmt::declare_init(&space.flat, PrimType::I64, flat);
    match virt {
        SegVirt::Virtualize => {
            let chunk_i = names.fresh("chunk_i");
            let i = names.fresh("i");
            let mut setup = vec![];
            let iters = match consts.chunk_iters(&shape) {
                Some(iters) => iters.clone(),
                None => {
                    let iters = names.fresh("chunk_iters");
                    setup.push(Stmt::declare_init(
                        &iters,
                        PrimType::I64,
                        space.size().div_up(consts.group_size.clone()),
                    ));
                    Exp::var(&iters)
                }
            };
            let flat = Exp::var(&chunk_i) * consts.group_size.clone() + consts.ltid();
            Nest {
                setup,
                counted: Some((chunk_i, iters)),
                prefix: vec![
                    Stmt::declare_init(&i, PrimType::I64, flat),
                    bind_flat(Exp::var(&i)),
                    unflatten(&dims, Exp::var(&i)),
                ],
                guard: in_bounds(space),
                suffix: vec![],
            }
        }
        SegVirt::FullNoPredicate => Nest::straight(
            vec![bind_flat(consts.ltid()), unflatten(&dims, consts.ltid())],
            Exp::bool(true),
        ),
        SegVirt::None => {
            let ids = match consts.local_ids(&shape) {
                Some(ids) => Stmt::seq(
                    dims.iter()
                        .zip(ids)
                        .map(|((i, _), id)| Stmt::declare_init(i, PrimType::I64, id.clone()))
                        .collect(),
                ),
                None => unflatten(&dims, consts.ltid()),
            };
            Nest::straight(vec![bind_flat(consts.ltid()), ids], in_bounds(space))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::size;
    use crate::lower::constants::kernel_init;

    fn cover(dims: Vec<(&str, i64)>, virt: SegVirt) -> Nest {
        let mut names = NameSource::new();
        let (consts, _) = kernel_init(&mut names, Exp::int(1), Exp::int(16));
        let space = SegSpace::new("flat", dims.into_iter().map(|(i, d)| (i, size(d))).collect());
        group_cover_space(&mut names, &consts, virt, &space)
    }

    #[test]
    fn space_of_group_size_is_covered_without_a_loop() {
        let shapes = [
            vec![("i", 16)],
            vec![("i", 4), ("j", 4)],
            vec![("i", 2), ("j", 2), ("k", 4)],
        ];
        for dims in shapes {
            let nest = cover(dims.clone(), SegVirt::Virtualize);
            assert!(nest.counted.is_none(), "loop around {:?}", dims);
            assert_eq!(nest.guard, Exp::bool(true), "predicate around {:?}", dims);
        }
    }

    #[test]
    fn larger_space_is_covered_in_chunks() {
        let nest = cover(vec![("i", 4), ("j", 5)], SegVirt::Virtualize);
        assert!(nest.counted.is_some());
        assert_ne!(nest.guard, Exp::bool(true));
    }
}
