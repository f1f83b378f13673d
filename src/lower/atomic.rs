//! Concurrent updates of shared accumulator locations.

use super::error::{LowerError, LowerResult};
use crate::config::AtomicsTable;
use crate::ir::{
    AtomicBinOp, AtomicOp, BinOp, Exp, Fence, MemRef, NameSource, PrimType, Space, Stmt, VName,
};
use crate::segop::Lambda;
use tracing::trace;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AtomicStrategy {
    Prim,
    Cas,
    Locking,
}

/// How one component of a vectorisable operator is updated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ComponentUpdate {
    Native(AtomicBinOp),
    /// Compare-and-swap retry loop around the primitive operator.
    Cas(BinOp),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AtomicUpdate {
    /// One independent atomic per component.
    Prim(Vec<ComponentUpdate>),
    /// A compare-and-swap retry loop around the whole operator.
    Cas,
    /// A spin-locked critical section.
    Locking,
}

impl AtomicUpdate {
    pub fn strategy(&self) -> AtomicStrategy {
        match self {
            AtomicUpdate::Prim(_) => AtomicStrategy::Prim,
            AtomicUpdate::Cas => AtomicStrategy::Cas,
            AtomicUpdate::Locking => AtomicStrategy::Locking,
        }
    }

    pub fn needs_locks(&self) -> bool {
        *self == AtomicUpdate::Locking
    }
}

/// The primitive operator and type of every component, if result `i` of `lam` is exactly
/// `x_i op y_i`.
pub fn binop_components(lam: &Lambda) -> Option<Vec<(BinOp, PrimType)>> {
    if !lam.is_well_formed() {
        return None;
    }
    lam.results
        .iter()
        .zip(lam.x_params().iter().zip(lam.y_params()))
        .map(|(res, (x, y))| match res {
            Exp::BinOp(op, a, b)
                if **a == Exp::var(&x.name) && **b == Exp::var(&y.name) =>
            {
                Some((*op, x.ty))
            }
            _ => None,
        })
        .collect()
}

/// Picks the cheapest legal way to update accumulators of operator `lam` concurrently.
pub fn select_strategy(table: &AtomicsTable, lam: &Lambda) -> AtomicUpdate {
    let update = match binop_components(lam) {
        Some(comps) if comps.iter().all(|(_, ty)| ty.bit_width() == 32) => AtomicUpdate::Prim(
            comps
                .iter()
                .map(|(op, ty)| match table.native(*op, *ty) {
                    Some(native) => ComponentUpdate::Native(native),
                    None => ComponentUpdate::Cas(*op),
                })
                .collect(),
        ),
        _ => match lam.result_types().as_slice() {
            [ty] if ty.bit_width() == 32 && lam.is_well_formed() => AtomicUpdate::Cas,
            _ => AtomicUpdate::Locking,
        },
    };
    trace!(?update, arity = lam.arity(), "selected atomic update strategy");
    update
}

pub const UNLOCKED: i32 = 0;
pub const LOCKED: i32 = 1;

/// A lock array guarding the buckets of a histogram. Buckets are hashed onto the locks.
#[derive(Clone, PartialEq, Debug)]
pub struct Locking {
    pub locks: MemRef,
    pub num_locks: Exp,
    /// Value of a free lock; the lock array is filled with it before first use.
    pub unlocked: i32,
    /// Stored when acquiring.
    pub to_lock: i32,
    /// Stored when releasing.
    pub to_unlock: i32,
}

impl Locking {
    pub fn new(locks: MemRef, num_locks: Exp) -> Self {
        Locking {
            locks,
            num_locks,
            unlocked: UNLOCKED,
            to_lock: LOCKED,
            to_unlock: UNLOCKED,
        }
    }

    pub fn slot(&self, flat_bucket: Exp) -> Exp {
        flat_bucket.rem(self.num_locks.clone())
    }
}

fn fence_for(space: Space) -> Fence {
    match space {
        Space::Local => Fence::Local,
        Space::Global | Space::Private => Fence::Global,
    }
}

/// The value of type `ty` whose bits are the compare-and-swap word `word`.
fn from_word(ty: PrimType, word: Exp) -> Exp {
    if ty == ty.word_type() {
        word
    } else {
        word.bitcast(ty)
    }
}

fn to_word(ty: PrimType, value: Exp) -> Exp {
    if ty == ty.word_type() {
        value
    } else {
        value.bitcast(ty.word_type())
    }
}

/// `dest[index] = candidate`, where `candidate` is computed from the word `assumed` holds, and
/// retried until no other thread interfered.
///
/// Hardware compare-and-swap works on integer words, so non-integer values are bit-cast and
/// the loop exits once the word read back matches the one assumed.
fn cas_loop(
    names: &mut NameSource,
    dest: &MemRef,
    index: Exp,
    assumed: VName,
    candidate: Exp,
) -> Stmt {
    let ty = dest.ty;
    let word = ty.word_type();
    let old = names.fresh("old");
    let old_bits = names.fresh("old_bits");
    let run_loop = names.fresh("run_loop");
    let word_view = MemRef {
        ty: word,
        ..dest.clone()
    };
    Stmt::seq(vec![
        Stmt::declare(&old, ty),
        dest.clone().volatile().read(&old, index.clone()),
        Stmt::declare_init(&old_bits, word, to_word(ty, Exp::var(&old))),
        Stmt::declare(&assumed, word),
        Stmt::declare_init(&run_loop, PrimType::Bool, Exp::bool(true)),
        Stmt::while_loop(
            Exp::var(&run_loop),
            Stmt::seq(vec![
                Stmt::set(&assumed, Exp::var(&old_bits)),
                Stmt::atomic(AtomicOp::Cas {
                    old: old_bits.clone(),
                    mem: word_view,
                    index,
                    expected: Exp::var(&assumed),
                    desired: to_word(ty, candidate),
                }),
                Stmt::when(
                    Exp::var(&old_bits).equals(Exp::var(&assumed)),
                    Stmt::set(&run_loop, Exp::bool(false)),
                ),
            ]),
        ),
    ])
}

fn locked_update(
    names: &mut NameSource,
    locking: &Locking,
    lam: &Lambda,
    dests: &[MemRef],
    index: Exp,
    values: &[Exp],
) -> Stmt {
    let space = locking.locks.space;
    let slot = locking.slot(index.clone());
    let continue_ = names.fresh("continue");
    let old = names.fresh("old");
    let released = names.fresh("released");
    let lock_view = locking.locks.clone().volatile();

    let mut bind = vec![];
    let mut accs = vec![];
    for (dest, param) in dests.iter().zip(lam.x_params()) {
        let acc = names.fresh("acc");
        bind.push(Stmt::declare(&acc, param.ty));
        bind.push(dest.clone().volatile().read(&acc, index.clone()));
        accs.push(Exp::var(&acc));
    }
    let update: Vec<Stmt> = dests
        .iter()
        .zip(lam.apply(&accs, values))
        .map(|(dest, res)| dest.clone().volatile().write(index.clone(), res))
        .collect();

    let critical = Stmt::seq(vec![
        Stmt::comment("bind lhs", Stmt::seq(bind)),
        Stmt::comment("update result", Stmt::seq(update)),
        Stmt::mem_fence(fence_for(dests.first().map_or(space, |d| d.space))),
        Stmt::declare(&released, PrimType::I32),
        Stmt::atomic(AtomicOp::Cas {
            old: released,
            mem: lock_view.clone(),
            index: slot.clone(),
            expected: Exp::i32(locking.to_lock),
            desired: Exp::i32(locking.to_unlock),
        }),
        Stmt::set(&continue_, Exp::bool(false)),
    ]);
    Stmt::seq(vec![
        Stmt::declare_init(&continue_, PrimType::Bool, Exp::bool(true)),
        Stmt::declare(&old, PrimType::I32),
        Stmt::while_loop(
            Exp::var(&continue_),
            Stmt::seq(vec![
                Stmt::atomic(AtomicOp::Cas {
                    old: old.clone(),
                    mem: lock_view,
                    index: slot,
                    expected: Exp::i32(locking.unlocked),
                    desired: Exp::i32(locking.to_lock),
                }),
                Stmt::when(Exp::var(&old).equals(Exp::i32(locking.unlocked)), critical),
                Stmt::mem_fence(fence_for(space)),
            ]),
        ),
    ])
}

/// Folds `values` into the accumulators `dests[index]` with `lam`, following `update`.
#[allow(clippy::too_many_arguments)]
pub fn atomic_update(
    names: &mut NameSource,
    update: &AtomicUpdate,
    lam: &Lambda,
    locking: Option<&Locking>,
    dests: &[MemRef],
    index: Exp,
    values: &[Exp],
) -> LowerResult<Stmt> {
    if dests.len() != lam.arity() || values.len() != lam.arity() {
        return Err(LowerError::bug(
            format!(
                "operator of arity {} applied to {} destinations",
                lam.arity(),
                dests.len()
            ),
            "histogram operator",
            lam.span,
        ));
    }
    let code = match update {
        AtomicUpdate::Prim(comps) => Stmt::seq(
            comps
                .iter()
                .zip(dests)
                .zip(values)
                .map(|((comp, dest), value)| match comp {
                    ComponentUpdate::Native(op) => {
                        let old = names.fresh("old");
                        Stmt::seq(vec![
                            Stmt::declare(&old, dest.ty),
                            Stmt::atomic(AtomicOp::Rmw {
                                op: *op,
                                old,
                                mem: dest.clone(),
                                index: index.clone(),
                                value: value.clone(),
                            }),
                        ])
                    }
                    ComponentUpdate::Cas(op) => {
                        let assumed = names.fresh("assumed");
                        let x = from_word(dest.ty, Exp::var(&assumed));
                        let candidate = Exp::binop(*op, x, value.clone());
                        cas_loop(names, dest, index.clone(), assumed, candidate)
                    }
                })
                .collect(),
        ),
        AtomicUpdate::Cas => {
            let assumed = names.fresh("assumed");
            let candidate = match dests {
                [dest] => lam.apply(&[from_word(dest.ty, Exp::var(&assumed))], values),
                _ => vec![],
            };
            match (dests, candidate.as_slice()) {
                ([dest], [candidate]) => {
                    cas_loop(names, dest, index, assumed, candidate.clone())
                }
                _ => {
                    return Err(LowerError::bug(
                        "compare-and-swap update of a multi-component operator",
                        "histogram operator",
                        lam.span,
                    ))
                }
            }
        }
        AtomicUpdate::Locking => match locking {
            Some(locking) => locked_update(names, locking, lam, dests, index, values),
            None => {
                return Err(LowerError::bug(
                    "locking update without a lock array",
                    "histogram operator",
                    lam.span,
                ))
            }
        },
    };
    Ok(Stmt::comment("atomic update", code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{binop_lambda, lambda, var};

    #[test]
    fn int_add_is_native() {
        let lam = binop_lambda(BinOp::Add, PrimType::I32);
        assert_eq!(
            select_strategy(&AtomicsTable::Cuda, &lam),
            AtomicUpdate::Prim(vec![ComponentUpdate::Native(AtomicBinOp::Add)])
        );
    }

    #[test]
    fn float_add_falls_back_to_cas_without_native_support() {
        let lam = binop_lambda(BinOp::Add, PrimType::F32);
        assert_eq!(
            select_strategy(&AtomicsTable::OpenCl, &lam),
            AtomicUpdate::Prim(vec![ComponentUpdate::Cas(BinOp::Add)])
        );
        assert_eq!(
            select_strategy(&AtomicsTable::Cuda, &lam),
            AtomicUpdate::Prim(vec![ComponentUpdate::Native(AtomicBinOp::Add)])
        );
    }

    #[test]
    fn single_non_binop_result_uses_cas() {
        // x * 2 + y
        let lam = lambda(
            vec![("x", PrimType::I32), ("y", PrimType::I32)],
            vec![Exp::binop(
                BinOp::Add,
                Exp::binop(BinOp::Mul, var("x"), Exp::i32(2)),
                var("y"),
            )],
        );
        assert_eq!(select_strategy(&AtomicsTable::Cuda, &lam), AtomicUpdate::Cas);
    }

    #[test]
    fn wide_values_need_locking() {
        let lam = binop_lambda(BinOp::Add, PrimType::I64);
        assert_eq!(
            select_strategy(&AtomicsTable::Cuda, &lam).strategy(),
            AtomicStrategy::Locking
        );
        let pair = lambda(
            vec![
                ("x0", PrimType::I32),
                ("x1", PrimType::I64),
                ("y0", PrimType::I32),
                ("y1", PrimType::I64),
            ],
            vec![
                Exp::binop(BinOp::Add, var("x0"), var("y0")),
                Exp::binop(BinOp::Max, var("x1"), var("y1")),
            ],
        );
        assert_eq!(select_strategy(&AtomicsTable::Cuda, &pair), AtomicUpdate::Locking);
    }

    #[test]
    fn mixed_components_choose_per_component() {
        let lam = lambda(
            vec![
                ("x0", PrimType::I32),
                ("x1", PrimType::I32),
                ("y0", PrimType::I32),
                ("y1", PrimType::I32),
            ],
            vec![
                Exp::binop(BinOp::Add, var("x0"), var("y0")),
                Exp::binop(BinOp::Mul, var("x1"), var("y1")),
            ],
        );
        assert_eq!(
            select_strategy(&AtomicsTable::Cuda, &lam),
            AtomicUpdate::Prim(vec![
                ComponentUpdate::Native(AtomicBinOp::Add),
                ComponentUpdate::Cas(BinOp::Mul)
            ])
        );
    }

    #[test]
    fn selection_is_deterministic() {
        let build = || binop_lambda(BinOp::Max, PrimType::U32);
        assert_eq!(
            select_strategy(&AtomicsTable::OpenCl, &build()),
            select_strategy(&AtomicsTable::OpenCl, &build()),
            "same operator shape selected different strategies"
        );
    }

    #[test]
    fn locking_without_locks_is_a_bug() {
        let lam = binop_lambda(BinOp::Add, PrimType::I64);
        let dest = MemRef::new(&VName::new("hist"), PrimType::I64, Space::Global);
        let err = atomic_update(
            &mut NameSource::new(),
            &AtomicUpdate::Locking,
            &lam,
            None,
            &[dest],
            Exp::int(0),
            &[Exp::int(1)],
        )
        .unwrap_err();
        assert!(!err.is_limitation());
    }
}
