//! Segmented-operation descriptors, as handed over by the optimiser.

use crate::ir::{Exp, PrimType, PrimValue, Span, VName};
use seglower_derive::span_derive;
use std::collections::{BTreeMap, HashMap};

/// An operand that is either a constant or a variable.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum SubExp {
    Const(PrimValue),
    Var(VName),
}

impl SubExp {
    pub fn int(v: i64) -> Self {
        SubExp::Const(PrimValue::I64(v))
    }

    pub fn var(name: &str) -> Self {
        SubExp::Var(VName::new(name))
    }

    pub fn to_exp(&self) -> Exp {
        match self {
            SubExp::Const(v) => Exp::Const(*v),
            SubExp::Var(name) => Exp::Var(name.clone()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SubExp::Const(PrimValue::I64(v)) => Some(*v),
            _ => None,
        }
    }
}

pub fn exps(ses: &[SubExp]) -> Vec<Exp> {
    ses.iter().map(SubExp::to_exp).collect()
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Level {
    Thread,
    Group,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SegVirt {
    /// `num_groups * group_size` already covers the space.
    None,
    Virtualize,
    /// Virtualised, but the space is known to be an exact multiple of the group size, so no
    /// active-thread predicate is needed.
    FullNoPredicate,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SegLevel {
    pub level: Level,
    pub num_groups: SubExp,
    pub group_size: SubExp,
    pub virt: SegVirt,
}

/// An iteration space: one bound index per dimension plus the flat index.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SegSpace {
    pub flat: VName,
    pub dims: Vec<(VName, SubExp)>,
}

impl SegSpace {
    pub fn new(flat: &str, dims: Vec<(&str, SubExp)>) -> Self {
        SegSpace {
            flat: VName::new(flat),
            dims: dims
                .into_iter()
                .map(|(name, size)| (VName::new(name), size))
                .collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn indices(&self) -> Vec<VName> {
        self.dims.iter().map(|(i, _)| i.clone()).collect()
    }

    pub fn index_exps(&self) -> Vec<Exp> {
        self.dims.iter().map(|(i, _)| Exp::var(i)).collect()
    }

    pub fn shape(&self) -> Vec<SubExp> {
        self.dims.iter().map(|(_, d)| d.clone()).collect()
    }

    pub fn dim_exps(&self) -> Vec<Exp> {
        self.dims.iter().map(|(_, d)| d.to_exp()).collect()
    }

    /// Number of points in the space.
    pub fn size(&self) -> Exp {
        Exp::product(self.dim_exps())
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Param {
    pub name: VName,
    pub ty: PrimType,
}

impl Param {
    pub fn new(name: &str, ty: PrimType) -> Self {
        Param {
            name: VName::new(name),
            ty,
        }
    }
}

/// A combining operator of arity `2k`: the `k` accumulator parameters come first.
#[span_derive(PartialEq, Eq, Hash)]
#[derive(Clone, Debug)]
pub struct Lambda {
    pub params: Vec<Param>,
    pub results: Vec<Exp>,
    #[span_ignore]
    pub span: Option<Span>,
}

impl Lambda {
    pub fn arity(&self) -> usize {
        self.results.len()
    }

    pub fn x_params(&self) -> &[Param] {
        &self.params[..self.arity().min(self.params.len())]
    }

    pub fn y_params(&self) -> &[Param] {
        &self.params[self.arity().min(self.params.len())..]
    }

    pub fn result_types(&self) -> Vec<PrimType> {
        self.x_params().iter().map(|p| p.ty).collect()
    }

    pub fn is_well_formed(&self) -> bool {
        self.params.len() == 2 * self.results.len()
            && self
                .x_params()
                .iter()
                .zip(self.y_params())
                .all(|(x, y)| x.ty == y.ty)
    }

    /// The results with the parameters replaced by `xs` and `ys`.
    pub fn apply(&self, xs: &[Exp], ys: &[Exp]) -> Vec<Exp> {
        let subst: HashMap<VName, Exp> = self
            .x_params()
            .iter()
            .zip(xs)
            .chain(self.y_params().iter().zip(ys))
            .map(|(p, e)| (p.name.clone(), e.clone()))
            .collect();
        self.results.iter().map(|r| r.substitute(&subst)).collect()
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SegBinOp {
    pub lambda: Lambda,
    pub neutral: Vec<SubExp>,
    /// Lane shape; non-empty makes every component an array, combined lane-wise.
    pub shape: Vec<SubExp>,
    pub commutative: bool,
}

impl SegBinOp {
    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    pub fn lanes(&self) -> Exp {
        Exp::product(exps(&self.shape))
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HistOp {
    pub width: SubExp,
    /// Outer bucket dimensions; destinations have shape `extra_shape ++ [width]`.
    pub extra_shape: Vec<SubExp>,
    pub neutral: Vec<SubExp>,
    pub lambda: Lambda,
    pub dests: Vec<VName>,
}

impl HistOp {
    pub fn dest_shape(&self) -> Vec<SubExp> {
        let mut shape = self.extra_shape.clone();
        shape.push(self.width.clone());
        shape
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Split {
    Contiguous,
    Strided(SubExp),
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum KernelResult {
    Returns(SubExp),
    /// Each group produces the tile `array`; one `(extent, tile size)` pair per dimension.
    TileReturns {
        tiles: Vec<(SubExp, SubExp)>,
        array: VName,
    },
    /// Scattered writes into a destination of logical extents `shape`.
    WriteReturns {
        shape: Vec<SubExp>,
        writes: Vec<(Vec<SubExp>, SubExp)>,
    },
    ConcatReturns {
        split: Split,
        per_thread: SubExp,
        array: VName,
    },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PatElem {
    pub name: VName,
    pub ty: PrimType,
    pub shape: Vec<SubExp>,
}

impl PatElem {
    pub fn new(name: &str, ty: PrimType, shape: Vec<SubExp>) -> Self {
        PatElem {
            name: VName::new(name),
            ty,
            shape,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum BodyStm {
    Let {
        name: VName,
        ty: PrimType,
        exp: Exp,
    },
    /// Reads one element of an array in scope.
    Index {
        name: VName,
        ty: PrimType,
        array: VName,
        index: Vec<Exp>,
    },
    /// A small per-thread array.
    ArrayLit {
        name: VName,
        ty: PrimType,
        elems: Vec<SubExp>,
    },
    /// A nested intra-group operation; only legal in a group-level body.
    Op { pat: Vec<PatElem>, op: Box<SegOp> },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KernelBody {
    pub stms: Vec<BodyStm>,
    pub results: Vec<KernelResult>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SegOpKind {
    Map,
    Scan(Vec<SegBinOp>),
    Red(Vec<SegBinOp>),
    Hist(Vec<HistOp>),
}

impl SegOpKind {
    pub fn name(&self) -> &'static str {
        match self {
            SegOpKind::Map => "segmap",
            SegOpKind::Scan(_) => "segscan",
            SegOpKind::Red(_) => "segred",
            SegOpKind::Hist(_) => "seghist",
        }
    }
}

/// A segmented operation.
///
/// Body results are laid out as the operator contributions first (for histograms: one bucket
/// per operator, then the values), followed by mapped results.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SegOp {
    pub kind: SegOpKind,
    pub level: SegLevel,
    pub space: SegSpace,
    pub body: KernelBody,
    pub span: Option<Span>,
}

/// Operations run on the host side of a descriptor file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum HostOp {
    Seg { pat: Vec<PatElem>, op: SegOp },
    Replicate { dest: VName, value: SubExp },
    Iota {
        dest: VName,
        start: SubExp,
        step: SubExp,
    },
    Copy { dest: VName, src: VName },
}

/// What the host side makes available to kernels.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct HostEnv {
    pub arrays: BTreeMap<VName, (PrimType, Vec<SubExp>)>,
    pub scalars: BTreeMap<VName, PrimType>,
    pub constants: BTreeMap<VName, PrimValue>,
}

impl HostEnv {
    pub fn new() -> Self {
        HostEnv::default()
    }

    pub fn with_array(mut self, name: &str, ty: PrimType, shape: Vec<SubExp>) -> Self {
        self.arrays.insert(VName::new(name), (ty, shape));
        self
    }

    pub fn with_scalar(mut self, name: &str, ty: PrimType) -> Self {
        self.scalars.insert(VName::new(name), ty);
        self
    }

    pub fn with_constant(mut self, name: &str, value: PrimValue) -> Self {
        self.constants.insert(VName::new(name), value);
        self
    }

    /// Whether `se` can be evaluated before any kernel runs.
    pub fn is_invariant(&self, se: &SubExp) -> bool {
        match se {
            SubExp::Const(_) => true,
            SubExp::Var(name) => self.scalars.contains_key(name) || self.constants.contains_key(name),
        }
    }
}

/// A parsed descriptor file.
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Module {
    pub env: HostEnv,
    pub ops: Vec<HostOp>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::BinOp;

    fn add(span: Option<Span>) -> Lambda {
        Lambda {
            params: vec![Param::new("x", PrimType::I32), Param::new("y", PrimType::I32)],
            results: vec![Exp::binop(
                BinOp::Add,
                Exp::var(&VName::new("x")),
                Exp::var(&VName::new("y")),
            )],
            span,
        }
    }

    #[test]
    fn lambda_equality_ignores_spans() {
        assert_eq!(add(None), add(Some(Span::new(3, 9))));
    }

    #[test]
    fn lambda_application_substitutes_parameters() {
        let lam = add(None);
        assert!(lam.is_well_formed());
        let applied = lam.apply(&[Exp::i32(1)], &[Exp::i32(2)]);
        assert_eq!(
            applied,
            vec![Exp::binop(BinOp::Add, Exp::i32(1), Exp::i32(2))]
        );
    }
}
