use crate::ir::{BinOp, Exp, PrimType, PrimValue, VName};
use crate::segop::*;

//
// Operands
//
pub fn name(n: &str) -> VName {
    VName::new(n)
}

pub fn var(n: &str) -> Exp {
    Exp::Var(VName::new(n))
}

pub fn size(v: i64) -> SubExp {
    SubExp::int(v)
}

pub fn size_var(n: &str) -> SubExp {
    SubExp::var(n)
}

pub fn lit_i32(v: i32) -> SubExp {
    SubExp::Const(PrimValue::I32(v))
}

pub fn lit_i64(v: i64) -> SubExp {
    SubExp::Const(PrimValue::I64(v))
}

pub fn lit_f32(v: f32) -> SubExp {
    SubExp::Const(PrimValue::F32(v))
}

//
// Levels and spaces
//
pub fn thread(num_groups: SubExp, group_size: SubExp, virt: SegVirt) -> SegLevel {
    SegLevel {
        level: Level::Thread,
        num_groups,
        group_size,
        virt,
    }
}

pub fn group(num_groups: SubExp, group_size: SubExp, virt: SegVirt) -> SegLevel {
    SegLevel {
        level: Level::Group,
        num_groups,
        group_size,
        virt,
    }
}

pub fn space(flat: &str, dims: Vec<(&str, SubExp)>) -> SegSpace {
    SegSpace::new(flat, dims)
}

//
// Operators
//
pub fn lambda(params: Vec<(&str, PrimType)>, results: Vec<Exp>) -> Lambda {
    Lambda {
        params: params
            .into_iter()
            .map(|(n, ty)| Param::new(n, ty))
            .collect(),
        results,
        span: None,
    }
}

/// `\x y -> x op y` on a single component.
pub fn binop_lambda(op: BinOp, ty: PrimType) -> Lambda {
    lambda(
        vec![("x", ty), ("y", ty)],
        vec![Exp::binop(op, var("x"), var("y"))],
    )
}

pub fn seg_binop(lambda: Lambda, neutral: Vec<SubExp>, commutative: bool) -> SegBinOp {
    SegBinOp {
        lambda,
        neutral,
        shape: vec![],
        commutative,
    }
}

pub fn seg_binop_lanes(lambda: Lambda, neutral: Vec<SubExp>, shape: Vec<SubExp>) -> SegBinOp {
    SegBinOp {
        lambda,
        neutral,
        shape,
        commutative: false,
    }
}

pub fn hist_op(
    width: SubExp,
    extra_shape: Vec<SubExp>,
    neutral: Vec<SubExp>,
    lambda: Lambda,
    dests: Vec<&str>,
) -> HistOp {
    HistOp {
        width,
        extra_shape,
        neutral,
        lambda,
        dests: dests.into_iter().map(VName::new).collect(),
    }
}

//
// Bodies
//
pub fn let_(n: &str, ty: PrimType, exp: Exp) -> BodyStm {
    BodyStm::Let {
        name: VName::new(n),
        ty,
        exp,
    }
}

pub fn index(n: &str, ty: PrimType, array: &str, index: Vec<Exp>) -> BodyStm {
    BodyStm::Index {
        name: VName::new(n),
        ty,
        array: VName::new(array),
        index,
    }
}

pub fn array_lit(n: &str, ty: PrimType, elems: Vec<SubExp>) -> BodyStm {
    BodyStm::ArrayLit {
        name: VName::new(n),
        ty,
        elems,
    }
}

pub fn nested(pat: Vec<PatElem>, op: SegOp) -> BodyStm {
    BodyStm::Op {
        pat,
        op: Box::new(op),
    }
}

pub fn body(stms: Vec<BodyStm>, results: Vec<KernelResult>) -> KernelBody {
    KernelBody { stms, results }
}

pub fn returns(se: SubExp) -> KernelResult {
    KernelResult::Returns(se)
}

pub fn pat_elem(n: &str, ty: PrimType, shape: Vec<SubExp>) -> PatElem {
    PatElem::new(n, ty, shape)
}

//
// Operations
//
fn seg_op(kind: SegOpKind, level: SegLevel, space: SegSpace, body: KernelBody) -> SegOp {
    SegOp {
        kind,
        level,
        space,
        body,
        span: None,
    }
}

pub fn segmap(level: SegLevel, space: SegSpace, body: KernelBody) -> SegOp {
    seg_op(SegOpKind::Map, level, space, body)
}

pub fn segred(level: SegLevel, space: SegSpace, ops: Vec<SegBinOp>, body: KernelBody) -> SegOp {
    seg_op(SegOpKind::Red(ops), level, space, body)
}

pub fn segscan(level: SegLevel, space: SegSpace, ops: Vec<SegBinOp>, body: KernelBody) -> SegOp {
    seg_op(SegOpKind::Scan(ops), level, space, body)
}

pub fn seghist(level: SegLevel, space: SegSpace, ops: Vec<HistOp>, body: KernelBody) -> SegOp {
    seg_op(SegOpKind::Hist(ops), level, space, body)
}
