//! Helper functions for parsing

use crate::ir::{BinOp, CmpOp, Exp, PrimType, PrimValue, UnOp, VName};
use crate::segop::{HostOp, Module, SubExp};

/// A top-level declaration or operation of a descriptor file.
pub enum Item {
    Array(VName, PrimType, Vec<SubExp>),
    Scalar(VName, PrimType),
    Const(VName, PrimValue),
    Op(HostOp),
}

pub fn make_binary(op: BinOp, lhs: Exp, rhs: Exp) -> Exp {
    Exp::BinOp(op, Box::new(lhs), Box::new(rhs))
}

pub fn make_cmp(op: CmpOp, lhs: Exp, rhs: Exp) -> Exp {
    Exp::Cmp(op, Box::new(lhs), Box::new(rhs))
}

pub fn make_unary(op: UnOp, rhs: Exp) -> Exp {
    Exp::UnOp(op, Box::new(rhs))
}

fn suffix_type(suffix: &str) -> Option<PrimType> {
    match suffix {
        "i32" => Some(PrimType::I32),
        "i64" => Some(PrimType::I64),
        "u32" => Some(PrimType::U32),
        "u64" => Some(PrimType::U64),
        "f32" => Some(PrimType::F32),
        "f64" => Some(PrimType::F64),
        _ => None,
    }
}

/// Parses a numeric literal such as `3`, `-1i32` or `0.5f32`.
///
/// Unsuffixed literals take the `expected` type when there is one, and are `i64` (or `f64` with
/// a fractional part) otherwise.
pub fn parse_literal(text: &str, expected: Option<PrimType>) -> Result<PrimValue, &'static str> {
    let (digits, suffix) = match text.find(|c| matches!(c, 'i' | 'u' | 'f')) {
        Some(i) => (&text[..i], Some(&text[i..])),
        None => (text, None),
    };
    let suffixed = match suffix {
        Some(s) => Some(suffix_type(s).ok_or("unknown literal suffix")?),
        None => None,
    };
    let fractional = digits.contains('.');
    let ty = match (suffixed, expected) {
        (Some(s), Some(e)) if s != e => return Err("literal does not match the declared type"),
        (Some(s), _) => s,
        (None, Some(e)) => e,
        (None, None) if fractional => PrimType::F64,
        (None, None) => PrimType::I64,
    };
    if fractional && !ty.is_float() {
        return Err("fractional literal of an integer type");
    }
    match ty {
        PrimType::Bool => Err("numeric literal of type bool"),
        PrimType::I32 => digits
            .parse()
            .map(PrimValue::I32)
            .map_err(|_| "i32 literal out of range"),
        PrimType::I64 => digits
            .parse()
            .map(PrimValue::I64)
            .map_err(|_| "i64 literal out of range"),
        PrimType::U32 => digits
            .parse()
            .map(PrimValue::U32)
            .map_err(|_| "u32 literal out of range"),
        PrimType::U64 => digits
            .parse()
            .map(PrimValue::U64)
            .map_err(|_| "u64 literal out of range"),
        PrimType::F32 => digits
            .parse()
            .map(PrimValue::F32)
            .map_err(|_| "malformed f32 literal"),
        PrimType::F64 => digits
            .parse()
            .map(PrimValue::F64)
            .map_err(|_| "malformed f64 literal"),
    }
}

/// Collects declarations into the host environment. Destinations of top-level operations that
/// were not declared become arrays of their pattern type.
pub fn build_module(items: Vec<Item>) -> Module {
    let mut module = Module::default();
    for item in items {
        match item {
            Item::Array(name, ty, shape) => {
                module.env.arrays.insert(name, (ty, shape));
            }
            Item::Scalar(name, ty) => {
                module.env.scalars.insert(name, ty);
            }
            Item::Const(name, value) => {
                module.env.constants.insert(name, value);
            }
            Item::Op(op) => {
                if let HostOp::Seg { pat, .. } = &op {
                    for pe in pat {
                        module
                            .env
                            .arrays
                            .entry(pe.name.clone())
                            .or_insert_with(|| (pe.ty, pe.shape.clone()));
                    }
                }
                module.ops.push(op);
            }
        }
    }
    module
}
