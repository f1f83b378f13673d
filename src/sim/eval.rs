//! Scalar expression semantics.

use super::SimError;
use crate::ir::{BinOp, CmpOp, Exp, PrimType, PrimValue, UnOp, VName};
use std::cmp::Ordering;

fn mismatch(what: impl Into<String>) -> SimError {
    SimError::TypeMismatch { what: what.into() }
}

/// Evaluates `exp`, reading variables through `lookup`.
///
/// `&&`, `||` and `select` only evaluate the operand they need, so guards such as
/// `i > 0 && flag(i - 1)` are safe.
pub fn eval<F>(exp: &Exp, lookup: &F) -> Result<PrimValue, SimError>
where
    F: Fn(&VName) -> Option<PrimValue>,
{
    match exp {
        Exp::Var(name) => lookup(name).ok_or_else(|| SimError::UnknownVariable(name.clone())),
        Exp::Const(v) => Ok(*v),
        Exp::BinOp(BinOp::LogAnd, x, y) => match eval(x, lookup)? {
            PrimValue::Bool(false) => Ok(PrimValue::Bool(false)),
            PrimValue::Bool(true) => expect_bool(eval(y, lookup)?, "&&"),
            v => Err(mismatch(format!("&& applied to {}", v.ty()))),
        },
        Exp::BinOp(BinOp::LogOr, x, y) => match eval(x, lookup)? {
            PrimValue::Bool(true) => Ok(PrimValue::Bool(true)),
            PrimValue::Bool(false) => expect_bool(eval(y, lookup)?, "||"),
            v => Err(mismatch(format!("|| applied to {}", v.ty()))),
        },
        Exp::BinOp(op, x, y) => binop(*op, eval(x, lookup)?, eval(y, lookup)?),
        Exp::Cmp(op, x, y) => cmp(*op, eval(x, lookup)?, eval(y, lookup)?),
        Exp::UnOp(op, x) => unop(*op, eval(x, lookup)?),
        Exp::Convert(ty, x) => Ok(convert(*ty, eval(x, lookup)?)),
        Exp::BitCast(ty, x) => bitcast(*ty, eval(x, lookup)?),
        Exp::Select(c, t, e) => match eval(c, lookup)? {
            PrimValue::Bool(true) => eval(t, lookup),
            PrimValue::Bool(false) => eval(e, lookup),
            v => Err(mismatch(format!("select on {}", v.ty()))),
        },
    }
}

fn expect_bool(v: PrimValue, op: &str) -> Result<PrimValue, SimError> {
    match v {
        PrimValue::Bool(_) => Ok(v),
        _ => Err(mismatch(format!("{} applied to {}", op, v.ty()))),
    }
}

/// Evaluates `exp` to an index or size.
pub fn eval_int<F>(exp: &Exp, lookup: &F) -> Result<i64, SimError>
where
    F: Fn(&VName) -> Option<PrimValue>,
{
    let v = eval(exp, lookup)?;
    match v {
        PrimValue::I64(i) => Ok(i),
        _ => Err(mismatch(format!("expected an i64 index, found {}", v.ty()))),
    }
}

pub fn eval_bool<F>(exp: &Exp, lookup: &F) -> Result<bool, SimError>
where
    F: Fn(&VName) -> Option<PrimValue>,
{
    let v = eval(exp, lookup)?;
    v.as_bool()
        .ok_or_else(|| mismatch(format!("expected a condition, found {}", v.ty())))
}

macro_rules! int_binop {
    ($op: expr, $a: expr, $b: expr, $zero: expr) => {
        match $op {
            BinOp::Add => $a.wrapping_add($b),
            BinOp::Sub => $a.wrapping_sub($b),
            BinOp::Mul => $a.wrapping_mul($b),
            BinOp::Div if $b == $zero => return Err(SimError::DivisionByZero),
            BinOp::Div => $a.wrapping_div($b),
            BinOp::Mod if $b == $zero => return Err(SimError::DivisionByZero),
            BinOp::Mod => $a.wrapping_rem($b),
            BinOp::Min => $a.min($b),
            BinOp::Max => $a.max($b),
            BinOp::And => $a & $b,
            BinOp::Or => $a | $b,
            BinOp::Xor => $a ^ $b,
            BinOp::Shl => $a.wrapping_shl($b as u32),
            BinOp::Shr => $a.wrapping_shr($b as u32),
            BinOp::LogAnd | BinOp::LogOr => {
                return Err(mismatch(format!("{:?} on integers", $op)))
            }
        }
    };
}

macro_rules! float_binop {
    ($op: expr, $a: expr, $b: expr) => {
        match $op {
            BinOp::Add => $a + $b,
            BinOp::Sub => $a - $b,
            BinOp::Mul => $a * $b,
            BinOp::Div => $a / $b,
            BinOp::Mod => $a % $b,
            BinOp::Min => $a.min($b),
            BinOp::Max => $a.max($b),
            _ => return Err(mismatch(format!("{:?} on floats", $op))),
        }
    };
}

pub fn binop(op: BinOp, x: PrimValue, y: PrimValue) -> Result<PrimValue, SimError> {
    use PrimValue::*;
    Ok(match (x, y) {
        (Bool(a), Bool(b)) => Bool(match op {
            BinOp::LogAnd | BinOp::And | BinOp::Min => a && b,
            BinOp::LogOr | BinOp::Or | BinOp::Max => a || b,
            BinOp::Xor => a ^ b,
            _ => return Err(mismatch(format!("{:?} on booleans", op))),
        }),
        (I32(a), I32(b)) => I32(int_binop!(op, a, b, 0)),
        (I64(a), I64(b)) => I64(int_binop!(op, a, b, 0)),
        (U32(a), U32(b)) => U32(int_binop!(op, a, b, 0)),
        (U64(a), U64(b)) => U64(int_binop!(op, a, b, 0)),
        (F32(a), F32(b)) => F32(float_binop!(op, a, b)),
        (F64(a), F64(b)) => F64(float_binop!(op, a, b)),
        _ => {
            return Err(mismatch(format!(
                "{:?} on {} and {}",
                op,
                x.ty(),
                y.ty()
            )))
        }
    })
}

fn ordering(x: PrimValue, y: PrimValue) -> Result<Option<Ordering>, SimError> {
    use PrimValue::*;
    Ok(match (x, y) {
        (Bool(a), Bool(b)) => a.partial_cmp(&b),
        (I32(a), I32(b)) => a.partial_cmp(&b),
        (I64(a), I64(b)) => a.partial_cmp(&b),
        (U32(a), U32(b)) => a.partial_cmp(&b),
        (U64(a), U64(b)) => a.partial_cmp(&b),
        (F32(a), F32(b)) => a.partial_cmp(&b),
        (F64(a), F64(b)) => a.partial_cmp(&b),
        _ => return Err(mismatch(format!("comparison of {} and {}", x.ty(), y.ty()))),
    })
}

pub fn cmp(op: CmpOp, x: PrimValue, y: PrimValue) -> Result<PrimValue, SimError> {
    let ord = ordering(x, y)?;
    let r = match op {
        CmpOp::Eq => ord == Some(Ordering::Equal),
        CmpOp::Ne => ord != Some(Ordering::Equal),
        CmpOp::Lt => ord == Some(Ordering::Less),
        CmpOp::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ord == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
    };
    Ok(PrimValue::Bool(r))
}

fn unop(op: UnOp, x: PrimValue) -> Result<PrimValue, SimError> {
    use PrimValue::*;
    Ok(match (op, x) {
        (UnOp::Not, Bool(b)) => Bool(!b),
        (UnOp::Not, I32(a)) => I32(!a),
        (UnOp::Not, I64(a)) => I64(!a),
        (UnOp::Not, U32(a)) => U32(!a),
        (UnOp::Not, U64(a)) => U64(!a),
        (UnOp::Neg, I32(a)) => I32(a.wrapping_neg()),
        (UnOp::Neg, I64(a)) => I64(a.wrapping_neg()),
        (UnOp::Neg, F32(a)) => F32(-a),
        (UnOp::Neg, F64(a)) => F64(-a),
        (UnOp::Abs, I32(a)) => I32(a.wrapping_abs()),
        (UnOp::Abs, I64(a)) => I64(a.wrapping_abs()),
        (UnOp::Abs, U32(_)) | (UnOp::Abs, U64(_)) => x,
        (UnOp::Abs, F32(a)) => F32(a.abs()),
        (UnOp::Abs, F64(a)) => F64(a.abs()),
        _ => return Err(mismatch(format!("{:?} on {}", op, x.ty()))),
    })
}

/// Numeric conversion with truncation and wrap-around, as device code performs it.
pub fn convert(ty: PrimType, x: PrimValue) -> PrimValue {
    use PrimValue::*;
    let float = match x {
        F32(a) => Some(a as f64),
        F64(a) => Some(a),
        _ => None,
    };
    if let Some(f) = float {
        return match ty {
            PrimType::Bool => Bool(f != 0.0),
            PrimType::I32 => I32(f as i32),
            PrimType::I64 => I64(f as i64),
            PrimType::U32 => U32(f as u32),
            PrimType::U64 => U64(f as u64),
            PrimType::F32 => F32(f as f32),
            PrimType::F64 => F64(f),
        };
    }
    let i: i128 = match x {
        Bool(b) => b as i128,
        I32(a) => a as i128,
        I64(a) => a as i128,
        U32(a) => a as i128,
        U64(a) => a as i128,
        F32(_) | F64(_) => 0,
    };
    match ty {
        PrimType::Bool => Bool(i != 0),
        PrimType::I32 => I32(i as i32),
        PrimType::I64 => I64(i as i64),
        PrimType::U32 => U32(i as u32),
        PrimType::U64 => U64(i as u64),
        PrimType::F32 => F32(i as f32),
        PrimType::F64 => F64(i as f64),
    }
}

pub fn bitcast(ty: PrimType, x: PrimValue) -> Result<PrimValue, SimError> {
    if ty.bit_width() != x.ty().bit_width() {
        return Err(mismatch(format!("bit cast of {} to {}", x.ty(), ty)));
    }
    Ok(PrimValue::from_bits(ty, x.to_bits()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn run(exp: &Exp, env: &HashMap<VName, PrimValue>) -> Result<PrimValue, SimError> {
        eval(exp, &|n: &VName| env.get(n).copied())
    }

    #[test]
    fn short_circuit_skips_unbound_operands() {
        let env = HashMap::new();
        let guarded = Exp::bool(false).and(Exp::var(&VName::new("unbound")));
        assert_eq!(run(&guarded, &env), Ok(PrimValue::Bool(false)));
        let guarded = Exp::BinOp(
            BinOp::LogAnd,
            Box::new(Exp::int(1).lt(Exp::int(0))),
            Box::new(Exp::var(&VName::new("unbound"))),
        );
        assert_eq!(run(&guarded, &env), Ok(PrimValue::Bool(false)));
    }

    #[test]
    fn integer_division_by_zero_is_an_error() {
        let env: HashMap<_, _> = [(VName::new("z"), PrimValue::I64(0))].into_iter().collect();
        let e = Exp::int(7).quot(Exp::var(&VName::new("z")));
        assert_eq!(run(&e, &env), Err(SimError::DivisionByZero));
    }

    #[test]
    fn mixed_operand_types_are_rejected() {
        let env = HashMap::new();
        let e = Exp::binop(BinOp::Add, Exp::int(1), Exp::i32(1));
        assert!(matches!(run(&e, &env), Err(SimError::TypeMismatch { .. })));
    }

    #[test]
    fn bit_casts_preserve_bits() {
        let v = bitcast(PrimType::I32, PrimValue::F32(1.5)).unwrap();
        assert_eq!(v, PrimValue::I32(1.5f32.to_bits() as i32));
        assert_eq!(bitcast(PrimType::F32, v).unwrap(), PrimValue::F32(1.5));
        assert!(bitcast(PrimType::I64, PrimValue::F32(1.5)).is_err());
    }

    #[test]
    fn conversions_truncate() {
        assert_eq!(convert(PrimType::I32, PrimValue::F32(2.75)), PrimValue::I32(2));
        assert_eq!(convert(PrimType::I64, PrimValue::I32(-3)), PrimValue::I64(-3));
        assert_eq!(convert(PrimType::Bool, PrimValue::I64(5)), PrimValue::Bool(true));
    }
}
