use super::{BinOp, CmpOp, Exp, PrimType, PrimValue, UnOp, VName};
use std::collections::HashMap;
use std::ops;

impl Exp {
    pub fn var(name: &VName) -> Exp {
        Exp::Var(name.clone())
    }

    /// An `i64` constant, the type of every index and size.
    pub fn int(v: i64) -> Exp {
        Exp::Const(PrimValue::I64(v))
    }

    pub fn i32(v: i32) -> Exp {
        Exp::Const(PrimValue::I32(v))
    }

    pub fn bool(b: bool) -> Exp {
        Exp::Const(PrimValue::Bool(b))
    }

    pub fn constant(v: PrimValue) -> Exp {
        Exp::Const(v)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Exp::Const(PrimValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    fn as_bool_const(&self) -> Option<bool> {
        match self {
            Exp::Const(PrimValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Builds a binary operation, folding `i64` constants and trivial identities.
    pub fn binop(op: BinOp, x: Exp, y: Exp) -> Exp {
        if let (Some(a), Some(b)) = (x.as_int(), y.as_int()) {
            let folded = match op {
                BinOp::Add => a.checked_add(b),
                BinOp::Sub => a.checked_sub(b),
                BinOp::Mul => a.checked_mul(b),
                BinOp::Div if b != 0 => a.checked_div(b),
                BinOp::Mod if b != 0 => a.checked_rem(b),
                BinOp::Min => Some(a.min(b)),
                BinOp::Max => Some(a.max(b)),
                _ => None,
            };
            if let Some(v) = folded {
                return Exp::int(v);
            }
        }
        match (op, x.as_int(), y.as_int()) {
            (BinOp::Add, Some(0), _) => return y,
            (BinOp::Add, _, Some(0)) | (BinOp::Sub, _, Some(0)) => return x,
            (BinOp::Mul, Some(1), _) => return y,
            (BinOp::Mul, _, Some(1)) | (BinOp::Div, _, Some(1)) => return x,
            _ => {}
        }
        Exp::BinOp(op, Box::new(x), Box::new(y))
    }

    pub fn cmp(op: CmpOp, x: Exp, y: Exp) -> Exp {
        if let (Some(a), Some(b)) = (x.as_int(), y.as_int()) {
            let r = match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            };
            return Exp::bool(r);
        }
        Exp::Cmp(op, Box::new(x), Box::new(y))
    }

    pub fn lt(self, other: Exp) -> Exp {
        Exp::cmp(CmpOp::Lt, self, other)
    }

    pub fn le(self, other: Exp) -> Exp {
        Exp::cmp(CmpOp::Le, self, other)
    }

    pub fn gt(self, other: Exp) -> Exp {
        Exp::cmp(CmpOp::Gt, self, other)
    }

    pub fn ge(self, other: Exp) -> Exp {
        Exp::cmp(CmpOp::Ge, self, other)
    }

    pub fn equals(self, other: Exp) -> Exp {
        Exp::cmp(CmpOp::Eq, self, other)
    }

    pub fn not_equals(self, other: Exp) -> Exp {
        Exp::cmp(CmpOp::Ne, self, other)
    }

    pub fn and(self, other: Exp) -> Exp {
        match (self.as_bool_const(), other.as_bool_const()) {
            (Some(true), _) => other,
            (_, Some(true)) => self,
            (Some(false), _) | (_, Some(false)) => Exp::bool(false),
            _ => Exp::BinOp(BinOp::LogAnd, Box::new(self), Box::new(other)),
        }
    }

    pub fn or(self, other: Exp) -> Exp {
        match (self.as_bool_const(), other.as_bool_const()) {
            (Some(false), _) => other,
            (_, Some(false)) => self,
            (Some(true), _) | (_, Some(true)) => Exp::bool(true),
            _ => Exp::BinOp(BinOp::LogOr, Box::new(self), Box::new(other)),
        }
    }

    /// Conjunction of all `conds`; `true` when empty.
    pub fn all(conds: Vec<Exp>) -> Exp {
        conds.into_iter().fold(Exp::bool(true), Exp::and)
    }

    pub fn not(self) -> Exp {
        match self {
            Exp::Const(PrimValue::Bool(b)) => Exp::bool(!b),
            Exp::UnOp(UnOp::Not, inner) => *inner,
            e => Exp::UnOp(UnOp::Not, Box::new(e)),
        }
    }

    pub fn quot(self, other: Exp) -> Exp {
        Exp::binop(BinOp::Div, self, other)
    }

    pub fn rem(self, other: Exp) -> Exp {
        Exp::binop(BinOp::Mod, self, other)
    }

    /// `ceil(self / other)` for non-negative operands.
    pub fn div_up(self, other: Exp) -> Exp {
        (self + other.clone() - Exp::int(1)).quot(other)
    }

    pub fn minimum(self, other: Exp) -> Exp {
        Exp::binop(BinOp::Min, self, other)
    }

    pub fn maximum(self, other: Exp) -> Exp {
        Exp::binop(BinOp::Max, self, other)
    }

    pub fn select(cond: Exp, then_exp: Exp, else_exp: Exp) -> Exp {
        match cond.as_bool_const() {
            Some(true) => then_exp,
            Some(false) => else_exp,
            None => Exp::Select(Box::new(cond), Box::new(then_exp), Box::new(else_exp)),
        }
    }

    pub fn convert(self, ty: PrimType) -> Exp {
        match &self {
            Exp::Const(PrimValue::I64(v)) if ty == PrimType::I64 => Exp::int(*v),
            _ => Exp::Convert(ty, Box::new(self)),
        }
    }

    pub fn bitcast(self, ty: PrimType) -> Exp {
        Exp::BitCast(ty, Box::new(self))
    }

    /// Product of all `factors`; `1` when empty.
    pub fn product(factors: Vec<Exp>) -> Exp {
        factors.into_iter().fold(Exp::int(1), |acc, f| acc * f)
    }

    /// Row-major flat index of `is` in an array of extents `dims`.
    pub fn flatten_index(dims: &[Exp], is: &[Exp]) -> Exp {
        dims.iter()
            .zip(is.iter())
            .fold(Exp::int(0), |acc, (d, i)| acc * d.clone() + i.clone())
    }

    /// Replaces the variables bound in `subst`.
    pub fn substitute(&self, subst: &HashMap<VName, Exp>) -> Exp {
        match self {
            Exp::Var(name) => match subst.get(name) {
                Some(e) => e.clone(),
                None => self.clone(),
            },
            Exp::Const(_) => self.clone(),
            Exp::BinOp(op, x, y) => Exp::BinOp(
                *op,
                Box::new(x.substitute(subst)),
                Box::new(y.substitute(subst)),
            ),
            Exp::Cmp(op, x, y) => Exp::Cmp(
                *op,
                Box::new(x.substitute(subst)),
                Box::new(y.substitute(subst)),
            ),
            Exp::UnOp(op, x) => Exp::UnOp(*op, Box::new(x.substitute(subst))),
            Exp::Convert(ty, x) => Exp::Convert(*ty, Box::new(x.substitute(subst))),
            Exp::BitCast(ty, x) => Exp::BitCast(*ty, Box::new(x.substitute(subst))),
            Exp::Select(c, t, e) => Exp::Select(
                Box::new(c.substitute(subst)),
                Box::new(t.substitute(subst)),
                Box::new(e.substitute(subst)),
            ),
        }
    }
}

impl ops::Add for Exp {
    type Output = Exp;

    fn add(self, other: Exp) -> Exp {
        Exp::binop(BinOp::Add, self, other)
    }
}

impl ops::Sub for Exp {
    type Output = Exp;

    fn sub(self, other: Exp) -> Exp {
        Exp::binop(BinOp::Sub, self, other)
    }
}

impl ops::Mul for Exp {
    type Output = Exp;

    fn mul(self, other: Exp) -> Exp {
        Exp::binop(BinOp::Mul, self, other)
    }
}

impl ops::BitAnd for Exp {
    type Output = Exp;

    fn bitand(self, other: Exp) -> Exp {
        Exp::binop(BinOp::And, self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_constant_index_arithmetic() {
        assert_eq!(Exp::int(3) * Exp::int(4) + Exp::int(1), Exp::int(13));
        assert_eq!(Exp::int(10).div_up(Exp::int(3)), Exp::int(4));
        assert_eq!(Exp::int(2).lt(Exp::int(3)), Exp::bool(true));
    }

    #[test]
    fn keeps_variables_symbolic() {
        let n = VName::new("n");
        let e = Exp::var(&n) + Exp::int(0);
        assert_eq!(e, Exp::var(&n), "adding zero was not simplified");
        let e = Exp::var(&n) * Exp::int(2);
        assert!(matches!(e, Exp::BinOp(BinOp::Mul, _, _)));
    }

    #[test]
    fn boolean_shortcuts() {
        let c = Exp::var(&VName::new("c"));
        assert_eq!(Exp::bool(true).and(c.clone()), c);
        assert_eq!(c.clone().and(Exp::bool(false)), Exp::bool(false));
        assert_eq!(c.clone().not().not(), c);
    }

    #[test]
    fn substitution_replaces_only_bound_names() {
        let x = VName::new("x");
        let y = VName::new("y");
        let e = Exp::var(&x) + Exp::var(&y);
        let mut subst = HashMap::new();
        subst.insert(x, Exp::i32(5));
        assert_eq!(
            e.substitute(&subst),
            Exp::BinOp(BinOp::Add, Box::new(Exp::i32(5)), Box::new(Exp::var(&y)))
        );
    }

    #[test]
    fn row_major_flattening() {
        let dims = vec![Exp::int(4), Exp::int(5)];
        let is = vec![Exp::int(2), Exp::int(3)];
        assert_eq!(Exp::flatten_index(&dims, &is), Exp::int(13));
    }
}
