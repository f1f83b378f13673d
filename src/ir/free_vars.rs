//! Names a kernel body refers to without declaring them.
//!
//! Lowered code only ever introduces names through declarations (scalars, arrays and loop
//! iterators), and every name is fresh, so a whole-body declared set is enough; no scoping is
//! tracked.

use super::visit::{walk_exp, walk_stmt, Visit};
use super::{Exp, Stmt, VName};
use std::collections::HashSet;

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct FreeVars {
    /// Scalars in order of first use.
    pub scalars: Vec<VName>,
    /// Memory blocks in order of first use.
    pub memory: Vec<VName>,
}

struct Declared {
    names: HashSet<VName>,
}

impl Visit for Declared {
    fn visit_decl(&mut self, name: &VName) {
        self.names.insert(name.clone());
    }
}

struct Used<'a> {
    declared: &'a HashSet<VName>,
    seen: HashSet<VName>,
    free: FreeVars,
}

impl Visit for Used<'_> {
    fn visit_vname(&mut self, name: &VName) {
        if !self.declared.contains(name) && self.seen.insert(name.clone()) {
            self.free.scalars.push(name.clone());
        }
    }

    fn visit_assign(&mut self, name: &VName) {
        self.visit_vname(name)
    }

    fn visit_mem_name(&mut self, name: &VName) {
        if !self.declared.contains(name) && self.seen.insert(name.clone()) {
            self.free.memory.push(name.clone());
        }
    }
}

pub fn declared_names(stmt: &Stmt) -> HashSet<VName> {
    let mut declared = Declared {
        names: HashSet::new(),
    };
    walk_stmt(&mut declared, stmt);
    declared.names
}

pub fn free_vars(stmt: &Stmt) -> FreeVars {
    let declared = declared_names(stmt);
    let mut used = Used {
        declared: &declared,
        seen: HashSet::new(),
        free: FreeVars::default(),
    };
    walk_stmt(&mut used, stmt);
    used.free
}

/// Variables of `exp` in order of first occurrence.
pub fn exp_vars(exp: &Exp) -> Vec<VName> {
    let declared = HashSet::new();
    let mut used = Used {
        declared: &declared,
        seen: HashSet::new(),
        free: FreeVars::default(),
    };
    walk_exp(&mut used, exp);
    used.free.scalars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{MemRef, PrimType, Space};

    #[test]
    fn declared_names_are_not_free() {
        let i = VName::new("i");
        let n = VName::new("n");
        let x = VName::new("x");
        let xs = MemRef::new(&VName::new("xs"), PrimType::I32, Space::Global);
        let body = Stmt::seq(vec![
            Stmt::declare(&x, PrimType::I32),
            Stmt::for_loop(&i, Exp::var(&n), xs.read(&x, Exp::var(&i))),
        ]);
        let free = free_vars(&body);
        assert_eq!(free.scalars, vec![n]);
        assert_eq!(free.memory, vec![VName::new("xs")]);
    }

    #[test]
    fn local_arrays_are_declared() {
        let arr = VName::new("red_arr");
        let body = Stmt::seq(vec![
            Stmt::declare_array(&arr, PrimType::F32, Exp::int(256), Space::Local),
            MemRef::new(&arr, PrimType::F32, Space::Local)
                .write(Exp::int(0), Exp::constant(crate::ir::PrimValue::F32(1.0))),
        ]);
        assert_eq!(free_vars(&body), FreeVars::default());
    }
}
