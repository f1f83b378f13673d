use crate::ir::*;

#[rustfmt::skip]
pub trait Visit: Sized {
    fn visit_vname(&mut self, _name: &VName) {}
    fn visit_decl(&mut self, _name: &VName) {}
    fn visit_assign(&mut self, _name: &VName) {}
    fn visit_mem_name(&mut self, _name: &VName) {}
    fn visit_prim_value(&mut self, _v: &PrimValue) {}
    fn visit_fence(&mut self, _fence: &Fence) {}
    fn visit_mem_ref(&mut self, mem: &MemRef) { walk_mem_ref(self, mem) }
    fn visit_exp(&mut self, exp: &Exp) { walk_exp(self, exp) }
    fn visit_atomic_op(&mut self, op: &AtomicOp) { walk_atomic_op(self, op) }
    fn visit_kernel_op(&mut self, op: &KernelOp) { walk_kernel_op(self, op) }
    fn visit_stmt(&mut self, stmt: &Stmt) { walk_stmt(self, stmt) }
}

macro_rules! walk_list {
    ($visitor: expr, $method: ident, $list: expr) => {
        for elem in $list {
            $visitor.$method(elem)
        }
    };
}

pub fn walk_mem_ref<V: Visit>(visitor: &mut V, mem: &MemRef) {
    visitor.visit_mem_name(&mem.name)
}

pub fn walk_exp<V: Visit>(visitor: &mut V, exp: &Exp) {
    match exp {
        Exp::Var(name) => visitor.visit_vname(name),
        Exp::Const(v) => visitor.visit_prim_value(v),
        Exp::BinOp(_, x, y) | Exp::Cmp(_, x, y) => {
            visitor.visit_exp(x);
            visitor.visit_exp(y)
        }
        Exp::UnOp(_, x) | Exp::Convert(_, x) | Exp::BitCast(_, x) => visitor.visit_exp(x),
        Exp::Select(c, t, e) => {
            visitor.visit_exp(c);
            visitor.visit_exp(t);
            visitor.visit_exp(e)
        }
    }
}

pub fn walk_atomic_op<V: Visit>(visitor: &mut V, op: &AtomicOp) {
    match op {
        AtomicOp::Rmw {
            old,
            mem,
            index,
            value,
            ..
        } => {
            visitor.visit_assign(old);
            visitor.visit_mem_ref(mem);
            visitor.visit_exp(index);
            visitor.visit_exp(value)
        }
        AtomicOp::Cas {
            old,
            mem,
            index,
            expected,
            desired,
        } => {
            visitor.visit_assign(old);
            visitor.visit_mem_ref(mem);
            visitor.visit_exp(index);
            visitor.visit_exp(expected);
            visitor.visit_exp(desired)
        }
    }
}

pub fn walk_kernel_op<V: Visit>(visitor: &mut V, op: &KernelOp) {
    match op {
        KernelOp::GetGlobalId(name)
        | KernelOp::GetLocalId(name)
        | KernelOp::GetGroupId(name)
        | KernelOp::GetLocalSize(name)
        | KernelOp::GetNumGroups(name)
        | KernelOp::GetLockstepWidth(name) => visitor.visit_assign(name),
        KernelOp::Barrier(fence) | KernelOp::MemFence(fence) => visitor.visit_fence(fence),
        KernelOp::Atomic(op) => visitor.visit_atomic_op(op),
    }
}

pub fn walk_stmt<V: Visit>(visitor: &mut V, stmt: &Stmt) {
    match stmt {
        Stmt::Skip => {}
        Stmt::Seq(stmts) => walk_list!(visitor, visit_stmt, stmts),
        Stmt::Comment(_, body) => visitor.visit_stmt(body),
        Stmt::DeclareScalar { name, .. } => visitor.visit_decl(name),
        Stmt::DeclareArray { name, len, .. } => {
            visitor.visit_exp(len);
            visitor.visit_decl(name)
        }
        Stmt::SetScalar { name, exp } => {
            visitor.visit_exp(exp);
            visitor.visit_assign(name)
        }
        Stmt::Read { dest, mem, index } => {
            visitor.visit_mem_ref(mem);
            visitor.visit_exp(index);
            visitor.visit_assign(dest)
        }
        Stmt::Write { mem, index, value } => {
            visitor.visit_mem_ref(mem);
            visitor.visit_exp(index);
            visitor.visit_exp(value)
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            visitor.visit_exp(cond);
            visitor.visit_stmt(then_branch);
            visitor.visit_stmt(else_branch)
        }
        Stmt::For { iter, bound, body } => {
            visitor.visit_exp(bound);
            visitor.visit_decl(iter);
            visitor.visit_stmt(body)
        }
        Stmt::While { cond, body } => {
            visitor.visit_exp(cond);
            visitor.visit_stmt(body)
        }
        Stmt::Op(op) => visitor.visit_kernel_op(op),
    }
}
