//! CUDA-flavoured rendering of lowered programs, for inspection and golden tests.

use super::{
    Alloc, AtomicBinOp, AtomicOp, BinOp, CmpOp, Exp, Fence, Kernel, KernelOp, KernelUse, Program,
    Space, Stmt, TuningParam, UnOp,
};
use std::fmt::{self, Formatter};

pub fn print(program: &Program) -> String {
    program.to_string()
}

const INDENT: &str = "    ";

impl fmt::Display for Program {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for param in &self.tuning_params {
            writeln!(f, "{}", param)?;
        }
        for alloc in &self.allocs {
            writeln!(f, "{}", alloc)?;
        }
        for kernel in &self.kernels {
            writeln!(f, "{}", kernel)?;
        }
        Ok(())
    }
}

impl fmt::Display for TuningParam {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "// tuning param {} (default {})", self.name, self.default)
    }
}

impl fmt::Display for Alloc {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "__device__ {} {}[{}];", self.ty, self.name, self.len)
    }
}

impl fmt::Display for KernelUse {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KernelUse::Scalar(name, ty) => write!(f, "{} {}", ty, name),
            KernelUse::Memory(name) => write!(f, "__global__ unsigned char *{}", name),
            KernelUse::Constant(name, v) => write!(f, "const {} {} = {}", v.ty(), name, v),
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "// launch: {} groups of {} threads{}",
            self.num_groups,
            self.group_size,
            if self.failure_tolerant {
                ", failure tolerant"
            } else {
                ""
            }
        )?;
        writeln!(f, "__global__ void {}(", self.name)?;
        for (i, u) in self.uses.iter().enumerate() {
            let sep = if i + 1 < self.uses.len() { "," } else { "" };
            writeln!(f, "{}{}{}", INDENT, u, sep)?;
        }
        writeln!(f, ") {{")?;
        fmt_stmt(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

fn indent(f: &mut Formatter<'_>, depth: usize) -> fmt::Result {
    for _ in 0..depth {
        write!(f, "{}", INDENT)?;
    }
    Ok(())
}

fn fmt_stmt(f: &mut Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
    match stmt {
        Stmt::Skip => Ok(()),
        Stmt::Seq(stmts) => {
            for s in stmts {
                fmt_stmt(f, s, depth)?;
            }
            Ok(())
        }
        Stmt::Comment(text, body) => {
            indent(f, depth)?;
            writeln!(f, "// {}", text)?;
            fmt_stmt(f, body, depth)
        }
        Stmt::DeclareScalar { name, ty, volatile } => {
            indent(f, depth)?;
            let vol = if *volatile { "volatile " } else { "" };
            writeln!(f, "{}{} {};", vol, ty, name)
        }
        Stmt::DeclareArray {
            name,
            ty,
            len,
            space,
        } => {
            indent(f, depth)?;
            writeln!(f, "{}{} {}[{}];", space_qualifier(*space), ty, name, len)
        }
        Stmt::SetScalar { name, exp } => {
            indent(f, depth)?;
            writeln!(f, "{} = {};", name, exp)
        }
        Stmt::Read { dest, mem, index } => {
            indent(f, depth)?;
            let vol = if mem.volatile { "(volatile)" } else { "" };
            writeln!(f, "{} = {}{}[{}];", dest, vol, mem.name, index)
        }
        Stmt::Write { mem, index, value } => {
            indent(f, depth)?;
            let vol = if mem.volatile { "(volatile)" } else { "" };
            writeln!(f, "{}{}[{}] = {};", vol, mem.name, index, value)
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
        } => {
            indent(f, depth)?;
            writeln!(f, "if ({}) {{", cond)?;
            fmt_stmt(f, then_branch, depth + 1)?;
            if **else_branch != Stmt::Skip {
                indent(f, depth)?;
                writeln!(f, "}} else {{")?;
                fmt_stmt(f, else_branch, depth + 1)?;
            }
            indent(f, depth)?;
            writeln!(f, "}}")
        }
        Stmt::For { iter, bound, body } => {
            indent(f, depth)?;
            writeln!(
                f,
                "for (int64_t {i} = 0; {i} < {}; {i}++) {{",
                bound,
                i = iter
            )?;
            fmt_stmt(f, body, depth + 1)?;
            indent(f, depth)?;
            writeln!(f, "}}")
        }
        Stmt::While { cond, body } => {
            indent(f, depth)?;
            writeln!(f, "while ({}) {{", cond)?;
            fmt_stmt(f, body, depth + 1)?;
            indent(f, depth)?;
            writeln!(f, "}}")
        }
        Stmt::Op(op) => {
            indent(f, depth)?;
            writeln!(f, "{};", op)
        }
    }
}

fn space_qualifier(space: Space) -> &'static str {
    match space {
        Space::Global => "__device__ ",
        Space::Local => "__shared__ ",
        Space::Private => "",
    }
}

impl fmt::Display for KernelOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KernelOp::GetGlobalId(n) => write!(f, "{} = get_global_id()", n),
            KernelOp::GetLocalId(n) => write!(f, "{} = get_local_id()", n),
            KernelOp::GetGroupId(n) => write!(f, "{} = get_group_id()", n),
            KernelOp::GetLocalSize(n) => write!(f, "{} = get_local_size()", n),
            KernelOp::GetNumGroups(n) => write!(f, "{} = get_num_groups()", n),
            KernelOp::GetLockstepWidth(n) => write!(f, "{} = get_lockstep_width()", n),
            KernelOp::Barrier(Fence::Local) => write!(f, "barrier(CLK_LOCAL_MEM_FENCE)"),
            KernelOp::Barrier(Fence::Global) => write!(f, "barrier(CLK_GLOBAL_MEM_FENCE)"),
            KernelOp::MemFence(Fence::Local) => write!(f, "mem_fence_local()"),
            KernelOp::MemFence(Fence::Global) => write!(f, "mem_fence_global()"),
            KernelOp::Atomic(op) => write!(f, "{}", op),
        }
    }
}

impl fmt::Display for AtomicOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AtomicOp::Rmw {
                op,
                old,
                mem,
                index,
                value,
            } => {
                let name = match op {
                    AtomicBinOp::Add => "atomic_add",
                    AtomicBinOp::Min => "atomic_min",
                    AtomicBinOp::Max => "atomic_max",
                    AtomicBinOp::And => "atomic_and",
                    AtomicBinOp::Or => "atomic_or",
                    AtomicBinOp::Xor => "atomic_xor",
                    AtomicBinOp::Xchg => "atomic_xchg",
                };
                write!(
                    f,
                    "{} = {}_{}_{}(&{}[{}], {})",
                    old,
                    name,
                    mem.ty,
                    space_suffix(mem.space),
                    mem.name,
                    index,
                    value
                )
            }
            AtomicOp::Cas {
                old,
                mem,
                index,
                expected,
                desired,
            } => write!(
                f,
                "{} = atomic_cmpxchg_{}_{}(&{}[{}], {}, {})",
                old,
                mem.ty,
                space_suffix(mem.space),
                mem.name,
                index,
                expected,
                desired
            ),
        }
    }
}

fn space_suffix(space: Space) -> &'static str {
    match space {
        Space::Global => "global",
        Space::Local => "local",
        Space::Private => "private",
    }
}

impl fmt::Display for Exp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Exp::Var(name) => write!(f, "{}", name),
            Exp::Const(v) => write!(f, "{}", v),
            Exp::BinOp(BinOp::Min, x, y) => write!(f, "min({}, {})", x, y),
            Exp::BinOp(BinOp::Max, x, y) => write!(f, "max({}, {})", x, y),
            Exp::BinOp(op, x, y) => write!(f, "({} {} {})", x, binop_str(*op), y),
            Exp::Cmp(op, x, y) => write!(f, "({} {} {})", x, cmp_str(*op), y),
            Exp::UnOp(UnOp::Not, x) => write!(f, "!{}", x),
            Exp::UnOp(UnOp::Neg, x) => write!(f, "-{}", x),
            Exp::UnOp(UnOp::Abs, x) => write!(f, "abs({})", x),
            Exp::Convert(ty, x) => write!(f, "({}){}", ty, x),
            Exp::BitCast(ty, x) => write!(f, "bitcast_{}({})", ty, x),
            Exp::Select(c, t, e) => write!(f, "({} ? {} : {})", c, t, e),
        }
    }
}

fn binop_str(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Min => "min",
        BinOp::Max => "max",
        BinOp::And => "&",
        BinOp::Or => "|",
        BinOp::Xor => "^",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
        BinOp::LogAnd => "&&",
        BinOp::LogOr => "||",
    }
}

fn cmp_str(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "==",
        CmpOp::Ne => "!=",
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{MemRef, PrimType, VName};

    #[test]
    fn prints_guarded_write() {
        let gtid = VName::new("gtid");
        let out = MemRef::new(&VName::new("out"), PrimType::I32, Space::Global);
        let stmt = Stmt::when(
            Exp::var(&gtid).lt(Exp::int(10)),
            out.write(Exp::var(&gtid), Exp::i32(1)),
        );
        let kernel = Kernel {
            name: "k".to_string(),
            body: stmt,
            uses: vec![KernelUse::Memory(VName::new("out"))],
            num_groups: Exp::int(1),
            group_size: Exp::int(32),
            failure_tolerant: true,
        };
        let text = kernel.to_string();
        assert!(text.contains("__global__ void k("), "missing signature:\n{}", text);
        assert!(text.contains("if ((gtid < 10ll)) {"), "missing guard:\n{}", text);
        assert!(text.contains("out[gtid] = 1;"), "missing write:\n{}", text);
    }

    #[test]
    fn prints_compare_and_swap() {
        let op = AtomicOp::Cas {
            old: VName::new("old"),
            mem: MemRef::new(&VName::new("locks"), PrimType::I32, Space::Local),
            index: Exp::int(3),
            expected: Exp::i32(0),
            desired: Exp::i32(1),
        };
        assert_eq!(
            op.to_string(),
            "old = atomic_cmpxchg_i32_local(&locks[3ll], 0, 1)"
        );
    }
}
