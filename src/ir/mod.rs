//! The in-memory instruction stream produced by the lowering engine.
//!
//! The stream is deliberately small: scalar expressions, element-indexed memory accesses,
//! structured control flow and a handful of kernel operations (hardware ids, barriers, fences
//! and atomics). A downstream emitter turns it into a device dialect; [`printer`] renders a
//! CUDA-flavoured approximation for inspection and [`crate::sim`] executes it.

mod exp;
pub mod free_vars;
mod names;
pub mod printer;
mod span;
pub mod visit;

pub use names::NameSource;
pub use span::Span;

use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct VName(String);

impl VName {
    pub fn new(name: &str) -> Self {
        VName(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VName {
    fn from(name: &str) -> Self {
        VName::new(name)
    }
}

impl fmt::Display for VName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PrimType {
    Bool,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
}

impl PrimType {
    pub fn bit_width(self) -> u32 {
        match self {
            PrimType::Bool => 8,
            PrimType::I32 | PrimType::U32 | PrimType::F32 => 32,
            PrimType::I64 | PrimType::U64 | PrimType::F64 => 64,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrimType::F32 | PrimType::F64)
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            PrimType::I32 | PrimType::I64 | PrimType::U32 | PrimType::U64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, PrimType::I32 | PrimType::I64)
    }

    /// The integer type of the same width, i.e. what a compare-and-swap instruction operates on.
    pub fn word_type(self) -> PrimType {
        match self {
            PrimType::Bool | PrimType::I32 | PrimType::U32 | PrimType::F32 => PrimType::I32,
            PrimType::I64 | PrimType::U64 | PrimType::F64 => PrimType::I64,
        }
    }
}

impl fmt::Display for PrimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrimType::Bool => "bool",
            PrimType::I32 => "i32",
            PrimType::I64 => "i64",
            PrimType::U32 => "u32",
            PrimType::U64 => "u64",
            PrimType::F32 => "f32",
            PrimType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

/// A primitive value.
///
/// Equality and hashing work on bit patterns, so values can key hash maps (floats included).
#[derive(Clone, Copy, Debug)]
pub enum PrimValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
}

impl PrimValue {
    pub fn ty(&self) -> PrimType {
        match self {
            PrimValue::Bool(_) => PrimType::Bool,
            PrimValue::I32(_) => PrimType::I32,
            PrimValue::I64(_) => PrimType::I64,
            PrimValue::U32(_) => PrimType::U32,
            PrimValue::U64(_) => PrimType::U64,
            PrimValue::F32(_) => PrimType::F32,
            PrimValue::F64(_) => PrimType::F64,
        }
    }

    pub fn zero(ty: PrimType) -> Self {
        PrimValue::from_bits(ty, 0)
    }

    /// The raw bit pattern, zero-extended to 64 bits.
    pub fn to_bits(&self) -> u64 {
        match *self {
            PrimValue::Bool(b) => b as u64,
            PrimValue::I32(v) => v as u32 as u64,
            PrimValue::I64(v) => v as u64,
            PrimValue::U32(v) => v as u64,
            PrimValue::U64(v) => v,
            PrimValue::F32(v) => v.to_bits() as u64,
            PrimValue::F64(v) => v.to_bits(),
        }
    }

    pub fn from_bits(ty: PrimType, bits: u64) -> Self {
        match ty {
            PrimType::Bool => PrimValue::Bool(bits & 0xff != 0),
            PrimType::I32 => PrimValue::I32(bits as u32 as i32),
            PrimType::I64 => PrimValue::I64(bits as i64),
            PrimType::U32 => PrimValue::U32(bits as u32),
            PrimType::U64 => PrimValue::U64(bits),
            PrimType::F32 => PrimValue::F32(f32::from_bits(bits as u32)),
            PrimType::F64 => PrimValue::F64(f64::from_bits(bits)),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            PrimValue::Bool(b) => Some(b as i64),
            PrimValue::I32(v) => Some(v as i64),
            PrimValue::I64(v) => Some(v),
            PrimValue::U32(v) => Some(v as i64),
            PrimValue::U64(v) => Some(v as i64),
            PrimValue::F32(_) | PrimValue::F64(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            PrimValue::Bool(b) => Some(b),
            _ => None,
        }
    }
}

impl PartialEq for PrimValue {
    fn eq(&self, other: &Self) -> bool {
        self.ty() == other.ty() && self.to_bits() == other.to_bits()
    }
}

impl Eq for PrimValue {}

impl Hash for PrimValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ty().hash(state);
        self.to_bits().hash(state);
    }
}

impl fmt::Display for PrimValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimValue::Bool(b) => write!(f, "{}", b),
            PrimValue::I32(v) => write!(f, "{}", v),
            PrimValue::I64(v) => write!(f, "{}ll", v),
            PrimValue::U32(v) => write!(f, "{}u", v),
            PrimValue::U64(v) => write!(f, "{}ull", v),
            PrimValue::F32(v) => write!(f, "{:?}f", v),
            PrimValue::F64(v) => write!(f, "{:?}", v),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Min,
    Max,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    LogAnd,
    LogOr,
}

impl BinOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinOp::Add
                | BinOp::Mul
                | BinOp::Min
                | BinOp::Max
                | BinOp::And
                | BinOp::Or
                | BinOp::Xor
                | BinOp::LogAnd
                | BinOp::LogOr
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum UnOp {
    Not,
    Neg,
    Abs,
}

/// Scalar expressions. All index, id and size arithmetic is done in `i64`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Exp {
    Var(VName),
    Const(PrimValue),
    BinOp(BinOp, Box<Exp>, Box<Exp>),
    Cmp(CmpOp, Box<Exp>, Box<Exp>),
    UnOp(UnOp, Box<Exp>),
    Convert(PrimType, Box<Exp>),
    BitCast(PrimType, Box<Exp>),
    Select(Box<Exp>, Box<Exp>, Box<Exp>),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Space {
    Global,
    Local,
    Private,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Fence {
    Local,
    Global,
}

/// An element-typed view of a memory block, as used by reads, writes and atomics.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MemRef {
    pub name: VName,
    pub ty: PrimType,
    pub space: Space,
    pub volatile: bool,
}

impl MemRef {
    pub fn new(name: &VName, ty: PrimType, space: Space) -> Self {
        MemRef {
            name: name.clone(),
            ty,
            space,
            volatile: false,
        }
    }

    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    pub fn read(&self, dest: &VName, index: Exp) -> Stmt {
        Stmt::Read {
            dest: dest.clone(),
            mem: self.clone(),
            index,
        }
    }

    pub fn write(&self, index: Exp, value: Exp) -> Stmt {
        Stmt::Write {
            mem: self.clone(),
            index,
            value,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Stmt {
    Skip,
    Seq(Vec<Stmt>),
    Comment(String, Box<Stmt>),
    DeclareScalar {
        name: VName,
        ty: PrimType,
        volatile: bool,
    },
    DeclareArray {
        name: VName,
        ty: PrimType,
        len: Exp,
        space: Space,
    },
    SetScalar {
        name: VName,
        exp: Exp,
    },
    Read {
        dest: VName,
        mem: MemRef,
        index: Exp,
    },
    Write {
        mem: MemRef,
        index: Exp,
        value: Exp,
    },
    If {
        cond: Exp,
        then_branch: Box<Stmt>,
        else_branch: Box<Stmt>,
    },
    /// Runs `body` for `iter` in `0..bound`.
    For {
        iter: VName,
        bound: Exp,
        body: Box<Stmt>,
    },
    While {
        cond: Exp,
        body: Box<Stmt>,
    },
    Op(KernelOp),
}

impl Stmt {
    /// Sequences statements, flattening nested sequences and dropping `Skip`s.
    pub fn seq(stmts: Vec<Stmt>) -> Stmt {
        let mut flat = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            match stmt {
                Stmt::Skip => {}
                Stmt::Seq(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Stmt::Skip,
            1 => flat.pop().unwrap_or(Stmt::Skip),
            _ => Stmt::Seq(flat),
        }
    }

    pub fn declare(name: &VName, ty: PrimType) -> Stmt {
        Stmt::DeclareScalar {
            name: name.clone(),
            ty,
            volatile: false,
        }
    }

    pub fn declare_init(name: &VName, ty: PrimType, exp: Exp) -> Stmt {
        Stmt::Seq(vec![Stmt::declare(name, ty), Stmt::set(name, exp)])
    }

    pub fn declare_array(name: &VName, ty: PrimType, len: Exp, space: Space) -> Stmt {
        Stmt::DeclareArray {
            name: name.clone(),
            ty,
            len,
            space,
        }
    }

    pub fn set(name: &VName, exp: Exp) -> Stmt {
        Stmt::SetScalar {
            name: name.clone(),
            exp,
        }
    }

    pub fn when(cond: Exp, body: Stmt) -> Stmt {
        match cond {
            Exp::Const(PrimValue::Bool(true)) => body,
            Exp::Const(PrimValue::Bool(false)) => Stmt::Skip,
            cond => Stmt::If {
                cond,
                then_branch: Box::new(body),
                else_branch: Box::new(Stmt::Skip),
            },
        }
    }

    pub fn unless(cond: Exp, body: Stmt) -> Stmt {
        Stmt::when(cond.not(), body)
    }

    pub fn if_else(cond: Exp, then_branch: Stmt, else_branch: Stmt) -> Stmt {
        Stmt::If {
            cond,
            then_branch: Box::new(then_branch),
            else_branch: Box::new(else_branch),
        }
    }

    pub fn for_loop(iter: &VName, bound: Exp, body: Stmt) -> Stmt {
        Stmt::For {
            iter: iter.clone(),
            bound,
            body: Box::new(body),
        }
    }

    pub fn while_loop(cond: Exp, body: Stmt) -> Stmt {
        Stmt::While {
            cond,
            body: Box::new(body),
        }
    }

    pub fn comment(text: &str, body: Stmt) -> Stmt {
        Stmt::Comment(text.to_string(), Box::new(body))
    }

    pub fn barrier(fence: Fence) -> Stmt {
        Stmt::Op(KernelOp::Barrier(fence))
    }

    pub fn mem_fence(fence: Fence) -> Stmt {
        Stmt::Op(KernelOp::MemFence(fence))
    }

    pub fn atomic(op: AtomicOp) -> Stmt {
        Stmt::Op(KernelOp::Atomic(op))
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum KernelOp {
    GetGlobalId(VName),
    GetLocalId(VName),
    GetGroupId(VName),
    GetLocalSize(VName),
    GetNumGroups(VName),
    GetLockstepWidth(VName),
    Barrier(Fence),
    MemFence(Fence),
    Atomic(AtomicOp),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AtomicBinOp {
    Add,
    Min,
    Max,
    And,
    Or,
    Xor,
    Xchg,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AtomicOp {
    /// Read-modify-write; `old` receives the previous contents.
    Rmw {
        op: AtomicBinOp,
        old: VName,
        mem: MemRef,
        index: Exp,
        value: Exp,
    },
    /// Compare-and-swap on the integer word `mem.ty`; `old` receives the previous contents.
    Cas {
        old: VName,
        mem: MemRef,
        index: Exp,
        expected: Exp,
        desired: Exp,
    },
}

/// What a kernel captures from the host.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum KernelUse {
    Scalar(VName, PrimType),
    Memory(VName),
    Constant(VName, PrimValue),
}

/// The kernel descriptor handed to the host-side launcher.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Kernel {
    pub name: String,
    pub body: Stmt,
    pub uses: Vec<KernelUse>,
    /// Host-side expression.
    pub num_groups: Exp,
    /// Host-side expression.
    pub group_size: Exp,
    /// Whether the kernel may abort without corrupting context state.
    pub failure_tolerant: bool,
}

/// A global array the host allocates before running the kernels of a [`Program`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Alloc {
    pub name: VName,
    pub ty: PrimType,
    pub len: Exp,
}

/// A runtime-tunable size, resolved by the host before launching.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TuningParam {
    pub name: VName,
    pub default: i64,
}

/// The lowering of one operation: allocations first, then the kernels in launch order.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Program {
    pub allocs: Vec<Alloc>,
    pub tuning_params: Vec<TuningParam>,
    pub kernels: Vec<Kernel>,
}

impl Program {
    pub fn append(&mut self, other: Program) {
        self.allocs.extend(other.allocs);
        for param in other.tuning_params {
            if !self.tuning_params.iter().any(|p| p.name == param.name) {
                self.tuning_params.push(param);
            }
        }
        self.kernels.extend(other.kernels);
    }
}
