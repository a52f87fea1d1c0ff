/// Compiled program representation.
///
/// A [`Program`] is produced by a front-end compiler (not part of this crate)
/// and consumed read-only by [`crate::kernel::Kernel`] and the interpreter.
/// Functions are lists of basic blocks; every block ends in a branch or a
/// return. Registers are numbered per function, and a function's parameters
/// occupy registers `0..params.len()` on entry.
use crate::memory::{AddressSpace, AtomicOp};
use crate::value::TypedValue;

pub type Reg = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// Position of one instruction inside a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionRef {
    pub function: FuncId,
    pub block: BlockId,
    pub index: usize,
}

impl std::fmt::Display for InstructionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn{}:bb{}:{}", self.function.0, self.block.0, self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// Integer of the given bit width (`Int(1)` is a boolean).
    Int(u32),
    Float,
    Double,
    Pointer(AddressSpace),
    Vector(Box<Type>, usize),
    Array(Box<Type>, usize),
    Struct(Vec<Type>),
}

impl Type {
    pub fn i32() -> Type {
        Type::Int(32)
    }

    pub fn vector(elem: Type, lanes: usize) -> Type {
        Type::Vector(Box::new(elem), lanes)
    }

    pub fn array(elem: Type, len: usize) -> Type {
        Type::Array(Box::new(elem), len)
    }

    /// Allocation size in bytes.
    pub fn size(&self) -> usize {
        match self {
            Type::Int(bits) => (*bits as usize).div_ceil(8),
            Type::Float => 4,
            Type::Double => 8,
            Type::Pointer(_) => 8,
            Type::Vector(elem, n) | Type::Array(elem, n) => elem.size() * n,
            Type::Struct(fields) => fields.iter().map(Type::size).sum(),
        }
    }

    /// Lane count when held in a register (vectors have one lane per element).
    pub fn lanes(&self) -> usize {
        match self {
            Type::Vector(_, n) => *n,
            _ => 1,
        }
    }

    /// Size of one register lane.
    pub fn lane_size(&self) -> usize {
        match self {
            Type::Vector(elem, _) => elem.size(),
            other => other.size(),
        }
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, Type::Vector(..))
    }

    pub fn is_float(&self) -> bool {
        match self {
            Type::Float | Type::Double => true,
            Type::Vector(elem, _) => elem.is_float(),
            _ => false,
        }
    }

    pub fn address_space(&self) -> Option<AddressSpace> {
        match self {
            Type::Pointer(space) => Some(*space),
            _ => None,
        }
    }
}

/// Initializer of a program-scope variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(u64),
    Float(f32),
    Double(f64),
    /// Element-wise initializer for arrays and vectors.
    Aggregate(Vec<Constant>),
    Zero,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalVariable {
    pub name: String,
    pub space: AddressSpace,
    pub ty: Type,
    pub constant: bool,
    pub initializer: Option<Constant>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
    UMin,
    UMax,
    SMin,
    SMax,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
    FMin,
    FMax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Eq,
    Ne,
    Ult,
    Ule,
    Ugt,
    Uge,
    Slt,
    Sle,
    Sgt,
    Sge,
    FEq,
    FNe,
    FLt,
    FLe,
    FGt,
    FGe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    FpToSi,
    FpToUi,
    SiToFp,
    UiToFp,
    FpExt,
    FpTrunc,
    Bitcast,
}

/// Work-item index queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    GlobalId,
    LocalId,
    GroupId,
    GlobalSize,
    LocalSize,
    NumGroups,
    GlobalOffset,
    WorkDim,
}

/// Memory fence flags carried by a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FenceFlags(pub u32);

impl FenceFlags {
    pub const NONE: FenceFlags = FenceFlags(0);
    pub const LOCAL: FenceFlags = FenceFlags(1);
    pub const GLOBAL: FenceFlags = FenceFlags(2);
    pub const BOTH: FenceFlags = FenceFlags(3);

    pub fn fences_local(self) -> bool {
        self.0 & Self::LOCAL.0 != 0
    }

    pub fn fences_global(self) -> bool {
        self.0 & Self::GLOBAL.0 != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Const {
        dst: Reg,
        value: TypedValue,
    },
    Builtin {
        dst: Reg,
        query: Builtin,
        dim: u32,
    },
    /// Address of a program-scope variable.
    GlobalAddress {
        dst: Reg,
        global: GlobalId,
    },
    Binary {
        op: BinaryOp,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    Compare {
        pred: Predicate,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
    },
    Cast {
        op: CastOp,
        dst: Reg,
        src: Reg,
        to: Type,
    },
    Select {
        dst: Reg,
        cond: Reg,
        if_true: Reg,
        if_false: Reg,
    },
    /// `dst = base + index * stride`, with `index` sign-extended.
    Offset {
        dst: Reg,
        base: Reg,
        index: Reg,
        stride: usize,
    },
    /// Reserve private memory for one value of `ty`.
    Alloca {
        dst: Reg,
        ty: Type,
    },
    Load {
        dst: Reg,
        ty: Type,
        space: AddressSpace,
        ptr: Reg,
    },
    Store {
        space: AddressSpace,
        ptr: Reg,
        value: Reg,
    },
    Atomic {
        op: AtomicOp,
        space: AddressSpace,
        dst: Reg,
        ptr: Reg,
        operand: Reg,
        compare: Option<Reg>,
    },
    Barrier {
        flags: FenceFlags,
    },
    /// Work-group wide copy of `bytes` bytes, performed once per group.
    AsyncCopy {
        dst_space: AddressSpace,
        dst: Reg,
        src_space: AddressSpace,
        src: Reg,
        bytes: Reg,
    },
    Branch {
        target: BlockId,
    },
    CondBranch {
        cond: Reg,
        if_true: BlockId,
        if_false: BlockId,
    },
    Call {
        dst: Option<Reg>,
        function: FuncId,
        args: Vec<Reg>,
    },
    Return {
        value: Option<Reg>,
    },
}

impl Instruction {
    /// Register written directly by this instruction, if any.
    pub fn destination(&self) -> Option<Reg> {
        match self {
            Instruction::Const { dst, .. }
            | Instruction::Builtin { dst, .. }
            | Instruction::GlobalAddress { dst, .. }
            | Instruction::Binary { dst, .. }
            | Instruction::Compare { dst, .. }
            | Instruction::Cast { dst, .. }
            | Instruction::Select { dst, .. }
            | Instruction::Offset { dst, .. }
            | Instruction::Alloca { dst, .. }
            | Instruction::Load { dst, .. }
            | Instruction::Atomic { dst, .. } => Some(*dst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub num_registers: u32,
    pub blocks: Vec<BasicBlock>,
}

/// Entry-point metadata attached to a kernel function.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelMetadata {
    pub function: FuncId,
    /// Required work-group size, if the kernel declares one.
    pub reqd_work_group_size: Option<[usize; 3]>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub functions: Vec<Function>,
    pub globals: Vec<GlobalVariable>,
    pub kernels: Vec<KernelMetadata>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        self.functions.push(function);
        FuncId(self.functions.len() - 1)
    }

    /// Add `function` and mark it as a kernel entry point.
    pub fn add_kernel(
        &mut self,
        function: Function,
        reqd_work_group_size: Option<[usize; 3]>,
    ) -> FuncId {
        let id = self.add_function(function);
        self.kernels.push(KernelMetadata {
            function: id,
            reqd_work_group_size,
        });
        id
    }

    pub fn add_global(&mut self, global: GlobalVariable) -> GlobalId {
        self.globals.push(global);
        GlobalId(self.globals.len() - 1)
    }

    pub fn function(&self, id: FuncId) -> Option<&Function> {
        self.functions.get(id.0)
    }

    pub fn global(&self, id: GlobalId) -> Option<&GlobalVariable> {
        self.globals.get(id.0)
    }

    pub fn find_function(&self, name: &str) -> Option<FuncId> {
        self.functions.iter().position(|f| f.name == name).map(FuncId)
    }

    pub fn kernel_metadata(&self, id: FuncId) -> Option<&KernelMetadata> {
        self.kernels.iter().find(|k| k.function == id)
    }

    pub fn instruction(&self, at: InstructionRef) -> Option<&Instruction> {
        self.functions
            .get(at.function.0)?
            .blocks
            .get(at.block.0)?
            .instructions
            .get(at.index)
    }
}

/// Incremental construction of a [`Function`].
///
/// Parameters are declared first so they take the lowest registers.
pub struct FunctionBuilder {
    name: String,
    params: Vec<Param>,
    next_reg: u32,
    blocks: Vec<BasicBlock>,
    current: BlockId,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> Self {
        FunctionBuilder {
            name: name.to_string(),
            params: Vec::new(),
            next_reg: 0,
            blocks: vec![BasicBlock::default()],
            current: BlockId(0),
        }
    }

    pub fn param(&mut self, name: &str, ty: Type) -> Reg {
        debug_assert_eq!(self.next_reg as usize, self.params.len());
        self.params.push(Param {
            name: name.to_string(),
            ty,
        });
        self.reg()
    }

    /// A fresh register.
    pub fn reg(&mut self) -> Reg {
        let r = self.next_reg;
        self.next_reg += 1;
        r
    }

    /// Create an empty block without switching to it.
    pub fn block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default());
        BlockId(self.blocks.len() - 1)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn push(&mut self, instruction: Instruction) {
        self.blocks[self.current.0].instructions.push(instruction);
    }

    pub fn constant(&mut self, value: TypedValue) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Const { dst, value });
        dst
    }

    pub fn builtin(&mut self, query: Builtin, dim: u32) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Builtin { dst, query, dim });
        dst
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Binary { op, dst, lhs, rhs });
        dst
    }

    pub fn compare(&mut self, pred: Predicate, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Compare { pred, dst, lhs, rhs });
        dst
    }

    pub fn cast(&mut self, op: CastOp, src: Reg, to: Type) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Cast { op, dst, src, to });
        dst
    }

    pub fn offset(&mut self, base: Reg, index: Reg, stride: usize) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Offset {
            dst,
            base,
            index,
            stride,
        });
        dst
    }

    pub fn load(&mut self, ty: Type, space: AddressSpace, ptr: Reg) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Load {
            dst,
            ty,
            space,
            ptr,
        });
        dst
    }

    pub fn store(&mut self, space: AddressSpace, ptr: Reg, value: Reg) {
        self.push(Instruction::Store { space, ptr, value });
    }

    pub fn atomic(&mut self, op: AtomicOp, space: AddressSpace, ptr: Reg, operand: Reg) -> Reg {
        let dst = self.reg();
        self.push(Instruction::Atomic {
            op,
            space,
            dst,
            ptr,
            operand,
            compare: None,
        });
        dst
    }

    pub fn barrier(&mut self, flags: FenceFlags) {
        self.push(Instruction::Barrier { flags });
    }

    pub fn ret(&mut self, value: Option<Reg>) {
        self.push(Instruction::Return { value });
    }

    pub fn finish(self) -> Function {
        Function {
            name: self.name,
            params: self.params,
            num_registers: self.next_reg,
            blocks: self.blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sizes() {
        assert_eq!(Type::Int(1).size(), 1);
        assert_eq!(Type::Int(16).size(), 2);
        assert_eq!(Type::vector(Type::Float, 4).size(), 16);
        assert_eq!(Type::vector(Type::Float, 4).lane_size(), 4);
        assert_eq!(Type::array(Type::Double, 3).size(), 24);
        assert_eq!(Type::Struct(vec![Type::i32(), Type::Double]).size(), 12);
        assert_eq!(Type::Pointer(AddressSpace::Local).size(), 8);
    }

    #[test]
    fn builder_places_params_first() {
        let mut f = FunctionBuilder::new("k");
        let a = f.param("a", Type::Pointer(AddressSpace::Global));
        let b = f.param("b", Type::i32());
        let c = f.constant(TypedValue::from_u32(1));
        f.ret(None);
        let func = f.finish();
        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(func.num_registers, 3);
        assert_eq!(func.blocks[0].instructions.len(), 2);
    }

    #[test]
    fn kernel_lookup() {
        let mut program = Program::new();
        let helper = program.add_function(FunctionBuilder::new("helper").finish());
        let k = program.add_kernel(FunctionBuilder::new("main").finish(), Some([4, 1, 1]));
        assert_eq!(program.find_function("main"), Some(k));
        assert!(program.kernel_metadata(helper).is_none());
        assert_eq!(
            program.kernel_metadata(k).and_then(|m| m.reqd_work_group_size),
            Some([4, 1, 1])
        );
    }
}
