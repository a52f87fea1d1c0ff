/// Ready-made kernels built with [`FunctionBuilder`].
///
/// Used by the demo binary and the test suites. Each function returns a
/// program holding a single kernel named after the function.
use crate::memory::{AddressSpace, AtomicOp};
use crate::program::{
    BinaryOp, Builtin, Constant, FenceFlags, FunctionBuilder, GlobalVariable, Instruction,
    Predicate, Program, Type,
};
use crate::value::TypedValue;

fn global_ptr() -> Type {
    Type::Pointer(AddressSpace::Global)
}

/// `out[i] = a[i] + b[i]` over `float`.
pub fn vector_add() -> Program {
    let mut k = FunctionBuilder::new("vector_add");
    let a = k.param("a", global_ptr());
    let b = k.param("b", global_ptr());
    let out = k.param("out", global_ptr());
    let gid = k.builtin(Builtin::GlobalId, 0);
    let pa = k.offset(a, gid, 4);
    let pb = k.offset(b, gid, 4);
    let va = k.load(Type::Float, AddressSpace::Global, pa);
    let vb = k.load(Type::Float, AddressSpace::Global, pb);
    let sum = k.binary(BinaryOp::FAdd, va, vb);
    let po = k.offset(out, gid, 4);
    k.store(AddressSpace::Global, po, sum);
    k.ret(None);

    let mut program = Program::new();
    program.add_kernel(k.finish(), None);
    program
}

/// Every item publishes `input[gid]` to a local scratch argument, waits at a
/// barrier, then reads its right-hand neighbour's slot:
/// `output[gid] = input[group * n + (lid + 1) % n]`.
pub fn rotate_local() -> Program {
    let mut k = FunctionBuilder::new("rotate_local");
    let input = k.param("input", global_ptr());
    let output = k.param("output", global_ptr());
    let scratch = k.param("scratch", Type::Pointer(AddressSpace::Local));
    let gid = k.builtin(Builtin::GlobalId, 0);
    let lid = k.builtin(Builtin::LocalId, 0);
    let n = k.builtin(Builtin::LocalSize, 0);

    let src = k.offset(input, gid, 4);
    let v = k.load(Type::i32(), AddressSpace::Global, src);
    let mine = k.offset(scratch, lid, 4);
    k.store(AddressSpace::Local, mine, v);
    k.barrier(FenceFlags::LOCAL);

    let one = k.constant(TypedValue::from_u64(1));
    let next = k.binary(BinaryOp::Add, lid, one);
    let next = k.binary(BinaryOp::URem, next, n);
    let theirs = k.offset(scratch, next, 4);
    let w = k.load(Type::i32(), AddressSpace::Local, theirs);
    let dst = k.offset(output, gid, 4);
    k.store(AddressSpace::Global, dst, w);
    k.ret(None);

    let mut program = Program::new();
    program.add_kernel(k.finish(), None);
    program
}

/// Reverse each group's slice of `input` through a program-scope local tile
/// filled with a work-group async copy. Groups hold at most 64 items.
pub fn reverse_tile() -> Program {
    let mut program = Program::new();
    let tile = program.add_global(GlobalVariable {
        name: "tile".to_string(),
        space: AddressSpace::Local,
        ty: Type::array(Type::i32(), 64),
        constant: false,
        initializer: None,
    });

    let mut k = FunctionBuilder::new("reverse_tile");
    let input = k.param("input", global_ptr());
    let output = k.param("output", global_ptr());
    let gid = k.builtin(Builtin::GlobalId, 0);
    let lid = k.builtin(Builtin::LocalId, 0);
    let group = k.builtin(Builtin::GroupId, 0);
    let n = k.builtin(Builtin::LocalSize, 0);
    let base = k.reg();
    k.push(Instruction::GlobalAddress { dst: base, global: tile });

    let first = k.binary(BinaryOp::Mul, group, n);
    let src = k.offset(input, first, 4);
    let four = k.constant(TypedValue::from_u64(4));
    let bytes = k.binary(BinaryOp::Mul, n, four);
    k.push(Instruction::AsyncCopy {
        dst_space: AddressSpace::Local,
        dst: base,
        src_space: AddressSpace::Global,
        src,
        bytes,
    });
    k.barrier(FenceFlags::LOCAL);

    let one = k.constant(TypedValue::from_u64(1));
    let last = k.binary(BinaryOp::Sub, n, one);
    let mirror = k.binary(BinaryOp::Sub, last, lid);
    let slot = k.offset(base, mirror, 4);
    let v = k.load(Type::i32(), AddressSpace::Local, slot);
    let dst = k.offset(output, gid, 4);
    k.store(AddressSpace::Global, dst, v);
    k.ret(None);

    program.add_kernel(k.finish(), None);
    program
}

/// `out[i] = input[i] * weights[i % 4]` with `weights = {1, 2, 3, 4}` in
/// constant memory.
pub fn weighted() -> Program {
    let mut program = Program::new();
    let weights = program.add_global(GlobalVariable {
        name: "weights".to_string(),
        space: AddressSpace::Constant,
        ty: Type::array(Type::i32(), 4),
        constant: true,
        initializer: Some(Constant::Aggregate(
            (1..=4).map(Constant::Int).collect(),
        )),
    });

    let mut k = FunctionBuilder::new("weighted");
    let input = k.param("input", global_ptr());
    let output = k.param("output", global_ptr());
    let gid = k.builtin(Builtin::GlobalId, 0);
    let table = k.reg();
    k.push(Instruction::GlobalAddress { dst: table, global: weights });
    let four = k.constant(TypedValue::from_u64(4));
    let lane = k.binary(BinaryOp::URem, gid, four);
    let pw = k.offset(table, lane, 4);
    let w = k.load(Type::i32(), AddressSpace::Constant, pw);
    let pi = k.offset(input, gid, 4);
    let x = k.load(Type::i32(), AddressSpace::Global, pi);
    let y = k.binary(BinaryOp::Mul, x, w);
    let po = k.offset(output, gid, 4);
    k.store(AddressSpace::Global, po, y);
    k.ret(None);

    program.add_kernel(k.finish(), None);
    program
}

/// Every item adds 1 to `*counter` atomically.
pub fn atomic_counter() -> Program {
    let mut k = FunctionBuilder::new("atomic_counter");
    let counter = k.param("counter", global_ptr());
    let one = k.constant(TypedValue::from_u32(1));
    k.atomic(AtomicOp::Add, AddressSpace::Global, counter, one);
    k.ret(None);

    let mut program = Program::new();
    program.add_kernel(k.finish(), None);
    program
}

/// Item 0 of each group waits at one barrier, all others at another.
pub fn divergent_barrier() -> Program {
    let mut k = FunctionBuilder::new("divergent_barrier");
    let lid = k.builtin(Builtin::LocalId, 0);
    let zero = k.constant(TypedValue::from_u64(0));
    let first = k.compare(Predicate::Eq, lid, zero);
    let left = k.block();
    let right = k.block();
    k.push(Instruction::CondBranch {
        cond: first,
        if_true: left,
        if_false: right,
    });
    k.switch_to(left);
    k.barrier(FenceFlags::LOCAL);
    k.ret(None);
    k.switch_to(right);
    k.barrier(FenceFlags::LOCAL);
    k.ret(None);

    let mut program = Program::new();
    program.add_kernel(k.finish(), None);
    program
}

/// Item 0 of each group returns immediately; the rest meet at a barrier and
/// then set `out[gid] = 1`.
pub fn early_exit() -> Program {
    let mut k = FunctionBuilder::new("early_exit");
    let out = k.param("out", global_ptr());
    let gid = k.builtin(Builtin::GlobalId, 0);
    let lid = k.builtin(Builtin::LocalId, 0);
    let zero = k.constant(TypedValue::from_u64(0));
    let first = k.compare(Predicate::Eq, lid, zero);
    let exit = k.block();
    let body = k.block();
    k.push(Instruction::CondBranch {
        cond: first,
        if_true: exit,
        if_false: body,
    });
    k.switch_to(exit);
    k.ret(None);
    k.switch_to(body);
    k.barrier(FenceFlags::GLOBAL);
    let one = k.constant(TypedValue::from_u32(1));
    let dst = k.offset(out, gid, 4);
    k.store(AddressSpace::Global, dst, one);
    k.ret(None);

    let mut program = Program::new();
    program.add_kernel(k.finish(), Some([4, 1, 1]));
    program
}

/// `out[gid] = *ptrs[gid]`, where each item loads through its own pointer.
/// Used to fault individual items with bad addresses.
pub fn gather() -> Program {
    let mut k = FunctionBuilder::new("gather");
    let ptrs = k.param("ptrs", global_ptr());
    let out = k.param("out", global_ptr());
    let gid = k.builtin(Builtin::GlobalId, 0);
    let slot = k.offset(ptrs, gid, 8);
    let ptr = k.load(global_ptr(), AddressSpace::Global, slot);
    let v = k.load(Type::i32(), AddressSpace::Global, ptr);
    let dst = k.offset(out, gid, 4);
    k.store(AddressSpace::Global, dst, v);
    k.ret(None);

    let mut program = Program::new();
    program.add_kernel(k.finish(), None);
    program
}
