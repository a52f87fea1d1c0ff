/// Work-item interpreter.
/// Each work-item walks the kernel's instruction stream on its own register
/// file and call stack, with a private memory pool that lives as long as the
/// item. Memory traffic goes to the pool named by the instruction's address
/// space; local addresses are rebased onto the owning group's region.
use crate::error::ExecutionError;
use crate::kernel::{Binding, Kernel};
use crate::memory::{Accessor, AddressSpace, Memory};
use crate::ndrange::{Dim3, NDRange};
use crate::ops;
use crate::plugin::{MessageType, PluginDispatcher};
use crate::program::{BlockId, Builtin, FenceFlags, FuncId, Instruction, InstructionRef, Reg};
use crate::value::TypedValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkItemId {
    pub global: Dim3,
    pub local: Dim3,
    pub group: Dim3,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkItemState {
    Ready,
    Running,
    AtBarrier { at: InstructionRef, flags: FenceFlags },
    Complete,
    Failed(ExecutionError),
}

impl WorkItemState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, WorkItemState::Complete | WorkItemState::Failed(_))
    }
}

/// Everything a work-item reads that belongs to its group or launch.
pub struct ExecutionContext<'a> {
    pub kernel: &'a Kernel,
    pub ndrange: &'a NDRange,
    pub group: Dim3,
    pub global: &'a Memory,
    pub constant: &'a Memory,
    pub local: &'a Memory,
    /// Address of the group's local region; Local bindings are offsets from it
    pub local_base: u64,
    pub private_size: usize,
    pub dispatcher: &'a Arc<PluginDispatcher>,
    /// Async copies already performed by this group: (site, n-th execution)
    pub copies: HashSet<(InstructionRef, u64)>,
}

struct Frame {
    function: FuncId,
    block: BlockId,
    index: usize,
    registers: Vec<Option<TypedValue>>,
    /// Caller register receiving the return value
    return_to: Option<Reg>,
    /// Private allocations made by this frame, freed on return
    allocas: Vec<u64>,
}

pub struct WorkItem {
    id: WorkItemId,
    state: WorkItemState,
    private: Memory,
    frames: Vec<Frame>,
    instructions: u64,
    copy_counts: HashMap<InstructionRef, u64>,
}

impl WorkItem {
    /// Create a work-item positioned at the kernel entry with its arguments
    /// loaded into the parameter registers.
    pub fn new(id: WorkItemId, ctx: &ExecutionContext<'_>) -> Self {
        let kernel = ctx.kernel;
        let function = kernel.function();
        let mut registers = vec![None; function.num_registers as usize];
        for (index, param) in function.params.iter().enumerate() {
            let Some(value) = kernel.argument(index) else {
                continue;
            };
            let value = match param.ty.address_space() {
                Some(AddressSpace::Local) => TypedValue::pointer(ctx.local_base + value.as_pointer()),
                _ => value.clone(),
            };
            if let Some(slot) = registers.get_mut(index) {
                *slot = Some(value);
            }
        }

        WorkItem {
            id,
            state: WorkItemState::Ready,
            private: Memory::new(AddressSpace::Private, ctx.private_size, Arc::clone(ctx.dispatcher)),
            frames: vec![Frame {
                function: kernel.function_id(),
                block: BlockId(0),
                index: 0,
                registers,
                return_to: None,
                allocas: Vec::new(),
            }],
            instructions: 0,
            copy_counts: HashMap::new(),
        }
    }

    pub fn id(&self) -> &WorkItemId {
        &self.id
    }

    pub fn state(&self) -> &WorkItemState {
        &self.state
    }

    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    /// Position of the next instruction to execute.
    pub fn current_instruction(&self) -> Option<InstructionRef> {
        self.frames.last().map(|f| InstructionRef {
            function: f.function,
            block: f.block,
            index: f.index,
        })
    }

    /// Barrier this item is waiting at, if any.
    pub fn barrier(&self) -> Option<(InstructionRef, FenceFlags)> {
        match self.state {
            WorkItemState::AtBarrier { at, flags } => Some((at, flags)),
            _ => None,
        }
    }

    /// Resume an item waiting at a barrier.
    pub fn release(&mut self) {
        if matches!(self.state, WorkItemState::AtBarrier { .. }) {
            self.state = WorkItemState::Ready;
        }
    }

    /// Execute until the item reaches a barrier or terminates.
    pub fn run(&mut self, ctx: &mut ExecutionContext<'_>) -> &WorkItemState {
        if self.state == WorkItemState::Ready {
            self.state = WorkItemState::Running;
        }
        while self.state == WorkItemState::Running {
            self.step(ctx);
        }
        &self.state
    }

    /// Execute exactly one instruction.
    pub fn step(&mut self, ctx: &mut ExecutionContext<'_>) {
        let kernel = ctx.kernel;
        let Some(at) = self.current_instruction() else {
            self.state = WorkItemState::Complete;
            return;
        };
        let Some(instruction) = kernel.program().instruction(at) else {
            self.fail(ctx, at, ExecutionError::MissingTerminator(at.function.0));
            return;
        };
        if let Some(frame) = self.frames.last_mut() {
            frame.index += 1;
        }

        match self.execute(ctx, at, instruction) {
            Ok(result) => {
                self.instructions += 1;
                ctx.dispatcher
                    .instruction_executed(&self.id, at, instruction, result.as_ref());
            }
            Err(err) => self.fail(ctx, at, err),
        }
    }

    fn fail(&mut self, ctx: &ExecutionContext<'_>, at: InstructionRef, err: ExecutionError) {
        ctx.dispatcher.log(
            MessageType::Error,
            &format!("work-item {} halted at {at}: {err}", self.id.global),
        );
        self.state = WorkItemState::Failed(err);
    }

    fn reg(&self, r: Reg) -> Result<&TypedValue, ExecutionError> {
        self.frames
            .last()
            .and_then(|f| f.registers.get(r as usize))
            .and_then(Option::as_ref)
            .ok_or(ExecutionError::UndefinedRegister(r))
    }

    fn set(&mut self, r: Reg, value: TypedValue) {
        if let Some(frame) = self.frames.last_mut() {
            let registers = &mut frame.registers;
            if registers.len() <= r as usize {
                registers.resize(r as usize + 1, None);
            }
            registers[r as usize] = Some(value);
        }
    }

    fn pool<'s>(&'s self, ctx: &'s ExecutionContext<'_>, space: AddressSpace) -> &'s Memory {
        match space {
            AddressSpace::Private => &self.private,
            AddressSpace::Global => ctx.global,
            AddressSpace::Constant => ctx.constant,
            AddressSpace::Local => ctx.local,
        }
    }

    fn builtin(&self, ctx: &ExecutionContext<'_>, query: Builtin, dim: u32) -> TypedValue {
        let d = dim as usize;
        let range = ctx.ndrange;
        let value = match query {
            Builtin::GlobalId => self.id.global.get_or(d, 0),
            Builtin::LocalId => self.id.local.get_or(d, 0),
            Builtin::GroupId => self.id.group.get_or(d, 0),
            Builtin::GlobalSize => range.global_size.get_or(d, 1),
            Builtin::LocalSize => range.local_size.get_or(d, 1),
            Builtin::NumGroups => range.num_groups().get_or(d, 1),
            Builtin::GlobalOffset => range.global_offset.get_or(d, 0),
            Builtin::WorkDim => return TypedValue::from_u32(range.work_dim),
        };
        TypedValue::from_u64(value as u64)
    }

    /// Run one instruction. The cursor already points past it.
    /// Returns the value produced, if any.
    fn execute(
        &mut self,
        ctx: &mut ExecutionContext<'_>,
        at: InstructionRef,
        instruction: &Instruction,
    ) -> Result<Option<TypedValue>, ExecutionError> {
        let accessor = Accessor::WorkItem(self.id);
        let result = match instruction {
            Instruction::Const { value, .. } => Some(value.clone()),
            Instruction::Builtin { query, dim, .. } => Some(self.builtin(ctx, *query, *dim)),
            Instruction::GlobalAddress { global, .. } => {
                let kernel = ctx.kernel;
                let address = kernel
                    .binding(Binding::Global(*global))
                    .ok_or(ExecutionError::UnboundGlobal(global.0))?
                    .try_pointer()?;
                let local = kernel
                    .program()
                    .global(*global)
                    .is_some_and(|g| g.space == AddressSpace::Local);
                let address = if local { ctx.local_base + address } else { address };
                Some(TypedValue::pointer(address))
            }
            Instruction::Binary { op, lhs, rhs, .. } => {
                Some(ops::binary(*op, self.reg(*lhs)?, self.reg(*rhs)?)?)
            }
            Instruction::Compare { pred, lhs, rhs, .. } => {
                Some(ops::compare(*pred, self.reg(*lhs)?, self.reg(*rhs)?)?)
            }
            Instruction::Cast { op, src, to, .. } => Some(ops::cast(*op, self.reg(*src)?, to)?),
            Instruction::Select { cond, if_true, if_false, .. } => Some(ops::select(
                self.reg(*cond)?,
                self.reg(*if_true)?,
                self.reg(*if_false)?,
            )?),
            Instruction::Offset { base, index, stride, .. } => {
                let base = self.reg(*base)?.try_pointer()?;
                let index = self.reg(*index)?.try_sint(0)?;
                let delta = index.wrapping_mul(*stride as i64) as u64;
                Some(TypedValue::pointer(base.wrapping_add(delta)))
            }
            Instruction::Alloca { ty, .. } => {
                let address = self.private.allocate(ty.size())?;
                if let Some(frame) = self.frames.last_mut() {
                    frame.allocas.push(address);
                }
                Some(TypedValue::pointer(address))
            }
            Instruction::Load { ty, space, ptr, .. } => {
                let address = self.reg(*ptr)?.try_pointer()?;
                let bytes = self.pool(ctx, *space).load(address, ty.size(), accessor)?;
                Some(TypedValue::from_bytes(ty.lane_size(), ty.lanes(), bytes))
            }
            Instruction::Store { space, ptr, value } => {
                let address = self.reg(*ptr)?.try_pointer()?;
                if *space == AddressSpace::Constant {
                    return Err(ExecutionError::ConstantStore(address));
                }
                let value = self.reg(*value)?;
                self.pool(ctx, *space).store(address, &value.data, accessor)?;
                None
            }
            Instruction::Atomic {
                op,
                space,
                ptr,
                operand,
                compare,
                ..
            } => {
                let address = self.reg(*ptr)?.try_pointer()?;
                if *space == AddressSpace::Constant {
                    return Err(ExecutionError::ConstantStore(address));
                }
                let operand = self.reg(*operand)?;
                let size = operand.size;
                let compare = match compare {
                    Some(r) => self.reg(*r)?.try_uint(0)?,
                    None => 0,
                };
                let old = self.pool(ctx, *space).atomic(
                    *op,
                    address,
                    size,
                    operand.try_uint(0)?,
                    compare,
                    accessor,
                )?;
                let mut result = TypedValue::new(size, 1);
                result.set_uint(0, old);
                Some(result)
            }
            Instruction::Barrier { flags } => {
                self.state = WorkItemState::AtBarrier { at, flags: *flags };
                None
            }
            Instruction::AsyncCopy {
                dst_space,
                dst,
                src_space,
                src,
                bytes,
            } => {
                let count = self.copy_counts.entry(at).or_insert(0);
                let key = (at, *count);
                *count += 1;
                let dst = self.reg(*dst)?.try_pointer()?;
                let src = self.reg(*src)?.try_pointer()?;
                let len = self.reg(*bytes)?.try_uint(0)? as usize;
                if *dst_space == AddressSpace::Constant {
                    return Err(ExecutionError::ConstantStore(dst));
                }
                // A copy that faults stays pending for the rest of the group.
                if !ctx.copies.contains(&key) {
                    let group = Accessor::WorkGroup(ctx.group);
                    let data = self.pool(ctx, *src_space).load(src, len, group)?;
                    self.pool(ctx, *dst_space).store(dst, &data, group)?;
                    ctx.copies.insert(key);
                }
                None
            }
            Instruction::Branch { target } => {
                self.jump(*target);
                None
            }
            Instruction::CondBranch { cond, if_true, if_false } => {
                let target = if self.reg(*cond)?.try_uint(0)? != 0 { *if_true } else { *if_false };
                self.jump(target);
                None
            }
            Instruction::Call { dst, function, args } => {
                let callee = ctx
                    .kernel
                    .program()
                    .function(*function)
                    .ok_or_else(|| ExecutionError::unknown_function(*function))?;
                if callee.params.len() != args.len() {
                    return Err(ExecutionError::ArgumentCount {
                        function: function.0,
                        expected: callee.params.len(),
                        found: args.len(),
                    });
                }
                let mut registers = vec![None; (callee.num_registers as usize).max(args.len())];
                for (slot, arg) in registers.iter_mut().zip(args) {
                    *slot = Some(self.reg(*arg)?.clone());
                }
                self.frames.push(Frame {
                    function: *function,
                    block: BlockId(0),
                    index: 0,
                    registers,
                    return_to: *dst,
                    allocas: Vec::new(),
                });
                None
            }
            Instruction::Return { value } => {
                let value = match value {
                    Some(r) => Some(self.reg(*r)?.clone()),
                    None => None,
                };
                if let Some(frame) = self.frames.pop() {
                    for address in frame.allocas {
                        self.private.deallocate(address)?;
                    }
                    match (self.frames.is_empty(), frame.return_to, &value) {
                        (true, _, _) => self.state = WorkItemState::Complete,
                        (false, Some(dst), Some(v)) => self.set(dst, v.clone()),
                        _ => {}
                    }
                }
                return Ok(value);
            }
        };

        if let (Some(dst), Some(value)) = (instruction.destination(), &result) {
            self.set(dst, value.clone());
        }
        Ok(result)
    }

    fn jump(&mut self, target: BlockId) {
        if let Some(frame) = self.frames.last_mut() {
            frame.block = target;
            frame.index = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AtomicOp;
    use crate::program::{BinaryOp, FunctionBuilder, Predicate, Program, Type};

    struct Fixture {
        kernel: Kernel,
        ndrange: NDRange,
        dispatcher: Arc<PluginDispatcher>,
        global: Memory,
        constant: Memory,
        local: Memory,
    }

    impl Fixture {
        fn new(program: Program, bind: impl FnOnce(&mut Kernel, &Memory)) -> Self {
            let dispatcher = Arc::new(PluginDispatcher::new());
            let global = Memory::new(AddressSpace::Global, 1 << 16, Arc::clone(&dispatcher));
            let constant = Memory::new(AddressSpace::Constant, 1 << 12, Arc::clone(&dispatcher));
            let local = Memory::new(AddressSpace::Local, 1 << 12, Arc::clone(&dispatcher));
            let mut kernel = Kernel::new(Arc::new(program), "k").unwrap();
            bind(&mut kernel, &global);
            Fixture {
                kernel,
                ndrange: NDRange::new(1, &[], &[4], &[4]).unwrap(),
                dispatcher,
                global,
                constant,
                local,
            }
        }

        fn context(&self) -> ExecutionContext<'_> {
            ExecutionContext {
                kernel: &self.kernel,
                ndrange: &self.ndrange,
                group: Dim3::default(),
                global: &self.global,
                constant: &self.constant,
                local: &self.local,
                local_base: 0,
                private_size: 1 << 10,
                dispatcher: &self.dispatcher,
                copies: HashSet::new(),
            }
        }
    }

    fn item(local: usize) -> WorkItemId {
        WorkItemId {
            global: Dim3::x(local),
            local: Dim3::x(local),
            group: Dim3::default(),
        }
    }

    fn read_u32(memory: &Memory, address: u64) -> u32 {
        let b = memory.host_load(address, 4).unwrap();
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }

    /// out[gid] = gid * gid, through a helper function.
    fn square_program() -> Program {
        let mut program = Program::new();
        let mut sq = FunctionBuilder::new("square");
        let x = sq.param("x", Type::Int(64));
        let y = sq.binary(BinaryOp::Mul, x, x);
        sq.ret(Some(y));
        let square = program.add_function(sq.finish());

        let mut k = FunctionBuilder::new("k");
        let out = k.param("out", Type::Pointer(AddressSpace::Global));
        let gid = k.builtin(Builtin::GlobalId, 0);
        let sqr = k.reg();
        k.push(Instruction::Call {
            dst: Some(sqr),
            function: square,
            args: vec![gid],
        });
        let slot = k.offset(out, gid, 8);
        k.store(AddressSpace::Global, slot, sqr);
        k.ret(None);
        program.add_kernel(k.finish(), None);
        program
    }

    #[test]
    fn runs_to_completion_through_calls() {
        let fx = Fixture::new(square_program(), |kernel, global| {
            let buffer = global.allocate(32).unwrap();
            kernel.set_argument(0, TypedValue::pointer(buffer)).unwrap();
        });
        let mut ctx = fx.context();
        let mut wi = WorkItem::new(item(3), &ctx);
        assert_eq!(*wi.run(&mut ctx), WorkItemState::Complete);
        assert_eq!(wi.call_depth(), 0);
        // builtin, call, mul, ret, offset, store, ret
        assert_eq!(wi.instructions_executed(), 7);
        let base = fx.kernel.argument(0).unwrap().as_pointer();
        assert_eq!(fx.global.host_load(base + 24, 8).unwrap(), 9u64.to_ne_bytes().to_vec());
    }

    #[test]
    fn invalid_load_fails_only_that_item() {
        let mut program = Program::new();
        let mut k = FunctionBuilder::new("k");
        let ptr = k.param("p", Type::Pointer(AddressSpace::Global));
        k.load(Type::i32(), AddressSpace::Global, ptr);
        k.ret(None);
        program.add_kernel(k.finish(), None);
        let fx = Fixture::new(program, |kernel, _| {
            kernel.set_argument(0, TypedValue::pointer(0x4000)).unwrap();
        });
        let mut ctx = fx.context();
        let mut wi = WorkItem::new(item(0), &ctx);
        let state = wi.run(&mut ctx).clone();
        assert!(matches!(state, WorkItemState::Failed(ExecutionError::Memory(_))));
        assert!(state.is_terminated());
    }

    #[test]
    fn barrier_suspends_until_released() {
        let mut program = Program::new();
        let mut k = FunctionBuilder::new("k");
        k.barrier(FenceFlags::LOCAL);
        k.ret(None);
        program.add_kernel(k.finish(), None);
        let fx = Fixture::new(program, |_, _| {});
        let mut ctx = fx.context();
        let mut wi = WorkItem::new(item(0), &ctx);

        let state = wi.run(&mut ctx).clone();
        let (at, flags) = wi.barrier().unwrap();
        assert!(matches!(state, WorkItemState::AtBarrier { .. }));
        assert_eq!(at.index, 0);
        assert_eq!(flags, FenceFlags::LOCAL);

        // Running without a release makes no progress.
        assert!(matches!(wi.run(&mut ctx), WorkItemState::AtBarrier { .. }));
        wi.release();
        assert_eq!(*wi.run(&mut ctx), WorkItemState::Complete);
    }

    #[test]
    fn loops_and_atomics() {
        // for (i = 0; i < 5; i++) atomic_add(counter, 2);
        let mut program = Program::new();
        let mut k = FunctionBuilder::new("k");
        let counter = k.param("counter", Type::Pointer(AddressSpace::Global));
        let slot = k.reg();
        k.push(Instruction::Alloca { dst: slot, ty: Type::i32() });
        let zero = k.constant(TypedValue::from_u32(0));
        k.store(AddressSpace::Private, slot, zero);
        let header = k.block();
        let body = k.block();
        let exit = k.block();
        k.push(Instruction::Branch { target: header });

        k.switch_to(header);
        let i = k.load(Type::i32(), AddressSpace::Private, slot);
        let five = k.constant(TypedValue::from_u32(5));
        let more = k.compare(Predicate::Slt, i, five);
        k.push(Instruction::CondBranch { cond: more, if_true: body, if_false: exit });

        k.switch_to(body);
        let two = k.constant(TypedValue::from_u32(2));
        k.atomic(AtomicOp::Add, AddressSpace::Global, counter, two);
        let one = k.constant(TypedValue::from_u32(1));
        let next = k.binary(BinaryOp::Add, i, one);
        k.store(AddressSpace::Private, slot, next);
        k.push(Instruction::Branch { target: header });

        k.switch_to(exit);
        k.ret(None);
        program.add_kernel(k.finish(), None);

        let fx = Fixture::new(program, |kernel, global| {
            let address = global.allocate(4).unwrap();
            kernel.set_argument(0, TypedValue::pointer(address)).unwrap();
        });
        let mut ctx = fx.context();
        for lane in 0..4 {
            let mut wi = WorkItem::new(item(lane), &ctx);
            assert_eq!(*wi.run(&mut ctx), WorkItemState::Complete);
        }
        let address = fx.kernel.argument(0).unwrap().as_pointer();
        assert_eq!(read_u32(&fx.global, address), 40);
    }

    #[test]
    fn stores_to_constant_memory_fault() {
        let mut program = Program::new();
        let mut k = FunctionBuilder::new("k");
        let ptr = k.param("p", Type::Pointer(AddressSpace::Constant));
        let v = k.constant(TypedValue::from_u32(1));
        k.store(AddressSpace::Constant, ptr, v);
        k.ret(None);
        program.add_kernel(k.finish(), None);
        let fx = Fixture::new(program, |kernel, _| {
            kernel.set_argument(0, TypedValue::pointer(8)).unwrap();
        });
        let mut ctx = fx.context();
        let mut wi = WorkItem::new(item(0), &ctx);
        assert_eq!(
            *wi.run(&mut ctx),
            WorkItemState::Failed(ExecutionError::ConstantStore(8))
        );
    }

    #[test]
    fn reading_an_unset_register_faults() {
        let mut program = Program::new();
        let mut k = FunctionBuilder::new("k");
        let ghost = k.reg();
        let sum = k.binary(BinaryOp::Add, ghost, ghost);
        k.ret(Some(sum));
        program.add_kernel(k.finish(), None);
        let fx = Fixture::new(program, |_, _| {});
        let mut ctx = fx.context();
        let mut wi = WorkItem::new(item(0), &ctx);
        assert_eq!(
            *wi.run(&mut ctx),
            WorkItemState::Failed(ExecutionError::UndefinedRegister(ghost))
        );
    }

    /// `v = load i24; br v ? a : b` over a private 3-byte slot.
    fn odd_width_branch() -> Program {
        let mut program = Program::new();
        let mut k = FunctionBuilder::new("k");
        let slot = k.reg();
        k.push(Instruction::Alloca { dst: slot, ty: Type::Int(24) });
        let v = k.load(Type::Int(24), AddressSpace::Private, slot);
        let taken = k.block();
        let skipped = k.block();
        k.push(Instruction::CondBranch { cond: v, if_true: taken, if_false: skipped });
        k.switch_to(taken);
        k.ret(None);
        k.switch_to(skipped);
        k.ret(None);
        program.add_kernel(k.finish(), None);
        program
    }

    #[test]
    fn odd_width_condition_fails_the_item() {
        let fx = Fixture::new(odd_width_branch(), |_, _| {});
        let mut ctx = fx.context();
        let mut wi = WorkItem::new(item(0), &ctx);
        let state = wi.run(&mut ctx).clone();
        assert!(
            matches!(state, WorkItemState::Failed(ExecutionError::Unsupported(_))),
            "{state:?}"
        );
        // alloca and load ran; the branch did not.
        assert_eq!(wi.instructions_executed(), 2);
    }

    #[test]
    fn odd_width_pointer_fails_the_item() {
        let mut program = Program::new();
        let mut k = FunctionBuilder::new("k");
        let slot = k.reg();
        k.push(Instruction::Alloca { dst: slot, ty: Type::Int(24) });
        let bogus = k.load(Type::Int(24), AddressSpace::Private, slot);
        let v = k.constant(TypedValue::from_u32(1));
        k.store(AddressSpace::Global, bogus, v);
        k.ret(None);
        program.add_kernel(k.finish(), None);
        let fx = Fixture::new(program, |_, _| {});
        let mut ctx = fx.context();
        let mut wi = WorkItem::new(item(0), &ctx);
        assert!(matches!(
            wi.run(&mut ctx),
            WorkItemState::Failed(ExecutionError::Unsupported(_))
        ));
    }
}
