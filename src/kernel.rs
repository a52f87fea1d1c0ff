/// Kernel definitions and argument binding.
/// A kernel is a compiled entry point that every work-item executes, plus the
/// host-supplied values bound to its formal arguments for the next launch.
use crate::error::{ConfigurationError, MemoryError};
use crate::memory::{AddressSpace, Memory};
use crate::ndrange::Dim3;
use crate::plugin::MessageType;
use crate::program::{Constant, FuncId, Function, GlobalId, Program, Type};
use crate::value::TypedValue;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stable handle for anything a work-item can read from the kernel's
/// binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Binding {
    /// Formal argument by position
    Argument(usize),
    /// Program-scope variable
    Global(GlobalId),
}

/// A compiled entry point and its current argument bindings.
///
/// Bindings for Local-space arguments and variables hold an offset into the
/// per-group local region, not an address: each work-group adds the base of
/// its own region. Constant-space variables are bound to real addresses in
/// constant memory between `allocate_constants` and `deallocate_constants`.
#[derive(Debug, Clone)]
pub struct Kernel {
    program: Arc<Program>,
    function: FuncId,
    name: String,
    required_work_group_size: Option<Dim3>,
    global_size: Dim3,
    bindings: BTreeMap<Binding, TypedValue>,
    /// Program-scope Local variables: (id, size)
    static_locals: Vec<(GlobalId, usize)>,
    /// Byte size requested for each bound Local argument
    local_arguments: BTreeMap<usize, usize>,
    local_memory_size: usize,
    /// Program-scope Constant variables materialized per launch
    constants: Vec<GlobalId>,
    /// Live constant buffers: (variable, address)
    constant_buffers: Vec<(GlobalId, u64)>,
}

impl Kernel {
    /// Look up the entry point `name` in `program`.
    ///
    /// Local-space program variables are laid out once here; Constant-space
    /// ones are queued for materialization at launch.
    pub fn new(program: Arc<Program>, name: &str) -> Result<Self, ConfigurationError> {
        let function = program
            .find_function(name)
            .ok_or_else(|| ConfigurationError::UnknownKernel(name.to_string()))?;
        let metadata = program
            .kernel_metadata(function)
            .ok_or_else(|| ConfigurationError::UnknownKernel(name.to_string()))?;
        let required_work_group_size = metadata.reqd_work_group_size.map(Dim3::from_array);

        let mut static_locals = Vec::new();
        let mut constants = Vec::new();
        for (index, global) in program.globals.iter().enumerate() {
            let id = GlobalId(index);
            match global.space {
                AddressSpace::Local => static_locals.push((id, global.ty.size())),
                AddressSpace::Constant => constants.push(id),
                space => log::warn!(
                    "program-scope variable '{}' in {space} memory is not materialized",
                    global.name
                ),
            }
        }

        let mut kernel = Kernel {
            program,
            function,
            name: name.to_string(),
            required_work_group_size,
            global_size: Dim3::new(1, 1, 1),
            bindings: BTreeMap::new(),
            static_locals,
            local_arguments: BTreeMap::new(),
            local_memory_size: 0,
            constants,
            constant_buffers: Vec::new(),
        };
        kernel.layout_local_memory();
        Ok(kernel)
    }

    /// Bind `value` to argument `index`.
    ///
    /// For a Local pointer argument `value.size * value.num` is the number of
    /// bytes to reserve in each group's local region; the binding becomes the
    /// reservation's offset. Vector arguments are reshaped to the declared
    /// lane count.
    pub fn set_argument(&mut self, index: usize, value: TypedValue) -> Result<(), ConfigurationError> {
        let ty = self.param_type(index)?.clone();
        if ty.address_space() == Some(AddressSpace::Local) {
            self.local_arguments.insert(index, value.size * value.num);
            self.layout_local_memory();
            return Ok(());
        }

        let value = if ty.is_vector() && value.num != ty.lanes() {
            let lanes = ty.lanes();
            if value.byte_len() % lanes == 0 {
                let lane = value.byte_len() / lanes;
                value.reshaped(lane, lanes)
            } else {
                log::warn!(
                    "argument {index} of '{}': {} bytes do not split into {lanes} lanes",
                    self.name,
                    value.byte_len()
                );
                value
            }
        } else {
            value
        };
        self.bindings.insert(Binding::Argument(index), value);
        Ok(())
    }

    /// Static locals first, then Local arguments in index order.
    fn layout_local_memory(&mut self) {
        let mut offset = 0usize;
        for &(id, size) in &self.static_locals {
            self.bindings.insert(Binding::Global(id), TypedValue::pointer(offset as u64));
            offset += size;
        }
        for (&index, &size) in &self.local_arguments {
            self.bindings.insert(Binding::Argument(index), TypedValue::pointer(offset as u64));
            offset += size;
        }
        self.local_memory_size = offset;
    }

    fn param_type(&self, index: usize) -> Result<&Type, ConfigurationError> {
        let params = &self.function().params;
        params
            .get(index)
            .map(|p| &p.ty)
            .ok_or(ConfigurationError::ArgumentOutOfRange {
                index,
                count: params.len(),
            })
    }

    /// Size in bytes of argument `index`. Pointers are 8 bytes.
    pub fn argument_size(&self, index: usize) -> Result<usize, ConfigurationError> {
        self.param_type(index).map(Type::size)
    }

    /// Address space an argument points into; non-pointer arguments are Private.
    pub fn argument_type(&self, index: usize) -> Result<AddressSpace, ConfigurationError> {
        self.param_type(index)
            .map(|ty| ty.address_space().unwrap_or(AddressSpace::Private))
    }

    pub fn required_work_group_size(&self) -> Option<Dim3> {
        self.required_work_group_size
    }

    pub fn set_global_size(&mut self, size: Dim3) {
        self.global_size = size;
    }

    pub fn global_size(&self) -> Dim3 {
        self.global_size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_arguments(&self) -> usize {
        self.function().params.len()
    }

    /// Bytes of local memory each work-group must provide.
    pub fn local_memory_size(&self) -> usize {
        self.local_memory_size
    }

    pub fn binding(&self, handle: Binding) -> Option<&TypedValue> {
        self.bindings.get(&handle)
    }

    pub fn argument(&self, index: usize) -> Option<&TypedValue> {
        self.binding(Binding::Argument(index))
    }

    pub fn first_unbound_argument(&self) -> Option<usize> {
        (0..self.num_arguments()).find(|&i| self.argument(i).is_none())
    }

    pub fn all_arguments_bound(&self) -> bool {
        self.first_unbound_argument().is_none()
    }

    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn function_id(&self) -> FuncId {
        self.function
    }

    pub fn function(&self) -> &Function {
        &self.program.functions[self.function.0]
    }

    /// Allocate and initialize every queued constant variable in `memory`.
    pub fn allocate_constants(&mut self, memory: &Memory) -> Result<(), MemoryError> {
        let program = Arc::clone(&self.program);
        for &id in &self.constants {
            let Some(global) = program.global(id) else {
                continue;
            };
            let address = memory.allocate(global.ty.size())?;
            self.constant_buffers.push((id, address));
            self.bindings.insert(Binding::Global(id), TypedValue::pointer(address));
            if let Some(init) = &global.initializer {
                store_constant(memory, address, &global.ty, init)?;
            }
        }
        Ok(())
    }

    /// Constant buffers currently held for this kernel.
    pub fn constant_buffer_count(&self) -> usize {
        self.constant_buffers.len()
    }

    /// Release the buffers made by [`Kernel::allocate_constants`].
    /// Failures are reported through the log channel only.
    pub fn deallocate_constants(&mut self, memory: &Memory) {
        for (id, address) in self.constant_buffers.drain(..) {
            self.bindings.remove(&Binding::Global(id));
            if let Err(err) = memory.deallocate(address) {
                memory
                    .dispatcher()
                    .log(MessageType::Warning, &format!("failed to release constant buffer: {err}"));
            }
        }
    }
}

/// Write `constant` as a value of type `ty` at `address`.
/// Aggregates are written element by element; shapes with no byte
/// representation are reported and left zeroed.
fn store_constant(memory: &Memory, address: u64, ty: &Type, constant: &Constant) -> Result<(), MemoryError> {
    match (ty, constant) {
        (_, Constant::Zero) => Ok(()),
        (Type::Int(_) | Type::Pointer(_), Constant::Int(v)) if matches!(ty.size(), 1 | 2 | 4 | 8) => {
            let mut value = TypedValue::new(ty.size(), 1);
            value.set_uint(0, *v);
            memory.host_store(address, &value.data)
        }
        (Type::Float, Constant::Float(f)) => memory.host_store(address, &f.to_ne_bytes()),
        (Type::Double, Constant::Double(d)) => memory.host_store(address, &d.to_ne_bytes()),
        (Type::Array(elem, n) | Type::Vector(elem, n), Constant::Aggregate(items)) => {
            let stride = elem.size() as u64;
            for (i, item) in items.iter().take(*n).enumerate() {
                store_constant(memory, address + i as u64 * stride, elem, item)?;
            }
            Ok(())
        }
        (Type::Struct(fields), Constant::Aggregate(items)) => {
            let mut offset = 0u64;
            for (field, item) in fields.iter().zip(items) {
                store_constant(memory, address + offset, field, item)?;
                offset += field.size() as u64;
            }
            Ok(())
        }
        (ty, constant) => {
            memory.dispatcher().log(
                MessageType::Warning,
                &format!("unsupported constant {constant:?} for type {ty:?}"),
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::PluginDispatcher;
    use crate::program::{FunctionBuilder, GlobalVariable};

    fn program() -> Arc<Program> {
        let mut program = Program::new();
        let mut f = FunctionBuilder::new("k");
        f.param("out", Type::Pointer(AddressSpace::Global));
        f.param("scratch", Type::Pointer(AddressSpace::Local));
        f.param("v", Type::vector(Type::Float, 4));
        f.param("n", Type::i32());
        f.ret(None);
        program.add_kernel(f.finish(), Some([4, 1, 1]));
        program.add_function(FunctionBuilder::new("helper").finish());
        program.add_global(GlobalVariable {
            name: "table".to_string(),
            space: AddressSpace::Constant,
            ty: Type::array(Type::i32(), 3),
            constant: true,
            initializer: Some(Constant::Aggregate(vec![
                Constant::Int(7),
                Constant::Int(8),
                Constant::Int(9),
            ])),
        });
        program.add_global(GlobalVariable {
            name: "tile".to_string(),
            space: AddressSpace::Local,
            ty: Type::array(Type::Float, 2),
            constant: false,
            initializer: None,
        });
        Arc::new(program)
    }

    #[test]
    fn only_kernel_entry_points_are_accepted() {
        let program = program();
        assert!(Kernel::new(Arc::clone(&program), "k").is_ok());
        assert_eq!(
            Kernel::new(Arc::clone(&program), "helper").unwrap_err(),
            ConfigurationError::UnknownKernel("helper".to_string())
        );
        assert!(Kernel::new(program, "missing").is_err());
    }

    #[test]
    fn metadata_queries() {
        let kernel = Kernel::new(program(), "k").unwrap();
        assert_eq!(kernel.num_arguments(), 4);
        assert_eq!(kernel.argument_type(0), Ok(AddressSpace::Global));
        assert_eq!(kernel.argument_type(1), Ok(AddressSpace::Local));
        assert_eq!(kernel.argument_type(3), Ok(AddressSpace::Private));
        assert_eq!(kernel.argument_size(0), Ok(8));
        assert_eq!(kernel.argument_size(2), Ok(16));
        assert_eq!(kernel.required_work_group_size(), Some(Dim3::new(4, 1, 1)));
        assert!(kernel.argument_size(9).is_err());
    }

    #[test]
    fn out_of_range_argument_changes_nothing() {
        let mut kernel = Kernel::new(program(), "k").unwrap();
        kernel.set_argument(3, TypedValue::from_u32(5)).unwrap();
        let before = kernel.bindings.clone();
        let err = kernel.set_argument(4, TypedValue::from_u32(1)).unwrap_err();
        assert_eq!(err, ConfigurationError::ArgumentOutOfRange { index: 4, count: 4 });
        assert_eq!(kernel.bindings, before);
    }

    #[test]
    fn local_arguments_follow_static_locals() {
        let mut kernel = Kernel::new(program(), "k").unwrap();
        assert_eq!(kernel.local_memory_size(), 8);
        kernel.set_argument(1, TypedValue::new(16, 1)).unwrap();
        assert_eq!(kernel.argument(1).map(TypedValue::as_pointer), Some(8));
        assert_eq!(kernel.local_memory_size(), 24);

        // Re-binding replaces the earlier reservation.
        kernel.set_argument(1, TypedValue::new(32, 1)).unwrap();
        assert_eq!(kernel.argument(1).map(TypedValue::as_pointer), Some(8));
        assert_eq!(kernel.local_memory_size(), 40);
        assert_eq!(
            kernel.binding(Binding::Global(GlobalId(1))).map(TypedValue::as_pointer),
            Some(0)
        );
    }

    #[test]
    fn vector_arguments_are_reshaped() {
        let mut kernel = Kernel::new(program(), "k").unwrap();
        let raw = TypedValue::from_bytes(16, 1, vec![0; 16]);
        kernel.set_argument(2, raw).unwrap();
        let bound = kernel.argument(2).unwrap();
        assert_eq!((bound.size, bound.num), (4, 4));
    }

    #[test]
    fn unbound_arguments_are_reported() {
        let mut kernel = Kernel::new(program(), "k").unwrap();
        assert_eq!(kernel.first_unbound_argument(), Some(0));
        kernel.set_argument(0, TypedValue::pointer(8)).unwrap();
        kernel.set_argument(1, TypedValue::new(4, 1)).unwrap();
        kernel.set_argument(2, TypedValue::from_f32_lanes(&[0.0; 4])).unwrap();
        assert_eq!(kernel.first_unbound_argument(), Some(3));
        kernel.set_argument(3, TypedValue::from_u32(1)).unwrap();
        assert!(kernel.all_arguments_bound());
    }

    #[test]
    fn constants_are_materialized_then_released() {
        let dispatcher = Arc::new(PluginDispatcher::new());
        let memory = Memory::new(AddressSpace::Constant, 1 << 12, dispatcher);
        let mut kernel = Kernel::new(program(), "k").unwrap();

        kernel.allocate_constants(&memory).unwrap();
        let address = kernel.binding(Binding::Global(GlobalId(0))).unwrap().as_pointer();
        let bytes = memory.host_load(address, 12).unwrap();
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words, vec![7, 8, 9]);

        kernel.deallocate_constants(&memory);
        assert_eq!(memory.allocation_count(), 0);
        assert!(kernel.binding(Binding::Global(GlobalId(0))).is_none());
    }

    #[test]
    fn unsupported_constant_is_skipped() {
        let mut program = Program::new();
        program.add_kernel(FunctionBuilder::new("k").finish(), None);
        program.add_global(GlobalVariable {
            name: "odd".to_string(),
            space: AddressSpace::Constant,
            ty: Type::Int(24),
            constant: true,
            initializer: Some(Constant::Int(1)),
        });
        let memory = Memory::new(AddressSpace::Constant, 1 << 12, Arc::new(PluginDispatcher::new()));
        let mut kernel = Kernel::new(Arc::new(program), "k").unwrap();
        kernel.allocate_constants(&memory).unwrap();
        let address = kernel.binding(Binding::Global(GlobalId(0))).unwrap().as_pointer();
        assert_eq!(memory.host_load(address, 3).unwrap(), vec![0, 0, 0]);
    }
}
