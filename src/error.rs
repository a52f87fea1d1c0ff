/// Error taxonomy of the simulator.
///
/// Memory and configuration failures are reported to the caller of the
/// operation that produced them. Work-item faults halt only the issuing lane;
/// barrier divergence is fatal for its work-group.
use crate::memory::AddressSpace;
use crate::ndrange::Dim3;
use crate::program::FuncId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SimError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("out of {space} memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        space: AddressSpace,
        requested: usize,
        available: usize,
    },
    #[error("invalid {space} access of {size} bytes at {address:#x}")]
    InvalidAddress {
        space: AddressSpace,
        address: u64,
        size: usize,
    },
    #[error("{space} address {address:#x} was never allocated or already freed")]
    UnknownAllocation { space: AddressSpace, address: u64 },
    #[error("atomic access of {size} bytes is not supported")]
    UnsupportedAtomicSize { size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("work dimension {0} is not in 1..=3")]
    InvalidWorkDim(u32),
    #[error("global size in dimension {dim} is zero or missing")]
    EmptyRange { dim: usize },
    #[error("global size {global} is not divisible by local size {local} in dimension {dim}")]
    IndivisibleRange {
        dim: usize,
        global: usize,
        local: usize,
    },
    #[error("work-group size {requested} does not match the required size {required}")]
    WorkGroupSizeMismatch { required: Dim3, requested: Dim3 },
    #[error("argument index {index} out of range ({count} arguments)")]
    ArgumentOutOfRange { index: usize, count: usize },
    #[error("kernel argument {index} has no binding")]
    UnboundArgument { index: usize },
    #[error("no kernel named '{0}' in program")]
    UnknownKernel(String),
}

/// A fault raised while interpreting one work-item.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("register r{0} read before it was written")]
    UndefinedRegister(u32),
    #[error("function #{0} does not exist")]
    UnknownFunction(usize),
    #[error("call to function #{function} passes {found} arguments, expected {expected}")]
    ArgumentCount {
        function: usize,
        expected: usize,
        found: usize,
    },
    #[error("integer division by zero")]
    DivisionByZero,
    #[error("store to read-only constant memory at {0:#x}")]
    ConstantStore(u64),
    #[error("program-scope variable #{0} has no address in this invocation")]
    UnboundGlobal(usize),
    #[error("control fell off the end of a block in function #{0}")]
    MissingTerminator(usize),
}

impl ExecutionError {
    pub(crate) fn unknown_function(id: FuncId) -> Self {
        ExecutionError::UnknownFunction(id.0)
    }
}

/// Failure reported by a plugin callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PluginError {
    /// Logged and broadcast; the run continues.
    #[error("{0}")]
    Recoverable(String),
    /// Aborts the run at the next scheduling boundary.
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("barrier divergence in work-group {group}: {detail}")]
    BarrierDivergence { group: Dim3, detail: String },
    #[error("work-item {item} failed: {source}")]
    WorkItemFault {
        item: Dim3,
        #[source]
        source: ExecutionError,
    },
    #[error("plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },
}
