/// # Plugin interface
/// Observers of the simulated execution implement [`Plugin`]. Every callback
/// has a no-op default, so a plugin overrides only the events it needs.
///
/// A [`PluginDispatcher`] owns the registered plugins and forwards each event
/// to all of them, synchronously and in registration order, before the
/// producing operation returns. Plugins that do not declare themselves
/// thread-safe are never invoked concurrently: their callbacks run under a
/// per-plugin lock.
///
/// A callback may fail. Recoverable failures are logged and broadcast as a
/// `log` event; fatal failures are recorded and picked up by the device at the
/// next scheduling boundary. Panics inside a callback are caught and treated
/// as recoverable. Neither path touches simulated state.
use crate::device::KernelInvocation;
use crate::error::PluginError;
use crate::memory::{Accessor, AtomicOp, Memory};
use crate::ndrange::Dim3;
use crate::program::{FenceFlags, Instruction, InstructionRef};
use crate::value::TypedValue;
use crate::workitem::WorkItemId;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

pub type PluginResult = Result<(), PluginError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<MessageType> for log::Level {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Debug => log::Level::Debug,
            MessageType::Info => log::Level::Info,
            MessageType::Warning => log::Level::Warn,
            MessageType::Error => log::Level::Error,
        }
    }
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
    fn host_memory_load(&self, _memory: &Memory, _address: u64, _size: usize) -> PluginResult {
        Ok(())
    }
    fn host_memory_store(&self, _memory: &Memory, _address: u64, _data: &[u8]) -> PluginResult {
        Ok(())
    }
    fn instruction_executed(
        &self,
        _item: &WorkItemId,
        _at: InstructionRef,
        _instruction: &Instruction,
        _result: Option<&TypedValue>,
    ) -> PluginResult {
        Ok(())
    }
    fn kernel_begin(&self, _invocation: &KernelInvocation<'_>) -> PluginResult {
        Ok(())
    }
    fn kernel_end(&self, _invocation: &KernelInvocation<'_>) -> PluginResult {
        Ok(())
    }
    fn log(&self, _kind: MessageType, _message: &str) -> PluginResult {
        Ok(())
    }
    fn memory_allocated(&self, _memory: &Memory, _address: u64, _size: usize) -> PluginResult {
        Ok(())
    }
    fn memory_deallocated(&self, _memory: &Memory, _address: u64) -> PluginResult {
        Ok(())
    }
    fn memory_atomic_load(
        &self,
        _memory: &Memory,
        _accessor: &Accessor,
        _op: AtomicOp,
        _address: u64,
        _size: usize,
    ) -> PluginResult {
        Ok(())
    }
    fn memory_atomic_store(
        &self,
        _memory: &Memory,
        _accessor: &Accessor,
        _op: AtomicOp,
        _address: u64,
        _size: usize,
    ) -> PluginResult {
        Ok(())
    }
    fn memory_load(
        &self,
        _memory: &Memory,
        _accessor: &Accessor,
        _address: u64,
        _size: usize,
    ) -> PluginResult {
        Ok(())
    }
    fn memory_store(
        &self,
        _memory: &Memory,
        _accessor: &Accessor,
        _address: u64,
        _data: &[u8],
    ) -> PluginResult {
        Ok(())
    }
    fn work_group_barrier(&self, _group: &Dim3, _flags: FenceFlags) -> PluginResult {
        Ok(())
    }
    fn work_group_complete(&self, _group: &Dim3) -> PluginResult {
        Ok(())
    }
    fn work_item_complete(&self, _item: &WorkItemId) -> PluginResult {
        Ok(())
    }
    /// Whether callbacks may run concurrently from parallel work-groups.
    fn is_thread_safe(&self) -> bool {
        false
    }
}

struct Registered {
    plugin: Arc<dyn Plugin>,
    /// Held around every callback of a plugin that is not thread-safe.
    /// Reentrant, so a callback may touch memory or log through the
    /// dispatcher and be notified again on the same thread.
    serial: Option<ReentrantMutex<()>>,
}

/// A fatal plugin failure waiting to be raised by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFailure {
    pub plugin: String,
    pub message: String,
}

#[derive(Default)]
pub struct PluginDispatcher {
    plugins: RwLock<Vec<Registered>>,
    fatal: Mutex<Option<PluginFailure>>,
}

impl std::fmt::Debug for PluginDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDispatcher")
            .field("plugins", &self.len())
            .finish()
    }
}

impl PluginDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a plugin. Must not be called while a kernel is running.
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let serial = (!plugin.is_thread_safe()).then(|| ReentrantMutex::new(()));
        log::debug!("registered plugin '{}'", plugin.name());
        self.plugins.write().push(Registered { plugin, serial });
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a fatal failure is waiting to be taken.
    pub fn has_fatal(&self) -> bool {
        self.fatal.lock().is_some()
    }

    /// Take the first fatal failure reported since the last call.
    pub fn take_fatal(&self) -> Option<PluginFailure> {
        self.fatal.lock().take()
    }

    fn each<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&dyn Plugin) -> PluginResult,
    {
        let plugins = self.plugins.read_recursive();
        for entry in plugins.iter() {
            let outcome = {
                let _guard = entry.serial.as_ref().map(|m| m.lock());
                catch_unwind(AssertUnwindSafe(|| f(entry.plugin.as_ref())))
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.report_failure(&plugins, entry, event, err),
                Err(_) => self.report_failure(
                    &plugins,
                    entry,
                    event,
                    PluginError::Recoverable("callback panicked".to_string()),
                ),
            }
        }
    }

    fn report_failure(
        &self,
        plugins: &[Registered],
        failed: &Registered,
        event: &str,
        err: PluginError,
    ) {
        let name = failed.plugin.name().to_string();
        match err {
            PluginError::Recoverable(message) => {
                let text = format!("plugin '{name}' failed in {event}: {message}");
                log::warn!("{text}");
                for entry in plugins {
                    let _guard = entry.serial.as_ref().map(|m| m.lock());
                    let delivered = catch_unwind(AssertUnwindSafe(|| {
                        entry.plugin.log(MessageType::Warning, &text)
                    }));
                    if !matches!(delivered, Ok(Ok(()))) {
                        log::warn!("plugin '{}' failed to accept a log message", entry.plugin.name());
                    }
                }
            }
            PluginError::Fatal(message) => {
                log::error!("plugin '{name}' reported a fatal error in {event}: {message}");
                let mut fatal = self.fatal.lock();
                if fatal.is_none() {
                    *fatal = Some(PluginFailure { plugin: name, message });
                }
            }
        }
    }

    pub fn host_memory_load(&self, memory: &Memory, address: u64, size: usize) {
        self.each("host_memory_load", |p| p.host_memory_load(memory, address, size));
    }

    pub fn host_memory_store(&self, memory: &Memory, address: u64, data: &[u8]) {
        self.each("host_memory_store", |p| p.host_memory_store(memory, address, data));
    }

    pub fn instruction_executed(
        &self,
        item: &WorkItemId,
        at: InstructionRef,
        instruction: &Instruction,
        result: Option<&TypedValue>,
    ) {
        self.each("instruction_executed", |p| {
            p.instruction_executed(item, at, instruction, result)
        });
    }

    pub fn kernel_begin(&self, invocation: &KernelInvocation<'_>) {
        self.each("kernel_begin", |p| p.kernel_begin(invocation));
    }

    pub fn kernel_end(&self, invocation: &KernelInvocation<'_>) {
        self.each("kernel_end", |p| p.kernel_end(invocation));
    }

    /// Forward a message to the `log` facade and to every plugin.
    pub fn log(&self, kind: MessageType, message: &str) {
        let level: log::Level = kind.into();
        log::log!(level, "{message}");
        let plugins = self.plugins.read_recursive();
        for entry in plugins.iter() {
            let _guard = entry.serial.as_ref().map(|m| m.lock());
            let delivered = catch_unwind(AssertUnwindSafe(|| entry.plugin.log(kind, message)));
            if !matches!(delivered, Ok(Ok(()))) {
                log::warn!("plugin '{}' failed to accept a log message", entry.plugin.name());
            }
        }
    }

    pub fn memory_allocated(&self, memory: &Memory, address: u64, size: usize) {
        self.each("memory_allocated", |p| p.memory_allocated(memory, address, size));
    }

    pub fn memory_deallocated(&self, memory: &Memory, address: u64) {
        self.each("memory_deallocated", |p| p.memory_deallocated(memory, address));
    }

    pub fn memory_atomic_load(
        &self,
        memory: &Memory,
        accessor: &Accessor,
        op: AtomicOp,
        address: u64,
        size: usize,
    ) {
        self.each("memory_atomic_load", |p| {
            p.memory_atomic_load(memory, accessor, op, address, size)
        });
    }

    pub fn memory_atomic_store(
        &self,
        memory: &Memory,
        accessor: &Accessor,
        op: AtomicOp,
        address: u64,
        size: usize,
    ) {
        self.each("memory_atomic_store", |p| {
            p.memory_atomic_store(memory, accessor, op, address, size)
        });
    }

    pub fn memory_load(&self, memory: &Memory, accessor: &Accessor, address: u64, size: usize) {
        self.each("memory_load", |p| p.memory_load(memory, accessor, address, size));
    }

    pub fn memory_store(&self, memory: &Memory, accessor: &Accessor, address: u64, data: &[u8]) {
        self.each("memory_store", |p| p.memory_store(memory, accessor, address, data));
    }

    pub fn work_group_barrier(&self, group: &Dim3, flags: FenceFlags) {
        self.each("work_group_barrier", |p| p.work_group_barrier(group, flags));
    }

    pub fn work_group_complete(&self, group: &Dim3) {
        self.each("work_group_complete", |p| p.work_group_complete(group));
    }

    pub fn work_item_complete(&self, item: &WorkItemId) {
        self.each("work_item_complete", |p| p.work_item_complete(item));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AddressSpace;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Appends its tag to a shared journal on every allocation.
    struct Journal {
        tag: &'static str,
        entries: Arc<Mutex<Vec<String>>>,
    }

    impl Plugin for Journal {
        fn memory_allocated(&self, _memory: &Memory, _address: u64, size: usize) -> PluginResult {
            self.entries.lock().push(format!("{}:{size}", self.tag));
            Ok(())
        }
        fn log(&self, _kind: MessageType, message: &str) -> PluginResult {
            self.entries.lock().push(format!("{}:log:{message}", self.tag));
            Ok(())
        }
    }

    struct Failing {
        fatal: bool,
        calls: AtomicUsize,
    }

    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn memory_allocated(&self, _memory: &Memory, _address: u64, _size: usize) -> PluginResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                Err(PluginError::Fatal("boom".to_string()))
            } else {
                Err(PluginError::Recoverable("oops".to_string()))
            }
        }
        fn is_thread_safe(&self) -> bool {
            true
        }
    }

    struct Panicking;

    impl Plugin for Panicking {
        fn memory_deallocated(&self, _memory: &Memory, _address: u64) -> PluginResult {
            panic!("plugin bug");
        }
    }

    #[test]
    fn plugins_are_notified_in_registration_order() {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Arc::new(PluginDispatcher::new());
        for tag in ["a", "b", "c"] {
            dispatcher.register(Arc::new(Journal { tag, entries: Arc::clone(&entries) }));
        }
        let mem = Memory::new(AddressSpace::Global, 1024, Arc::clone(&dispatcher));
        mem.allocate(12).unwrap();
        assert_eq!(*entries.lock(), vec!["a:12", "b:12", "c:12"]);
    }

    #[test]
    fn recoverable_failure_is_logged_and_run_continues() {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Arc::new(PluginDispatcher::new());
        dispatcher.register(Arc::new(Failing { fatal: false, calls: AtomicUsize::new(0) }));
        dispatcher.register(Arc::new(Journal { tag: "j", entries: Arc::clone(&entries) }));
        let mem = Memory::new(AddressSpace::Global, 1024, Arc::clone(&dispatcher));

        let addr = mem.allocate(4).unwrap();
        assert!(mem.is_allocated(addr));
        assert!(dispatcher.take_fatal().is_none());
        let entries = entries.lock();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].starts_with("j:log:plugin 'failing' failed in memory_allocated"));
        assert_eq!(entries[1], "j:4");
    }

    #[test]
    fn fatal_failure_is_recorded_once() {
        let dispatcher = Arc::new(PluginDispatcher::new());
        dispatcher.register(Arc::new(Failing { fatal: true, calls: AtomicUsize::new(0) }));
        let mem = Memory::new(AddressSpace::Global, 1024, Arc::clone(&dispatcher));
        mem.allocate(4).unwrap();
        mem.allocate(4).unwrap();
        assert_eq!(
            dispatcher.take_fatal(),
            Some(PluginFailure { plugin: "failing".to_string(), message: "boom".to_string() })
        );
        assert!(dispatcher.take_fatal().is_none());
    }

    #[test]
    fn panicking_plugin_does_not_corrupt_memory() {
        let dispatcher = Arc::new(PluginDispatcher::new());
        dispatcher.register(Arc::new(Panicking));
        let mem = Memory::new(AddressSpace::Global, 1024, Arc::clone(&dispatcher));
        let addr = mem.allocate(4).unwrap();
        mem.deallocate(addr).unwrap();
        assert_eq!(mem.allocation_count(), 0);
        assert!(dispatcher.take_fatal().is_none());
    }

    #[test]
    fn unsafe_plugins_are_serialized() {
        /// Detects overlapping callbacks.
        struct Exclusive {
            inside: AtomicUsize,
            overlaps: AtomicUsize,
        }
        impl Plugin for Exclusive {
            fn memory_store(
                &self,
                _memory: &Memory,
                _accessor: &Accessor,
                _address: u64,
                _data: &[u8],
            ) -> PluginResult {
                if self.inside.fetch_add(1, Ordering::SeqCst) != 0 {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::yield_now();
                self.inside.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let plugin = Arc::new(Exclusive { inside: AtomicUsize::new(0), overlaps: AtomicUsize::new(0) });
        let dispatcher = Arc::new(PluginDispatcher::new());
        dispatcher.register(plugin.clone());
        let mem = Memory::new(AddressSpace::Global, 1024, Arc::clone(&dispatcher));
        let addr = mem.allocate(4).unwrap();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        mem.store(addr, &[1, 2, 3, 4], Accessor::WorkGroup(Dim3::default()))
                            .unwrap();
                    }
                });
            }
        });
        assert_eq!(plugin.overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callbacks_may_read_memory_and_log() {
        /// Reads back every store and reports it through the dispatcher.
        #[derive(Default)]
        struct Inspector {
            seen: Mutex<Vec<Vec<u8>>>,
            notes: Mutex<Vec<String>>,
        }
        impl Plugin for Inspector {
            fn memory_store(
                &self,
                memory: &Memory,
                _accessor: &Accessor,
                address: u64,
                data: &[u8],
            ) -> PluginResult {
                let host = memory.host_load(address, data.len()).map_err(|e| {
                    PluginError::Recoverable(e.to_string())
                })?;
                let quiet = memory.peek(address, data.len()).map_err(|e| {
                    PluginError::Recoverable(e.to_string())
                })?;
                assert_eq!(host, quiet);
                self.seen.lock().push(host);
                memory.dispatcher().log(MessageType::Info, "store inspected");
                Ok(())
            }
            fn log(&self, _kind: MessageType, message: &str) -> PluginResult {
                self.notes.lock().push(message.to_string());
                Ok(())
            }
        }

        let plugin = Arc::new(Inspector::default());
        assert!(!plugin.is_thread_safe());
        let dispatcher = Arc::new(PluginDispatcher::new());
        dispatcher.register(plugin.clone());
        let mem = Memory::new(AddressSpace::Global, 1024, Arc::clone(&dispatcher));
        let addr = mem.allocate(4).unwrap();
        mem.store(addr, &[9, 8, 7, 6], Accessor::WorkGroup(Dim3::default())).unwrap();

        assert_eq!(*plugin.seen.lock(), vec![vec![9, 8, 7, 6]]);
        assert_eq!(*plugin.notes.lock(), vec!["store inspected".to_string()]);
        assert!(dispatcher.take_fatal().is_none());
    }
}
