/// Live metrics for the TUI visualizer.
///
/// `MetricsPlugin` counts device events and writes a JSON snapshot after
/// every completed work-group and at kernel begin/end. The viz binary polls
/// the snapshot file and re-renders the dashboard. Writes are atomic (write
/// to .tmp then rename) to avoid torn reads.
use crate::device::KernelInvocation;
use crate::error::PluginError;
use crate::memory::{Accessor, AtomicOp, Memory};
use crate::ndrange::Dim3;
use crate::plugin::{Plugin, PluginResult};
use crate::program::{FenceFlags, Instruction, InstructionRef};
use crate::value::TypedValue;
use crate::workitem::WorkItemId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const METRICS_PATH: &str = "/tmp/ndsim_live.json";

/// Launches with more groups than this leave `group_done` empty.
pub const MAX_TRACKED_GROUPS: usize = 4096;

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct LiveMetrics {
    /// "idle" | "running" | "complete"
    pub status: String,
    pub kernel_name: String,
    pub global_size: [usize; 3],
    pub local_size: [usize; 3],
    pub groups_total: usize,
    pub groups_completed: u64,
    pub items_completed: u64,
    pub instructions: u64,
    pub loads: u64,
    pub stores: u64,
    pub atomics: u64,
    pub barriers: u64,
    /// Includes the launch's constant buffers, made before `kernel_begin`
    pub allocations: u64,
    /// Completion flag per group, by flat group index
    #[serde(default)]
    pub group_done: Vec<bool>,
    /// Unix timestamp in ms when this snapshot was written
    pub timestamp_ms: u64,
}

/// Atomically write metrics to `path`.
pub fn write_metrics(path: &Path, metrics: &LiveMetrics) -> std::io::Result<()> {
    let json = serde_json::to_string(metrics)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Read the latest metrics snapshot. Returns None if the file doesn't exist
/// or can't be parsed (e.g. no simulation has run yet).
pub fn read_metrics(path: &Path) -> Option<LiveMetrics> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

/// Returns current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
struct Counters {
    groups_completed: AtomicU64,
    items_completed: AtomicU64,
    instructions: AtomicU64,
    loads: AtomicU64,
    stores: AtomicU64,
    atomics: AtomicU64,
    barriers: AtomicU64,
    allocations: AtomicU64,
}

impl Counters {
    fn reset(&self) {
        for counter in [
            &self.groups_completed,
            &self.items_completed,
            &self.instructions,
            &self.loads,
            &self.stores,
            &self.atomics,
            &self.barriers,
            &self.allocations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Plugin that keeps running totals and mirrors them to a snapshot file.
pub struct MetricsPlugin {
    path: PathBuf,
    counters: Counters,
    /// Launch description plus per-group flags; also serializes file writes
    launch: Mutex<LiveMetrics>,
    num_groups: Mutex<Dim3>,
}

impl MetricsPlugin {
    pub fn new() -> Self {
        Self::with_path(METRICS_PATH)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        MetricsPlugin {
            path: path.into(),
            counters: Counters::default(),
            launch: Mutex::new(LiveMetrics {
                status: "idle".to_string(),
                ..LiveMetrics::default()
            }),
            num_groups: Mutex::new(Dim3::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current totals, without touching the file.
    pub fn snapshot(&self) -> LiveMetrics {
        let launch = self.launch.lock();
        self.fill(&launch)
    }

    fn fill(&self, launch: &LiveMetrics) -> LiveMetrics {
        let c = &self.counters;
        LiveMetrics {
            groups_completed: c.groups_completed.load(Ordering::Relaxed),
            items_completed: c.items_completed.load(Ordering::Relaxed),
            instructions: c.instructions.load(Ordering::Relaxed),
            loads: c.loads.load(Ordering::Relaxed),
            stores: c.stores.load(Ordering::Relaxed),
            atomics: c.atomics.load(Ordering::Relaxed),
            barriers: c.barriers.load(Ordering::Relaxed),
            allocations: c.allocations.load(Ordering::Relaxed),
            timestamp_ms: now_ms(),
            ..launch.clone()
        }
    }

    /// Write a snapshot while holding the launch lock, so parallel groups
    /// never race on the temporary file.
    fn publish(&self, launch: &LiveMetrics) -> PluginResult {
        write_metrics(&self.path, &self.fill(launch)).map_err(|err| {
            PluginError::Recoverable(format!(
                "cannot write metrics to {}: {err}",
                self.path.display()
            ))
        })
    }
}

impl Default for MetricsPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for MetricsPlugin {
    fn name(&self) -> &str {
        "metrics"
    }

    fn kernel_begin(&self, invocation: &KernelInvocation<'_>) -> PluginResult {
        self.counters.reset();
        // Constants were allocated before this event reached us.
        self.counters
            .allocations
            .store(invocation.kernel.constant_buffer_count() as u64, Ordering::Relaxed);
        let groups = invocation.num_groups();
        *self.num_groups.lock() = groups;

        let mut launch = self.launch.lock();
        *launch = LiveMetrics {
            status: "running".to_string(),
            kernel_name: invocation.name().to_string(),
            global_size: invocation.ndrange.global_size.as_array(),
            local_size: invocation.ndrange.local_size.as_array(),
            groups_total: groups.size(),
            group_done: if groups.size() <= MAX_TRACKED_GROUPS {
                vec![false; groups.size()]
            } else {
                Vec::new()
            },
            ..LiveMetrics::default()
        };
        self.publish(&launch)
    }

    fn kernel_end(&self, _invocation: &KernelInvocation<'_>) -> PluginResult {
        let mut launch = self.launch.lock();
        launch.status = "complete".to_string();
        self.publish(&launch)
    }

    fn instruction_executed(
        &self,
        _item: &WorkItemId,
        _at: InstructionRef,
        _instruction: &Instruction,
        _result: Option<&TypedValue>,
    ) -> PluginResult {
        Counters::bump(&self.counters.instructions);
        Ok(())
    }

    fn memory_allocated(&self, _memory: &Memory, _address: u64, _size: usize) -> PluginResult {
        Counters::bump(&self.counters.allocations);
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
        Counters::bump(&self.counters.atomics);
        Ok(())
    }

    fn memory_load(
        &self,
        _memory: &Memory,
        _accessor: &Accessor,
        _address: u64,
        _size: usize,
    ) -> PluginResult {
        Counters::bump(&self.counters.loads);
        Ok(())
    }

    fn memory_store(
        &self,
        _memory: &Memory,
        _accessor: &Accessor,
        _address: u64,
        _data: &[u8],
    ) -> PluginResult {
        Counters::bump(&self.counters.stores);
        Ok(())
    }

    fn work_group_barrier(&self, _group: &Dim3, _flags: FenceFlags) -> PluginResult {
        Counters::bump(&self.counters.barriers);
        Ok(())
    }

    fn work_group_complete(&self, group: &Dim3) -> PluginResult {
        Counters::bump(&self.counters.groups_completed);
        let flat = group.flatten(*self.num_groups.lock());
        let mut launch = self.launch.lock();
        if let Some(done) = launch.group_done.get_mut(flat) {
            *done = true;
        }
        self.publish(&launch)
    }

    fn work_item_complete(&self, _item: &WorkItemId) -> PluginResult {
        Counters::bump(&self.counters.items_completed);
        Ok(())
    }

    fn is_thread_safe(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::kernel::Kernel;
    use crate::samples;
    use std::sync::Arc;

    #[test]
    fn write_then_read_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        assert!(read_metrics(&path).is_none());

        let metrics = LiveMetrics {
            status: "running".to_string(),
            kernel_name: "k".to_string(),
            groups_total: 3,
            group_done: vec![true, false, false],
            ..LiveMetrics::default()
        };
        write_metrics(&path, &metrics).unwrap();
        assert_eq!(read_metrics(&path), Some(metrics));
        assert!(!dir.path().join("live.json.tmp").exists());
    }

    #[test]
    fn counts_a_whole_launch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.json");
        let plugin = Arc::new(MetricsPlugin::with_path(&path));

        let mut device = Device::new(DeviceConfig::compact());
        device.add_plugin(plugin.clone());
        let counter = device.global_memory().allocate(4).unwrap();
        device.global_memory().host_store(counter, &[0; 4]).unwrap();
        let mut kernel = Kernel::new(Arc::new(samples::atomic_counter()), "atomic_counter").unwrap();
        kernel.set_argument(0, TypedValue::pointer(counter)).unwrap();
        device.run(&mut kernel, 1, &[], &[8], &[4]).unwrap();

        let written = read_metrics(&path).unwrap();
        assert_eq!(written.status, "complete");
        assert_eq!(written.kernel_name, "atomic_counter");
        assert_eq!(written.groups_total, 2);
        assert_eq!(written.groups_completed, 2);
        assert_eq!(written.items_completed, 8);
        assert_eq!(written.atomics, 8);
        assert_eq!(written.group_done, vec![true, true]);
        assert_eq!(written.global_size, [8, 1, 1]);
        assert_eq!(plugin.snapshot().instructions, written.instructions);
    }

    #[test]
    fn constant_buffers_count_as_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = Arc::new(MetricsPlugin::with_path(dir.path().join("live.json")));

        let mut device = Device::new(DeviceConfig::compact());
        device.add_plugin(plugin.clone());
        let input = device.global_memory().allocate(32).unwrap();
        let output = device.global_memory().allocate(32).unwrap();
        let mut kernel = Kernel::new(Arc::new(samples::weighted()), "weighted").unwrap();
        kernel.set_argument(0, TypedValue::pointer(input)).unwrap();
        kernel.set_argument(1, TypedValue::pointer(output)).unwrap();
        device.run(&mut kernel, 1, &[], &[8], &[4]).unwrap();

        // The weights table plus one local region per group.
        assert_eq!(plugin.snapshot().allocations, 3);
    }

    #[test]
    fn unwritable_path_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = MetricsPlugin::with_path(dir.path().join("missing").join("live.json"));
        let launch = plugin.launch.lock();
        assert!(matches!(plugin.publish(&launch), Err(PluginError::Recoverable(_))));
    }
}
