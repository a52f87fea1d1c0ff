/// Top-level device simulator.
/// A device owns the global and constant memory pools and the plugin
/// dispatcher, and runs kernels by decomposing an NDRange into work-groups.
/// Groups are created, run and dropped one at a time so only the running
/// groups hold local and private memory.
use crate::error::{ConfigurationError, ExecutionError, Result, SimError};
use crate::kernel::Kernel;
use crate::memory::{AddressSpace, Memory};
use crate::ndrange::{Dim3, NDRange};
use crate::plugin::{Plugin, PluginDispatcher};
use crate::scheduler::SchedulingPolicy;
use crate::workgroup::{GroupStats, Launch, WorkGroup};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::Arc;

/// Environment variable that turns on interactive group stepping.
pub const INTERACTIVE_ENV: &str = "NDSIM_INTERACTIVE";

/// Device sizing and execution options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bytes of global memory
    pub global_memory_size: usize,
    /// Bytes of constant memory
    pub constant_memory_size: usize,
    /// Bytes of local memory available to each work-group
    pub local_memory_size: usize,
    /// Bytes of private memory available to each work-item
    pub private_memory_size: usize,
    /// Order in which ready work-items run within a group
    pub policy: SchedulingPolicy,
    /// Run work-groups on the rayon thread pool
    pub parallel_groups: bool,
    /// Abort the run at the first work-item fault
    pub halt_on_fault: bool,
    /// Ask the frontend before every work-group
    pub interactive: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            global_memory_size: 64 * 1024 * 1024,
            constant_memory_size: 64 * 1024,
            local_memory_size: 32 * 1024,
            private_memory_size: 16 * 1024,
            policy: SchedulingPolicy::InOrder,
            parallel_groups: false,
            halt_on_fault: false,
            interactive: false,
        }
    }
}

impl DeviceConfig {
    /// Small pools for unit tests and demos.
    pub fn compact() -> Self {
        DeviceConfig {
            global_memory_size: 1024 * 1024,
            constant_memory_size: 4 * 1024,
            local_memory_size: 4 * 1024,
            private_memory_size: 1024,
            ..Self::default()
        }
    }

    /// Defaults, with `interactive` taken from `NDSIM_INTERACTIVE=1`.
    pub fn from_env() -> Self {
        let interactive = std::env::var(INTERACTIVE_ENV).is_ok_and(|v| v == "1");
        DeviceConfig {
            interactive,
            ..Self::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn with_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_parallel_groups(mut self, parallel: bool) -> Self {
        self.parallel_groups = parallel;
        self
    }

    pub fn with_halt_on_fault(mut self, halt: bool) -> Self {
        self.halt_on_fault = halt;
        self
    }

    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }
}

/// The kernel launch a `kernel_begin`/`kernel_end` event refers to.
#[derive(Debug, Clone, Copy)]
pub struct KernelInvocation<'a> {
    pub kernel: &'a Kernel,
    pub ndrange: &'a NDRange,
}

impl KernelInvocation<'_> {
    pub fn name(&self) -> &str {
        self.kernel.name()
    }

    pub fn num_groups(&self) -> Dim3 {
        self.ndrange.num_groups()
    }
}

/// Summary of one `Device::run`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub groups: usize,
    pub items: usize,
    pub completed: usize,
    pub failed: usize,
    pub instructions: u64,
    pub barriers: usize,
    /// First work-item fault, by global id
    pub fault: Option<(Dim3, ExecutionError)>,
    /// Groups abandoned because their items waited at different barriers
    pub diverged: Vec<Dim3>,
    /// The frontend asked to stop before every group had run
    pub quit: bool,
}

impl RunStats {
    fn absorb(&mut self, index: Dim3, group: GroupStats) {
        self.groups += 1;
        self.items += group.items;
        self.completed += group.completed;
        self.failed += group.failed;
        self.instructions += group.instructions;
        self.barriers += group.barriers;
        if self.fault.is_none() {
            self.fault = group.fault;
        }
        if group.divergence.is_some() {
            self.diverged.push(index);
        }
    }
}

/// Interactive stepping commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run every remaining group without asking again
    Continue,
    /// Run the next group, then ask again
    Step,
    /// Stop before the next group
    Quit,
}

/// Where an interactive run is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPosition {
    pub next: Dim3,
    pub completed: usize,
    pub total: usize,
}

/// Supplies commands to a device in interactive mode.
pub trait Frontend: Send {
    fn next_command(&mut self, position: &GroupPosition) -> Command;
}

/// Line-oriented frontend: `c`/`continue`, `s`/`step` (or an empty line),
/// `q`/`quit`. End of input continues unattended.
pub struct LineFrontend<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead + Send, W: Write + Send> LineFrontend<R, W> {
    pub fn new(input: R, output: W) -> Self {
        LineFrontend { input, output }
    }
}

impl<R: BufRead + Send, W: Write + Send> Frontend for LineFrontend<R, W> {
    fn next_command(&mut self, position: &GroupPosition) -> Command {
        loop {
            // The prompt is best-effort; a closed output still accepts commands.
            let _ = write!(
                self.output,
                "[ndsim] group {} next ({}/{} done) > ",
                position.next, position.completed, position.total
            );
            let _ = self.output.flush();

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) | Err(_) => return Command::Continue,
                Ok(_) => {}
            }
            match line.trim() {
                "c" | "continue" => return Command::Continue,
                "s" | "step" | "" => return Command::Step,
                "q" | "quit" => return Command::Quit,
                other => {
                    let _ = writeln!(self.output, "unknown command '{other}': use continue, step or quit");
                }
            }
        }
    }
}

pub struct Device {
    config: DeviceConfig,
    dispatcher: Arc<PluginDispatcher>,
    global: Memory,
    constant: Memory,
    frontend: Option<Box<dyn Frontend>>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("config", &self.config)
            .field("global", &self.global)
            .field("constant", &self.constant)
            .finish()
    }
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        let dispatcher = Arc::new(PluginDispatcher::new());
        Device {
            global: Memory::new(AddressSpace::Global, config.global_memory_size, Arc::clone(&dispatcher)),
            constant: Memory::new(
                AddressSpace::Constant,
                config.constant_memory_size,
                Arc::clone(&dispatcher),
            ),
            dispatcher,
            config,
            frontend: None,
        }
    }

    /// A device with default sizing, interactive if `NDSIM_INTERACTIVE=1`.
    pub fn from_env() -> Self {
        Self::new(DeviceConfig::from_env())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn global_memory(&self) -> &Memory {
        &self.global
    }

    /// Pool that buffers for Constant pointer arguments must live in.
    pub fn constant_memory(&self) -> &Memory {
        &self.constant
    }

    pub fn dispatcher(&self) -> &Arc<PluginDispatcher> {
        &self.dispatcher
    }

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.dispatcher.register(plugin);
    }

    pub fn set_frontend(&mut self, frontend: Box<dyn Frontend>) {
        self.frontend = Some(frontend);
    }

    /// Run `kernel` over an NDRange.
    ///
    /// `global_offset` and `local_size` may be shorter than `work_dim` (or
    /// empty); missing entries default to 0 and 1. If the kernel requires a
    /// work-group size and `local_size` is empty, the required size is used.
    pub fn run(
        &mut self,
        kernel: &mut Kernel,
        work_dim: u32,
        global_offset: &[usize],
        global_size: &[usize],
        local_size: &[usize],
    ) -> Result<RunStats> {
        let ndrange = self.configure(kernel, work_dim, global_offset, global_size, local_size)
            .inspect_err(|err| log::error!("kernel '{}' rejected: {err}", kernel.name()))?;
        kernel.set_global_size(ndrange.global_size);
        log::info!(
            "launching kernel '{}': global={} local={} groups={}",
            kernel.name(),
            ndrange.global_size,
            ndrange.local_size,
            ndrange.num_groups()
        );

        if let Err(err) = kernel.allocate_constants(&self.constant) {
            log::error!("kernel '{}': constant memory: {err}", kernel.name());
            kernel.deallocate_constants(&self.constant);
            return Err(err.into());
        }

        let result = {
            let invocation = KernelInvocation {
                kernel,
                ndrange: &ndrange,
            };
            self.dispatcher.kernel_begin(&invocation);
            let result = self.run_groups(kernel, &ndrange);
            self.dispatcher.kernel_end(&invocation);
            result
        };
        kernel.deallocate_constants(&self.constant);

        let result = result.and_then(|stats| match self.dispatcher.take_fatal() {
            Some(failure) => Err(SimError::Plugin {
                plugin: failure.plugin,
                message: failure.message,
            }),
            None => Ok(stats),
        });
        match &result {
            Ok(stats) => {
                log::info!(
                    "kernel '{}' complete: {} groups, {} items ({} failed), {} instructions",
                    kernel.name(),
                    stats.groups,
                    stats.items,
                    stats.failed,
                    stats.instructions
                );
                if !stats.diverged.is_empty() {
                    log::warn!(
                        "kernel '{}': {} work-group(s) abandoned at divergent barriers",
                        kernel.name(),
                        stats.diverged.len()
                    );
                }
            }
            Err(err) => log::error!("kernel '{}' aborted: {err}", kernel.name()),
        }
        result
    }

    fn configure(
        &self,
        kernel: &Kernel,
        work_dim: u32,
        global_offset: &[usize],
        global_size: &[usize],
        local_size: &[usize],
    ) -> std::result::Result<NDRange, ConfigurationError> {
        let required = kernel.required_work_group_size();
        let unspecified = local_size.iter().all(|&l| l == 0);
        let ndrange = match required {
            Some(required) if unspecified => {
                NDRange::new(work_dim, global_offset, global_size, &required.as_array())?
            }
            _ => NDRange::new(work_dim, global_offset, global_size, local_size)?,
        };
        if let Some(required) = required {
            if ndrange.local_size != required {
                return Err(ConfigurationError::WorkGroupSizeMismatch {
                    required,
                    requested: ndrange.local_size,
                });
            }
        }
        if let Some(index) = kernel.first_unbound_argument() {
            return Err(ConfigurationError::UnboundArgument { index });
        }
        Ok(ndrange)
    }

    fn launch<'a>(&'a self, kernel: &'a Kernel, ndrange: &'a NDRange) -> Launch<'a> {
        Launch {
            kernel,
            ndrange,
            global: &self.global,
            constant: &self.constant,
            dispatcher: &self.dispatcher,
            local_limit: self.config.local_memory_size,
            private_limit: self.config.private_memory_size,
            policy: self.config.policy,
        }
    }

    fn run_groups(&mut self, kernel: &Kernel, ndrange: &NDRange) -> Result<RunStats> {
        let groups: Vec<Dim3> = ndrange.num_groups().iter().collect();
        if self.config.parallel_groups && !self.config.interactive {
            self.run_parallel(kernel, ndrange, &groups)
        } else {
            self.run_sequential(kernel, ndrange, &groups)
        }
    }

    fn run_sequential(&mut self, kernel: &Kernel, ndrange: &NDRange, groups: &[Dim3]) -> Result<RunStats> {
        let mut asking = self.config.interactive;
        if asking && self.frontend.is_none() {
            log::warn!("interactive mode without a frontend; running unattended");
            asking = false;
        }

        let mut stats = RunStats::default();
        for (done, &index) in groups.iter().enumerate() {
            if let (true, Some(frontend)) = (asking, self.frontend.as_mut()) {
                let position = GroupPosition {
                    next: index,
                    completed: done,
                    total: groups.len(),
                };
                match frontend.next_command(&position) {
                    Command::Step => {}
                    Command::Continue => asking = false,
                    Command::Quit => {
                        log::info!("run stopped by frontend before group {index}");
                        stats.quit = true;
                        break;
                    }
                }
            }

            let group = run_group(index, self.launch(kernel, ndrange))?;
            let divergence = group.divergence.clone();
            stats.absorb(index, group);
            self.check_group_boundary(&stats, index, divergence)?;
        }
        Ok(stats)
    }

    fn run_parallel(&self, kernel: &Kernel, ndrange: &NDRange, groups: &[Dim3]) -> Result<RunStats> {
        let launch = self.launch(kernel, ndrange);
        let halt = self.config.halt_on_fault;
        let dispatcher = &self.dispatcher;
        let results: Vec<(Dim3, GroupStats)> = groups
            .par_iter()
            .map(|&index| -> Result<(Dim3, GroupStats)> {
                if dispatcher.has_fatal() {
                    return Err(plugin_abort());
                }
                let group = run_group(index, launch)?;
                if halt {
                    if let Some(detail) = &group.divergence {
                        return Err(SimError::BarrierDivergence {
                            group: index,
                            detail: detail.clone(),
                        });
                    }
                    if let Some((item, fault)) = &group.fault {
                        return Err(SimError::WorkItemFault {
                            item: *item,
                            source: fault.clone(),
                        });
                    }
                }
                Ok((index, group))
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|err| self.resolve_abort(err))?;

        let mut stats = RunStats::default();
        for (index, group) in results {
            stats.absorb(index, group);
        }
        Ok(stats)
    }

    /// Plugin failures and halting faults end the run between groups.
    /// `divergence` belongs to the group that just ran.
    fn check_group_boundary(&self, stats: &RunStats, group: Dim3, divergence: Option<String>) -> Result<()> {
        if let Some(failure) = self.dispatcher.take_fatal() {
            return Err(SimError::Plugin {
                plugin: failure.plugin,
                message: failure.message,
            });
        }
        if self.config.halt_on_fault {
            if let Some(detail) = divergence {
                return Err(SimError::BarrierDivergence { group, detail });
            }
            if let Some((item, fault)) = &stats.fault {
                return Err(SimError::WorkItemFault {
                    item: *item,
                    source: fault.clone(),
                });
            }
        }
        Ok(())
    }

    fn resolve_abort(&self, err: SimError) -> SimError {
        match (&err, self.dispatcher.take_fatal()) {
            (SimError::Plugin { .. }, Some(failure)) => SimError::Plugin {
                plugin: failure.plugin,
                message: failure.message,
            },
            _ => err,
        }
    }
}

fn plugin_abort() -> SimError {
    SimError::Plugin {
        plugin: String::new(),
        message: "aborted by an earlier fatal plugin error".to_string(),
    }
}

/// Create, run and drop one work-group.
fn run_group(index: Dim3, launch: Launch<'_>) -> Result<GroupStats> {
    let mut group = WorkGroup::new(index, launch)?;
    Ok(group.run())
}
