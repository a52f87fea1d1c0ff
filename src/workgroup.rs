/// Work-group execution.
/// A work-group owns one local memory region and the work-items of its
/// group index. Items run cooperatively in quanta: every ready item runs
/// until it blocks at a barrier or terminates, then the group decides
/// whether the barrier can be released.
///
/// A barrier is released only when every live item waits at the same
/// barrier instruction. Items that have completed or failed never block a
/// barrier. Live items waiting at different barriers can never make progress;
/// the group is abandoned and the divergence is recorded in its stats.
use crate::error::{ExecutionError, MemoryError};
use crate::kernel::Kernel;
use crate::memory::{AddressSpace, Memory};
use crate::ndrange::{Dim3, NDRange};
use crate::plugin::{MessageType, PluginDispatcher};
use crate::program::InstructionRef;
use crate::scheduler::{ItemSlot, SchedulingPolicy};
use crate::workitem::{ExecutionContext, WorkItem, WorkItemId, WorkItemState};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// Launch-wide state shared by every work-group of one invocation.
#[derive(Clone, Copy)]
pub struct Launch<'a> {
    pub kernel: &'a Kernel,
    pub ndrange: &'a NDRange,
    pub global: &'a Memory,
    pub constant: &'a Memory,
    pub dispatcher: &'a Arc<PluginDispatcher>,
    /// Capacity of each group's local pool
    pub local_limit: usize,
    /// Capacity of each item's private pool
    pub private_limit: usize,
    pub policy: SchedulingPolicy,
}

/// Statistics collected while running one work-group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupStats {
    pub items: usize,
    pub completed: usize,
    pub failed: usize,
    pub instructions: u64,
    pub barriers: usize,
    pub quanta: usize,
    /// First item fault in this group: (global id, fault)
    pub fault: Option<(Dim3, ExecutionError)>,
    /// Set when live items waited at different barriers and the group was
    /// abandoned. Names the barrier sites.
    pub divergence: Option<String>,
}

pub struct WorkGroup<'a> {
    index: Dim3,
    launch: Launch<'a>,
    local: Memory,
    local_base: u64,
    items: Vec<WorkItem>,
}

impl<'a> WorkGroup<'a> {
    /// Reserve the group's local memory and create its work-items.
    pub fn new(index: Dim3, launch: Launch<'a>) -> Result<Self, MemoryError> {
        let local = Memory::new(
            AddressSpace::Local,
            launch.local_limit,
            Arc::clone(launch.dispatcher),
        );
        let local_base = local.allocate(launch.kernel.local_memory_size())?;

        let items = {
            let ctx = ExecutionContext {
                kernel: launch.kernel,
                ndrange: launch.ndrange,
                group: index,
                global: launch.global,
                constant: launch.constant,
                local: &local,
                local_base,
                private_size: launch.private_limit,
                dispatcher: launch.dispatcher,
                copies: HashSet::new(),
            };
            launch
                .ndrange
                .local_size
                .iter()
                .map(|lid| {
                    let id = WorkItemId {
                        global: launch.ndrange.global_id(index, lid),
                        local: lid,
                        group: index,
                    };
                    WorkItem::new(id, &ctx)
                })
                .collect()
        };

        Ok(WorkGroup {
            index,
            launch,
            local,
            local_base,
            items,
        })
    }

    pub fn index(&self) -> Dim3 {
        self.index
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn local_memory(&self) -> &Memory {
        &self.local
    }

    /// Drive every work-item to termination, or until the group diverges.
    pub fn run(&mut self) -> GroupStats {
        let launch = self.launch;
        let dispatcher = launch.dispatcher;
        let mut ctx = ExecutionContext {
            kernel: launch.kernel,
            ndrange: launch.ndrange,
            group: self.index,
            global: launch.global,
            constant: launch.constant,
            local: &self.local,
            local_base: self.local_base,
            private_size: launch.private_limit,
            dispatcher,
            copies: HashSet::new(),
        };
        let mut scheduler = launch.policy.build();
        let mut stats = GroupStats {
            items: self.items.len(),
            ..GroupStats::default()
        };

        loop {
            let ready: Vec<ItemSlot> = self
                .items
                .iter()
                .enumerate()
                .filter(|(_, wi)| *wi.state() == WorkItemState::Ready)
                .map(|(i, wi)| ItemSlot::new(i, wi.instructions_executed()))
                .collect();
            if !ready.is_empty() {
                stats.quanta += 1;
            }

            for index in scheduler.order_items(&ready) {
                let item = &mut self.items[index];
                let state = item.run(&mut ctx).clone();
                scheduler.record_run(index);
                match state {
                    WorkItemState::Complete => {
                        stats.completed += 1;
                        dispatcher.work_item_complete(item.id());
                    }
                    WorkItemState::Failed(err) => {
                        stats.failed += 1;
                        if stats.fault.is_none() {
                            stats.fault = Some((item.id().global, err));
                        }
                        dispatcher.work_item_complete(item.id());
                    }
                    _ => {}
                }
            }

            let waiting: BTreeSet<InstructionRef> =
                self.items.iter().filter_map(|wi| wi.barrier().map(|(at, _)| at)).collect();
            if waiting.is_empty() {
                break;
            }
            if waiting.len() > 1 {
                let sites: Vec<String> = waiting.iter().map(ToString::to_string).collect();
                let detail = format!("work-items wait at different barriers: {}", sites.join(", "));
                dispatcher.log(
                    MessageType::Error,
                    &format!("work-group {} aborted: {detail}", self.index),
                );
                stats.divergence = Some(detail);
                break;
            }

            let flags = self
                .items
                .iter()
                .find_map(|wi| wi.barrier().map(|(_, flags)| flags))
                .unwrap_or_default();
            stats.barriers += 1;
            dispatcher.work_group_barrier(&self.index, flags);
            for item in &mut self.items {
                item.release();
            }
        }

        stats.instructions = self.items.iter().map(WorkItem::instructions_executed).sum();
        if let Err(err) = self.local.deallocate(self.local_base) {
            log::warn!("work-group {}: failed to release local memory: {err}", self.index);
        }
        if stats.divergence.is_none() {
            dispatcher.work_group_complete(&self.index);
        }
        log::debug!(
            "work-group {} done: {} completed, {} failed, {} barriers",
            self.index,
            stats.completed,
            stats.failed,
            stats.barriers
        );
        stats
    }
}
