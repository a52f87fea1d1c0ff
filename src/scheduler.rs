/// Work-item scheduling policies.
///
/// Within a work-group, items are interleaved cooperatively: each quantum
/// the group asks its scheduler for an order over the items that are ready,
/// then runs each one until it reaches a barrier or terminates. The order
/// only changes how execution is interleaved between barriers; results of a
/// race-free kernel are the same under every policy.
///   - InOrder          : ascending local index
///   - Reverse          : descending local index
///   - RoundRobin       : rotates the starting item every quantum
///   - GreedyThenOldest : the item run last goes first, then lowest index
use serde::{Deserialize, Serialize};

/// The scheduler's view of a ready work-item.
#[derive(Debug, Clone)]
pub struct ItemSlot {
    /// Flat local index within the group
    pub index: usize,
    /// Instructions the item has executed so far
    pub executed: u64,
}

impl ItemSlot {
    pub fn new(index: usize, executed: u64) -> Self {
        ItemSlot { index, executed }
    }
}

/// Trait for in-group scheduling policies.
pub trait ItemScheduler: Send {
    /// Given the ready items, return the order in which to run them.
    fn order_items(&mut self, slots: &[ItemSlot]) -> Vec<usize>;

    /// Called after an item has run so the scheduler can update its state.
    fn record_run(&mut self, index: usize);

    fn name(&self) -> &'static str;
}

pub struct InOrderScheduler;

impl ItemScheduler for InOrderScheduler {
    fn order_items(&mut self, slots: &[ItemSlot]) -> Vec<usize> {
        let mut order: Vec<usize> = slots.iter().map(|s| s.index).collect();
        order.sort_unstable();
        order
    }

    fn record_run(&mut self, _index: usize) {}

    fn name(&self) -> &'static str {
        "InOrder"
    }
}

pub struct ReverseScheduler;

impl ItemScheduler for ReverseScheduler {
    fn order_items(&mut self, slots: &[ItemSlot]) -> Vec<usize> {
        let mut order: Vec<usize> = slots.iter().map(|s| s.index).collect();
        order.sort_unstable_by(|a, b| b.cmp(a));
        order
    }

    fn record_run(&mut self, _index: usize) {}

    fn name(&self) -> &'static str {
        "Reverse"
    }
}

/// Starts each quantum one position after the previous quantum's start.
pub struct RoundRobinScheduler {
    start: usize,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        RoundRobinScheduler { start: 0 }
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemScheduler for RoundRobinScheduler {
    fn order_items(&mut self, slots: &[ItemSlot]) -> Vec<usize> {
        let n = slots.len();
        if n == 0 {
            return vec![];
        }
        let mut sorted: Vec<usize> = slots.iter().map(|s| s.index).collect();
        sorted.sort_unstable();
        let start = self.start % n;
        self.start = self.start.wrapping_add(1);
        (0..n).map(|i| sorted[(start + i) % n]).collect()
    }

    fn record_run(&mut self, _index: usize) {}

    fn name(&self) -> &'static str {
        "RoundRobin"
    }
}

/// Sticks with the last item run if it is ready again, then falls back to
/// the item that has made the least progress, ties broken by index.
pub struct GreedyThenOldestScheduler {
    last_run: Option<usize>,
}

impl GreedyThenOldestScheduler {
    pub fn new() -> Self {
        GreedyThenOldestScheduler { last_run: None }
    }
}

impl Default for GreedyThenOldestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemScheduler for GreedyThenOldestScheduler {
    fn order_items(&mut self, slots: &[ItemSlot]) -> Vec<usize> {
        let mut ordered: Vec<usize> = Vec::with_capacity(slots.len());
        if let Some(last) = self.last_run {
            if slots.iter().any(|s| s.index == last) {
                ordered.push(last);
            }
        }

        let mut rest: Vec<&ItemSlot> = slots
            .iter()
            .filter(|s| Some(s.index) != self.last_run)
            .collect();
        rest.sort_by_key(|s| (s.executed, s.index));
        ordered.extend(rest.iter().map(|s| s.index));
        ordered
    }

    fn record_run(&mut self, index: usize) {
        self.last_run = Some(index);
    }

    fn name(&self) -> &'static str {
        "GreedyThenOldest"
    }
}

/// Selectable in-group scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    #[default]
    InOrder,
    Reverse,
    RoundRobin,
    GreedyThenOldest,
}

impl SchedulingPolicy {
    pub const ALL: [SchedulingPolicy; 4] = [
        SchedulingPolicy::InOrder,
        SchedulingPolicy::Reverse,
        SchedulingPolicy::RoundRobin,
        SchedulingPolicy::GreedyThenOldest,
    ];

    pub fn build(self) -> Box<dyn ItemScheduler> {
        match self {
            SchedulingPolicy::InOrder => Box::new(InOrderScheduler),
            SchedulingPolicy::Reverse => Box::new(ReverseScheduler),
            SchedulingPolicy::RoundRobin => Box::new(RoundRobinScheduler::new()),
            SchedulingPolicy::GreedyThenOldest => Box::new(GreedyThenOldestScheduler::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulingPolicy::InOrder => "InOrder",
            SchedulingPolicy::Reverse => "Reverse",
            SchedulingPolicy::RoundRobin => "RoundRobin",
            SchedulingPolicy::GreedyThenOldest => "GreedyThenOldest",
        }
    }
}
