/// Address-space scoped device memory.
/// One `Memory` backs each pool: global and constant memory per device,
/// local memory per work-group, private memory per work-item.
///
/// Every pool is a growable byte buffer. Address 0 is never handed out so it
/// can serve as the null pointer; allocations are 8-byte aligned and freed
/// blocks are reused first-fit. All accesses go through an internal lock, so
/// a pool can be shared between threads and atomics are indivisible.
use crate::error::MemoryError;
use crate::plugin::PluginDispatcher;
use crate::workitem::WorkItemId;
use crate::ndrange::Dim3;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

const ALIGNMENT: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    Private,
    Global,
    Constant,
    Local,
}

impl std::fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressSpace::Private  => write!(f, "private"),
            AddressSpace::Global   => write!(f, "global"),
            AddressSpace::Constant => write!(f, "constant"),
            AddressSpace::Local    => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    Sub,
    Xchg,
    CmpXchg,
    Inc,
    Dec,
    And,
    Or,
    Xor,
    Min,
    Max,
    UMin,
    UMax,
}

impl AtomicOp {
    /// New memory contents given the old value, the operand and (for
    /// `CmpXchg`) the comparand. Arithmetic wraps at `size` bytes.
    pub fn apply(self, old: u64, operand: u64, compare: u64, size: usize) -> u64 {
        let mask = if size >= 8 { u64::MAX } else { (1u64 << (size * 8)) - 1 };
        let signed = |v: u64| -> i64 {
            let shift = 64 - size as u32 * 8;
            ((v << shift) as i64) >> shift
        };
        let result = match self {
            AtomicOp::Add => old.wrapping_add(operand),
            AtomicOp::Sub => old.wrapping_sub(operand),
            AtomicOp::Xchg => operand,
            AtomicOp::CmpXchg => {
                if old & mask == compare & mask {
                    operand
                } else {
                    old
                }
            }
            AtomicOp::Inc => old.wrapping_add(1),
            AtomicOp::Dec => old.wrapping_sub(1),
            AtomicOp::And => old & operand,
            AtomicOp::Or => old | operand,
            AtomicOp::Xor => old ^ operand,
            AtomicOp::Min => {
                if signed(operand) < signed(old) { operand } else { old }
            }
            AtomicOp::Max => {
                if signed(operand) > signed(old) { operand } else { old }
            }
            AtomicOp::UMin => (old & mask).min(operand & mask),
            AtomicOp::UMax => (old & mask).max(operand & mask),
        };
        result & mask
    }
}

/// Who issued a device-side memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    WorkItem(WorkItemId),
    WorkGroup(Dim3),
}

#[derive(Debug, Default)]
struct Pool {
    data: Vec<u8>,
    /// Next never-used address
    top: u64,
    /// Live allocations: address -> requested size
    allocations: BTreeMap<u64, usize>,
    /// Released blocks available for reuse: (address, padded size)
    free: Vec<(u64, u64)>,
}

impl Pool {
    /// Index range of `[address, address + size)` if it lies in one live allocation.
    fn resolve(&self, address: u64, size: usize) -> Option<std::ops::Range<usize>> {
        let (&start, &len) = self.allocations.range(..=address).next_back()?;
        let end = address.checked_add(size as u64)?;
        if end <= start + len as u64 {
            Some(address as usize..end as usize)
        } else {
            None
        }
    }

    fn reclaim_top(&mut self) {
        while let Some(pos) = self.free.iter().position(|&(a, l)| a + l == self.top) {
            let (address, _) = self.free.swap_remove(pos);
            self.top = address;
        }
        self.data.truncate(self.top as usize);
    }
}

pub struct Memory {
    space: AddressSpace,
    /// Highest address (exclusive) the pool may grow to
    limit: usize,
    dispatcher: Arc<PluginDispatcher>,
    pool: Mutex<Pool>,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("space", &self.space)
            .field("limit", &self.limit)
            .field("allocations", &self.allocation_count())
            .finish()
    }
}

impl Memory {
    pub fn new(space: AddressSpace, limit: usize, dispatcher: Arc<PluginDispatcher>) -> Self {
        Memory {
            space,
            limit,
            dispatcher,
            pool: Mutex::new(Pool {
                data: vec![0u8; ALIGNMENT as usize],
                top: ALIGNMENT,
                ..Pool::default()
            }),
        }
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn dispatcher(&self) -> &Arc<PluginDispatcher> {
        &self.dispatcher
    }

    /// Reserve at least `size` bytes, zero-filled. Never returns 0.
    pub fn allocate(&self, size: usize) -> Result<u64, MemoryError> {
        let padded = (size.max(1) as u64).next_multiple_of(ALIGNMENT);
        let address = {
            let mut pool = self.pool.lock();
            let address = match pool.free.iter().position(|&(_, len)| len >= padded) {
                Some(pos) => {
                    let (address, len) = pool.free.swap_remove(pos);
                    if len > padded {
                        pool.free.push((address + padded, len - padded));
                    }
                    address
                }
                None => {
                    let address = pool.top;
                    let end = address + padded;
                    if end > self.limit as u64 {
                        return Err(MemoryError::OutOfMemory {
                            space: self.space,
                            requested: size,
                            available: self.limit.saturating_sub(address as usize),
                        });
                    }
                    pool.top = end;
                    pool.data.resize(end as usize, 0);
                    address
                }
            };
            let range = address as usize..(address + padded) as usize;
            pool.data[range].fill(0);
            pool.allocations.insert(address, size);
            address
        };
        self.dispatcher.memory_allocated(self, address, size);
        Ok(address)
    }

    /// Release the allocation starting at `address`.
    pub fn deallocate(&self, address: u64) -> Result<(), MemoryError> {
        {
            let mut pool = self.pool.lock();
            let size = pool
                .allocations
                .remove(&address)
                .ok_or(MemoryError::UnknownAllocation {
                    space: self.space,
                    address,
                })?;
            let padded = (size.max(1) as u64).next_multiple_of(ALIGNMENT);
            pool.free.push((address, padded));
            pool.reclaim_top();
        }
        self.dispatcher.memory_deallocated(self, address);
        Ok(())
    }

    /// Read `size` bytes on behalf of a work-item or work-group.
    pub fn load(&self, address: u64, size: usize, accessor: Accessor) -> Result<Vec<u8>, MemoryError> {
        let bytes = self.read(address, size)?;
        self.dispatcher.memory_load(self, &accessor, address, size);
        Ok(bytes)
    }

    /// Write `data` on behalf of a work-item or work-group.
    pub fn store(&self, address: u64, data: &[u8], accessor: Accessor) -> Result<(), MemoryError> {
        self.write(address, data)?;
        self.dispatcher.memory_store(self, &accessor, address, data);
        Ok(())
    }

    /// Read without emitting any event. Meant for plugins inspecting memory
    /// from inside their own callbacks.
    pub fn peek(&self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        self.read(address, size)
    }

    /// Host-side read (buffer readback).
    pub fn host_load(&self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        let bytes = self.read(address, size)?;
        self.dispatcher.host_memory_load(self, address, size);
        Ok(bytes)
    }

    /// Host-side write (buffer upload).
    pub fn host_store(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.write(address, data)?;
        self.dispatcher.host_memory_store(self, address, data);
        Ok(())
    }

    /// Indivisible read-modify-write of a 4- or 8-byte value.
    /// Returns the value held before the operation.
    pub fn atomic(
        &self,
        op: AtomicOp,
        address: u64,
        size: usize,
        operand: u64,
        compare: u64,
        accessor: Accessor,
    ) -> Result<u64, MemoryError> {
        if size != 4 && size != 8 {
            return Err(MemoryError::UnsupportedAtomicSize { size });
        }
        let old = {
            let mut pool = self.pool.lock();
            let range = pool.resolve(address, size).ok_or_else(|| self.invalid(address, size))?;
            let bytes = &mut pool.data[range];
            let old = if size == 4 {
                u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
            } else {
                let mut b = [0u8; 8];
                b.copy_from_slice(bytes);
                u64::from_ne_bytes(b)
            };
            let new = op.apply(old, operand, compare, size);
            if size == 4 {
                bytes.copy_from_slice(&(new as u32).to_ne_bytes());
            } else {
                bytes.copy_from_slice(&new.to_ne_bytes());
            }
            old
        };
        self.dispatcher.memory_atomic_load(self, &accessor, op, address, size);
        self.dispatcher.memory_atomic_store(self, &accessor, op, address, size);
        Ok(old)
    }

    pub fn is_allocated(&self, address: u64) -> bool {
        self.pool.lock().allocations.contains_key(&address)
    }

    pub fn allocation_count(&self) -> usize {
        self.pool.lock().allocations.len()
    }

    /// Sum of the requested sizes of all live allocations.
    pub fn bytes_allocated(&self) -> usize {
        self.pool.lock().allocations.values().sum()
    }

    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        let pool = self.pool.lock();
        let range = pool.resolve(address, size).ok_or_else(|| self.invalid(address, size))?;
        Ok(pool.data[range].to_vec())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut pool = self.pool.lock();
        let range = pool
            .resolve(address, data.len())
            .ok_or_else(|| self.invalid(address, data.len()))?;
        pool.data[range].copy_from_slice(data);
        Ok(())
    }

    fn invalid(&self, address: u64, size: usize) -> MemoryError {
        MemoryError::InvalidAddress {
            space: self.space,
            address,
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn global(limit: usize) -> Memory {
        Memory::new(AddressSpace::Global, limit, Arc::new(PluginDispatcher::new()))
    }

    fn group() -> Accessor {
        Accessor::WorkGroup(Dim3::default())
    }

    #[test]
    fn null_is_never_allocated() {
        let mem = global(1024);
        let a = mem.allocate(0).unwrap();
        let b = mem.allocate(4).unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert!(mem.load(0, 1, group()).is_err());
    }

    #[test]
    fn store_then_load_round_trips() {
        let mem = global(1024);
        let addr = mem.allocate(16).unwrap();
        let data: Vec<u8> = (1..=16).collect();
        mem.store(addr, &data, group()).unwrap();
        assert_eq!(mem.load(addr, 16, group()).unwrap(), data);
        assert_eq!(mem.load(addr + 4, 4, group()).unwrap(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn access_past_allocation_is_invalid() {
        let mem = global(1024);
        let addr = mem.allocate(100).unwrap();
        let _next = mem.allocate(100).unwrap();
        let err = mem.load(addr + 100, 8, group()).unwrap_err();
        assert_eq!(
            err,
            MemoryError::InvalidAddress {
                space: AddressSpace::Global,
                address: addr + 100,
                size: 8
            }
        );
        assert!(mem.load(addr + 96, 4, group()).is_ok());
        assert!(mem.store(addr + 97, &[0; 4], group()).is_err());
    }

    #[test]
    fn out_of_memory() {
        let mem = global(64);
        assert!(mem.allocate(32).is_ok());
        let err = mem.allocate(64).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { requested: 64, .. }));
    }

    #[test]
    fn double_free_is_reported() {
        let mem = global(256);
        let addr = mem.allocate(8).unwrap();
        mem.deallocate(addr).unwrap();
        assert_eq!(
            mem.deallocate(addr),
            Err(MemoryError::UnknownAllocation {
                space: AddressSpace::Global,
                address: addr
            })
        );
        assert!(mem.deallocate(12345).is_err());
    }

    #[test]
    fn freed_blocks_are_reused_and_zeroed() {
        let mem = global(256);
        let a = mem.allocate(16).unwrap();
        let b = mem.allocate(16).unwrap();
        mem.host_store(a, &[0xab; 16]).unwrap();
        mem.deallocate(a).unwrap();
        let c = mem.allocate(8).unwrap();
        assert_eq!(c, a);
        assert_eq!(mem.host_load(c, 8).unwrap(), vec![0; 8]);
        mem.deallocate(b).unwrap();
        mem.deallocate(c).unwrap();
        assert_eq!(mem.allocation_count(), 0);
        // Everything was released, so the pool shrinks back to its start.
        assert_eq!(mem.allocate(200).unwrap(), a);
    }

    #[test]
    fn atomic_ops_return_previous_value() {
        let mem = global(256);
        let addr = mem.allocate(4).unwrap();
        mem.host_store(addr, &10u32.to_ne_bytes()).unwrap();
        assert_eq!(mem.atomic(AtomicOp::Add, addr, 4, 5, 0, group()).unwrap(), 10);
        assert_eq!(mem.atomic(AtomicOp::CmpXchg, addr, 4, 99, 14, group()).unwrap(), 15);
        assert_eq!(mem.atomic(AtomicOp::CmpXchg, addr, 4, 99, 15, group()).unwrap(), 15);
        assert_eq!(mem.atomic(AtomicOp::Dec, addr, 4, 0, 0, group()).unwrap(), 99);
        assert_eq!(mem.host_load(addr, 4).unwrap(), 98u32.to_ne_bytes().to_vec());
        assert!(mem.atomic(AtomicOp::Add, addr, 2, 1, 0, group()).is_err());
    }

    #[test]
    fn atomic_apply_respects_width_and_sign() {
        assert_eq!(AtomicOp::Add.apply(0xffff_ffff, 1, 0, 4), 0);
        assert_eq!(AtomicOp::Min.apply(5, (-3i32) as u32 as u64, 0, 4), (-3i32) as u32 as u64);
        assert_eq!(AtomicOp::UMin.apply(5, (-3i32) as u32 as u64, 0, 4), 5);
        assert_eq!(AtomicOp::Max.apply(5, (-3i32) as u32 as u64, 0, 4), 5);
        assert_eq!(AtomicOp::Xchg.apply(1, 2, 0, 8), 2);
    }

    #[test]
    fn concurrent_atomic_adds_accumulate() {
        let mem = Arc::new(global(256));
        let addr = mem.allocate(4).unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                let mem = Arc::clone(&mem);
                s.spawn(move || {
                    for _ in 0..100 {
                        mem.atomic(AtomicOp::Add, addr, 4, 3, 0, group()).unwrap();
                    }
                });
            }
        });
        assert_eq!(mem.host_load(addr, 4).unwrap(), 2400u32.to_ne_bytes().to_vec());
    }
}
