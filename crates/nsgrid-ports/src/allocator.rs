//! Slot-bitmap port allocator.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use nsgrid_core::{PORTS_PER_BLOCK, PortBlock};
use tracing::{debug, info, warn};

use crate::error::{PortError, PortResult};

/// Bitmap over slots plus the namespace that owns each set bit.
struct SlotTable {
    words: Vec<u64>,
    owners: HashMap<String, u32>,
}

impl SlotTable {
    fn new(capacity: u32) -> Self {
        Self {
            words: vec![0; (capacity as usize).div_ceil(64)],
            owners: HashMap::new(),
        }
    }

    fn is_set(&self, slot: u32) -> bool {
        self.words[(slot / 64) as usize] & (1 << (slot % 64)) != 0
    }

    fn set(&mut self, slot: u32) {
        self.words[(slot / 64) as usize] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: u32) {
        self.words[(slot / 64) as usize] &= !(1 << (slot % 64));
    }

    /// Lowest free slot below `capacity`.
    fn first_free(&self, capacity: u32) -> Option<u32> {
        for (i, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let slot = i as u32 * 64 + word.trailing_ones();
                return (slot < capacity).then_some(slot);
            }
        }
        None
    }
}

/// Hands out non-overlapping [`PortBlock`]s from a fixed range.
///
/// Constructed once at startup and shared behind an `Arc`.
pub struct PortAllocator {
    range_start: u16,
    capacity: u32,
    table: Mutex<SlotTable>,
}

impl PortAllocator {
    /// Create an allocator over `range_size` ports starting at `range_start`.
    ///
    /// Trailing ports that do not fill a whole block are left unused.
    pub fn new(range_start: u16, range_size: u32) -> Self {
        let capacity = range_size / u32::from(PORTS_PER_BLOCK);
        debug!(range_start, range_size, capacity, "port allocator created");
        Self {
            range_start,
            capacity,
            table: Mutex::new(SlotTable::new(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn block_for(&self, slot: u32) -> PortBlock {
        let base = u32::from(self.range_start) + slot * u32::from(PORTS_PER_BLOCK);
        PortBlock::new(slot, base as u16)
    }

    /// Reserve a block for `namespace`.
    ///
    /// Fails with `AlreadyReserved` if the namespace still owns a block and
    /// with `PoolExhausted` if no slot is free.
    pub fn reserve(&self, namespace: &str) -> PortResult<PortBlock> {
        let mut table = self.lock();
        if let Some(&slot) = table.owners.get(namespace) {
            return Err(PortError::AlreadyReserved {
                namespace: namespace.to_string(),
                block: self.block_for(slot),
            });
        }
        let Some(slot) = table.first_free(self.capacity) else {
            warn!(%namespace, capacity = self.capacity, "port pool exhausted");
            return Err(PortError::PoolExhausted {
                capacity: self.capacity,
            });
        };
        debug_assert!(!table.is_set(slot));
        table.set(slot);
        table.owners.insert(namespace.to_string(), slot);
        drop(table);

        let block = self.block_for(slot);
        info!(%namespace, slot, base = block.base, "port block reserved");
        Ok(block)
    }

    /// Return the namespace's block to the pool. Releasing twice is a no-op.
    pub fn release(&self, namespace: &str) -> Option<PortBlock> {
        let mut table = self.lock();
        let slot = table.owners.remove(namespace)?;
        table.clear(slot);
        drop(table);

        let block = self.block_for(slot);
        info!(%namespace, slot, base = block.base, "port block released");
        Some(block)
    }

    /// The block currently owned by `namespace`, if any.
    pub fn block_of(&self, namespace: &str) -> Option<PortBlock> {
        let table = self.lock();
        table.owners.get(namespace).map(|&slot| self.block_for(slot))
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn reserved(&self) -> u32 {
        self.lock().owners.len() as u32
    }

    pub fn available(&self) -> u32 {
        self.capacity - self.reserved()
    }
}
