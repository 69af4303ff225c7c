//! Timestamp pool allocator.
//!
//! Small host-visible timestamp pools are common (one per profiled command
//! list) and would churn the allocator. Instead, each root device keeps a set
//! of fixed-size backing buffers split into equal slots; a pool takes one slot
//! and returns it on drop. Pools drawn from the same buffer alias one physical
//! allocation at disjoint offsets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use neo_sync_core::Result;
use neo_sync_core::memory::{Allocation, AllocationProperties, MemoryManager, MemoryPlacement};
use neo_sync_core::types::align_up;
use tracing::debug;

use crate::lock;

#[derive(Default)]
pub(crate) struct CacheStats {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) released: AtomicU64,
}

struct CacheBuffer {
    allocation: Arc<Allocation>,
    slot_size: usize,
    free: Vec<usize>,
}

pub(crate) struct TimestampPoolCache {
    root_device_index: u32,
    buffer_size: usize,
    memory_manager: Arc<dyn MemoryManager>,
    buffers: Mutex<Vec<CacheBuffer>>,
    stats: CacheStats,
}

/// One slot of a cache buffer, returned to the cache on drop.
pub(crate) struct CacheChunk {
    cache: Arc<TimestampPoolCache>,
    allocation: Arc<Allocation>,
    offset: usize,
}

impl CacheChunk {
    pub(crate) fn allocation(&self) -> &Arc<Allocation> {
        &self.allocation
    }

    pub(crate) fn offset(&self) -> usize {
        self.offset
    }
}

impl Drop for CacheChunk {
    fn drop(&mut self) {
        self.cache.release(self.allocation.id, self.offset);
    }
}

impl TimestampPoolCache {
    pub(crate) fn new(
        root_device_index: u32,
        buffer_size: usize,
        memory_manager: Arc<dyn MemoryManager>,
    ) -> Self {
        Self {
            root_device_index,
            buffer_size,
            memory_manager,
            buffers: Mutex::new(Vec::new()),
            stats: CacheStats::default(),
        }
    }

    /// A slot of at least `size` bytes, or `None` when `size` does not fit
    /// one buffer.
    pub(crate) fn acquire(self: &Arc<Self>, size: usize, alignment: usize) -> Result<Option<CacheChunk>> {
        let slot_size = align_up(size, alignment.max(64));
        if slot_size > self.buffer_size {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let mut buffers = lock(&self.buffers);
        if let Some(buffer) = buffers
            .iter_mut()
            .find(|b| b.slot_size == slot_size && !b.free.is_empty())
            && let Some(offset) = buffer.free.pop()
        {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(CacheChunk {
                cache: self.clone(),
                allocation: buffer.allocation.clone(),
                offset,
            }));
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let allocation = self.memory_manager.allocate(&AllocationProperties {
            size: self.buffer_size,
            alignment: alignment.max(64),
            root_device_index: self.root_device_index,
            placement: MemoryPlacement::HostVisible,
            shareable: false,
        })?;
        let slots = self.buffer_size / slot_size;
        let mut free: Vec<usize> = (0..slots).rev().map(|i| i * slot_size).collect();
        let offset = free.pop().unwrap_or(0);
        debug!(
            root = self.root_device_index,
            buffer_size = self.buffer_size,
            slot_size,
            slots,
            "New timestamp pool buffer"
        );
        buffers.push(CacheBuffer {
            allocation: allocation.clone(),
            slot_size,
            free,
        });
        Ok(Some(CacheChunk {
            cache: self.clone(),
            allocation,
            offset,
        }))
    }

    fn release(&self, allocation_id: u64, offset: usize) {
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        let mut buffers = lock(&self.buffers);
        if let Some(buffer) = buffers
            .iter_mut()
            .find(|b| b.allocation.id == allocation_id)
        {
            buffer.free.push(offset);
        }
    }

    /// `(hits, misses, released)`.
    pub(crate) fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.released.load(Ordering::Relaxed),
        )
    }
}

impl Drop for TimestampPoolCache {
    fn drop(&mut self) {
        for buffer in lock(&self.buffers).drain(..) {
            self.memory_manager.free(&buffer.allocation);
        }
    }
}
