//! In-order execution counters backing counter-based events.
//!
//! A counter-based event has no pool slot. It completes once every partition
//! of an externally owned counter reaches the event's counter value. Each
//! partition is one little-endian `u64`, [`PARTITION_STRIDE`] bytes apart.
//! The host polls the host counter when one is attached, else the device
//! counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use neo_sync_core::memory::Allocation;
use neo_sync_core::types::GpuAddress;
use neo_sync_core::{Result, SyncError};

use crate::event::EventScope;

pub const PARTITION_STRIDE: usize = 8;

pub struct InOrderExecInfo {
    device_counter: Arc<Allocation>,
    host_counter: Option<Arc<Allocation>>,
    offset: usize,
    partition_count: u32,
    last_waited_counter: AtomicU64,
}

impl InOrderExecInfo {
    pub fn new(
        device_counter: Arc<Allocation>,
        host_counter: Option<Arc<Allocation>>,
        offset: usize,
        partition_count: u32,
    ) -> Result<Arc<Self>> {
        if partition_count == 0 {
            return Err(SyncError::InvalidArgument(
                "in-order counter needs at least one partition".into(),
            ));
        }
        let span = offset + partition_count as usize * PARTITION_STRIDE;
        for allocation in std::iter::once(&device_counter).chain(host_counter.as_ref()) {
            if span > allocation.size {
                return Err(SyncError::InvalidArgument(format!(
                    "counter span {span} exceeds allocation {} of {} bytes",
                    allocation.id, allocation.size
                )));
            }
        }
        Ok(Arc::new(Self {
            device_counter,
            host_counter,
            offset,
            partition_count,
            last_waited_counter: AtomicU64::new(0),
        }))
    }

    #[inline]
    pub fn device_address(&self) -> GpuAddress {
        self.device_counter.gpu_address + self.offset as GpuAddress
    }

    pub fn device_counter_allocation(&self) -> &Arc<Allocation> {
        &self.device_counter
    }

    pub fn host_counter_allocation(&self) -> Option<&Arc<Allocation>> {
        self.host_counter.as_ref()
    }

    /// Allocation the host reads for completion.
    pub fn poll_allocation(&self) -> &Arc<Allocation> {
        self.host_counter.as_ref().unwrap_or(&self.device_counter)
    }

    #[inline]
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn span(&self) -> usize {
        self.partition_count as usize * PARTITION_STRIDE
    }

    /// Highest counter value a host wait has observed.
    pub fn last_waited_counter(&self) -> u64 {
        self.last_waited_counter.load(Ordering::Acquire)
    }

    pub(crate) fn update_last_waited(&self, value: u64) {
        self.last_waited_counter.fetch_max(value, Ordering::AcqRel);
    }

    /// Current value of every partition of the polled allocation.
    pub fn read_partitions(&self) -> Result<Vec<u64>> {
        let bytes = self
            .poll_allocation()
            .storage()
            .snapshot(self.offset, self.span())?;
        Ok(bytes
            .chunks_exact(PARTITION_STRIDE)
            .map(|chunk| {
                let mut raw = [0u8; PARTITION_STRIDE];
                raw.copy_from_slice(chunk);
                u64::from_le_bytes(raw)
            })
            .collect())
    }

    pub fn is_reached(&self, value: u64) -> Result<bool> {
        Ok(self.read_partitions()?.iter().all(|&v| v >= value))
    }

    /// Store `value` in every partition of both allocations.
    pub(crate) fn write_all(&self, value: u64) -> Result<()> {
        let bytes: Vec<u8> = (0..self.partition_count)
            .flat_map(|_| value.to_le_bytes())
            .collect();
        for allocation in std::iter::once(&self.device_counter).chain(self.host_counter.as_ref()) {
            allocation.storage().write(self.offset, &bytes)?;
        }
        Ok(())
    }

    pub(crate) fn allocations(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        std::iter::once(&self.device_counter).chain(self.host_counter.as_ref())
    }
}

/// Creation parameters of a counter-based event.
#[derive(Clone)]
pub struct CounterBasedEventDesc {
    pub in_order: Arc<InOrderExecInfo>,
    /// Value every partition must reach.
    pub counter_value: u64,
    pub signal_scope: EventScope,
    pub wait_scope: EventScope,
}

#[cfg(test)]
mod tests {
    use neo_sync_core::memory::{AllocationProperties, HostStorage, MemoryPlacement};

    use super::*;

    fn allocation(id: u64, size: usize) -> Arc<Allocation> {
        let props = AllocationProperties {
            size,
            alignment: 64,
            root_device_index: 0,
            placement: MemoryPlacement::HostVisible,
            shareable: false,
        };
        Arc::new(Allocation::new(
            id,
            0x10_000 * id,
            &props,
            Arc::new(HostStorage::zeroed(size)),
        ))
    }

    #[test]
    fn completion_needs_every_partition() {
        let info = InOrderExecInfo::new(allocation(1, 64), None, 8, 2).expect("fits");
        assert_eq!(info.device_address(), 0x10_008);
        info.poll_allocation()
            .storage()
            .write(8, &5u64.to_le_bytes())
            .expect("in bounds");
        assert!(!info.is_reached(5).expect("readable"));
        info.write_all(7).expect("in bounds");
        assert_eq!(info.read_partitions().expect("readable"), vec![7, 7]);
        assert!(info.is_reached(7).expect("readable"));
    }

    #[test]
    fn host_counter_is_polled_when_attached() {
        let info = InOrderExecInfo::new(allocation(1, 64), Some(allocation(2, 64)), 0, 1)
            .expect("fits");
        assert_eq!(info.poll_allocation().id, 2);
        info.write_all(3).expect("in bounds");
        assert_eq!(
            info.device_counter_allocation().storage().snapshot(0, 8).expect("readable"),
            3u64.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn span_must_fit_both_allocations() {
        assert!(InOrderExecInfo::new(allocation(1, 64), Some(allocation(2, 8)), 0, 2).is_err());
        assert!(InOrderExecInfo::new(allocation(1, 64), None, 0, 0).is_err());
    }

    #[test]
    fn last_waited_only_moves_forward() {
        let info = InOrderExecInfo::new(allocation(1, 8), None, 0, 1).expect("fits");
        info.update_last_waited(9);
        info.update_last_waited(4);
        assert_eq!(info.last_waited_counter(), 9);
    }
}
