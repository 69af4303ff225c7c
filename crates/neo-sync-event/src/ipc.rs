//! IPC event pool descriptor and import bookkeeping.
//!
//! # Wire format
//!
//! 64 bytes, little endian, opaque to the transport:
//!
//! | offset | type | field |
//! |---|---|---|
//! | 0 | u64 | shareable allocation handle |
//! | 8 | u64 | number of events |
//! | 16 | u32 | event size in bytes |
//! | 20 | u32 | exporter root-device index |
//! | 24 | u32 | max event packets |
//! | 28 | u32 | number of devices |
//! | 32 | u8 | device-local pool |
//! | 33 | u8 | host visible |
//! | 34 | u8 | implicit-scaling capable |
//! | 35 | u8 | kernel timestamp |
//! | 36 | u8 | kernel mapped timestamp |
//! | 37 | u8 | descriptor version |
//! | 38..64 | | zero |

use std::collections::HashMap;
use std::sync::Arc;

use neo_sync_core::memory::{Allocation, AllocationProperties, MemoryManager};
use neo_sync_core::{Result, SyncError};
use tracing::debug;

pub const IPC_HANDLE_SIZE: usize = 64;
pub const IPC_DESCRIPTOR_VERSION: u8 = 1;

/// Serialized pool descriptor handed to another process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcEventPoolHandle {
    pub data: [u8; IPC_HANDLE_SIZE],
}

/// Decoded form of [`IpcEventPoolHandle`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpcPoolDescriptor {
    pub handle: u64,
    pub num_events: u64,
    pub event_size: u32,
    pub root_device_index: u32,
    pub max_event_packets: u32,
    pub num_devices: u32,
    pub device_pool: bool,
    pub host_visible: bool,
    pub implicit_scaling: bool,
    pub timestamp: bool,
    pub mapped_timestamp: bool,
}

impl IpcPoolDescriptor {
    pub fn encode(&self) -> IpcEventPoolHandle {
        let mut data = [0u8; IPC_HANDLE_SIZE];
        data[0..8].copy_from_slice(&self.handle.to_le_bytes());
        data[8..16].copy_from_slice(&self.num_events.to_le_bytes());
        data[16..20].copy_from_slice(&self.event_size.to_le_bytes());
        data[20..24].copy_from_slice(&self.root_device_index.to_le_bytes());
        data[24..28].copy_from_slice(&self.max_event_packets.to_le_bytes());
        data[28..32].copy_from_slice(&self.num_devices.to_le_bytes());
        data[32] = self.device_pool as u8;
        data[33] = self.host_visible as u8;
        data[34] = self.implicit_scaling as u8;
        data[35] = self.timestamp as u8;
        data[36] = self.mapped_timestamp as u8;
        data[37] = IPC_DESCRIPTOR_VERSION;
        IpcEventPoolHandle { data }
    }

    pub fn decode(handle: &IpcEventPoolHandle) -> Result<Self> {
        let data = &handle.data;
        let version = data[37];
        if version != IPC_DESCRIPTOR_VERSION {
            return Err(SyncError::InvalidArgument(format!(
                "IPC pool descriptor version {version} is not supported (expected {IPC_DESCRIPTOR_VERSION})"
            )));
        }
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[at..at + 8]);
            u64::from_le_bytes(raw)
        };
        let u32_at = |at: usize| {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(raw)
        };
        let descriptor = Self {
            handle: u64_at(0),
            num_events: u64_at(8),
            event_size: u32_at(16),
            root_device_index: u32_at(20),
            max_event_packets: u32_at(24),
            num_devices: u32_at(28),
            device_pool: data[32] != 0,
            host_visible: data[33] != 0,
            implicit_scaling: data[34] != 0,
            timestamp: data[35] != 0,
            mapped_timestamp: data[36] != 0,
        };
        if descriptor.num_events == 0 || descriptor.num_events > u64::from(u32::MAX) {
            return Err(SyncError::InvalidArgument(format!(
                "IPC pool descriptor carries {} events",
                descriptor.num_events
            )));
        }
        Ok(descriptor)
    }
}

// ─── Import registry ─────────────────────────────────────────────────────────

struct ImportEntry {
    allocation: Arc<Allocation>,
    refcount: usize,
}

/// Driver-wide refcount of imported root allocations, keyed by shareable
/// handle. Every pool opened from the same handle shares one import; the
/// import is freed when the last of them closes.
#[derive(Default)]
pub(crate) struct ImportRegistry {
    entries: HashMap<u64, ImportEntry>,
}

impl ImportRegistry {
    pub(crate) fn acquire(
        &mut self,
        handle: u64,
        props: &AllocationProperties,
        memory_manager: &dyn MemoryManager,
    ) -> Result<Arc<Allocation>> {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.refcount += 1;
            debug!(handle, refcount = entry.refcount, "Reusing IPC import");
            return Ok(entry.allocation.clone());
        }
        let allocation = memory_manager.import_from_handle(handle, props)?;
        self.entries.insert(
            handle,
            ImportEntry {
                allocation: allocation.clone(),
                refcount: 1,
            },
        );
        debug!(handle, allocation = allocation.id, "Imported IPC allocation");
        Ok(allocation)
    }

    pub(crate) fn release(&mut self, handle: u64, memory_manager: &dyn MemoryManager) {
        let Some(entry) = self.entries.get_mut(&handle) else {
            return;
        };
        entry.refcount -= 1;
        if entry.refcount == 0
            && let Some(entry) = self.entries.remove(&handle)
        {
            memory_manager.free(&entry.allocation);
            debug!(handle, "Released IPC import");
        }
    }

    pub(crate) fn refcount(&self, handle: u64) -> usize {
        self.entries.get(&handle).map_or(0, |e| e.refcount)
    }
}
