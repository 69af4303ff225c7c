//! Event pools.
//!
//! # Geometry
//!
//! Every event slot has the same stride, `event_size`:
//!
//! ```text
//! event_size = align_up(max_event_packets * packet_size, alignment)
//! ```
//!
//! `max_event_packets` is the largest packet count reported by the pool's
//! devices (or a fixed constant when dynamic estimation is off), so offset
//! math is identical on every root device of a multi-device pool.
//!
//! # Memory
//!
//! A pool's memory is one of:
//!
//! - an owned allocation per unique root device over shared storage,
//! - a slot of the root device's timestamp pool cache (single root, no
//!   implicit scaling, host-visible timestamp pool, not IPC),
//! - an IPC import plus one shadow allocation per additional context root.
//!
//! The memory is reference counted. The pool and each of its events hold a
//! reference; it is released exactly once when the last reference goes.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use neo_sync_core::config::SyncConfig;
use neo_sync_core::device::{Device, TimestampWidth};
use neo_sync_core::memory::{Allocation, AllocationProperties, MemoryPlacement, MultiAllocation};
use neo_sync_core::types::align_up;
use neo_sync_core::{ErrorKind, Result, SyncError};
use neo_sync_timestamp::{EVENT_MAX_KERNEL_SPLIT, EVENT_PACKETS, PacketLayout};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::driver::{Context, DeviceHandle, DriverHandle};
use crate::event::{Event, EventDesc, SlotEventInit};
use crate::ipc::{IpcEventPoolHandle, IpcPoolDescriptor};
use crate::lock;
use crate::pool_cache::CacheChunk;

bitflags! {
    /// Event pool creation flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EventPoolFlags: u32 {
        /// Events may be signaled and waited on by the host.
        const HOST_VISIBLE = 0x1;
        /// The pool may be exported to another process.
        const IPC = 0x2;
        /// Events record kernel timestamps.
        const KERNEL_TIMESTAMP = 0x4;
        /// Events record kernel timestamps mapped to host time.
        const KERNEL_MAPPED_TIMESTAMP = 0x8;
    }
}

impl EventPoolFlags {
    #[inline]
    pub fn is_timestamp(self) -> bool {
        self.intersects(Self::KERNEL_TIMESTAMP | Self::KERNEL_MAPPED_TIMESTAMP)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventPoolDesc {
    /// Number of event slots. Must be non-zero.
    pub count: u32,
    pub flags: EventPoolFlags,
}

// ─── Geometry ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PoolGeometry {
    pub width: TimestampWidth,
    pub max_event_packets: u32,
    pub max_kernel_count: u32,
    pub packet_size: usize,
    pub alignment: usize,
    pub event_size: usize,
}

impl PoolGeometry {
    pub fn new(
        width: TimestampWidth,
        max_event_packets: u32,
        max_kernel_count: u32,
        alignment: usize,
    ) -> Result<Self> {
        if max_event_packets == 0 || max_kernel_count == 0 {
            return Err(SyncError::InvalidArgument(
                "event geometry needs at least one packet and one kernel".into(),
            ));
        }
        if !alignment.is_power_of_two() {
            return Err(SyncError::InvalidArgument(format!(
                "event alignment {alignment} is not a power of two"
            )));
        }
        let packet_size = PacketLayout::new(width).packet_size();
        Ok(Self {
            width,
            max_event_packets,
            max_kernel_count,
            packet_size,
            alignment,
            event_size: align_up(max_event_packets as usize * packet_size, alignment),
        })
    }

    /// Geometry shared by `devices`: the widest timestamp, the largest packet
    /// and kernel counts and the strictest alignment.
    pub fn for_devices(devices: &[Arc<Device>], config: &SyncConfig) -> Result<Self> {
        let caps = devices.iter().map(|d| d.caps());
        let width = if caps.clone().any(|c| c.timestamp_width == TimestampWidth::Bits64) {
            TimestampWidth::Bits64
        } else {
            TimestampWidth::Bits32
        };
        let alignment = caps.clone().map(|c| c.event_alignment).max().unwrap_or(64);
        let (max_event_packets, max_kernel_count) = if config.use_dynamic_event_packets_count {
            (
                caps.clone()
                    .map(|c| c.max_event_packets)
                    .max()
                    .unwrap_or(EVENT_PACKETS),
                caps.map(|c| c.max_kernel_count)
                    .max()
                    .unwrap_or(EVENT_MAX_KERNEL_SPLIT),
            )
        } else {
            (EVENT_PACKETS, EVENT_MAX_KERNEL_SPLIT)
        };
        Self::new(width, max_event_packets, max_kernel_count, alignment)
    }

    #[inline]
    pub fn layout(&self) -> PacketLayout {
        PacketLayout::new(self.width)
    }

    pub fn pool_size(&self, num_events: u32) -> Result<usize> {
        self.event_size
            .checked_mul(num_events as usize)
            .ok_or_else(|| {
                SyncError::InvalidArgument(format!(
                    "{num_events} events of {} bytes overflow the address space",
                    self.event_size
                ))
            })
    }
}

// ─── Memory ──────────────────────────────────────────────────────────────────

enum Backing {
    Owned(MultiAllocation),
    Cached(CacheChunk),
    Imported {
        handle: u64,
        root: Arc<Allocation>,
        shadows: Vec<Arc<Allocation>>,
    },
}

/// Backing memory of a pool, released on drop.
pub(crate) struct PoolMemory {
    backing: Backing,
    driver: Arc<DriverHandle>,
}

impl PoolMemory {
    pub(crate) fn default_allocation(&self) -> &Arc<Allocation> {
        match &self.backing {
            Backing::Owned(multi) => multi.default_allocation(),
            Backing::Cached(chunk) => chunk.allocation(),
            Backing::Imported { root, .. } => root,
        }
    }

    /// Allocation of `root_device_index`, or the default one when the pool has
    /// no allocation there.
    pub(crate) fn allocation_for(&self, root_device_index: u32) -> &Arc<Allocation> {
        self.find_allocation(root_device_index)
            .unwrap_or_else(|| self.default_allocation())
    }

    pub(crate) fn find_allocation(&self, root_device_index: u32) -> Option<&Arc<Allocation>> {
        match &self.backing {
            Backing::Owned(multi) => multi.get(root_device_index),
            Backing::Cached(chunk) => Some(chunk.allocation())
                .filter(|a| a.root_device_index == root_device_index),
            Backing::Imported { root, shadows, .. } => std::iter::once(root)
                .chain(shadows.iter())
                .find(|a| a.root_device_index == root_device_index),
        }
    }

    /// Byte offset of the pool's first slot inside its allocation.
    pub(crate) fn base_offset(&self) -> usize {
        match &self.backing {
            Backing::Cached(chunk) => chunk.offset(),
            Backing::Owned(_) | Backing::Imported { .. } => 0,
        }
    }
}

impl Drop for PoolMemory {
    fn drop(&mut self) {
        let memory_manager = self.driver.memory_manager().clone();
        match &self.backing {
            Backing::Owned(multi) => {
                for allocation in multi.iter() {
                    memory_manager.free(allocation);
                }
            }
            Backing::Cached(_) => {}
            Backing::Imported {
                handle, shadows, ..
            } => {
                for shadow in shadows {
                    memory_manager.free(shadow);
                }
                self.driver
                    .ipc_imports()
                    .release(*handle, memory_manager.as_ref());
            }
        }
    }
}

// ─── Pool ────────────────────────────────────────────────────────────────────

pub struct EventPool {
    driver: Arc<DriverHandle>,
    devices: Vec<Arc<Device>>,
    root_device_indices: Vec<u32>,
    num_events: u32,
    geometry: PoolGeometry,
    flags: EventPoolFlags,
    implicit_scaling_capable: bool,
    imported: bool,
    memory: Mutex<Option<Arc<PoolMemory>>>,
}

impl EventPool {
    /// Create a pool on `devices`. An empty list covers every device of the
    /// driver, deduplicated to unique root devices.
    pub fn create(
        driver: &Arc<DriverHandle>,
        context: &Context,
        devices: &[DeviceHandle],
        desc: &EventPoolDesc,
    ) -> Result<Arc<Self>> {
        if !Arc::ptr_eq(driver, context.driver()) {
            return Err(SyncError::InvalidArgument(
                "context belongs to a different driver".into(),
            ));
        }
        if desc.count == 0 {
            return Err(SyncError::InvalidArgument(
                "event pool count must be greater than zero".into(),
            ));
        }
        let devices = resolve_devices(driver, devices)?;
        let root_device_indices = unique_roots(&devices);
        let config = driver.config();
        let geometry = PoolGeometry::for_devices(&devices, config)?;
        let implicit_scaling_capable = devices.iter().any(|d| d.is_implicit_scaling_capable());
        let size = geometry.pool_size(desc.count)?;

        let props = AllocationProperties {
            size,
            alignment: geometry.alignment,
            root_device_index: root_device_indices[0],
            placement: if desc.flags.contains(EventPoolFlags::HOST_VISIBLE) {
                MemoryPlacement::HostVisible
            } else {
                MemoryPlacement::DeviceLocal
            },
            shareable: desc.flags.contains(EventPoolFlags::IPC),
        };
        let use_cache = config.enable_timestamp_pool_allocator
            && root_device_indices.len() == 1
            && !implicit_scaling_capable
            && desc.flags.contains(EventPoolFlags::HOST_VISIBLE)
            && desc.flags.is_timestamp()
            && !desc.flags.contains(EventPoolFlags::IPC);

        let cached = if use_cache {
            let chunk = driver
                .timestamp_pool_cache(root_device_indices[0])
                .acquire(size, geometry.alignment)?;
            if chunk.is_none() {
                warn!(
                    size,
                    chunk_size = config.timestamp_pool_chunk_size,
                    "Timestamp pool too large for the pool allocator, allocating directly"
                );
            }
            chunk
        } else {
            None
        };
        let backing = match cached {
            Some(chunk) => Backing::Cached(chunk),
            None => Backing::Owned(
                driver
                    .memory_manager()
                    .allocate_multi_root(&root_device_indices, &props)?,
            ),
        };

        debug!(
            num_events = desc.count,
            event_size = geometry.event_size,
            max_event_packets = geometry.max_event_packets,
            roots = ?root_device_indices,
            cached = matches!(backing, Backing::Cached(_)),
            flags = ?desc.flags,
            "Event pool created"
        );
        Ok(Arc::new(Self {
            driver: driver.clone(),
            devices,
            root_device_indices,
            num_events: desc.count,
            geometry,
            flags: desc.flags,
            implicit_scaling_capable,
            imported: false,
            memory: Mutex::new(Some(Arc::new(PoolMemory {
                backing,
                driver: driver.clone(),
            }))),
        }))
    }

    /// Open a pool exported by [`EventPool::ipc_handle`].
    pub fn open_ipc_handle(
        driver: &Arc<DriverHandle>,
        context: &Context,
        handle: &IpcEventPoolHandle,
    ) -> Result<Arc<Self>> {
        if !Arc::ptr_eq(driver, context.driver()) {
            return Err(SyncError::InvalidArgument(
                "context belongs to a different driver".into(),
            ));
        }
        let descriptor = IpcPoolDescriptor::decode(handle)?;
        let devices = context.devices().to_vec();
        let geometry = PoolGeometry::for_devices(&devices, driver.config())?;
        if descriptor.max_event_packets != geometry.max_event_packets {
            error!(
                descriptor = descriptor.max_event_packets,
                local = geometry.max_event_packets,
                "IPC handle max event packets does not match context devices max event packets"
            );
            return Err(SyncError::IpcPacketMismatch {
                descriptor: descriptor.max_event_packets,
                local: geometry.max_event_packets,
            });
        }
        if descriptor.event_size as usize != geometry.event_size {
            error!(
                descriptor = descriptor.event_size,
                local = geometry.event_size,
                "IPC handle event size does not match local event size"
            );
            return Err(SyncError::IpcEventSizeMismatch {
                descriptor: descriptor.event_size,
                local: geometry.event_size as u32,
            });
        }

        let num_events = descriptor.num_events as u32;
        let roots = context.root_device_indices();
        let props = AllocationProperties {
            size: geometry.pool_size(num_events)?,
            alignment: geometry.alignment,
            root_device_index: roots[0],
            placement: if descriptor.host_visible {
                MemoryPlacement::HostVisible
            } else {
                MemoryPlacement::DeviceLocal
            },
            shareable: true,
        };
        let memory_manager = driver.memory_manager().clone();
        let root = driver
            .ipc_imports()
            .acquire(descriptor.handle, &props, memory_manager.as_ref())?;

        let mut shadows = Vec::with_capacity(roots.len().saturating_sub(1));
        for &root_device_index in &roots[1..] {
            match memory_manager.allocate_from_existing_storage(&root, root_device_index) {
                Ok(shadow) => shadows.push(shadow),
                Err(err) => {
                    for shadow in &shadows {
                        memory_manager.free(shadow);
                    }
                    driver
                        .ipc_imports()
                        .release(descriptor.handle, memory_manager.as_ref());
                    return Err(err);
                }
            }
        }

        let mut flags = EventPoolFlags::IPC;
        flags.set(EventPoolFlags::HOST_VISIBLE, descriptor.host_visible);
        flags.set(EventPoolFlags::KERNEL_TIMESTAMP, descriptor.timestamp);
        flags.set(
            EventPoolFlags::KERNEL_MAPPED_TIMESTAMP,
            descriptor.mapped_timestamp,
        );
        debug!(
            handle = descriptor.handle,
            num_events,
            event_size = descriptor.event_size,
            shadows = shadows.len(),
            "Opened IPC event pool"
        );
        Ok(Arc::new(Self {
            driver: driver.clone(),
            devices,
            root_device_indices: roots,
            num_events,
            geometry,
            flags,
            implicit_scaling_capable: descriptor.implicit_scaling,
            imported: true,
            memory: Mutex::new(Some(Arc::new(PoolMemory {
                backing: Backing::Imported {
                    handle: descriptor.handle,
                    root,
                    shadows,
                },
                driver: driver.clone(),
            }))),
        }))
    }

    /// Serialize the pool for another process.
    pub fn ipc_handle(&self) -> Result<IpcEventPoolHandle> {
        if !self.flags.contains(EventPoolFlags::IPC) {
            return Err(SyncError::Unsupported(
                "event pool was not created with the IPC flag".into(),
            ));
        }
        if self.devices.len() > 1 && !self.implicit_scaling_capable {
            return Err(SyncError::Unsupported(
                "IPC export of a multi-device pool needs implicit scaling".into(),
            ));
        }
        let memory = self.memory()?;
        let allocation = memory.default_allocation();
        let handle = self
            .driver
            .memory_manager()
            .shareable_handle(allocation)
            .map_err(|err| match err.kind() {
                ErrorKind::OutOfHostMemory => err,
                _ => SyncError::OutOfHostMemory(format!(
                    "no shareable handle for event pool allocation: {err}"
                )),
            })?;
        Ok(IpcPoolDescriptor {
            handle,
            num_events: u64::from(self.num_events),
            event_size: self.geometry.event_size as u32,
            root_device_index: allocation.root_device_index,
            max_event_packets: self.geometry.max_event_packets,
            num_devices: self.devices.len() as u32,
            device_pool: allocation.placement == MemoryPlacement::DeviceLocal,
            host_visible: self.flags.contains(EventPoolFlags::HOST_VISIBLE),
            implicit_scaling: self.implicit_scaling_capable,
            timestamp: self.flags.contains(EventPoolFlags::KERNEL_TIMESTAMP),
            mapped_timestamp: self.flags.contains(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP),
        }
        .encode())
    }

    /// Release this pool's reference to an imported allocation. Idempotent.
    pub fn close_ipc_handle(&self) -> Result<()> {
        if !self.imported {
            return Err(SyncError::InvalidArgument(
                "close_ipc_handle on a pool that was not opened from an IPC handle".into(),
            ));
        }
        if lock(&self.memory).take().is_some() {
            debug!(num_events = self.num_events, "Closed IPC event pool");
        }
        Ok(())
    }

    /// Carve event `desc.index` out of the pool.
    pub fn create_event(self: &Arc<Self>, desc: &EventDesc) -> Result<Arc<Event>> {
        if desc.index >= self.num_events {
            return Err(SyncError::IndexOutOfRange {
                index: desc.index,
                capacity: self.num_events,
            });
        }
        let memory = self.memory()?;
        let offset = memory.base_offset() + desc.index as usize * self.geometry.event_size;
        let device = self.devices[0].clone();
        let config = self.driver.config().clone();

        let event = Event::from_pool(SlotEventInit {
            index: desc.index,
            signal_scope: desc.signal_scope,
            wait_scope: desc.wait_scope,
            signal_all_packets: device.signal_all_event_packets(&config),
            device,
            memory,
            offset,
            geometry: self.geometry,
            flags: self.flags,
            implicit_scaling: self.implicit_scaling_capable,
            config,
        });
        if !self.imported {
            event.clear_all_packets()?;
        }
        debug!(
            index = desc.index,
            offset,
            imported = self.imported,
            "Event created"
        );
        Ok(event)
    }

    pub(crate) fn memory(&self) -> Result<Arc<PoolMemory>> {
        lock(&self.memory).clone().ok_or_else(|| {
            SyncError::InvalidArgument("event pool IPC handle was closed".into())
        })
    }

    #[inline]
    pub fn event_size(&self) -> usize {
        self.geometry.event_size
    }

    #[inline]
    pub fn num_events(&self) -> u32 {
        self.num_events
    }

    #[inline]
    pub fn max_event_packets(&self) -> u32 {
        self.geometry.max_event_packets
    }

    #[inline]
    pub fn max_kernel_count(&self) -> u32 {
        self.geometry.max_kernel_count
    }

    #[inline]
    pub fn geometry(&self) -> &PoolGeometry {
        &self.geometry
    }

    #[inline]
    pub fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    #[inline]
    pub fn is_imported_ipc_pool(&self) -> bool {
        self.imported
    }

    #[inline]
    pub fn is_implicit_scaling_capable(&self) -> bool {
        self.implicit_scaling_capable
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn root_device_indices(&self) -> &[u32] {
        &self.root_device_indices
    }

    /// Allocation backing the pool on `root_device_index`. `None` once an
    /// imported pool is closed, or when the pool does not span that root.
    pub fn allocation_for(&self, root_device_index: u32) -> Option<Arc<Allocation>> {
        let memory = lock(&self.memory).clone()?;
        memory.find_allocation(root_device_index).cloned()
    }

    /// Byte offset of slot 0 inside the pool's allocation.
    pub fn pool_offset(&self) -> usize {
        lock(&self.memory)
            .as_ref()
            .map_or(0, |memory| memory.base_offset())
    }
}

fn resolve_devices(driver: &DriverHandle, handles: &[DeviceHandle]) -> Result<Vec<Arc<Device>>> {
    let mut devices: Vec<Arc<Device>> = Vec::new();
    if handles.is_empty() {
        for &handle in driver.device_handles() {
            let device = driver.device(handle)?;
            let root = driver
                .root_device(device.root_device_index())
                .cloned()
                .unwrap_or(device);
            if !devices.iter().any(|d| d.id() == root.id()) {
                devices.push(root);
            }
        }
        return Ok(devices);
    }
    for &handle in handles {
        let device = driver.device(handle)?;
        if !devices.iter().any(|d| d.id() == device.id()) {
            devices.push(device);
        }
    }
    Ok(devices)
}

fn unique_roots(devices: &[Arc<Device>]) -> Vec<u32> {
    let mut roots = Vec::new();
    for device in devices {
        if !roots.contains(&device.root_device_index()) {
            roots.push(device.root_device_index());
        }
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_size_is_aligned_packet_span() {
        let g = PoolGeometry::new(TimestampWidth::Bits32, 16, 3, 64).expect("valid");
        assert_eq!(g.packet_size, 16);
        assert_eq!(g.event_size, 256);

        let g = PoolGeometry::new(TimestampWidth::Bits64, 3, 3, 64).expect("valid");
        assert_eq!(g.packet_size, 32);
        assert_eq!(g.event_size, 128);

        let g = PoolGeometry::new(TimestampWidth::Bits32, 5, 3, 256).expect("valid");
        assert_eq!(g.event_size, 256);
    }

    #[test]
    fn geometry_rejects_bad_alignment_and_zero_packets() {
        assert!(PoolGeometry::new(TimestampWidth::Bits32, 16, 3, 48).is_err());
        assert!(PoolGeometry::new(TimestampWidth::Bits32, 0, 3, 64).is_err());
    }

    #[test]
    fn pool_size_overflow_is_invalid_argument() {
        let g = PoolGeometry::new(TimestampWidth::Bits64, 48, 3, 64).expect("valid");
        assert_eq!(g.pool_size(4).expect("fits"), 4 * 1536);
        if usize::BITS == 32 {
            assert!(g.pool_size(u32::MAX).is_err());
        }
    }

    #[test]
    fn mapped_timestamp_counts_as_timestamp_pool() {
        assert!(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP.is_timestamp());
        assert!(!(EventPoolFlags::HOST_VISIBLE | EventPoolFlags::IPC).is_timestamp());
    }
}
