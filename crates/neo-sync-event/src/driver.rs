//! Driver and context objects.
//!
//! # Ownership
//!
//! The [`DriverHandle`] owns the device list, the external memory manager,
//! the immutable [`SyncConfig`] and the driver-wide registries (IPC imports,
//! timestamp pool caches). A [`Context`] owns two handle arenas, one for
//! event pools and one for events. Destroying a pool or event releases its
//! arena slot; the backing memory goes away once the last event carved from
//! it is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use neo_sync_core::config::DeviceHierarchy;
use neo_sync_core::device::Device;
use neo_sync_core::handle::{HandleTable, RawHandle};
use neo_sync_core::memory::MemoryManager;
use neo_sync_core::types::DeviceId;
use neo_sync_core::{Result, SyncConfig, SyncError};
use tracing::debug;

use crate::counter::CounterBasedEventDesc;
use crate::event::{Event, EventDesc};
use crate::ipc::{ImportRegistry, IpcEventPoolHandle};
use crate::lock;
use crate::pool::{EventPool, EventPoolDesc};
use crate::pool_cache::TimestampPoolCache;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(RawHandle);

        impl $name {
            pub const NULL: Self = Self(RawHandle::NULL);

            #[inline]
            pub fn as_u64(self) -> u64 {
                self.0.as_u64()
            }
        }
    };
}

opaque_handle!(
    /// Device or sub-device known to a driver.
    DeviceHandle
);
opaque_handle!(EventPoolHandle);
opaque_handle!(EventHandle);

// ─── Driver ──────────────────────────────────────────────────────────────────

pub struct DriverHandle {
    roots: Vec<Arc<Device>>,
    devices: HandleTable<Arc<Device>>,
    by_id: HashMap<DeviceId, DeviceHandle>,
    exposed: Vec<DeviceHandle>,
    memory_manager: Arc<dyn MemoryManager>,
    config: Arc<SyncConfig>,
    ipc_imports: Mutex<ImportRegistry>,
    timestamp_pools: Mutex<HashMap<u32, Arc<TimestampPoolCache>>>,
}

impl DriverHandle {
    /// Register `roots` (and their sub-devices) with the driver.
    pub fn new(
        roots: Vec<Arc<Device>>,
        memory_manager: Arc<dyn MemoryManager>,
        config: Arc<SyncConfig>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if roots.is_empty() {
            return Err(SyncError::InvalidArgument(
                "driver needs at least one root device".into(),
            ));
        }

        let mut devices = HandleTable::new("device");
        let mut by_id = HashMap::new();
        let mut exposed = Vec::new();
        for root in &roots {
            if root.id().is_sub_device() || by_id.contains_key(&root.id()) {
                return Err(SyncError::InvalidArgument(format!(
                    "device {} is not a unique root device",
                    root.id()
                )));
            }
            let root_handle = DeviceHandle(devices.insert(root.clone()));
            by_id.insert(root.id(), root_handle);
            let mut tiles = Vec::new();
            for sub in root.sub_devices() {
                let handle = DeviceHandle(devices.insert(sub.clone()));
                by_id.insert(sub.id(), handle);
                tiles.push(handle);
            }
            match config.device_hierarchy {
                DeviceHierarchy::Flat if !tiles.is_empty() => exposed.extend(tiles),
                _ => exposed.push(root_handle),
            }
        }

        debug!(
            roots = roots.len(),
            exposed = exposed.len(),
            hierarchy = ?config.device_hierarchy,
            "Driver initialized"
        );
        Ok(Arc::new(Self {
            roots,
            devices,
            by_id,
            exposed,
            memory_manager,
            config,
            ipc_imports: Mutex::new(ImportRegistry::default()),
            timestamp_pools: Mutex::new(HashMap::new()),
        }))
    }

    #[inline]
    pub fn config(&self) -> &Arc<SyncConfig> {
        &self.config
    }

    #[inline]
    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory_manager
    }

    /// Devices exposed to the application under the configured hierarchy.
    pub fn device_handles(&self) -> &[DeviceHandle] {
        &self.exposed
    }

    pub fn sub_device_handles(&self, device: DeviceHandle) -> Result<Vec<DeviceHandle>> {
        let device = self.device(device)?;
        Ok(device
            .sub_devices()
            .iter()
            .filter_map(|sub| self.by_id.get(&sub.id()).copied())
            .collect())
    }

    /// Resolve a handle. Null and stale handles are `InvalidArgument`.
    pub fn device(&self, handle: DeviceHandle) -> Result<Arc<Device>> {
        self.devices.get(handle.0).cloned()
    }

    pub fn device_handle_of(&self, id: DeviceId) -> Option<DeviceHandle> {
        self.by_id.get(&id).copied()
    }

    pub fn root_device(&self, root_device_index: u32) -> Option<&Arc<Device>> {
        self.roots
            .iter()
            .find(|d| d.root_device_index() == root_device_index)
    }

    pub fn root_devices(&self) -> &[Arc<Device>] {
        &self.roots
    }

    /// Number of live imports of shareable `handle` across all pools.
    pub fn ipc_import_refcount(&self, handle: u64) -> usize {
        lock(&self.ipc_imports).refcount(handle)
    }

    /// `(hits, misses, released)` of the timestamp pool cache of a root device.
    pub fn timestamp_pool_stats(&self, root_device_index: u32) -> Option<(u64, u64, u64)> {
        lock(&self.timestamp_pools)
            .get(&root_device_index)
            .map(|cache| cache.stats())
    }

    pub(crate) fn ipc_imports(&self) -> MutexGuard<'_, ImportRegistry> {
        lock(&self.ipc_imports)
    }

    /// The timestamp pool cache of `root_device_index`, created on first use.
    pub(crate) fn timestamp_pool_cache(&self, root_device_index: u32) -> Arc<TimestampPoolCache> {
        lock(&self.timestamp_pools)
            .entry(root_device_index)
            .or_insert_with(|| {
                Arc::new(TimestampPoolCache::new(
                    root_device_index,
                    self.config.timestamp_pool_chunk_size,
                    self.memory_manager.clone(),
                ))
            })
            .clone()
    }
}

// ─── Context ─────────────────────────────────────────────────────────────────

pub struct Context {
    driver: Arc<DriverHandle>,
    devices: Vec<Arc<Device>>,
    pools: Mutex<HandleTable<Arc<EventPool>>>,
    events: Mutex<HandleTable<Arc<Event>>>,
}

impl Context {
    /// An empty device list covers every exposed device.
    pub fn new(driver: &Arc<DriverHandle>, devices: &[DeviceHandle]) -> Result<Arc<Self>> {
        let handles = if devices.is_empty() {
            driver.device_handles()
        } else {
            devices
        };
        let devices = handles
            .iter()
            .map(|&h| driver.device(h))
            .collect::<Result<Vec<_>>>()?;
        Ok(Arc::new(Self {
            driver: driver.clone(),
            devices,
            pools: Mutex::new(HandleTable::new("event pool")),
            events: Mutex::new(HandleTable::new("event")),
        }))
    }

    #[inline]
    pub fn driver(&self) -> &Arc<DriverHandle> {
        &self.driver
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Unique root-device indices of the context's devices, in device order.
    pub fn root_device_indices(&self) -> Vec<u32> {
        let mut roots = Vec::new();
        for device in &self.devices {
            if !roots.contains(&device.root_device_index()) {
                roots.push(device.root_device_index());
            }
        }
        roots
    }

    pub fn create_event_pool(
        &self,
        devices: &[DeviceHandle],
        desc: &EventPoolDesc,
    ) -> Result<EventPoolHandle> {
        let pool = EventPool::create(&self.driver, self, devices, desc)?;
        Ok(EventPoolHandle(lock(&self.pools).insert(pool)))
    }

    pub fn open_ipc_event_pool(&self, handle: &IpcEventPoolHandle) -> Result<EventPoolHandle> {
        let pool = EventPool::open_ipc_handle(&self.driver, self, handle)?;
        Ok(EventPoolHandle(lock(&self.pools).insert(pool)))
    }

    pub fn event_pool(&self, handle: EventPoolHandle) -> Result<Arc<EventPool>> {
        lock(&self.pools).get(handle.0).cloned()
    }

    /// Release the pool's arena slot. Events already created keep the
    /// backing memory alive.
    pub fn destroy_event_pool(&self, handle: EventPoolHandle) -> Result<()> {
        let pool = lock(&self.pools).remove(handle.0)?;
        debug!(num_events = pool.num_events(), "Event pool destroyed");
        Ok(())
    }

    pub fn create_event(&self, pool: EventPoolHandle, desc: &EventDesc) -> Result<EventHandle> {
        let pool = self.event_pool(pool)?;
        let event = pool.create_event(desc)?;
        Ok(EventHandle(lock(&self.events).insert(event)))
    }

    pub fn create_counter_based_event(
        &self,
        device: DeviceHandle,
        desc: CounterBasedEventDesc,
    ) -> Result<EventHandle> {
        let device = self.driver.device(device)?;
        let event = Event::create_counter_based(device, self.driver.config().clone(), desc)?;
        Ok(EventHandle(lock(&self.events).insert(event)))
    }

    pub fn event(&self, handle: EventHandle) -> Result<Arc<Event>> {
        lock(&self.events).get(handle.0).cloned()
    }

    /// Release the event back to the arena. The handle is stale afterwards.
    pub fn destroy_event(&self, handle: EventHandle) -> Result<()> {
        lock(&self.events).remove(handle.0).map(drop)
    }

    pub fn live_event_pools(&self) -> usize {
        lock(&self.pools).len()
    }

    pub fn live_events(&self) -> usize {
        lock(&self.events).len()
    }
}
