//! Allocation model and the memory-manager interface.
//!
//! The engine never owns a real allocator. It asks a [`MemoryManager`] for
//! GPU-addressable, host-mappable [`Allocation`]s and frees them through the
//! same trait. Each allocation exposes its backing bytes as [`HostStorage`];
//! multi-root allocations and IPC shadows share one storage so that a write
//! through any root is visible through all of them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, SyncError};
use crate::types::GpuAddress;

/// Where the allocation lives from the allocator's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryPlacement {
    DeviceLocal,
    HostVisible,
}

/// Allocation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationProperties {
    pub size: usize,
    pub alignment: usize,
    pub root_device_index: u32,
    pub placement: MemoryPlacement,
    /// Must be exportable through an OS shareable handle.
    pub shareable: bool,
}

impl AllocationProperties {
    /// The out-of-memory error matching this request.
    ///
    /// Host-visible and shareable requests report host memory exhaustion,
    /// everything else device memory exhaustion.
    pub fn out_of_memory(&self) -> SyncError {
        if self.placement == MemoryPlacement::HostVisible || self.shareable {
            SyncError::OutOfHostMemory(format!(
                "{} bytes on root device {}",
                self.size, self.root_device_index
            ))
        } else {
            SyncError::OutOfDeviceMemory {
                requested_bytes: self.size,
                root_device_index: self.root_device_index,
            }
        }
    }
}

/// Host view of an allocation's bytes.
pub struct HostStorage {
    bytes: Mutex<Vec<u8>>,
}

impl HostStorage {
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let bytes = self.lock();
        let range = checked_range(offset, out.len(), bytes.len())?;
        out.copy_from_slice(&bytes[range]);
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut bytes = self.lock();
        let range = checked_range(offset, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, value: u8) -> Result<()> {
        let mut bytes = self.lock();
        let range = checked_range(offset, len, bytes.len())?;
        bytes[range].fill(value);
        Ok(())
    }

    /// Copy `len` bytes at `offset` out of storage.
    pub fn snapshot(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; len];
        self.read(offset, &mut out)?;
        Ok(out)
    }
}

fn checked_range(offset: usize, len: usize, capacity: usize) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= capacity)
        .ok_or_else(|| {
            SyncError::InvalidArgument(format!(
                "range {offset}+{len} outside allocation of {capacity} bytes"
            ))
        })?;
    Ok(offset..end)
}

/// One physical allocation on one root device.
pub struct Allocation {
    pub id: u64,
    pub gpu_address: GpuAddress,
    pub root_device_index: u32,
    pub size: usize,
    pub placement: MemoryPlacement,
    pub shareable: bool,
    storage: Arc<HostStorage>,
}

impl Allocation {
    pub fn new(
        id: u64,
        gpu_address: GpuAddress,
        props: &AllocationProperties,
        storage: Arc<HostStorage>,
    ) -> Self {
        Self {
            id,
            gpu_address,
            root_device_index: props.root_device_index,
            size: props.size,
            placement: props.placement,
            shareable: props.shareable,
            storage,
        }
    }

    /// Host view of the allocation.
    #[inline]
    pub fn storage(&self) -> &Arc<HostStorage> {
        &self.storage
    }

    pub fn shares_storage_with(&self, other: &Allocation) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("root_device_index", &self.root_device_index)
            .field("size", &self.size)
            .field("placement", &self.placement)
            .finish()
    }
}

/// One logical allocation replicated per root device over shared storage.
#[derive(Clone, Debug)]
pub struct MultiAllocation {
    allocations: Vec<Arc<Allocation>>,
}

impl MultiAllocation {
    /// The first allocation is the default root.
    pub fn new(allocations: Vec<Arc<Allocation>>) -> Result<Self> {
        if allocations.is_empty() {
            return Err(SyncError::InvalidArgument(
                "multi-root allocation needs at least one root".into(),
            ));
        }
        Ok(Self { allocations })
    }

    pub fn default_allocation(&self) -> &Arc<Allocation> {
        &self.allocations[0]
    }

    pub fn get(&self, root_device_index: u32) -> Option<&Arc<Allocation>> {
        self.allocations
            .iter()
            .find(|a| a.root_device_index == root_device_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Allocation>> {
        self.allocations.iter()
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

/// External allocator consumed by event pools.
pub trait MemoryManager: Send + Sync {
    fn allocate(&self, props: &AllocationProperties) -> Result<Arc<Allocation>>;

    /// One allocation per root, all sharing one host storage.
    fn allocate_multi_root(
        &self,
        roots: &[u32],
        props: &AllocationProperties,
    ) -> Result<MultiAllocation>;

    /// A new allocation on `root_device_index` aliasing `source`'s storage.
    fn allocate_from_existing_storage(
        &self,
        source: &Allocation,
        root_device_index: u32,
    ) -> Result<Arc<Allocation>>;

    fn free(&self, allocation: &Allocation);

    /// OS handle another process can import.
    fn shareable_handle(&self, allocation: &Allocation) -> Result<u64>;

    fn import_from_handle(
        &self,
        handle: u64,
        props: &AllocationProperties,
    ) -> Result<Arc<Allocation>>;
}
