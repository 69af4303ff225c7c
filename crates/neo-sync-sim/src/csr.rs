//! Simulated command-stream receivers.
//!
//! On the hardware backend GPU writes land directly in host storage. On TBX
//! and AUB they land in a device image held by [`SimDeviceMemory`] and only
//! reach host storage when the engine downloads the allocation, which is the
//! incoherence the synchronization engine has to handle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use neo_sync_core::Result;
use neo_sync_core::csr::{CommandStreamReceiver, CsrBackend};
use neo_sync_core::memory::Allocation;
use neo_sync_core::types::{DeviceId, TaskCount};
use tracing::{trace, warn};

/// Device-side copies of host storages, shared by every receiver of a
/// simulated platform.
#[derive(Default)]
pub struct SimDeviceMemory {
    images: Mutex<HashMap<usize, Vec<u8>>>,
}

impl SimDeviceMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn images(&self) -> MutexGuard<'_, HashMap<usize, Vec<u8>>> {
        self.images.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(allocation: &Allocation) -> usize {
        Arc::as_ptr(allocation.storage()) as usize
    }

    fn with_image<R>(
        &self,
        allocation: &Allocation,
        f: impl FnOnce(&mut Vec<u8>) -> Result<R>,
    ) -> Result<R> {
        let mut images = self.images();
        let image = match images.entry(Self::key(allocation)) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let storage = allocation.storage();
                entry.insert(storage.snapshot(0, storage.len())?)
            }
        };
        f(image)
    }

    /// Bytes the device currently sees at `offset`.
    pub fn read(&self, allocation: &Allocation, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.with_image(allocation, |image| {
            image
                .get(offset..offset + len)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| out_of_range(offset, len, image.len()))
        })
    }
}

fn out_of_range(offset: usize, len: usize, capacity: usize) -> neo_sync_core::SyncError {
    neo_sync_core::SyncError::InvalidArgument(format!(
        "device image range {offset}+{len} outside {capacity} bytes"
    ))
}

/// Download and upload counters for assertions.
#[derive(Default)]
pub struct CsrStats {
    pub downloads: AtomicU64,
    pub blocking_downloads: AtomicU64,
    pub uploads: AtomicU64,
    pub hang_checks: AtomicU64,
}

pub struct SimCsr {
    id: u32,
    owner: DeviceId,
    backend: CsrBackend,
    device_memory: Arc<SimDeviceMemory>,
    hang: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    task_counts: Mutex<HashMap<u64, TaskCount>>,
    stats: CsrStats,
}

impl SimCsr {
    pub fn new(
        id: u32,
        owner: DeviceId,
        backend: CsrBackend,
        device_memory: Arc<SimDeviceMemory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            owner,
            backend,
            device_memory,
            hang: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            task_counts: Mutex::new(HashMap::new()),
            stats: CsrStats::default(),
        })
    }

    pub fn stats(&self) -> &CsrStats {
        &self.stats
    }

    /// Record a submission referencing `allocation` and return its task count.
    pub fn submit(&self, allocation: &Allocation) -> TaskCount {
        let task = self.submitted.fetch_add(1, Ordering::AcqRel) + 1;
        self.task_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(allocation.id, task);
        trace!(csr = self.id, task, allocation = allocation.id, "Submitted");
        task
    }

    /// Retire every submitted task.
    pub fn retire_all(&self) {
        let submitted = self.submitted.load(Ordering::Acquire);
        self.completed.fetch_max(submitted, Ordering::AcqRel);
    }

    /// Write as the GPU would.
    pub fn gpu_write(&self, allocation: &Allocation, offset: usize, data: &[u8]) -> Result<()> {
        if self.backend == CsrBackend::Hardware {
            return allocation.storage().write(offset, data);
        }
        self.device_memory.with_image(allocation, |image| {
            let capacity = image.len();
            image
                .get_mut(offset..offset + data.len())
                .ok_or_else(|| out_of_range(offset, data.len(), capacity))?
                .copy_from_slice(data);
            Ok(())
        })
    }

    /// Submit, write and retire in one step.
    pub fn execute_write(&self, allocation: &Allocation, offset: usize, data: &[u8]) -> Result<TaskCount> {
        let task = self.submit(allocation);
        self.gpu_write(allocation, offset, data)?;
        self.retire_all();
        Ok(task)
    }

    pub fn inject_hang(&self) {
        warn!(csr = self.id, "Injecting simulated GPU hang");
        self.hang.store(true, Ordering::Release);
    }

    pub fn clear_hang(&self) {
        self.hang.store(false, Ordering::Release);
    }
}

impl CommandStreamReceiver for SimCsr {
    fn id(&self) -> u32 {
        self.id
    }

    fn owner(&self) -> DeviceId {
        self.owner
    }

    fn backend(&self) -> CsrBackend {
        self.backend
    }

    fn is_gpu_hang_detected(&self) -> bool {
        self.stats.hang_checks.fetch_add(1, Ordering::Relaxed);
        self.hang.load(Ordering::Acquire)
    }

    fn download_allocation(&self, allocation: &Allocation, blocking: bool) {
        self.stats.downloads.fetch_add(1, Ordering::Relaxed);
        if blocking {
            self.stats.blocking_downloads.fetch_add(1, Ordering::Relaxed);
        }
        if self.backend == CsrBackend::Hardware {
            return;
        }
        let copied = self
            .device_memory
            .with_image(allocation, |image| allocation.storage().write(0, image));
        if let Err(err) = copied {
            warn!(csr = self.id, %err, "Download failed");
        }
    }

    fn upload_allocation(&self, allocation: &Allocation, offset: usize, len: usize) {
        self.stats.uploads.fetch_add(1, Ordering::Relaxed);
        if self.backend == CsrBackend::Hardware {
            return;
        }
        let copied = self.device_memory.with_image(allocation, |image| {
            let capacity = image.len();
            let target = image
                .get_mut(offset..offset + len)
                .ok_or_else(|| out_of_range(offset, len, capacity))?;
            allocation.storage().read(offset, target)
        });
        if let Err(err) = copied {
            warn!(csr = self.id, %err, "Upload failed");
        }
    }

    fn task_count_for(&self, allocation: &Allocation) -> TaskCount {
        self.task_counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&allocation.id)
            .copied()
            .unwrap_or(0)
    }

    fn completed_task_count(&self) -> TaskCount {
        self.completed.load(Ordering::Acquire)
    }
}
