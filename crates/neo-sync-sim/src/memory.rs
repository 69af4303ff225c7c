//! Host-memory allocator standing in for the driver's memory manager.
//!
//! Every allocation is plain host memory with a synthetic GPU address. Byte
//! usage is accounted per root device and checked against an optional budget
//! so out-of-memory paths can be exercised. Shareable handles live in a
//! registry keyed by handle value; importing from a second driver that shares
//! this manager models cross-process IPC.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use neo_sync_core::memory::{
    Allocation, AllocationProperties, HostStorage, MemoryManager, MultiAllocation,
};
use neo_sync_core::types::align_up;
use neo_sync_core::{Result, SyncError};
use tracing::{debug, error};

const GPU_VA_BASE: u64 = 0xFF00_0000_0000;
const HANDLE_BASE: u64 = 0x1000;

// ─── Accounting ──────────────────────────────────────────────────────────────

/// Byte counters for one root device.
#[derive(Default)]
struct MemoryAccounting {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryAccounting {
    #[inline]
    fn on_alloc(&self, bytes: usize) {
        let prev = self.current.fetch_add(bytes, Ordering::Relaxed);
        self.peak.fetch_max(prev + bytes, Ordering::Relaxed);
    }

    #[inline]
    fn on_free(&self, bytes: usize) {
        self.current.fetch_sub(bytes, Ordering::Relaxed);
    }

    #[inline]
    fn snapshot(&self) -> (usize, usize) {
        (
            self.current.load(Ordering::Relaxed),
            self.peak.load(Ordering::Relaxed),
        )
    }
}

struct Shared {
    storage: Arc<HostStorage>,
    size: usize,
}

#[derive(Default)]
struct Registry {
    /// Live allocation id → (root, bytes charged).
    live: HashMap<u64, (u32, usize)>,
    /// Allocation id → number of `free` calls seen.
    frees: HashMap<u64, u32>,
    shared: HashMap<u64, Shared>,
    /// Allocation id → exported handle.
    exported: HashMap<u64, u64>,
}

// ─── Memory manager ──────────────────────────────────────────────────────────

pub struct SimMemoryManager {
    next_id: AtomicU64,
    next_gpu_va: AtomicU64,
    budgets: HashMap<u32, usize>,
    accounting: Mutex<HashMap<u32, Arc<MemoryAccounting>>>,
    registry: Mutex<Registry>,
    fail_shareable: AtomicBool,
}

impl Default for SimMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SimMemoryManager {
    pub fn new() -> Self {
        Self::with_budgets(HashMap::new())
    }

    /// Per-root byte budgets. Roots without an entry are unbounded.
    pub fn with_budgets(budgets: HashMap<u32, usize>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_gpu_va: AtomicU64::new(GPU_VA_BASE),
            budgets,
            accounting: Mutex::new(HashMap::new()),
            registry: Mutex::new(Registry::default()),
            fail_shareable: AtomicBool::new(false),
        }
    }

    /// Make `shareable_handle` fail from now on.
    pub fn set_fail_shareable(&self, fail: bool) {
        self.fail_shareable.store(fail, Ordering::Relaxed);
    }

    /// `(current, peak)` bytes charged to `root_device_index`.
    pub fn usage(&self, root_device_index: u32) -> (usize, usize) {
        self.accounting_for(root_device_index).snapshot()
    }

    /// Number of `free` calls seen for allocation `id`.
    pub fn free_count(&self, id: u64) -> u32 {
        self.registry().frees.get(&id).copied().unwrap_or(0)
    }

    pub fn is_live(&self, id: u64) -> bool {
        self.registry().live.contains_key(&id)
    }

    pub fn live_allocations(&self) -> usize {
        self.registry().live.len()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accounting_for(&self, root: u32) -> Arc<MemoryAccounting> {
        self.accounting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(root)
            .or_default()
            .clone()
    }

    fn charge(&self, props: &AllocationProperties) -> Result<()> {
        let accounting = self.accounting_for(props.root_device_index);
        if let Some(&budget) = self.budgets.get(&props.root_device_index) {
            let (current, _) = accounting.snapshot();
            if current.saturating_add(props.size) > budget {
                debug!(
                    root = props.root_device_index,
                    requested_bytes = props.size,
                    current,
                    budget,
                    "Allocation over budget"
                );
                return Err(props.out_of_memory());
            }
        }
        accounting.on_alloc(props.size);
        Ok(())
    }

    fn make_allocation(
        &self,
        props: &AllocationProperties,
        storage: Arc<HostStorage>,
    ) -> Result<Arc<Allocation>> {
        self.charge(props)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let alignment = props.alignment.max(64).next_power_of_two() as u64;
        let span = align_up(props.size.max(1), 4096) as u64;
        let mut gpu_address = 0;
        let _ = self
            .next_gpu_va
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |va| {
                let aligned = (va + alignment - 1) & !(alignment - 1);
                gpu_address = aligned;
                Some(aligned + span)
            });
        self.registry()
            .live
            .insert(id, (props.root_device_index, props.size));
        Ok(Arc::new(Allocation::new(id, gpu_address, props, storage)))
    }
}

impl MemoryManager for SimMemoryManager {
    fn allocate(&self, props: &AllocationProperties) -> Result<Arc<Allocation>> {
        if props.size == 0 {
            return Err(SyncError::InvalidArgument("zero-sized allocation".into()));
        }
        self.make_allocation(props, Arc::new(HostStorage::zeroed(props.size)))
    }

    fn allocate_multi_root(
        &self,
        roots: &[u32],
        props: &AllocationProperties,
    ) -> Result<MultiAllocation> {
        if props.size == 0 || roots.is_empty() {
            return Err(SyncError::InvalidArgument(
                "multi-root allocation needs a size and at least one root".into(),
            ));
        }
        let storage = Arc::new(HostStorage::zeroed(props.size));
        let mut allocations = Vec::with_capacity(roots.len());
        for &root in roots {
            let root_props = AllocationProperties {
                root_device_index: root,
                ..props.clone()
            };
            match self.make_allocation(&root_props, storage.clone()) {
                Ok(allocation) => allocations.push(allocation),
                Err(err) => {
                    for allocation in &allocations {
                        self.free(allocation);
                    }
                    return Err(err);
                }
            }
        }
        MultiAllocation::new(allocations)
    }

    fn allocate_from_existing_storage(
        &self,
        source: &Allocation,
        root_device_index: u32,
    ) -> Result<Arc<Allocation>> {
        let props = AllocationProperties {
            size: source.size,
            alignment: 64,
            root_device_index,
            placement: source.placement,
            shareable: source.shareable,
        };
        self.make_allocation(&props, source.storage().clone())
    }

    fn free(&self, allocation: &Allocation) {
        let mut registry = self.registry();
        *registry.frees.entry(allocation.id).or_default() += 1;
        match registry.live.remove(&allocation.id) {
            Some((root, bytes)) => {
                if let Some(handle) = registry.exported.remove(&allocation.id) {
                    registry.shared.remove(&handle);
                }
                drop(registry);
                self.accounting_for(root).on_free(bytes);
            }
            None => {
                error!(id = allocation.id, "Double free of simulated allocation");
            }
        }
    }

    fn shareable_handle(&self, allocation: &Allocation) -> Result<u64> {
        if !allocation.shareable || self.fail_shareable.load(Ordering::Relaxed) {
            return Err(SyncError::OutOfHostMemory(format!(
                "allocation {} cannot be exported",
                allocation.id
            )));
        }
        let mut registry = self.registry();
        if let Some(&handle) = registry.exported.get(&allocation.id) {
            return Ok(handle);
        }
        let handle = HANDLE_BASE + allocation.id;
        registry.exported.insert(allocation.id, handle);
        registry.shared.insert(
            handle,
            Shared {
                storage: allocation.storage().clone(),
                size: allocation.size,
            },
        );
        Ok(handle)
    }

    fn import_from_handle(
        &self,
        handle: u64,
        props: &AllocationProperties,
    ) -> Result<Arc<Allocation>> {
        let (storage, size) = {
            let registry = self.registry();
            let shared = registry.shared.get(&handle).ok_or_else(|| {
                SyncError::InvalidArgument(format!("unknown shareable handle {handle:#x}"))
            })?;
            (shared.storage.clone(), shared.size)
        };
        if props.size > size {
            return Err(SyncError::InvalidArgument(format!(
                "import of {} bytes from handle {handle:#x} backing only {size} bytes",
                props.size
            )));
        }
        self.make_allocation(props, storage)
    }
}
