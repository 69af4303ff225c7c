//! Command-stream receiver interface and backend download strategy.
//!
//! A command-stream receiver (CSR) is the submission endpoint of one engine.
//! On real hardware the host reads device-written memory directly. On the
//! TBX and AUB validation backends host and device memory are not coherent,
//! so the host must download an allocation through the receiver that issued
//! the work before reading it.

use crate::memory::Allocation;
use crate::types::{DeviceId, TaskCount};

/// Execution backend of a receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsrBackend {
    Hardware,
    /// Network transport to a simulator.
    Tbx,
    /// TBX with a parallel AUB capture.
    TbxWithAub,
    /// File capture only.
    Aub,
}

impl CsrBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Tbx => "tbx",
            Self::TbxWithAub => "tbx_with_aub",
            Self::Aub => "aub",
        }
    }
}

/// How the host makes device writes visible before reading them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadStrategy {
    /// Coherent memory, reads are direct.
    Coherent,
    /// Every read must be preceded by an explicit download.
    Explicit,
}

impl DownloadStrategy {
    pub fn for_backend(backend: CsrBackend) -> Self {
        match backend {
            CsrBackend::Hardware => Self::Coherent,
            CsrBackend::Tbx | CsrBackend::TbxWithAub | CsrBackend::Aub => Self::Explicit,
        }
    }

    #[inline]
    pub fn needs_download(self) -> bool {
        self == Self::Explicit
    }

    /// Download through `csr` when this strategy requires it.
    pub fn download(self, csr: &dyn CommandStreamReceiver, allocation: &Allocation, blocking: bool) {
        if self.needs_download() {
            csr.download_allocation(allocation, blocking);
        }
    }

    /// Push a host write to the device view when this strategy requires it.
    pub fn upload(
        self,
        csr: &dyn CommandStreamReceiver,
        allocation: &Allocation,
        offset: usize,
        len: usize,
    ) {
        if self.needs_download() {
            csr.upload_allocation(allocation, offset, len);
        }
    }
}

/// Submission endpoint consumed by the synchronization engine.
pub trait CommandStreamReceiver: Send + Sync {
    fn id(&self) -> u32;

    /// Device (or sub-device) that issues work on this receiver.
    fn owner(&self) -> DeviceId;

    fn backend(&self) -> CsrBackend;

    fn download_strategy(&self) -> DownloadStrategy {
        DownloadStrategy::for_backend(self.backend())
    }

    fn is_gpu_hang_detected(&self) -> bool;

    /// Make device writes to `allocation` visible to host reads.
    fn download_allocation(&self, allocation: &Allocation, blocking: bool);

    /// Make a host write to `allocation` visible to the device.
    fn upload_allocation(&self, allocation: &Allocation, offset: usize, len: usize);

    /// Task count of the last submission that referenced `allocation`.
    fn task_count_for(&self, allocation: &Allocation) -> TaskCount;

    /// Highest task count the device has retired.
    fn completed_task_count(&self) -> TaskCount;
}

impl std::fmt::Debug for dyn CommandStreamReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("id", &self.id())
            .field("owner", &self.owner())
            .field("backend", &self.backend())
            .finish()
    }
}
