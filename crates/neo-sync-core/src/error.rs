//! Typed error hierarchy for the synchronization engine.
//!
//! Uses `thiserror` for library-grade errors. Every variant folds into one
//! [`ErrorKind`], the result taxonomy callers branch on.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`SyncError::error_code`]
//! for structured telemetry without string parsing.

/// Result taxonomy shared by every pool and event operation.
///
/// `Success` is `Ok(..)`; everything else arrives as a [`SyncError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input: bad index, null device, mismatched IPC geometry.
    InvalidArgument,
    /// A device-local allocation could not be satisfied.
    OutOfDeviceMemory,
    /// A host-visible or shareable allocation could not be satisfied.
    OutOfHostMemory,
    /// Well-formed, but not available in this configuration.
    Unsupported,
    /// The tracked work has not completed yet. Retryable.
    NotReady,
    /// A GPU hang was observed. The device context is unusable.
    DeviceLost,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::OutOfDeviceMemory => "out_of_device_memory",
            Self::OutOfHostMemory => "out_of_host_memory",
            Self::Unsupported => "unsupported",
            Self::NotReady => "not_ready",
            Self::DeviceLost => "device_lost",
        }
    }
}

/// All errors originating from the synchronization engine.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ── Arguments ────────────────────────────────────────────────────
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("stale or unknown {kind} handle {handle:#x}")]
    StaleHandle { kind: &'static str, handle: u64 },

    #[error("event index {index} out of range for pool of {capacity} events")]
    IndexOutOfRange { index: u32, capacity: u32 },

    #[error("kernel count limit reached: event supports at most {max} kernels")]
    KernelCountExceeded { max: u32 },

    #[error("packet count {requested} exceeds the event maximum of {max}")]
    PacketCountExceeded { requested: u32, max: u32 },

    #[error(
        "IPC handle max event packets {descriptor} does not match context devices max event packets {local}"
    )]
    IpcPacketMismatch { descriptor: u32, local: u32 },

    #[error("IPC handle event size {descriptor} does not match locally computed event size {local}")]
    IpcEventSizeMismatch { descriptor: u32, local: u32 },

    // ── Memory ───────────────────────────────────────────────────────
    #[error("out of device memory: requested {requested_bytes} bytes on root device {root_device_index}")]
    OutOfDeviceMemory {
        requested_bytes: usize,
        root_device_index: u32,
    },

    #[error("out of host memory: {0}")]
    OutOfHostMemory(String),

    // ── Capability ───────────────────────────────────────────────────
    #[error("unsupported: {0}")]
    Unsupported(String),

    // ── Status ───────────────────────────────────────────────────────
    #[error("event not ready")]
    NotReady,

    // ── Device ───────────────────────────────────────────────────────
    #[error("device lost: GPU hang detected on command stream receiver {csr_id}")]
    DeviceLost { csr_id: u32 },
}

impl SyncError {
    /// Fold the variant into the caller-facing result taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_)
            | Self::StaleHandle { .. }
            | Self::IndexOutOfRange { .. }
            | Self::KernelCountExceeded { .. }
            | Self::PacketCountExceeded { .. }
            | Self::IpcPacketMismatch { .. }
            | Self::IpcEventSizeMismatch { .. } => ErrorKind::InvalidArgument,
            Self::OutOfDeviceMemory { .. } => ErrorKind::OutOfDeviceMemory,
            Self::OutOfHostMemory(_) => ErrorKind::OutOfHostMemory,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::NotReady => ErrorKind::NotReady,
            Self::DeviceLost { .. } => ErrorKind::DeviceLost,
        }
    }

    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: arguments
    /// - 2xx: memory
    /// - 3xx: capability
    /// - 4xx: status
    /// - 5xx: device
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => 100,
            Self::StaleHandle { .. } => 101,
            Self::IndexOutOfRange { .. } => 102,
            Self::KernelCountExceeded { .. } => 103,
            Self::PacketCountExceeded { .. } => 104,
            Self::IpcPacketMismatch { .. } => 105,
            Self::IpcEventSizeMismatch { .. } => 106,
            Self::OutOfDeviceMemory { .. } => 200,
            Self::OutOfHostMemory(_) => 201,
            Self::Unsupported(_) => 300,
            Self::NotReady => 400,
            Self::DeviceLost { .. } => 500,
        }
    }

    /// Whether the same call may succeed if retried later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotReady)
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_family_folds_into_invalid_argument() {
        let errors = [
            SyncError::InvalidArgument("x".into()),
            SyncError::StaleHandle {
                kind: "event",
                handle: 7,
            },
            SyncError::IndexOutOfRange {
                index: 4,
                capacity: 4,
            },
            SyncError::KernelCountExceeded { max: 3 },
            SyncError::PacketCountExceeded {
                requested: 49,
                max: 48,
            },
            SyncError::IpcPacketMismatch {
                descriptor: 16,
                local: 48,
            },
        ];
        for err in errors {
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{err}");
            assert!((100..200).contains(&err.error_code()));
        }
    }

    #[test]
    fn only_not_ready_is_recoverable() {
        assert!(SyncError::NotReady.is_recoverable());
        assert!(!SyncError::DeviceLost { csr_id: 0 }.is_recoverable());
        assert!(!SyncError::Unsupported("ipc".into()).is_recoverable());
    }

    #[test]
    fn kind_names_are_snake_case() {
        assert_eq!(SyncError::NotReady.kind().as_str(), "not_ready");
        assert_eq!(
            SyncError::DeviceLost { csr_id: 2 }.kind().as_str(),
            "device_lost"
        );
    }

    #[test]
    fn ipc_mismatch_message_names_both_values() {
        let msg = SyncError::IpcPacketMismatch {
            descriptor: 16,
            local: 48,
        }
        .to_string();
        assert!(msg.contains("16"), "{msg}");
        assert!(msg.contains("48"), "{msg}");
    }
}
