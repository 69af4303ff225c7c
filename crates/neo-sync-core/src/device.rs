//! Device and capability model.
//!
//! A [`Device`] is either a root device or one tile of it. Everything the
//! engine needs to size pools and pick code paths is carried by
//! [`DeviceCaps`]; no hardware-family dispatch happens past this point.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::csr::CommandStreamReceiver;
use crate::error::{Result, SyncError};
use crate::types::DeviceId;

/// Width of one timestamp packet word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampWidth {
    #[default]
    Bits32,
    Bits64,
}

impl TimestampWidth {
    /// Bytes per packet word.
    #[inline]
    pub const fn word_size(self) -> usize {
        match self {
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits32 => 32,
            Self::Bits64 => 64,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            32 => Some(Self::Bits32),
            64 => Some(Self::Bits64),
            _ => None,
        }
    }
}

/// Capabilities queried once per device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceCaps {
    /// Largest number of timestamp packets one event may need.
    pub max_event_packets: u32,
    /// Largest number of kernels one event may fold.
    pub max_kernel_count: u32,
    pub timestamp_width: TimestampWidth,
    /// One dispatch is split across tiles automatically.
    pub implicit_scaling: bool,
    /// Packets map one-to-one to tiles, so per-packet timestamps are meaningful.
    pub static_partitioning: bool,
    /// Signal and wait on every allocated packet, not only the used ones.
    pub signal_all_event_packets: bool,
    pub event_alignment: usize,
    /// Significant bits of a device kernel timestamp.
    pub kernel_timestamp_valid_bits: u32,
    /// Nanoseconds per device timestamp tick.
    pub timer_resolution_ns: f64,
}

impl Default for DeviceCaps {
    fn default() -> Self {
        Self {
            max_event_packets: 16,
            max_kernel_count: 3,
            timestamp_width: TimestampWidth::Bits32,
            implicit_scaling: false,
            static_partitioning: false,
            signal_all_event_packets: false,
            event_alignment: 64,
            kernel_timestamp_valid_bits: 32,
            timer_resolution_ns: 1.0,
        }
    }
}

/// Host/device timestamp pair captured at the same instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TimeStampData {
    pub cpu_time_ns: u64,
    pub gpu_timestamp: u64,
}

/// Source of device timestamps.
pub trait DeviceClock: Send + Sync {
    /// Capture a correlated host/device timestamp pair.
    fn gpu_cpu_time(&self) -> Result<TimeStampData>;

    /// Host monotonic time in nanoseconds, same timebase as `gpu_cpu_time`.
    fn cpu_time_ns(&self) -> u64;
}

pub struct Device {
    id: DeviceId,
    caps: DeviceCaps,
    engines: Vec<Arc<dyn CommandStreamReceiver>>,
    clock: Arc<dyn DeviceClock>,
    sub_devices: Vec<Arc<Device>>,
}

impl Device {
    /// The first engine is the default receiver.
    pub fn new(
        id: DeviceId,
        caps: DeviceCaps,
        engines: Vec<Arc<dyn CommandStreamReceiver>>,
        clock: Arc<dyn DeviceClock>,
    ) -> Result<Self> {
        if engines.is_empty() {
            return Err(SyncError::InvalidArgument(format!(
                "device {id} needs at least one engine"
            )));
        }
        if !caps.event_alignment.is_power_of_two() {
            return Err(SyncError::InvalidArgument(format!(
                "device {id} event alignment {} is not a power of two",
                caps.event_alignment
            )));
        }
        if caps.max_event_packets == 0 || caps.max_kernel_count == 0 {
            return Err(SyncError::InvalidArgument(format!(
                "device {id} reports zero event packets or kernels"
            )));
        }
        Ok(Self {
            id,
            caps,
            engines,
            clock,
            sub_devices: Vec::new(),
        })
    }

    pub fn with_sub_devices(mut self, sub_devices: Vec<Arc<Device>>) -> Self {
        self.sub_devices = sub_devices;
        self
    }

    #[inline]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[inline]
    pub fn root_device_index(&self) -> u32 {
        self.id.root_device_index
    }

    #[inline]
    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn engines(&self) -> &[Arc<dyn CommandStreamReceiver>] {
        &self.engines
    }

    pub fn default_csr(&self) -> &Arc<dyn CommandStreamReceiver> {
        &self.engines[0]
    }

    pub fn clock(&self) -> &Arc<dyn DeviceClock> {
        &self.clock
    }

    pub fn sub_devices(&self) -> &[Arc<Device>] {
        &self.sub_devices
    }

    pub fn is_implicit_scaling_capable(&self) -> bool {
        self.caps.implicit_scaling
    }

    /// Signal-all mode after applying the config override.
    pub fn signal_all_event_packets(&self, config: &SyncConfig) -> bool {
        config
            .signal_all_event_packets
            .unwrap_or(self.caps.signal_all_event_packets)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("caps", &self.caps)
            .field("engines", &self.engines.len())
            .field("sub_devices", &self.sub_devices.len())
            .finish()
    }
}
