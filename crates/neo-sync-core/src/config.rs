//! Immutable engine configuration.
//!
//! Every debug knob and override lives in [`SyncConfig`]. The struct is built
//! once (defaults, JSON, or `NEO_SYNC_*` environment overrides), wrapped in an
//! `Arc`, and threaded through the driver into pools and events. Production
//! paths read the same struct with defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Prefix for environment overrides read by [`SyncConfig::with_env_overrides`].
pub const ENV_PREFIX: &str = "NEO_SYNC_";

/// Whether `Event::reset` first waits for the event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncBeforeReset {
    #[default]
    Disabled,
    /// Block until the event completes before clearing its memory.
    Synchronize,
    /// As `Synchronize`, and log when the event was not yet complete.
    SynchronizeAndLog,
}

/// How the driver exposes devices to the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceHierarchy {
    /// Root devices are exposed; tiles are reachable as sub-devices.
    #[default]
    Composite,
    /// Every tile is exposed as its own device.
    Flat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Force "signal all event packets" on or off. `None` uses the device capability.
    pub signal_all_event_packets: Option<bool>,
    /// Size event slots from the devices' reported max packet count.
    pub use_dynamic_event_packets_count: bool,
    pub synchronize_before_reset: SyncBeforeReset,
    /// Period between GPU hang checks during a host wait.
    pub gpu_hang_check_period_us: u64,
    /// Re-check for a GPU hang after observing a signaled event.
    pub force_status_recheck_on_success: bool,
    /// Abort the process when a host wait targets an event without host signal scope.
    pub abort_host_sync_on_non_host_visible_event: bool,
    /// Refresh interval for the host/device timestamp reference pair.
    pub timestamp_refresh_interval_ms: Option<u64>,
    /// Replaces every caller-provided host wait timeout.
    pub host_synchronize_timeout_override_ns: Option<u64>,
    pub enable_timestamp_pool_allocator: bool,
    /// Bytes per backing buffer of the shared timestamp pool allocator.
    pub timestamp_pool_chunk_size: usize,
    /// Skip a download when the receiver has no new work on the allocation.
    pub skip_redundant_downloads: bool,
    pub device_hierarchy: DeviceHierarchy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            signal_all_event_packets: None,
            use_dynamic_event_packets_count: true,
            synchronize_before_reset: SyncBeforeReset::Disabled,
            gpu_hang_check_period_us: 500_000,
            force_status_recheck_on_success: false,
            abort_host_sync_on_non_host_visible_event: false,
            timestamp_refresh_interval_ms: None,
            host_synchronize_timeout_override_ns: None,
            enable_timestamp_pool_allocator: true,
            timestamp_pool_chunk_size: 64 * 1024,
            skip_redundant_downloads: true,
            device_hierarchy: DeviceHierarchy::Composite,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)
            .map_err(|err| SyncError::InvalidArgument(format!("invalid sync config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NEO_SYNC_*` variables from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(std::env::vars())
    }

    /// Apply `NEO_SYNC_*` key/value overrides. Unknown keys are ignored.
    ///
    /// Optional knobs accept `-1` to mean "unset".
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "SIGNAL_ALL_EVENT_PACKETS" => {
                    self.signal_all_event_packets =
                        parse_optional::<u8>(name, value)?.map(|v| v != 0)
                }
                "USE_DYNAMIC_EVENT_PACKETS_COUNT" => {
                    self.use_dynamic_event_packets_count = parse_bool(name, value)?
                }
                "SYNCHRONIZE_BEFORE_RESET" => {
                    self.synchronize_before_reset = match parse_number::<u8>(name, value)? {
                        0 => SyncBeforeReset::Disabled,
                        1 => SyncBeforeReset::Synchronize,
                        2 => SyncBeforeReset::SynchronizeAndLog,
                        other => {
                            return Err(SyncError::InvalidArgument(format!(
                                "{ENV_PREFIX}{name}={other}: expected 0, 1 or 2"
                            )));
                        }
                    }
                }
                "GPU_HANG_CHECK_PERIOD_US" => {
                    self.gpu_hang_check_period_us = parse_number(name, value)?
                }
                "FORCE_STATUS_RECHECK_ON_SUCCESS" => {
                    self.force_status_recheck_on_success = parse_bool(name, value)?
                }
                "ABORT_HOST_SYNC_ON_NON_HOST_VISIBLE_EVENT" => {
                    self.abort_host_sync_on_non_host_visible_event = parse_bool(name, value)?
                }
                "TIMESTAMP_REFRESH_INTERVAL_MS" => {
                    self.timestamp_refresh_interval_ms = parse_optional(name, value)?
                }
                "HOST_SYNCHRONIZE_TIMEOUT_NS" => {
                    self.host_synchronize_timeout_override_ns = parse_optional(name, value)?
                }
                "ENABLE_TIMESTAMP_POOL_ALLOCATOR" => {
                    self.enable_timestamp_pool_allocator = parse_bool(name, value)?
                }
                "TIMESTAMP_POOL_CHUNK_SIZE" => {
                    self.timestamp_pool_chunk_size = parse_number::<usize>(name, value)?
                }
                "SKIP_REDUNDANT_DOWNLOADS" => {
                    self.skip_redundant_downloads = parse_bool(name, value)?
                }
                "DEVICE_HIERARCHY" => {
                    self.device_hierarchy = match value.to_ascii_lowercase().as_str() {
                        "composite" => DeviceHierarchy::Composite,
                        "flat" => DeviceHierarchy::Flat,
                        other => {
                            return Err(SyncError::InvalidArgument(format!(
                                "{ENV_PREFIX}{name}={other}: expected COMPOSITE or FLAT"
                            )));
                        }
                    }
                }
                _ => {}
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.gpu_hang_check_period_us == 0 {
            return Err(SyncError::InvalidArgument(
                "gpu_hang_check_period_us must be greater than zero".into(),
            ));
        }
        if self.timestamp_pool_chunk_size == 0 {
            return Err(SyncError::InvalidArgument(
                "timestamp_pool_chunk_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn gpu_hang_check_period(&self) -> std::time::Duration {
        std::time::Duration::from_micros(self.gpu_hang_check_period_us)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse::<T>().map_err(|_| {
        SyncError::InvalidArgument(format!("{ENV_PREFIX}{name}={value}: not a valid number"))
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        other => Err(SyncError::InvalidArgument(format!(
            "{ENV_PREFIX}{name}={other}: expected 0 or 1"
        ))),
    }
}

fn parse_optional<T: std::str::FromStr>(name: &str, value: &str) -> Result<Option<T>> {
    if value == "-1" {
        return Ok(None);
    }
    parse_number(name, value).map(Some)
}
