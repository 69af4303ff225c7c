//! Host-mapped ("synchronized") kernel timestamps.
//!
//! Raw device ticks are mapped to host nanoseconds through a reference pair
//! `(cpu_ns, gpu_ticks)` captured from the device clock. Capturing a pair is
//! expensive, so the pair is reused until the host time elapsed since the
//! capture exceeds the refresh interval. The default interval is half the
//! device counter range in nanoseconds, which bounds drift and guarantees a
//! delta never wraps more than once.

use std::sync::{Mutex, PoisonError};

use neo_sync_core::Result;
use neo_sync_core::device::{DeviceClock, TimeStampData};
use tracing::trace;

pub struct SynchronizedClock {
    valid_bits: u32,
    resolution_ns: f64,
    refresh_interval_ns: u64,
    reference: Mutex<Option<TimeStampData>>,
}

impl SynchronizedClock {
    /// `override_ms` replaces the range-derived refresh interval.
    pub fn new(valid_bits: u32, resolution_ns: f64, override_ms: Option<u64>) -> Self {
        let valid_bits = valid_bits.clamp(1, 64);
        let refresh_interval_ns = match override_ms {
            Some(ms) => ms.saturating_mul(1_000_000),
            None => default_refresh_interval_ns(valid_bits, resolution_ns),
        };
        Self {
            valid_bits,
            resolution_ns,
            refresh_interval_ns,
            reference: Mutex::new(None),
        }
    }

    #[inline]
    pub fn refresh_interval_ns(&self) -> u64 {
        self.refresh_interval_ns
    }

    /// Last captured reference pair, if any.
    pub fn current_reference(&self) -> Option<TimeStampData> {
        *self.reference.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reference pair to convert with, recaptured when unset or stale.
    pub fn reference(&self, clock: &dyn DeviceClock) -> Result<TimeStampData> {
        let mut reference = self.reference.lock().unwrap_or_else(PoisonError::into_inner);
        let now = clock.cpu_time_ns();
        match *reference {
            Some(pair) if now.saturating_sub(pair.cpu_time_ns) <= self.refresh_interval_ns => {
                Ok(pair)
            }
            _ => {
                let pair = clock.gpu_cpu_time()?;
                trace!(
                    cpu_ns = pair.cpu_time_ns,
                    gpu_ticks = pair.gpu_timestamp,
                    "Refreshed timestamp reference"
                );
                *reference = Some(pair);
                Ok(pair)
            }
        }
    }

    /// Map device ticks to host nanoseconds relative to `reference`.
    pub fn to_host_ns(&self, reference: TimeStampData, gpu_ticks: u64) -> u64 {
        let mask = if self.valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.valid_bits) - 1
        };
        let forward = gpu_ticks.wrapping_sub(reference.gpu_timestamp) & mask;
        if forward <= mask / 2 {
            reference
                .cpu_time_ns
                .saturating_add(self.ticks_to_ns(forward))
        } else {
            let backward = reference.gpu_timestamp.wrapping_sub(gpu_ticks) & mask;
            reference
                .cpu_time_ns
                .saturating_sub(self.ticks_to_ns(backward))
        }
    }

    #[inline]
    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        (ticks as f64 * self.resolution_ns) as u64
    }
}

fn default_refresh_interval_ns(valid_bits: u32, resolution_ns: f64) -> u64 {
    if valid_bits < 64 {
        let max_ts = (1u64 << valid_bits) - 1;
        (max_ts as f64 * resolution_ns / 2.0) as u64
    } else {
        u64::MAX / 2
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct ManualClock {
        cpu_ns: AtomicU64,
        captures: AtomicU64,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                cpu_ns: AtomicU64::new(1_000),
                captures: AtomicU64::new(0),
            }
        }
    }

    impl DeviceClock for ManualClock {
        fn gpu_cpu_time(&self) -> Result<TimeStampData> {
            self.captures.fetch_add(1, Ordering::Relaxed);
            let cpu = self.cpu_ns.load(Ordering::Relaxed);
            Ok(TimeStampData {
                cpu_time_ns: cpu,
                gpu_timestamp: cpu / 2,
            })
        }

        fn cpu_time_ns(&self) -> u64 {
            self.cpu_ns.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn default_interval_is_half_the_counter_range() {
        let clock = SynchronizedClock::new(32, 2.0, None);
        assert_eq!(clock.refresh_interval_ns(), u32::MAX as u64);
        let wide = SynchronizedClock::new(64, 1.0, None);
        assert_eq!(wide.refresh_interval_ns(), u64::MAX / 2);
    }

    #[test]
    fn override_interval_is_in_milliseconds() {
        let clock = SynchronizedClock::new(32, 1.0, Some(3));
        assert_eq!(clock.refresh_interval_ns(), 3_000_000);
    }

    #[test]
    fn reference_is_reused_until_interval_elapses() {
        let device = ManualClock::new();
        let clock = SynchronizedClock::new(32, 1.0, Some(1));

        let first = clock.reference(&device).expect("capture");
        device.cpu_ns.fetch_add(500_000, Ordering::Relaxed);
        assert_eq!(clock.reference(&device).expect("cached"), first);
        assert_eq!(device.captures.load(Ordering::Relaxed), 1);

        device.cpu_ns.fetch_add(600_000, Ordering::Relaxed);
        let refreshed = clock.reference(&device).expect("recapture");
        assert_ne!(refreshed, first);
        assert_eq!(device.captures.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn conversion_handles_both_directions_and_wrap() {
        let clock = SynchronizedClock::new(32, 2.0, None);
        let reference = TimeStampData {
            cpu_time_ns: 1_000_000,
            gpu_timestamp: 0xFFFF_FFF0,
        };
        // 0x20 ticks past the reference, across the counter wrap.
        assert_eq!(clock.to_host_ns(reference, 0x10), 1_000_000 + 0x20 * 2);
        assert_eq!(clock.to_host_ns(reference, 0xFFFF_FFE0), 1_000_000 - 0x10 * 2);
        assert_eq!(clock.to_host_ns(reference, 0xFFFF_FFF0), 1_000_000);
    }
}
