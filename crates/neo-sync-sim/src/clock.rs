//! Simulated device clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use neo_sync_core::Result;
use neo_sync_core::device::{DeviceClock, TimeStampData};

enum Source {
    RealTime(Instant),
    Manual(AtomicU64),
}

/// Device timestamps derived from host time: `ticks = cpu_ns / resolution`,
/// truncated to the counter's valid bits.
pub struct SimClock {
    source: Source,
    resolution_ns: f64,
    valid_bits: u32,
    gpu_offset_ticks: u64,
}

impl SimClock {
    /// Ticks follow real host time.
    pub fn real_time(resolution_ns: f64, valid_bits: u32) -> Self {
        Self {
            source: Source::RealTime(Instant::now()),
            resolution_ns,
            valid_bits,
            gpu_offset_ticks: 0,
        }
    }

    /// Time only moves through [`SimClock::advance`].
    pub fn manual(start_ns: u64, resolution_ns: f64, valid_bits: u32) -> Self {
        Self {
            source: Source::Manual(AtomicU64::new(start_ns)),
            resolution_ns,
            valid_bits,
            gpu_offset_ticks: 0,
        }
    }

    /// Shift device ticks so the counter starts at `ticks`, e.g. just below a wrap.
    pub fn with_gpu_offset(mut self, ticks: u64) -> Self {
        self.gpu_offset_ticks = ticks;
        self
    }

    /// Advance a manual clock. No-op on a real-time clock.
    pub fn advance(&self, ns: u64) {
        if let Source::Manual(now) = &self.source {
            now.fetch_add(ns, Ordering::Relaxed);
        }
    }

    fn mask(&self) -> u64 {
        if self.valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.valid_bits) - 1
        }
    }

    /// Device ticks at host time `cpu_ns`.
    pub fn ticks_at(&self, cpu_ns: u64) -> u64 {
        let ticks = (cpu_ns as f64 / self.resolution_ns) as u64;
        ticks.wrapping_add(self.gpu_offset_ticks) & self.mask()
    }
}

impl DeviceClock for SimClock {
    fn gpu_cpu_time(&self) -> Result<TimeStampData> {
        let cpu_time_ns = self.cpu_time_ns();
        Ok(TimeStampData {
            cpu_time_ns,
            gpu_timestamp: self.ticks_at(cpu_time_ns),
        })
    }

    fn cpu_time_ns(&self) -> u64 {
        match &self.source {
            Source::RealTime(base) => base.elapsed().as_nanos() as u64,
            Source::Manual(now) => now.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = SimClock::manual(1_000, 2.0, 32);
        let a = clock.gpu_cpu_time().expect("capture");
        assert_eq!(a.gpu_timestamp, 500);
        clock.advance(1_000);
        let b = clock.gpu_cpu_time().expect("capture");
        assert_eq!(b.cpu_time_ns, 2_000);
        assert_eq!(b.gpu_timestamp, 1_000);
    }

    #[test]
    fn ticks_wrap_at_valid_bits() {
        let clock = SimClock::manual(0, 1.0, 32).with_gpu_offset(0xFFFF_FFF0);
        assert_eq!(clock.ticks_at(0x20), 0x10);
    }

    #[test]
    fn real_time_clock_is_monotonic() {
        let clock = SimClock::real_time(1.0, 64);
        let a = clock.cpu_time_ns();
        let b = clock.cpu_time_ns();
        assert!(b >= a);
    }
}
