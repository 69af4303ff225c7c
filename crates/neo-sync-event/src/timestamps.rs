//! Kernel timestamp queries.
//!
//! Every query first checks completion and returns `NotReady` without
//! reading event memory when the event is still pending. Results come from
//! the snapshot taken when the event completed, so the packets may be
//! overwritten afterwards without affecting them.

use neo_sync_core::{Result, SyncError};
use neo_sync_timestamp::profiling::{calculate_profiling_data_from_bytes, packet_results_from_bytes};
use neo_sync_timestamp::{KernelTimestampResult, TimestampRange};
use serde::Serialize;

use crate::event::{Event, TimestampSnapshot};
use crate::lock;

/// Per-packet results, with host-mapped copies for mapped-timestamp pools.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KernelTimestampsExt {
    pub kernel: Vec<KernelTimestampResult>,
    pub synchronized: Option<Vec<KernelTimestampResult>>,
}

impl Event {
    /// Reduced kernel timestamp of the event, in host nanoseconds for
    /// mapped-timestamp pools and raw device ticks otherwise.
    pub fn query_kernel_timestamp(&self) -> Result<KernelTimestampResult> {
        if !self.is_timestamp() {
            return Err(SyncError::Unsupported(
                "kernel timestamps need a timestamp event pool".into(),
            ));
        }
        self.query_status()?;
        let raw = self.with_snapshot(|snapshot| {
            let kernels: Vec<&[u8]> = snapshot.kernels.iter().map(Vec::as_slice).collect();
            calculate_profiling_data_from_bytes(
                self.geometry.layout(),
                &kernels,
                &snapshot.l3_flush,
            )
            .unwrap_or_default()
        })?;
        match &self.sync_clock {
            Some(_) => Ok(self.to_host(&[raw])?.remove(0)),
            None => Ok(raw),
        }
    }

    /// One raw result per used packet, across all kernels.
    pub fn query_timestamps_exp(&self) -> Result<Vec<KernelTimestampResult>> {
        self.check_per_packet_timestamps()?;
        self.query_status()?;
        self.packet_results()
    }

    /// As [`Event::query_timestamps_exp`], plus host-mapped results when the
    /// pool maps timestamps.
    pub fn query_kernel_timestamps_ext(&self) -> Result<KernelTimestampsExt> {
        self.check_per_packet_timestamps()?;
        self.query_status()?;
        let kernel = self.packet_results()?;
        let synchronized = match &self.sync_clock {
            Some(_) => Some(self.to_host(&kernel)?),
            None => None,
        };
        Ok(KernelTimestampsExt {
            kernel,
            synchronized,
        })
    }

    fn check_per_packet_timestamps(&self) -> Result<()> {
        if !self.is_timestamp() {
            return Err(SyncError::Unsupported(
                "per-packet timestamps need a timestamp event pool".into(),
            ));
        }
        if self.packets_in_use() > 1 && !self.device.caps().static_partitioning {
            return Err(SyncError::Unsupported(
                "per-packet timestamps of a multi-packet event need static partitioning".into(),
            ));
        }
        Ok(())
    }

    fn packet_results(&self) -> Result<Vec<KernelTimestampResult>> {
        let layout = self.geometry.layout();
        self.with_snapshot(|snapshot| {
            snapshot
                .kernels
                .iter()
                .flat_map(|bytes| packet_results_from_bytes(layout, bytes))
                .collect()
        })
    }

    fn with_snapshot<R>(&self, f: impl FnOnce(&TimestampSnapshot) -> R) -> Result<R> {
        let state = lock(&self.state);
        state.snapshot.as_ref().map(f).ok_or(SyncError::NotReady)
    }

    fn to_host(&self, results: &[KernelTimestampResult]) -> Result<Vec<KernelTimestampResult>> {
        let Some(clock) = &self.sync_clock else {
            return Ok(results.to_vec());
        };
        let reference = clock.reference(self.device.clock().as_ref())?;
        let map = |range: TimestampRange| TimestampRange {
            kernel_start: clock.to_host_ns(reference, range.kernel_start),
            kernel_end: clock.to_host_ns(reference, range.kernel_end),
        };
        Ok(results
            .iter()
            .map(|r| KernelTimestampResult {
                global: map(r.global),
                context: map(r.context),
            })
            .collect())
    }
}
