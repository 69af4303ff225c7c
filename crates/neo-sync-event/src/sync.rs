//! Host-side synchronization engine.
//!
//! # Download
//!
//! On non-coherent backends the host copy of the event memory is stale until
//! it is downloaded through the receiver that ran the work. Every read that
//! could observe a transition is preceded by a download through each of the
//! event's receivers (the device's default receiver when none is recorded).
//! The download blocks when the receiver belongs to another device than the
//! event's own.
//!
//! A receiver that retired every task touching the allocation at the time of
//! a download has nothing new to show until its task count for the
//! allocation moves; later downloads are skipped until then.
//!
//! # Waiting
//!
//! [`Event::host_synchronize`] spins on [`Event::query_status`] and polls the
//! receivers for a GPU hang every configured period. A hang always ends the
//! wait with `DeviceLost`.

use std::time::{Duration, Instant};

use neo_sync_core::memory::Allocation;
use neo_sync_core::{Result, SyncError};
use tracing::{error, trace};

use crate::event::{Event, EventScope, EventState, flush_printf};
use crate::lock;

impl Event {
    /// `Ok` when the event is complete, `NotReady` otherwise. Never blocks.
    pub fn query_status(&self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }
        let flush = {
            let mut state = lock(&self.state);
            if self.is_completed() {
                return Ok(());
            }
            if !self.observe_completion(&mut state)? {
                return Err(SyncError::NotReady);
            }
            self.mark_completed(&mut state)?
        };
        flush_printf(flush);
        Ok(())
    }

    fn observe_completion(&self, state: &mut EventState) -> Result<bool> {
        if let Some(in_order) = &self.counter {
            if in_order.last_waited_counter() >= state.counter_value {
                return Ok(true);
            }
            self.download(state, in_order.poll_allocation());
            return in_order.is_reached(state.counter_value);
        }
        let Some(allocation) = self.host_allocation() else {
            return Ok(false);
        };
        self.download(state, allocation);
        self.packets_signaled(state, allocation)
    }

    fn download(&self, state: &mut EventState, allocation: &Allocation) {
        for csr in self.targets(state) {
            let strategy = csr.download_strategy();
            if !strategy.needs_download() {
                continue;
            }
            let task = csr.task_count_for(allocation);
            if self.config.skip_redundant_downloads
                && state
                    .download_watermarks
                    .get(&csr.id())
                    .is_some_and(|&downloaded| downloaded >= task)
            {
                trace!(csr = csr.id(), task, "Skipping redundant download");
                continue;
            }
            let completed = csr.completed_task_count();
            let blocking = csr.owner() != self.device.id();
            strategy.download(csr.as_ref(), allocation, blocking);
            if completed >= task {
                state.download_watermarks.insert(csr.id(), task);
            }
        }
    }

    /// Block until the event completes, the timeout elapses or a GPU hang is
    /// detected.
    ///
    /// `0` checks once, `u64::MAX` waits without a deadline.
    pub fn host_synchronize(&self, timeout_ns: u64) -> Result<()> {
        let timeout_ns = self
            .config
            .host_synchronize_timeout_override_ns
            .unwrap_or(timeout_ns);
        if self.config.abort_host_sync_on_non_host_visible_event
            && !self.signal_scope.contains(EventScope::HOST)
        {
            error!(
                index = self.index,
                signal_scope = ?self.signal_scope,
                "Host synchronize on an event without host signal scope, aborting"
            );
            std::process::abort();
        }
        if timeout_ns == 0 {
            return self.query_status();
        }

        let start = Instant::now();
        // Timeouts past what `Instant` can represent wait without a deadline.
        let deadline = (timeout_ns != u64::MAX)
            .then(|| start.checked_add(Duration::from_nanos(timeout_ns)))
            .flatten();
        let period = self.config.gpu_hang_check_period();
        let mut last_hang_check = start;
        loop {
            match self.query_status() {
                Ok(()) => {
                    if self.config.force_status_recheck_on_success {
                        self.check_gpu_hang()?;
                    }
                    return Ok(());
                }
                Err(SyncError::NotReady) => {}
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now.duration_since(last_hang_check) >= period {
                self.check_gpu_hang()?;
                last_hang_check = now;
            }
            if let Some(deadline) = deadline
                && now >= deadline
            {
                self.check_gpu_hang()?;
                trace!(index = self.index, timeout_ns, "Host synchronize timed out");
                return Err(SyncError::NotReady);
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// `DeviceLost` when any receiver of the event reports a hang.
    pub fn check_gpu_hang(&self) -> Result<()> {
        let targets = {
            let state = lock(&self.state);
            self.targets(&state)
        };
        if let Some(csr) = targets.iter().find(|csr| csr.is_gpu_hang_detected()) {
            error!(
                index = self.index,
                csr = csr.id(),
                owner = %csr.owner(),
                "GPU hang detected"
            );
            return Err(SyncError::DeviceLost { csr_id: csr.id() });
        }
        Ok(())
    }
}
