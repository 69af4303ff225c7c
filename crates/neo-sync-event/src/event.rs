//! Events and their packet accounting.
//!
//! # State machine
//!
//! ```text
//! Initial ──(GPU work)──▶ InFlight ──(observed signaled)──▶ Completed
//!    │                                                          │
//!    └──────────(host_signal)──────────▶ Completed ◀────────────┘
//!                                          │
//!                                       reset() ──▶ Initial
//! ```
//!
//! Completion is cached in an atomic flag. Once set, status queries return
//! without touching memory until [`Event::reset`].
//!
//! # Packet accounting
//!
//! Each kernel folded into the event claims a run of consecutive packets.
//! `packets_in_use` is the running total across kernels, and
//! [`Event::packet_address`] points at the first unclaimed packet, where the
//! command encoder directs the next dispatch's completion writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use neo_sync_core::config::SyncConfig;
use neo_sync_core::csr::CommandStreamReceiver;
use neo_sync_core::device::Device;
use neo_sync_core::memory::Allocation;
use neo_sync_core::types::{GpuAddress, TaskCount};
use neo_sync_core::{Result, SyncError};
use neo_sync_timestamp::{STATE_CLEARED, STATE_SIGNALED, SynchronizedClock};
use tracing::{debug, trace, warn};

use crate::counter::{CounterBasedEventDesc, InOrderExecInfo};
use crate::lock;
use crate::pool::{EventPoolFlags, PoolGeometry, PoolMemory};

/// Slot index reported by counter-based events.
pub const COUNTER_BASED_INDEX: u32 = u32::MAX;

bitflags! {
    /// Memory visibility of an event's signal or wait.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EventScope: u32 {
        const SUBDEVICE = 0x1;
        const DEVICE = 0x2;
        const HOST = 0x4;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventDesc {
    pub index: u32,
    pub signal_scope: EventScope,
    pub wait_scope: EventScope,
}

/// Kernel with printf output to flush once its event completes.
pub trait PrintfHandler: Send + Sync {
    fn flush_printf_output(&self);
}

/// Raw packet bytes of every kernel, captured at completion.
pub(crate) struct TimestampSnapshot {
    pub(crate) kernels: Vec<Vec<u8>>,
    pub(crate) l3_flush: Vec<bool>,
}

pub(crate) struct EventState {
    /// Packets claimed by each kernel since the last kernel-count reset.
    pub(crate) kernel_packets: Vec<u32>,
    pub(crate) l3_flush: Vec<bool>,
    pub(crate) csrs: Vec<Arc<dyn CommandStreamReceiver>>,
    /// Per receiver: allocation task count already downloaded after retiring.
    pub(crate) download_watermarks: HashMap<u32, TaskCount>,
    pub(crate) gpu_start: Option<u64>,
    pub(crate) gpu_end: Option<u64>,
    pub(crate) snapshot: Option<TimestampSnapshot>,
    pub(crate) printf: Option<Weak<dyn PrintfHandler>>,
    pub(crate) counter_value: u64,
}

impl EventState {
    fn new(counter_value: u64) -> Self {
        Self {
            kernel_packets: vec![1],
            l3_flush: vec![false],
            csrs: Vec::new(),
            download_watermarks: HashMap::new(),
            gpu_start: None,
            gpu_end: None,
            snapshot: None,
            printf: None,
            counter_value,
        }
    }

    #[inline]
    pub(crate) fn packets_in_use(&self) -> u32 {
        self.kernel_packets
            .iter()
            .fold(0u32, |total, &packets| total.saturating_add(packets))
    }
}

/// Everything a pool hands to a new slot event.
pub(crate) struct SlotEventInit {
    pub(crate) index: u32,
    pub(crate) device: Arc<Device>,
    pub(crate) memory: Arc<PoolMemory>,
    pub(crate) offset: usize,
    pub(crate) geometry: PoolGeometry,
    pub(crate) flags: EventPoolFlags,
    pub(crate) implicit_scaling: bool,
    pub(crate) signal_all_packets: bool,
    pub(crate) signal_scope: EventScope,
    pub(crate) wait_scope: EventScope,
    pub(crate) config: Arc<SyncConfig>,
}

pub struct Event {
    pub(crate) index: u32,
    pub(crate) device: Arc<Device>,
    pub(crate) memory: Option<Arc<PoolMemory>>,
    pub(crate) offset: usize,
    pub(crate) geometry: PoolGeometry,
    pub(crate) flags: EventPoolFlags,
    pub(crate) use_context_end: bool,
    pub(crate) signal_all: bool,
    pub(crate) signal_scope: EventScope,
    pub(crate) wait_scope: EventScope,
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) state: Mutex<EventState>,
    pub(crate) completed: AtomicBool,
    pub(crate) sync_clock: Option<SynchronizedClock>,
    pub(crate) counter: Option<Arc<InOrderExecInfo>>,
}

impl Event {
    pub(crate) fn from_pool(init: SlotEventInit) -> Arc<Self> {
        let caps = init.device.caps();
        let sync_clock = init
            .flags
            .contains(EventPoolFlags::KERNEL_MAPPED_TIMESTAMP)
            .then(|| {
                SynchronizedClock::new(
                    caps.kernel_timestamp_valid_bits,
                    caps.timer_resolution_ns,
                    init.config.timestamp_refresh_interval_ms,
                )
            });
        Arc::new(Self {
            index: init.index,
            use_context_end: init.flags.is_timestamp() || init.implicit_scaling,
            signal_all: init.signal_all_packets,
            device: init.device,
            memory: Some(init.memory),
            offset: init.offset,
            geometry: init.geometry,
            flags: init.flags,
            signal_scope: init.signal_scope,
            wait_scope: init.wait_scope,
            config: init.config,
            state: Mutex::new(EventState::new(0)),
            completed: AtomicBool::new(false),
            sync_clock,
            counter: None,
        })
    }

    /// Standalone event completing when `desc.in_order` reaches
    /// `desc.counter_value`.
    pub fn create_counter_based(
        device: Arc<Device>,
        config: Arc<SyncConfig>,
        desc: CounterBasedEventDesc,
    ) -> Result<Arc<Self>> {
        let geometry = PoolGeometry::for_devices(std::slice::from_ref(&device), &config)?;
        debug!(
            device = %device.id(),
            counter_value = desc.counter_value,
            partitions = desc.in_order.partition_count(),
            "Counter-based event created"
        );
        Ok(Arc::new(Self {
            index: COUNTER_BASED_INDEX,
            device,
            memory: None,
            offset: 0,
            geometry,
            flags: EventPoolFlags::empty(),
            use_context_end: false,
            signal_all: false,
            signal_scope: desc.signal_scope,
            wait_scope: desc.wait_scope,
            config,
            state: Mutex::new(EventState::new(desc.counter_value)),
            completed: AtomicBool::new(false),
            sync_clock: None,
            counter: Some(desc.in_order),
        }))
    }

    // ─── Identity ────────────────────────────────────────────────────────

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    #[inline]
    pub fn signal_scope(&self) -> EventScope {
        self.signal_scope
    }

    #[inline]
    pub fn wait_scope(&self) -> EventScope {
        self.wait_scope
    }

    #[inline]
    pub fn is_timestamp(&self) -> bool {
        self.flags.is_timestamp()
    }

    #[inline]
    pub fn is_counter_based(&self) -> bool {
        self.counter.is_some()
    }

    #[inline]
    pub fn is_signal_all_event_packets(&self) -> bool {
        self.signal_all
    }

    /// Whether completion is polled at the context-end word.
    #[inline]
    pub fn is_using_context_end_offset(&self) -> bool {
        self.use_context_end
    }

    #[inline]
    pub fn max_packet_count(&self) -> u32 {
        self.geometry.max_event_packets
    }

    #[inline]
    pub fn max_kernel_count(&self) -> u32 {
        self.geometry.max_kernel_count
    }

    #[inline]
    pub fn single_packet_size(&self) -> usize {
        self.geometry.packet_size
    }

    /// Cached completion, without touching memory.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn in_order_exec_info(&self) -> Option<&Arc<InOrderExecInfo>> {
        self.counter.as_ref()
    }

    pub fn counter_value(&self) -> u64 {
        lock(&self.state).counter_value
    }

    // ─── Addresses ───────────────────────────────────────────────────────

    /// GPU address of the event's memory as seen by `device`.
    pub fn gpu_address(&self, device: &Device) -> GpuAddress {
        if let Some(in_order) = &self.counter {
            return in_order.device_address();
        }
        self.memory
            .as_ref()
            .map_or(0, |memory| {
                memory.allocation_for(device.root_device_index()).gpu_address
            })
            + self.offset as GpuAddress
    }

    /// Address of the first packet not yet claimed by any kernel.
    pub fn packet_address(&self, device: &Device) -> GpuAddress {
        let in_use = lock(&self.state).packets_in_use();
        self.gpu_address(device) + (in_use as usize * self.geometry.packet_size) as GpuAddress
    }

    /// Allocation the host reads for this event.
    pub(crate) fn host_allocation(&self) -> Option<&Arc<Allocation>> {
        match &self.counter {
            Some(in_order) => Some(in_order.poll_allocation()),
            None => self
                .memory
                .as_ref()
                .map(|memory| memory.allocation_for(self.device.root_device_index())),
        }
    }

    // ─── Kernel and packet accounting ────────────────────────────────────

    pub fn kernel_count(&self) -> u32 {
        lock(&self.state).kernel_packets.len() as u32
    }

    pub fn packets_in_use(&self) -> u32 {
        lock(&self.state).packets_in_use()
    }

    /// Packets claimed by kernel `kernel`, or 0 past the kernel count.
    pub fn packets_in_kernel(&self, kernel: u32) -> u32 {
        lock(&self.state)
            .kernel_packets
            .get(kernel as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Start a new kernel record with zero packets.
    pub fn increase_kernel_count(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.kernel_packets.len() as u32 >= self.geometry.max_kernel_count {
            return Err(SyncError::KernelCountExceeded {
                max: self.geometry.max_kernel_count,
            });
        }
        state.kernel_packets.push(0);
        state.l3_flush.push(false);
        Ok(())
    }

    /// Set the packet count of the current kernel.
    pub fn set_packets_in_use(&self, packets: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if state.kernel_packets.is_empty() {
            state.kernel_packets.push(0);
            state.l3_flush.push(false);
        }
        let current = state.kernel_packets.len() - 1;
        let requested = (state.packets_in_use() - state.kernel_packets[current])
            .checked_add(packets)
            .unwrap_or(u32::MAX);
        if requested > self.geometry.max_event_packets {
            return Err(SyncError::PacketCountExceeded {
                requested,
                max: self.geometry.max_event_packets,
            });
        }
        state.kernel_packets[current] = packets;
        Ok(())
    }

    /// Drop every kernel record. The next kernel starts a fresh run at packet 0.
    pub fn zero_kernel_count(&self) {
        let mut state = lock(&self.state);
        state.kernel_packets.clear();
        state.l3_flush.clear();
    }

    /// Back to one kernel using one packet.
    pub fn reset_kernel_count_and_packets(&self) {
        let mut state = lock(&self.state);
        state.kernel_packets = vec![1];
        state.l3_flush = vec![false];
    }

    /// Mark the current kernel's last packet as an L3 flush packet.
    pub fn set_l3_flush_for_current_kernel(&self) {
        let mut state = lock(&self.state);
        if let Some(last) = state.l3_flush.last_mut() {
            *last = true;
        }
    }

    pub fn l3_flush_applied(&self, kernel: u32) -> bool {
        lock(&self.state)
            .l3_flush
            .get(kernel as usize)
            .copied()
            .unwrap_or(false)
    }

    // ─── Receivers ───────────────────────────────────────────────────────

    /// Record a receiver this event was used on. Duplicates are ignored.
    pub fn add_csr(&self, csr: Arc<dyn CommandStreamReceiver>) {
        let mut state = lock(&self.state);
        if !state.csrs.iter().any(|c| c.id() == csr.id()) {
            trace!(index = self.index, csr = csr.id(), "Event bound to receiver");
            state.csrs.push(csr);
        }
    }

    pub fn csr_count(&self) -> usize {
        lock(&self.state).csrs.len()
    }

    /// Recorded receivers, or the device's default receiver when none.
    pub(crate) fn targets(&self, state: &EventState) -> Vec<Arc<dyn CommandStreamReceiver>> {
        if state.csrs.is_empty() {
            vec![self.device.default_csr().clone()]
        } else {
            state.csrs.clone()
        }
    }

    /// Push a host write of `len` bytes at `offset` to every target receiver.
    pub(crate) fn upload(&self, state: &EventState, allocation: &Allocation, offset: usize, len: usize) {
        for csr in self.targets(state) {
            csr.download_strategy()
                .upload(csr.as_ref(), allocation, offset, len);
        }
    }

    // ─── Host-side timestamps and hooks ──────────────────────────────────

    /// Capture the device timestamp used as the start of a host signal.
    pub fn capture_gpu_start_timestamp(&self) -> Result<()> {
        let pair = self.device.clock().gpu_cpu_time()?;
        lock(&self.state).gpu_start = Some(pair.gpu_timestamp);
        Ok(())
    }

    pub fn gpu_start_timestamp(&self) -> Option<u64> {
        lock(&self.state).gpu_start
    }

    pub fn gpu_end_timestamp(&self) -> Option<u64> {
        lock(&self.state).gpu_end
    }

    /// Recapture the host/device reference pair when it is stale. No-op for
    /// events without mapped timestamps.
    pub fn refresh_reference_timestamp(&self) -> Result<()> {
        if let Some(clock) = &self.sync_clock {
            clock.reference(self.device.clock().as_ref())?;
        }
        Ok(())
    }

    pub fn set_kernel_with_printf(&self, kernel: Weak<dyn PrintfHandler>) {
        lock(&self.state).printf = Some(kernel);
    }

    pub fn update_counter_value(&self, value: u64) {
        lock(&self.state).counter_value = value;
    }

    // ─── Signal and reset ────────────────────────────────────────────────

    /// Signal the event from the host.
    ///
    /// Counter-based events are signaled by writing their counter value and
    /// need `allow_counter_based`.
    pub fn host_signal(&self, allow_counter_based: bool) -> Result<()> {
        let flush = {
            let mut state = lock(&self.state);
            if let Some(in_order) = &self.counter {
                if !allow_counter_based {
                    return Err(SyncError::InvalidArgument(
                        "host signal of a counter-based event is not allowed here".into(),
                    ));
                }
                in_order.write_all(state.counter_value)?;
                for allocation in in_order.allocations() {
                    self.upload(&state, allocation, in_order.offset(), in_order.span());
                }
            } else {
                self.write_signaled_packets(&mut state)?;
            }
            trace!(index = self.index, "Host signaled");
            self.mark_completed(&mut state)?
        };
        flush_printf(flush);
        Ok(())
    }

    fn write_signaled_packets(&self, state: &mut EventState) -> Result<()> {
        let Some(allocation) = self.host_allocation() else {
            return Ok(());
        };
        let layout = self.geometry.layout();
        let packet_size = self.geometry.packet_size;
        let packets = self.packets_to_check(state) as usize;
        let storage = allocation.storage();

        if self.is_timestamp() {
            let end = self.device.clock().gpu_cpu_time()?.gpu_timestamp;
            let start = state.gpu_start.unwrap_or(end);
            let packet = layout.range_bytes(start, end);
            for i in 0..packets {
                storage.write(self.offset + i * packet_size, &packet)?;
            }
            state.gpu_start = Some(start);
            state.gpu_end = Some(end);
        } else {
            let mut word = vec![0u8; layout.word_size()];
            layout.write_word(u64::from(STATE_SIGNALED), &mut word);
            let word_offset = layout.completion_offset(self.use_context_end);
            for i in 0..packets {
                storage.write(self.offset + i * packet_size + word_offset, &word)?;
            }
        }
        self.upload(state, allocation, self.offset, packets * packet_size);
        Ok(())
    }

    /// Packets whose state decides completion.
    pub(crate) fn packets_to_check(&self, state: &EventState) -> u32 {
        if self.signal_all {
            self.geometry.max_event_packets
        } else {
            state.packets_in_use().max(1)
        }
    }

    /// Write `STATE_CLEARED` into every packet of the slot.
    pub(crate) fn clear_all_packets(&self) -> Result<()> {
        let Some(allocation) = self.host_allocation() else {
            return Ok(());
        };
        let packets = self.geometry.max_event_packets as usize;
        let len = packets * self.geometry.packet_size;
        allocation
            .storage()
            .write(self.offset, &self.geometry.layout().cleared_bytes(packets))?;
        let state = lock(&self.state);
        self.upload(&state, allocation, self.offset, len);
        Ok(())
    }

    /// Re-arm the event.
    ///
    /// Every packet a signal could have written is cleared: the in-use
    /// count, at least one, or every packet in signal-all mode. Kernel and packet counters are kept; cached
    /// completion, the timestamp snapshot, download watermarks, L3 flush
    /// marks and host-side GPU timestamps are dropped.
    pub fn reset(&self) -> Result<()> {
        if self.counter.is_some() {
            return Err(SyncError::InvalidArgument(
                "counter-based events cannot be reset".into(),
            ));
        }
        self.synchronize_before_reset();

        let mut state = lock(&self.state);
        if let Some(allocation) = self.host_allocation() {
            let packets = self.packets_to_check(&state) as usize;
            let layout = self.geometry.layout();
            allocation
                .storage()
                .write(self.offset, &layout.cleared_bytes(packets))?;
            self.upload(&state, allocation, self.offset, packets * self.geometry.packet_size);
        }
        self.completed.store(false, Ordering::Release);
        state.snapshot = None;
        state.download_watermarks.clear();
        state.l3_flush.iter_mut().for_each(|flag| *flag = false);
        state.gpu_start = None;
        state.gpu_end = None;
        trace!(index = self.index, "Event reset");
        Ok(())
    }

    fn synchronize_before_reset(&self) {
        use neo_sync_core::config::SyncBeforeReset;

        match self.config.synchronize_before_reset {
            SyncBeforeReset::Disabled => {}
            mode => {
                if mode == SyncBeforeReset::SynchronizeAndLog && self.query_status().is_err() {
                    warn!(
                        index = self.index,
                        "Event reset before completion, synchronizing first"
                    );
                }
                if let Err(err) = self.host_synchronize(u64::MAX) {
                    warn!(index = self.index, %err, "Synchronize before reset failed");
                }
            }
        }
    }

    // ─── Completion ──────────────────────────────────────────────────────

    /// First transition into the completed state: snapshot timestamps,
    /// advance the counter watermark, hand back the printf kernel to flush.
    /// Later calls do nothing.
    pub(crate) fn mark_completed(
        &self,
        state: &mut EventState,
    ) -> Result<Option<Arc<dyn PrintfHandler>>> {
        if self.is_completed() {
            return Ok(None);
        }
        if self.is_timestamp() && state.snapshot.is_none() {
            state.snapshot = Some(self.take_snapshot(state)?);
        }
        if self.completed.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        if let Some(in_order) = &self.counter {
            in_order.update_last_waited(state.counter_value);
        }
        trace!(index = self.index, "Event completed");
        Ok(state.printf.take().and_then(|kernel| kernel.upgrade()))
    }

    fn take_snapshot(&self, state: &EventState) -> Result<TimestampSnapshot> {
        let Some(allocation) = self.host_allocation() else {
            return Ok(TimestampSnapshot {
                kernels: Vec::new(),
                l3_flush: Vec::new(),
            });
        };
        let packet_size = self.geometry.packet_size;
        let mut kernels = Vec::with_capacity(state.kernel_packets.len());
        let mut first_packet = 0usize;
        for &packets in &state.kernel_packets {
            kernels.push(allocation.storage().snapshot(
                self.offset + first_packet * packet_size,
                packets as usize * packet_size,
            )?);
            first_packet += packets as usize;
        }
        Ok(TimestampSnapshot {
            kernels,
            l3_flush: state.l3_flush.clone(),
        })
    }

    /// Whether the packet words in host storage show completion.
    pub(crate) fn packets_signaled(&self, state: &EventState, allocation: &Allocation) -> Result<bool> {
        let layout = self.geometry.layout();
        let packet_size = self.geometry.packet_size;
        let count = self.packets_to_check(state) as usize;
        let bytes = allocation.storage().snapshot(self.offset, count * packet_size)?;
        let word_offset = layout.completion_offset(self.use_context_end);
        let timestamp = self.is_timestamp();
        Ok(bytes.chunks_exact(packet_size).all(|packet| {
            let word = layout.read_word(&packet[word_offset..]);
            if timestamp {
                word != u64::from(STATE_CLEARED)
            } else {
                word == u64::from(STATE_SIGNALED)
            }
        }))
    }
}

pub(crate) fn flush_printf(kernel: Option<Arc<dyn PrintfHandler>>) {
    if let Some(kernel) = kernel {
        kernel.flush_printf_output();
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("index", &self.index)
            .field("device", &self.device.id())
            .field("offset", &self.offset)
            .field("flags", &self.flags)
            .field("completed", &self.is_completed())
            .finish()
    }
}
