//! Timestamp packet wire layout.
//!
//! A packet is four words the GPU writes on completion:
//!
//! | offset | field |
//! |---|---|
//! | 0 | context start |
//! | w | global start |
//! | 2w | context end |
//! | 3w | global end |
//!
//! where `w` is the word size (4 or 8 bytes) chosen once per pool from the
//! device's [`TimestampWidth`]. All math is generic over [`PacketWord`].

pub use neo_sync_core::device::TimestampWidth;

/// Word value of a signaled non-timestamp packet.
pub const STATE_SIGNALED: u32 = 0;
/// Word value of a packet the GPU has not written yet.
pub const STATE_CLEARED: u32 = 0xFFFF_FFFF;
/// Word value of a freshly created packet.
pub const STATE_INITIAL: u32 = STATE_CLEARED;

/// Packets per kernel when a device does not report its own maximum.
pub const PREFERRED_PACKET_COUNT: u32 = 16;
/// Kernels one event folds when a device does not report its own maximum.
pub const EVENT_MAX_KERNEL_SPLIT: u32 = 3;
/// Fixed packet count per event when dynamic estimation is off.
pub const EVENT_PACKETS: u32 = PREFERRED_PACKET_COUNT * EVENT_MAX_KERNEL_SPLIT;

/// Unsigned counter word of a timestamp packet.
pub trait PacketWord: Copy + Ord + Into<u64> + Send + Sync + std::fmt::Debug + 'static {
    const BYTES: usize;
    const WIDTH: TimestampWidth;
    const SIGNALED: Self;
    const CLEARED: Self;

    /// Decode from the first `BYTES` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into the first `BYTES` bytes, little endian.
    fn write_le(self, out: &mut [u8]);

    /// Truncate a 64-bit value to this width.
    fn truncate(value: u64) -> Self;

    /// Widen to `u64`, adding one modulus when `self` trails `reference` by
    /// more than half the counter range (the counter wrapped in between).
    fn unwrap_after(self, reference: Self) -> u64;
}

impl PacketWord for u32 {
    const BYTES: usize = 4;
    const WIDTH: TimestampWidth = TimestampWidth::Bits32;
    const SIGNALED: Self = STATE_SIGNALED;
    const CLEARED: Self = STATE_CLEARED;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        u32::from_le_bytes(raw)
    }

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[..4].copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn truncate(value: u64) -> Self {
        value as u32
    }

    #[inline]
    fn unwrap_after(self, reference: Self) -> u64 {
        if self < reference && reference - self > u32::MAX / 2 {
            u64::from(self) + (1u64 << 32)
        } else {
            u64::from(self)
        }
    }
}

impl PacketWord for u64 {
    const BYTES: usize = 8;
    const WIDTH: TimestampWidth = TimestampWidth::Bits64;
    const SIGNALED: Self = STATE_SIGNALED as u64;
    const CLEARED: Self = STATE_CLEARED as u64;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        u64::from_le_bytes(raw)
    }

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.to_le_bytes());
    }

    #[inline]
    fn truncate(value: u64) -> Self {
        value
    }

    #[inline]
    fn unwrap_after(self, _reference: Self) -> u64 {
        self
    }
}

/// One GPU-written completion record.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimestampPacket<W: PacketWord> {
    pub context_start: W,
    pub global_start: W,
    pub context_end: W,
    pub global_end: W,
}

impl<W: PacketWord> TimestampPacket<W> {
    pub const SIZE: usize = 4 * W::BYTES;

    pub const fn cleared() -> Self {
        Self {
            context_start: W::CLEARED,
            global_start: W::CLEARED,
            context_end: W::CLEARED,
            global_end: W::CLEARED,
        }
    }

    /// Start fields set to `start`, end fields to `end`.
    pub fn with_range(start: u64, end: u64) -> Self {
        let (start, end) = (W::truncate(start), W::truncate(end));
        Self {
            context_start: start,
            global_start: start,
            context_end: end,
            global_end: end,
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let w = W::BYTES;
        Self {
            context_start: W::read_le(&bytes[0..]),
            global_start: W::read_le(&bytes[w..]),
            context_end: W::read_le(&bytes[2 * w..]),
            global_end: W::read_le(&bytes[3 * w..]),
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        let w = W::BYTES;
        self.context_start.write_le(&mut out[0..]);
        self.global_start.write_le(&mut out[w..]);
        self.context_end.write_le(&mut out[2 * w..]);
        self.global_end.write_le(&mut out[3 * w..]);
    }

    /// Decode `count` consecutive packets.
    pub fn decode_all(bytes: &[u8], count: usize) -> Vec<Self> {
        bytes
            .chunks_exact(Self::SIZE)
            .take(count)
            .map(Self::decode)
            .collect()
    }
}

/// Width-tagged view of the packet layout, for code that picks the width at
/// run time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketLayout {
    pub width: TimestampWidth,
}

impl PacketLayout {
    pub const fn new(width: TimestampWidth) -> Self {
        Self { width }
    }

    #[inline]
    pub const fn word_size(self) -> usize {
        self.width.word_size()
    }

    #[inline]
    pub const fn packet_size(self) -> usize {
        4 * self.word_size()
    }

    #[inline]
    pub const fn context_start_offset(self) -> usize {
        0
    }

    #[inline]
    pub const fn global_start_offset(self) -> usize {
        self.word_size()
    }

    #[inline]
    pub const fn context_end_offset(self) -> usize {
        2 * self.word_size()
    }

    #[inline]
    pub const fn global_end_offset(self) -> usize {
        3 * self.word_size()
    }

    /// Offset of the word polled for completion inside one packet.
    #[inline]
    pub const fn completion_offset(self, use_context_end: bool) -> usize {
        if use_context_end {
            self.context_end_offset()
        } else {
            self.context_start_offset()
        }
    }

    pub fn read_word(self, bytes: &[u8]) -> u64 {
        match self.width {
            TimestampWidth::Bits32 => u32::read_le(bytes).into(),
            TimestampWidth::Bits64 => u64::read_le(bytes),
        }
    }

    /// Write `value` truncated to the word width.
    pub fn write_word(self, value: u64, out: &mut [u8]) {
        match self.width {
            TimestampWidth::Bits32 => u32::truncate(value).write_le(out),
            TimestampWidth::Bits64 => value.write_le(out),
        }
    }

    /// `count` packets with every word set to [`STATE_CLEARED`].
    pub fn cleared_bytes(self, count: usize) -> Vec<u8> {
        let mut out = vec![0u8; count * self.packet_size()];
        for word in out.chunks_exact_mut(self.word_size()) {
            self.write_word(u64::from(STATE_CLEARED), word);
        }
        out
    }

    /// One packet with start fields set to `start` and end fields to `end`.
    pub fn range_bytes(self, start: u64, end: u64) -> Vec<u8> {
        let mut out = vec![0u8; self.packet_size()];
        match self.width {
            TimestampWidth::Bits32 => TimestampPacket::<u32>::with_range(start, end).encode(&mut out),
            TimestampWidth::Bits64 => TimestampPacket::<u64>::with_range(start, end).encode(&mut out),
        }
        out
    }
}
