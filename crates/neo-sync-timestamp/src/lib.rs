#![doc = include_str!("../README.md")]

pub mod packet;
pub mod profiling;
pub mod sync_clock;

pub use packet::{
    EVENT_MAX_KERNEL_SPLIT, EVENT_PACKETS, PREFERRED_PACKET_COUNT, PacketLayout, PacketWord,
    STATE_CLEARED, STATE_INITIAL, STATE_SIGNALED, TimestampPacket, TimestampWidth,
};
pub use profiling::{KernelTimestampResult, TimestampRange, calculate_profiling_data};
pub use sync_clock::SynchronizedClock;
