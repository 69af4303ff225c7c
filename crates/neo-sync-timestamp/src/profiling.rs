//! Reduction of an event's timestamp packets to one kernel timestamp result.
//!
//! Start values come from the first kernel folded into the event, end values
//! from the last one. The trailing packet of a kernel that ends with an L3
//! flush carries the flush's timestamps, not the kernel's, and is excluded.
//! Narrow counters wrap independently of any event, so every comparison goes
//! through [`PacketWord::unwrap_after`].

use serde::Serialize;

use crate::packet::{PacketLayout, PacketWord, TimestampPacket, TimestampWidth};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TimestampRange {
    pub kernel_start: u64,
    pub kernel_end: u64,
}

/// Global (device-wide) and context (engine-local) execution ranges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KernelTimestampResult {
    pub global: TimestampRange,
    pub context: TimestampRange,
}

/// Reduce per-kernel packet lists to one result.
///
/// `kernels[i]` holds the used packets of the i-th kernel; `l3_flush[i]`
/// marks kernels whose last packet is an L3 flush. Returns `None` when no
/// kernel used any packet.
pub fn calculate_profiling_data<W: PacketWord>(
    kernels: &[&[TimestampPacket<W>]],
    l3_flush: &[bool],
) -> Option<KernelTimestampResult> {
    let first = kernels[kernels.iter().position(|k| !k.is_empty())?];
    let last_index = kernels.iter().rposition(|k| !k.is_empty())?;
    let last = kernels[last_index];

    let context_reference = first[0].context_start;
    let global_reference = first[0].global_start;
    let context_start = first
        .iter()
        .map(|p| p.context_start.unwrap_after(context_reference))
        .min()?;
    let global_start = first
        .iter()
        .map(|p| p.global_start.unwrap_after(global_reference))
        .min()?;

    let flushed = l3_flush.get(last_index).copied().unwrap_or(false);
    let end_packets = if flushed && last.len() > 1 {
        &last[..last.len() - 1]
    } else {
        last
    };
    let context_end = end_packets
        .iter()
        .map(|p| p.context_end.unwrap_after(W::truncate(context_start)))
        .max()?;
    let global_end = end_packets
        .iter()
        .map(|p| p.global_end.unwrap_after(W::truncate(global_start)))
        .max()?;

    Some(KernelTimestampResult {
        global: TimestampRange {
            kernel_start: global_start,
            kernel_end: global_end,
        },
        context: TimestampRange {
            kernel_start: context_start,
            kernel_end: context_end,
        },
    })
}

/// Raw result of one packet, end values unwrapped against their start.
pub fn packet_result<W: PacketWord>(packet: &TimestampPacket<W>) -> KernelTimestampResult {
    KernelTimestampResult {
        global: TimestampRange {
            kernel_start: packet.global_start.into(),
            kernel_end: packet.global_end.unwrap_after(packet.global_start),
        },
        context: TimestampRange {
            kernel_start: packet.context_start.into(),
            kernel_end: packet.context_end.unwrap_after(packet.context_start),
        },
    }
}

/// [`calculate_profiling_data`] over raw packet bytes of the given width.
pub fn calculate_profiling_data_from_bytes(
    layout: PacketLayout,
    kernels: &[&[u8]],
    l3_flush: &[bool],
) -> Option<KernelTimestampResult> {
    fn reduce<W: PacketWord>(kernels: &[&[u8]], l3_flush: &[bool]) -> Option<KernelTimestampResult> {
        let decoded: Vec<Vec<TimestampPacket<W>>> = kernels
            .iter()
            .map(|bytes| {
                TimestampPacket::<W>::decode_all(bytes, bytes.len() / TimestampPacket::<W>::SIZE)
            })
            .collect();
        let views: Vec<&[TimestampPacket<W>]> = decoded.iter().map(Vec::as_slice).collect();
        calculate_profiling_data(&views, l3_flush)
    }

    match layout.width {
        TimestampWidth::Bits32 => reduce::<u32>(kernels, l3_flush),
        TimestampWidth::Bits64 => reduce::<u64>(kernels, l3_flush),
    }
}

/// One [`packet_result`] per packet in `bytes`.
pub fn packet_results_from_bytes(layout: PacketLayout, bytes: &[u8]) -> Vec<KernelTimestampResult> {
    fn each<W: PacketWord>(bytes: &[u8]) -> Vec<KernelTimestampResult> {
        bytes
            .chunks_exact(TimestampPacket::<W>::SIZE)
            .map(|chunk| packet_result(&TimestampPacket::<W>::decode(chunk)))
            .collect()
    }

    match layout.width {
        TimestampWidth::Bits32 => each::<u32>(bytes),
        TimestampWidth::Bits64 => each::<u64>(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet32(cs: u32, gs: u32, ce: u32, ge: u32) -> TimestampPacket<u32> {
        TimestampPacket {
            context_start: cs,
            global_start: gs,
            context_end: ce,
            global_end: ge,
        }
    }

    #[test]
    fn single_packet_passes_through() {
        let p = [packet32(1, 3, 2, 4)];
        let result = calculate_profiling_data(&[&p[..]], &[false]).expect("one packet");
        assert_eq!(result.context.kernel_start, 1);
        assert_eq!(result.context.kernel_end, 2);
        assert_eq!(result.global.kernel_start, 3);
        assert_eq!(result.global.kernel_end, 4);
    }

    #[test]
    fn start_from_first_kernel_end_from_last() {
        let first = [packet32(100, 1000, 150, 1050), packet32(90, 990, 160, 1060)];
        let second = [packet32(10, 500, 400, 1400), packet32(20, 510, 420, 1500)];
        let result = calculate_profiling_data(&[&first[..], &second[..]], &[false, false])
            .expect("packets present");
        // Second kernel's smaller starts are ignored.
        assert_eq!(result.context.kernel_start, 90);
        assert_eq!(result.global.kernel_start, 990);
        // First kernel's ends are ignored.
        assert_eq!(result.context.kernel_end, 420);
        assert_eq!(result.global.kernel_end, 1500);
    }

    #[test]
    fn l3_flush_packet_is_excluded_from_end() {
        let first = [packet32(10, 20, 30, 40)];
        let second = [packet32(50, 60, 70, 80), packet32(90, 100, 9000, 9999)];
        let result = calculate_profiling_data(&[&first[..], &second[..]], &[false, true])
            .expect("packets present");
        assert_eq!(result.context.kernel_start, 10);
        assert_eq!(result.context.kernel_end, 70);
        assert_eq!(result.global.kernel_end, 80);
    }

    #[test]
    fn single_flush_packet_is_kept() {
        let only = [packet32(1, 2, 3, 4)];
        let result = calculate_profiling_data(&[&only[..]], &[true]).expect("one packet");
        assert_eq!(result.global.kernel_end, 4);
    }

    #[test]
    fn narrow_end_wraps_past_start() {
        let p = [packet32(0xFFFF_FF00, 0xFFFF_FF00, 0x0000_0100, 0x0000_0200)];
        let result = calculate_profiling_data(&[&p[..]], &[false]).expect("one packet");
        assert_eq!(result.context.kernel_start, 0xFFFF_FF00);
        assert_eq!(result.context.kernel_end, 0x1_0000_0100);
        assert_eq!(result.global.kernel_end, 0x1_0000_0200);
        assert!(result.global.kernel_end > result.global.kernel_start);
    }

    #[test]
    fn wide_counters_never_unwrap() {
        let p = [TimestampPacket::<u64> {
            context_start: 5,
            global_start: 6,
            context_end: 1 << 40,
            global_end: 1 << 41,
        }];
        let result = calculate_profiling_data(&[&p[..]], &[false]).expect("one packet");
        assert_eq!(result.context.kernel_end, 1 << 40);
    }

    #[test]
    fn empty_kernels_yield_none() {
        let empty: [TimestampPacket<u32>; 0] = [];
        assert!(calculate_profiling_data(&[&empty[..]], &[false]).is_none());
        assert!(calculate_profiling_data::<u32>(&[], &[]).is_none());
    }

    #[test]
    fn byte_entry_point_matches_typed_reduction() {
        let layout = PacketLayout::new(TimestampWidth::Bits64);
        let mut bytes = layout.range_bytes(100, 200);
        bytes.extend(layout.range_bytes(90, 250));
        let result =
            calculate_profiling_data_from_bytes(layout, &[bytes.as_slice()], &[false]).expect("packets");
        assert_eq!(result.context.kernel_start, 90);
        assert_eq!(result.context.kernel_end, 250);

        let per_packet = packet_results_from_bytes(layout, &bytes);
        assert_eq!(per_packet.len(), 2);
        assert_eq!(per_packet[1].global.kernel_start, 90);
    }
}
