//! MRAM address translation for the rank region.
//!
//! Established by probing the Xeon SP memory controller mapping.
//!
//! A logical MRAM offset goes through two layers before it names a byte of
//! the rank region:
//!
//! 1. **Bit permutation** over the 26-bit MRAM address:
//!
//!    ```text
//!    logical[13: 0] -> permuted[13: 0]
//!    logical[21:15] -> permuted[20:14]
//!    logical[   14] -> permuted[   21]
//!    logical[25:22] -> permuted[25:22]
//!    ```
//!
//! 2. **Bank chunk remap**: each permuted 64-bit word owns a 128-byte stride
//!    (two cache lines, one per member half), strides are packed into 128 KiB
//!    chunks and consecutive chunks sit 1 MiB apart. Members `m % 4` take
//!    consecutive 256 KiB quarters of each MiB; members `>= 4` use the odd
//!    cache line of every stride.
//!
//! The permutation is a bijection but not an involution; use
//! [`unpermute_mram_offset`] to invert it.

use crate::rank::{NR_CIS, NR_DPUS_PER_CI, WORD_SIZE};

/// Region bytes between consecutive MRAM words of one member.
pub const BANK_WORD_STRIDE: u64 = 16 * WORD_SIZE as u64; // 128 B

/// Contiguous run of strides before jumping to the next chunk.
pub const BANK_CHUNK_SIZE: u64 = 0x2_0000; // 128 KiB

/// Distance between consecutive chunks.
pub const BANK_NEXT_CHUNK_OFFSET: u64 = 0x10_0000; // 1 MiB

/// Region bytes of one member quarter inside a chunk window.
pub const BANK_MEMBER_QUARTER: u64 = 0x4_0000; // 256 KiB

/// Offset of the odd cache line used by members 4..8.
pub const BANK_UPPER_HALF: u64 = 0x40;

/// MRAM offsets are 26 bits wide.
pub const MRAM_ADDRESS_BITS: u32 = 26;

/// Smallest MRAM size for which the permutation stays inside the MRAM.
pub const MIN_PERMUTATION_SPAN: usize = 1 << 22; // 4 MiB

const MASK_21_TO_15: u32 = ((1 << (21 - 15 + 1)) - 1) << 15;
const MASK_20_TO_14: u32 = ((1 << (20 - 14 + 1)) - 1) << 14;
const MASK_21_TO_14: u32 = ((1 << (21 - 14 + 1)) - 1) << 14;

/// Apply the MRAM bit permutation.
#[must_use]
pub const fn permute_mram_offset(offset: u32) -> u32 {
    let bits_21_to_15 = (offset & MASK_21_TO_15) >> 15;
    let bit_14 = (offset >> 14) & 1;
    let unchanged = offset & !MASK_21_TO_14;
    unchanged | (bits_21_to_15 << 14) | (bit_14 << 21)
}

/// Invert [`permute_mram_offset`].
#[must_use]
pub const fn unpermute_mram_offset(offset: u32) -> u32 {
    let bits_20_to_14 = (offset & MASK_20_TO_14) >> 14;
    let bit_21 = (offset >> 21) & 1;
    let unchanged = offset & !MASK_21_TO_14;
    unchanged | (bits_20_to_14 << 15) | (bit_21 << 14)
}

/// Start of a member's bank inside the rank region.
///
/// # Panics
///
/// Panics if `member >= 8`.
#[must_use]
pub const fn bank_start(member: u8) -> u64 {
    assert!((member as usize) < NR_DPUS_PER_CI, "member out of rank");
    BANK_MEMBER_QUARTER * (member % 4) as u64 + if member >= 4 { BANK_UPPER_HALF } else { 0 }
}

/// Region offset, relative to a bank start, of the line holding the MRAM
/// word at `logical` (low three bits ignored).
#[must_use]
pub const fn word_region_offset(logical: u32) -> u64 {
    let word = (permute_mram_offset(logical) / WORD_SIZE as u32) as u64;
    let next_data = word * BANK_WORD_STRIDE;
    (next_data % BANK_CHUNK_SIZE) + (next_data / BANK_CHUNK_SIZE) * BANK_NEXT_CHUNK_OFFSET
}

/// Region offset of the line holding `logical` for `member`.
#[must_use]
pub const fn line_offset(member: u8, logical: u32) -> u64 {
    bank_start(member) + word_region_offset(logical)
}

/// Region offset of byte `logical` of the DPU at (`member`, `lane`).
///
/// Inside a line, byte `b` of the word of CI `c` sits at `b * 8 + c`.
#[must_use]
pub const fn byte_region_offset(member: u8, lane: u8, logical: u32) -> u64 {
    line_offset(member, logical) + (logical as u64 % WORD_SIZE as u64) * NR_CIS as u64 + lane as u64
}

/// Logical MRAM offset → physical region offset (member 0, CI 0).
#[must_use]
pub const fn translate(logical: u32) -> u64 {
    byte_region_offset(0, 0, logical)
}

/// A region byte resolved back to its DPU and MRAM offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalByte {
    /// Member owning the bank.
    pub member: u8,
    /// Chip interface (lane inside the line).
    pub lane: u8,
    /// Logical MRAM byte offset.
    pub logical: u32,
}

/// Resolve a region offset. `None` for bytes outside the bank layout.
#[must_use]
pub fn locate(physical: u64) -> Option<PhysicalByte> {
    let window = physical / BANK_NEXT_CHUNK_OFFSET;
    let within = physical % BANK_NEXT_CHUNK_OFFSET;
    let quarter = within / BANK_MEMBER_QUARTER;
    let inner = within % BANK_MEMBER_QUARTER;
    let upper = inner & BANK_UPPER_HALF != 0;
    let in_stride = inner % BANK_WORD_STRIDE;
    let line_base = inner - in_stride;
    let byte_in_line = in_stride - if upper { BANK_UPPER_HALF } else { 0 };
    if line_base >= BANK_CHUNK_SIZE || byte_in_line >= BANK_UPPER_HALF {
        return None;
    }

    let next_data = window * BANK_CHUNK_SIZE + line_base;
    let word = u32::try_from(next_data / BANK_WORD_STRIDE).ok()?;
    let permuted = word.checked_mul(WORD_SIZE as u32)?;
    if permuted >> MRAM_ADDRESS_BITS != 0 {
        return None;
    }

    #[allow(clippy::cast_possible_truncation)]
    let member = (quarter as u8) + if upper { 4 } else { 0 };
    #[allow(clippy::cast_possible_truncation)]
    let lane = (byte_in_line % NR_CIS as u64) as u8;
    #[allow(clippy::cast_possible_truncation)]
    let byte = (byte_in_line / NR_CIS as u64) as u32;
    Some(PhysicalByte {
        member,
        lane,
        logical: unpermute_mram_offset(permuted) + byte,
    })
}

/// Physical region offset → logical MRAM offset, for bytes of member 0, CI 0.
#[must_use]
pub fn physical_to_logical(physical: u64) -> Option<u32> {
    locate(physical)
        .filter(|b| b.member == 0 && b.lane == 0)
        .map(|b| b.logical)
}

/// Region bytes one rank needs so every member can address `mram_bytes`.
#[must_use]
pub const fn region_span(mram_bytes: usize) -> u64 {
    let effective = if mram_bytes < MIN_PERMUTATION_SPAN {
        MIN_PERMUTATION_SPAN
    } else {
        mram_bytes
    };
    effective as u64 * (BANK_WORD_STRIDE / WORD_SIZE as u64) / BANK_CHUNK_SIZE * BANK_NEXT_CHUNK_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn permutation_moves_documented_bits() {
        assert_eq!(permute_mram_offset(1 << 14), 1 << 21);
        assert_eq!(permute_mram_offset(1 << 15), 1 << 14);
        assert_eq!(permute_mram_offset(1 << 21), 1 << 20);
        assert_eq!(permute_mram_offset(0x3FFF), 0x3FFF);
        assert_eq!(permute_mram_offset(1 << 22), 1 << 22);
    }

    #[test]
    fn permutation_is_not_an_involution() {
        let o = 1 << 14;
        assert_ne!(permute_mram_offset(permute_mram_offset(o)), o);
        assert_eq!(unpermute_mram_offset(permute_mram_offset(o)), o);
    }

    #[test]
    fn unpermute_inverts_over_window_bits() {
        for high in 0..256u32 {
            let o = (high << 14) | 0x1238;
            assert_eq!(unpermute_mram_offset(permute_mram_offset(o)), o);
            assert_eq!(permute_mram_offset(unpermute_mram_offset(o)), o);
        }
    }

    #[test]
    fn bank_starts() {
        assert_eq!(bank_start(0), 0);
        assert_eq!(bank_start(1), 0x40000);
        assert_eq!(bank_start(3), 0xC0000);
        assert_eq!(bank_start(4), 0x40);
        assert_eq!(bank_start(7), 0xC0040);
    }

    #[test]
    fn first_chunk_is_contiguous_strides() {
        assert_eq!(word_region_offset(0), 0);
        assert_eq!(word_region_offset(8), 128);
        assert_eq!(word_region_offset(1023 * 8), 1023 * 128);
        // bit 14 of the logical offset jumps to bit 21 -> far chunk
        assert_eq!(word_region_offset(1 << 14), (1 << 21) / 8 * 128 / BANK_CHUNK_SIZE * BANK_NEXT_CHUNK_OFFSET);
    }

    #[test]
    fn translate_roundtrip_first_mebibytes() {
        for o in (0..(4u32 << 20)).step_by(8) {
            assert_eq!(physical_to_logical(translate(o)), Some(o), "offset {o:#x}");
        }
    }

    #[test]
    fn translate_roundtrip_whole_bank() {
        let mram = crate::rank::MRAM_SIZE as u32;
        // odd word stride, so every permuted bit pattern gets visited
        for o in (0..mram).step_by(8 * 4099).chain([mram - 8, mram - 1]) {
            assert_eq!(physical_to_logical(translate(o)), Some(o), "offset {o:#x}");
            let member = (o % 8) as u8;
            let lane = ((o / 8) % 8) as u8;
            let byte = locate(byte_region_offset(member, lane, o)).expect("resolvable");
            assert_eq!((byte.member, byte.lane, byte.logical), (member, lane, o));
        }
    }

    #[test]
    fn translate_injective_with_byte_lanes() {
        let mut seen = HashSet::new();
        for member in 0..8u8 {
            for lane in 0..8u8 {
                for o in (0..(1u32 << 16)).step_by(3) {
                    assert!(seen.insert(byte_region_offset(member, lane, o)));
                }
            }
        }
    }

    #[test]
    fn locate_recovers_member_and_lane() {
        let p = byte_region_offset(6, 3, 0x12_3455);
        assert_eq!(
            locate(p),
            Some(PhysicalByte { member: 6, lane: 3, logical: 0x12_3455 })
        );
        // odd line of a stride belongs to the upper member
        assert_eq!(locate(0x40).map(|b| b.member), Some(4));
        // gap between the chunk and the next member quarter
        assert_eq!(locate(BANK_CHUNK_SIZE), None);
    }

    #[test]
    fn region_span_covers_full_mram() {
        let span = region_span(crate::rank::MRAM_SIZE);
        assert_eq!(span, 8 * 1024 * 1024 * 1024);
        let last = crate::rank::MRAM_SIZE as u32 - 8;
        for member in 0..8 {
            assert!(line_offset(member, last) + 64 <= span);
        }
        assert_eq!(region_span(1 << 20), region_span(4 << 20));
    }
}
