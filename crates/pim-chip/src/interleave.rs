//! Byte interleave of one rank cache line.
//!
//! The memory controller stripes every 64-byte line across the 8 chip
//! interfaces byte by byte: byte `i` of the word headed for CI `c` travels at
//! line position `i * 8 + c`. Seen as eight 64-bit words this is an 8×8 byte
//! transpose, so the same routine converts in both directions.
//!
//! ```text
//!   words (per CI)              line (as stored)
//!   c0: a0 a1 .. a7             a0 b0 c0 .. h0 | a1 b1 .. h1 | ... | a7 .. h7
//!   c1: b0 b1 .. b7      <->
//!   ..
//!   c7: h0 h1 .. h7
//! ```

use crate::rank::{GRANULE_SIZE, NR_CIS, WORD_SIZE};

/// Pack one word per CI into the line layout.
#[must_use]
pub fn interleave(words: &[u64; NR_CIS]) -> [u8; GRANULE_SIZE] {
    let mut line = [0u8; GRANULE_SIZE];
    for (ci, word) in words.iter().enumerate() {
        for (byte, value) in word.to_le_bytes().into_iter().enumerate() {
            line[byte * NR_CIS + ci] = value;
        }
    }
    line
}

/// Unpack a line into one word per CI.
#[must_use]
pub fn deinterleave(line: &[u8; GRANULE_SIZE]) -> [u64; NR_CIS] {
    let mut words = [0u64; NR_CIS];
    for (ci, word) in words.iter_mut().enumerate() {
        let mut bytes = [0u8; WORD_SIZE];
        for (byte, slot) in bytes.iter_mut().enumerate() {
            *slot = line[byte * NR_CIS + ci];
        }
        *word = u64::from_le_bytes(bytes);
    }
    words
}
