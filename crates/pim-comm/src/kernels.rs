//! Transfer and reduce kernels over one granule
//!
//! A granule is held as [`Lanes`], one 64-bit word per CI lane, the same
//! shape as a 512-bit vector register. The kernels are branch-light
//! per-lane loops that the compiler vectorises:
//!
//! | Kernel | Effect |
//! |--------|--------|
//! | [`copy`] | plain copy |
//! | [`rotate_lanes`] | lane `i` moves to lane `i + k` (mod 8) |
//! | [`exchange_lanes`] | lane `i` swaps with lane `i ^ bit` |
//! | [`rotate_elements`] | elements rotate inside each lane, in blocks of `group` |
//! | [`reduce_into`] | element-wise sum or max into an accumulator |
//! | [`reduce_lanes`] | butterfly reduction across lanes |
//! | [`blend`] | byte-masked merge |
//!
//! The byte view of a granule assumes a little-endian host.

use crate::error::{CommError, Result};
use pim_chip::rank::{GRANULE_SIZE, NR_CIS, WORD_SIZE};
use std::fmt;

/// One granule: a 64-bit MRAM word per CI lane
pub type Lanes = [u64; NR_CIS];

/// Element width in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementWidth {
    /// 1-byte elements
    W1 = 1,
    /// 2-byte elements
    W2 = 2,
    /// 4-byte elements
    W4 = 4,
    /// 8-byte elements
    W8 = 8,
}

impl ElementWidth {
    /// Width from a byte count
    ///
    /// # Errors
    ///
    /// Returns `InvalidElementSize` for anything but 1, 2, 4 or 8.
    pub const fn from_bytes(size: usize) -> Result<Self> {
        match size {
            1 => Ok(Self::W1),
            2 => Ok(Self::W2),
            4 => Ok(Self::W4),
            8 => Ok(Self::W8),
            _ => Err(CommError::InvalidElementSize { size }),
        }
    }

    /// Bytes per element
    pub const fn bytes(self) -> usize {
        self as usize
    }

    /// Bits per element
    pub const fn bits(self) -> u32 {
        self as u32 * 8
    }
}

impl fmt::Display for ElementWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.bytes())
    }
}

/// Rotation block length (`a_length`): entangled groups per granule, or
/// elements per rotation block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupSize {
    /// No rotation
    One = 1,
    /// Pairs
    Two = 2,
    /// Quads
    Four = 4,
}

impl GroupSize {
    /// Group size from a length
    ///
    /// # Errors
    ///
    /// Returns `InvalidGroupSize` for anything but 1, 2 or 4.
    pub const fn from_len(size: usize) -> Result<Self> {
        match size {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            4 => Ok(Self::Four),
            _ => Err(CommError::InvalidGroupSize { size }),
        }
    }

    /// Number of elements per block
    pub const fn get(self) -> usize {
        self as usize
    }
}

/// Signedness used by max reductions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Signedness {
    /// Two's complement comparison
    #[default]
    Signed,
    /// Unsigned comparison
    Unsigned,
}

/// Reduction operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReduceKind {
    /// Wrapping sum
    #[default]
    Sum,
    /// Maximum
    Max,
}

impl ReduceKind {
    /// Operator from the runtime's numeric code (1 = sum, 2 = max)
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Sum),
            2 => Some(Self::Max),
            _ => None,
        }
    }

    /// Numeric code of the operator
    pub const fn code(self) -> u32 {
        match self {
            Self::Sum => 1,
            Self::Max => 2,
        }
    }
}

impl fmt::Display for ReduceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Max => write!(f, "max"),
        }
    }
}

/// Validated element width and rotation group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelShape {
    width: ElementWidth,
    group: GroupSize,
}

impl KernelShape {
    /// Shape of `group` elements of `width` bytes
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if a block does not fit one 64-bit lane.
    pub fn new(width: ElementWidth, group: GroupSize) -> Result<Self> {
        if width.bytes() * group.get() > WORD_SIZE {
            return Err(CommError::invalid_shape(format!(
                "{group:?} elements of {width} exceed the {WORD_SIZE}-byte lane"
            )));
        }
        Ok(Self { width, group })
    }

    /// Element width
    pub const fn width(self) -> ElementWidth {
        self.width
    }

    /// Rotation group
    pub const fn group(self) -> GroupSize {
        self.group
    }

    /// Bytes per rotation block
    pub const fn span(self) -> usize {
        self.width.bytes() * self.group.get()
    }

    /// Whether a block covers the whole lane (native 64-bit rotate)
    pub const fn is_native(self) -> bool {
        self.span() == WORD_SIZE
    }
}

/// Per-byte select mask over a granule, bit `i` = byte `i` of the byte view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ByteMask(u64);

impl ByteMask {
    /// Every byte
    pub const FULL: Self = Self(u64::MAX);

    /// No byte
    pub const EMPTY: Self = Self(0);

    /// All bytes of the lanes set in `lanes` (bit per lane)
    pub const fn lanes(lanes: u8) -> Self {
        let mut bits = 0u64;
        let mut lane = 0;
        while lane < NR_CIS {
            if lanes & (1 << lane) != 0 {
                bits |= 0xFF << (lane * WORD_SIZE);
            }
            lane += 1;
        }
        Self(bits)
    }

    /// Bytes `[slot * slot_bytes, (slot + 1) * slot_bytes)` of the selected lanes
    pub const fn slot(lanes: u8, slot_bytes: usize, slot: usize) -> Self {
        let in_lane = ((1u64 << slot_bytes) - 1) << (slot * slot_bytes);
        let mut bits = 0u64;
        let mut lane = 0;
        while lane < NR_CIS {
            if lanes & (1 << lane) != 0 {
                bits |= in_lane << (lane * WORD_SIZE);
            }
            lane += 1;
        }
        Self(bits)
    }

    /// Raw bits
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Whether every byte is selected
    pub const fn is_full(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether no byte is selected
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Union of two masks
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether the masks share a byte
    pub const fn overlaps(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

/// Partner lane for each butterfly bit (1, 2, 4)
const EXCHANGE_TABLES: [[usize; NR_CIS]; 3] = [
    [1, 0, 3, 2, 5, 4, 7, 6],
    [2, 3, 0, 1, 6, 7, 4, 5],
    [4, 5, 6, 7, 0, 1, 2, 3],
];

/// Plain copy
#[must_use]
pub const fn copy(src: &Lanes) -> Lanes {
    *src
}

/// Lane rotation: input lane `i` lands in lane `(i + k) mod 8`.
#[must_use]
pub fn rotate_lanes(g: &Lanes, k: usize) -> Lanes {
    let mut out = [0u64; NR_CIS];
    for (i, word) in g.iter().enumerate() {
        out[(i + k) % NR_CIS] = *word;
    }
    out
}

/// Butterfly exchange: output lane `i` is input lane `i ^ bit`.
///
/// # Panics
///
/// Panics if `bit` is not 1, 2 or 4.
#[must_use]
pub fn exchange_lanes(g: &Lanes, bit: usize) -> Lanes {
    assert!(matches!(bit, 1 | 2 | 4), "exchange bit must be 1, 2 or 4");
    let table = &EXCHANGE_TABLES[bit.trailing_zeros() as usize];
    std::array::from_fn(|i| g[table[i]])
}

/// Byte shuffle for an element rotation: `out[i] = in[table[i]]`.
#[must_use]
pub const fn element_shuffle(k: usize, shape: KernelShape) -> [u8; GRANULE_SIZE] {
    let width = shape.width.bytes();
    let group = shape.group.get();
    let span = shape.span();
    let back = (group - k % group) % group;
    let mut table = [0u8; GRANULE_SIZE];
    let mut o = 0;
    while o < GRANULE_SIZE {
        let lane = o / WORD_SIZE;
        let b = o % WORD_SIZE;
        let block = b / span;
        let within = b % span;
        let elem = within / width;
        let byte = within % width;
        let src = lane * WORD_SIZE + block * span + ((elem + back) % group) * width + byte;
        #[allow(clippy::cast_possible_truncation)]
        let src = src as u8;
        table[o] = src;
        o += 1;
    }
    table
}

fn shuffle_bytes(g: &Lanes, table: &[u8; GRANULE_SIZE]) -> Lanes {
    let bytes: [u8; GRANULE_SIZE] = bytemuck::cast(*g);
    let out: [u8; GRANULE_SIZE] = std::array::from_fn(|i| bytes[usize::from(table[i])]);
    bytemuck::cast(out)
}

/// Rotating copy: inside every lane, element `j` of each block of `group`
/// elements moves to position `(j + k) mod group`.
#[must_use]
pub fn rotate_elements(g: &Lanes, k: usize, shape: KernelShape) -> Lanes {
    let k = k % shape.group.get();
    if k == 0 {
        return *g;
    }
    if shape.is_native() {
        #[allow(clippy::cast_possible_truncation)]
        let bits = (k * shape.width.bytes() * 8) as u32;
        return g.map(|w| w.rotate_left(bits));
    }
    shuffle_bytes(g, &element_shuffle(k, shape))
}

/// Post-reduction rotation: bring sub-word slot `slot` (of `slot_bytes`
/// bytes) to slot 0 of every lane.
///
/// # Errors
///
/// Returns a configuration error if `slot_bytes` is not 2 or 4.
pub fn rotate_slot_to_front(g: &Lanes, slot: usize, slot_bytes: usize) -> Result<Lanes> {
    let shape = slot_shape(slot_bytes)?;
    let group = shape.group.get();
    Ok(rotate_elements(g, (group - slot % group) % group, shape))
}

/// Rotation shape for sub-word slots of `slot_bytes`
///
/// # Errors
///
/// Returns a configuration error if `slot_bytes` is not 2 or 4.
pub fn slot_shape(slot_bytes: usize) -> Result<KernelShape> {
    match slot_bytes {
        2 | 4 => KernelShape::new(
            ElementWidth::from_bytes(slot_bytes)?,
            GroupSize::from_len(WORD_SIZE / slot_bytes)?,
        ),
        _ => Err(CommError::invalid_shape(format!(
            "sub-word slot of {slot_bytes} bytes (expected 2 or 4)"
        ))),
    }
}

const fn sign_extend(x: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    #[allow(clippy::cast_possible_wrap)]
    let v = ((x << shift) as i64) >> shift;
    v
}

fn combine_word(a: u64, b: u64, width: ElementWidth, kind: ReduceKind, sign: Signedness) -> u64 {
    let bits = width.bits();
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let mut out = 0u64;
    for e in 0..(64 / bits) {
        let shift = e * bits;
        let x = (a >> shift) & mask;
        let y = (b >> shift) & mask;
        let r = match (kind, sign) {
            (ReduceKind::Sum, _) => x.wrapping_add(y) & mask,
            (ReduceKind::Max, Signedness::Unsigned) => x.max(y),
            (ReduceKind::Max, Signedness::Signed) => {
                if sign_extend(x, bits) >= sign_extend(y, bits) {
                    x
                } else {
                    y
                }
            }
        };
        out |= r << shift;
    }
    out
}

/// Element-wise reduction of `src` into `acc`
pub fn reduce_into(
    acc: &mut Lanes,
    src: &Lanes,
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
) {
    for (a, s) in acc.iter_mut().zip(src) {
        *a = combine_word(*a, *s, width, kind, sign);
    }
}

/// Butterfly reduction across the lanes named by `lane_bits` (a mask of
/// bits 1, 2, 4). Every lane ends up holding the total of the lanes that
/// differ from it only in those bits.
#[must_use]
pub fn reduce_lanes(
    g: &Lanes,
    lane_bits: usize,
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
) -> Lanes {
    let mut acc = *g;
    for bit in [1, 2, 4] {
        if lane_bits & bit != 0 {
            let partner = exchange_lanes(&acc, bit);
            reduce_into(&mut acc, &partner, width, kind, sign);
        }
    }
    acc
}

/// Byte-masked merge: bytes selected by `mask` come from `src`.
#[must_use]
pub fn blend(dst: &Lanes, src: &Lanes, mask: ByteMask) -> Lanes {
    if mask.is_full() {
        return *src;
    }
    if mask.is_empty() {
        return *dst;
    }
    let mut out = *dst;
    for (lane, (o, s)) in out.iter_mut().zip(src).enumerate() {
        let byte_bits = (mask.bits() >> (lane * WORD_SIZE)) & 0xFF;
        let mut word_mask = 0u64;
        for b in 0..WORD_SIZE {
            if byte_bits & (1 << b) != 0 {
                word_mask |= 0xFF << (b * 8);
            }
        }
        *o = (*o & !word_mask) | (s & word_mask);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Lanes {
        std::array::from_fn(|i| 0x0102_0304_0506_0708u64.wrapping_mul(i as u64 + 1))
    }

    #[test]
    fn shape_validation() {
        assert!(KernelShape::new(ElementWidth::W2, GroupSize::Four).is_ok());
        assert!(KernelShape::new(ElementWidth::W4, GroupSize::Four).is_err());
        assert!(ElementWidth::from_bytes(3).is_err());
        assert!(GroupSize::from_len(8).is_err());
        assert!(slot_shape(1).is_err());
        assert_eq!(slot_shape(2).unwrap().group(), GroupSize::Four);
    }

    #[test]
    fn reduce_kind_codes() {
        assert_eq!(ReduceKind::from_code(1), Some(ReduceKind::Sum));
        assert_eq!(ReduceKind::from_code(2), Some(ReduceKind::Max));
        assert_eq!(ReduceKind::from_code(0), None);
        assert_eq!(ReduceKind::Max.code(), 2);
    }

    #[test]
    fn lane_rotation_and_exchange() {
        let g: Lanes = std::array::from_fn(|i| i as u64);
        assert_eq!(rotate_lanes(&g, 3), [5, 6, 7, 0, 1, 2, 3, 4]);
        assert_eq!(rotate_lanes(&rotate_lanes(&g, 3), 5), g);
        assert_eq!(exchange_lanes(&g, 2), [2, 3, 0, 1, 6, 7, 4, 5]);
        assert_eq!(exchange_lanes(&exchange_lanes(&g, 4), 4), g);
    }

    #[test]
    fn rotating_copy_inverse_for_every_shape() {
        let g = sample();
        for width in [ElementWidth::W1, ElementWidth::W2, ElementWidth::W4, ElementWidth::W8] {
            for group in [GroupSize::One, GroupSize::Two, GroupSize::Four] {
                let Ok(shape) = KernelShape::new(width, group) else {
                    continue;
                };
                for k in 0..group.get() {
                    let back = (group.get() - k) % group.get();
                    let r = rotate_elements(&g, k, shape);
                    assert_eq!(rotate_elements(&r, back, shape), g, "{width} {group:?} k={k}");
                }
            }
        }
    }

    #[test]
    fn native_and_shuffled_rotation_agree() {
        let g = sample();
        let shape = KernelShape::new(ElementWidth::W2, GroupSize::Four).unwrap();
        let native = rotate_elements(&g, 1, shape);
        assert_eq!(native, shuffle_bytes(&g, &element_shuffle(1, shape)));
        // element 0 moved to element 1
        assert_eq!((native[0] >> 16) & 0xFFFF, g[0] & 0xFFFF);
    }

    #[test]
    fn sub_lane_rotation_stays_in_block() {
        let shape = KernelShape::new(ElementWidth::W1, GroupSize::Two).unwrap();
        let g = [0x0706_0504_0302_0100u64; NR_CIS];
        let r = rotate_elements(&g, 1, shape);
        assert_eq!(r[0], 0x0607_0405_0203_0001);
    }

    #[test]
    fn slot_to_front() {
        let g = [0x4444_3333_2222_1111u64; NR_CIS];
        let r = rotate_slot_to_front(&g, 2, 2).unwrap();
        assert_eq!(r[0] & 0xFFFF, 0x3333);
        let r = rotate_slot_to_front(&[0xAAAA_AAAA_5555_5555; NR_CIS], 1, 4).unwrap();
        assert_eq!(r[3] & 0xFFFF_FFFF, 0xAAAA_AAAA);
    }

    #[test]
    fn reductions() {
        let mut acc = [0xFF01u64; NR_CIS];
        reduce_into(&mut acc, &[0x0102; NR_CIS], ElementWidth::W1, ReduceKind::Sum, Signedness::Signed);
        assert_eq!(acc[0], 0x0003);
        let mut acc = [0x80u64; NR_CIS];
        reduce_into(&mut acc, &[0x7F; NR_CIS], ElementWidth::W1, ReduceKind::Max, Signedness::Signed);
        assert_eq!(acc[0], 0x7F);
        let mut acc = [0x80u64; NR_CIS];
        reduce_into(&mut acc, &[0x7F; NR_CIS], ElementWidth::W1, ReduceKind::Max, Signedness::Unsigned);
        assert_eq!(acc[0], 0x80);
        let mut acc = [u64::MAX; NR_CIS];
        reduce_into(&mut acc, &[2; NR_CIS], ElementWidth::W8, ReduceKind::Sum, Signedness::Signed);
        assert_eq!(acc[0], 1);
    }

    #[test]
    fn butterfly_reduces_lane_groups() {
        let g: Lanes = std::array::from_fn(|i| i as u64);
        let r = reduce_lanes(&g, 0b011, ElementWidth::W8, ReduceKind::Sum, Signedness::Signed);
        assert_eq!(r, [6, 6, 6, 6, 22, 22, 22, 22]);
        let r = reduce_lanes(&g, 0b100, ElementWidth::W8, ReduceKind::Max, Signedness::Signed);
        assert_eq!(r, [4, 5, 6, 7, 4, 5, 6, 7]);
    }

    #[test]
    fn blend_by_mask() {
        let dst = [0u64; NR_CIS];
        let src = [u64::MAX; NR_CIS];
        let out = blend(&dst, &src, ByteMask::lanes(0b1000_0001));
        assert_eq!(out, [u64::MAX, 0, 0, 0, 0, 0, 0, u64::MAX]);
        let out = blend(&dst, &src, ByteMask::slot(0b10, 2, 1));
        assert_eq!(out[1], 0xFFFF_0000);
        assert!(ByteMask::lanes(0xFF).is_full());
        assert!(!ByteMask::slot(1, 4, 0).overlaps(ByteMask::slot(1, 4, 1)));
    }
}
