//! Hypercube topology and granule planning
//!
//! Units form a hypercube of at most three power-of-two axes laid over the
//! flat unit index, x fastest:
//!
//! ```text
//! flat index bits:   [ z ... | y ... | x ... ]
//!                      \________ rank / member ________/\_ lane _/
//!                                  bits 3..               bits 0..3
//! ```
//!
//! The low three bits pick the CI lane inside a granule, the rest pick the
//! row (rank and member). A communication group is the set of units that
//! differ only in participating axes; its partner bits split into
//!
//! - **lane bits**: partners that share every granule, moved by lane
//!   rotation or butterfly exchange inside one register;
//! - **row bits**: partners in other rows, combined by loading several
//!   granules.
//!
//! When a group has lane partners, `8 / lanes-per-group` independent groups
//! are entangled in every granule. Moving all of them with one masked
//! rotation works because every lane of a group is displaced by the same
//! amount.

use crate::error::{CommError, Result};
use crate::fabric::GranuleAddr;
use crate::kernels::{slot_shape, ByteMask, ElementWidth, GroupSize, KernelShape};
use pim_chip::rank::{NR_CIS, NR_DPUS_PER_CI, NR_DPUS_PER_RANK, WORD_SIZE};
use std::fmt;

/// Maximum number of hypercube axes
pub const MAX_AXES: usize = 3;

const LANE_BITS: usize = NR_CIS - 1;

/// Scatter the low bits of `value` into the set bits of `mask`.
pub const fn expand_bits(value: usize, mask: usize) -> usize {
    let mut out = 0;
    let mut m = mask;
    let mut v = value;
    while m != 0 {
        let low = m & m.wrapping_neg();
        if v & 1 != 0 {
            out |= low;
        }
        v >>= 1;
        m &= m - 1;
    }
    out
}

/// Gather the bits of `value` selected by `mask` into the low bits.
pub const fn compress_bits(value: usize, mask: usize) -> usize {
    let mut out = 0;
    let mut m = mask;
    let mut i = 0;
    while m != 0 {
        let low = m & m.wrapping_neg();
        if value & low != 0 {
            out |= 1 << i;
        }
        i += 1;
        m &= m - 1;
    }
    out
}

/// Position of a unit in the rank fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitLocation {
    /// Rank index
    pub rank: usize,
    /// Member (rotation group) inside the rank
    pub member: u8,
    /// CI lane inside the granule
    pub lane: u8,
}

/// Shape of the unit hypercube
///
/// Read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HypercubeManager {
    dimension: usize,
    axis_len: [usize; MAX_AXES],
}

impl HypercubeManager {
    /// Hypercube with the given axis lengths (x first)
    ///
    /// # Errors
    ///
    /// Returns `InvalidTopology` for zero or more than three axes, or an
    /// axis length that is not a power of two.
    pub fn new(axis_len: &[usize]) -> Result<Self> {
        if axis_len.is_empty() || axis_len.len() > MAX_AXES {
            return Err(CommError::invalid_topology(format!(
                "{} axes given, expected 1..={MAX_AXES}",
                axis_len.len()
            )));
        }
        let mut lens = [1; MAX_AXES];
        for (i, &len) in axis_len.iter().enumerate() {
            if !len.is_power_of_two() {
                return Err(CommError::invalid_topology(format!(
                    "axis {} has length {len}, not a power of two",
                    AXIS_NAMES[i]
                )));
            }
            lens[i] = len;
        }
        if lens.iter().try_fold(1usize, |n, &len| n.checked_mul(len)).is_none() {
            return Err(CommError::invalid_topology(format!(
                "{axis_len:?} units overflow the address space"
            )));
        }
        Ok(Self {
            dimension: axis_len.len(),
            axis_len: lens,
        })
    }

    /// Named axes
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Axis lengths, unused axes fixed at 1
    pub const fn axis_len(&self) -> [usize; MAX_AXES] {
        self.axis_len
    }

    /// Units in the hypercube
    pub const fn unit_count(&self) -> usize {
        self.axis_len[0] * self.axis_len[1] * self.axis_len[2]
    }

    /// Ranks the hypercube spans
    pub const fn ranks_needed(&self) -> usize {
        self.unit_count().div_ceil(NR_DPUS_PER_RANK)
    }

    /// Granule rows (rank members) holding at least one unit
    pub const fn rows(&self) -> usize {
        self.unit_count().div_ceil(NR_CIS)
    }

    /// `(x, y, z)` of a unit
    pub const fn coords(&self, unit: usize) -> [usize; MAX_AXES] {
        let [a, b, _] = self.axis_len;
        [unit % a, (unit / a) % b, unit / (a * b)]
    }

    /// Unit at `(x, y, z)`
    pub const fn unit_at(&self, coords: [usize; MAX_AXES]) -> usize {
        let [a, b, _] = self.axis_len;
        coords[0] + a * (coords[1] + b * coords[2])
    }

    /// Rank, member and lane of a unit
    pub const fn location(&self, unit: usize) -> UnitLocation {
        #[allow(clippy::cast_possible_truncation)]
        let member = ((unit % NR_DPUS_PER_RANK) / NR_CIS) as u8;
        #[allow(clippy::cast_possible_truncation)]
        let lane = (unit % NR_CIS) as u8;
        UnitLocation {
            rank: unit / NR_DPUS_PER_RANK,
            member,
            lane,
        }
    }

    /// Flat-index bits owned by `axis`
    pub const fn axis_bits(&self, axis: usize) -> usize {
        let mut shift = 0;
        let mut i = 0;
        while i < axis {
            shift += self.axis_len[i].trailing_zeros();
            i += 1;
        }
        (self.axis_len[axis] - 1) << shift
    }

    /// Communication groups for `comm`, ordered by lowest unit
    pub fn groups(&self, comm: CommAxis) -> Vec<CommGroup> {
        let bits = comm.participating_bits(self);
        let partners = 1usize << bits.count_ones();
        (0..self.unit_count())
            .filter(|u| u & bits == 0)
            .enumerate()
            .map(|(index, base)| CommGroup {
                index,
                units: (0..partners).map(|p| base | expand_bits(p, bits)).collect(),
            })
            .collect()
    }

    /// Partner index of `unit` inside its group (x fastest)
    pub const fn partner_index(&self, comm: CommAxis, unit: usize) -> usize {
        compress_bits(unit, comm.participating_bits(self))
    }

    /// Partners per group
    pub const fn partners(&self, comm: CommAxis) -> usize {
        1 << comm.participating_bits(self).count_ones()
    }

    /// Transfer descriptors issued by `source_unit` for one collective
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the layout does not split into
    /// per-partner slots.
    pub fn plan(
        &self,
        op: CollectiveOp,
        comm: CommAxis,
        source_unit: usize,
        layout: TransferLayout,
    ) -> Result<Vec<TransferDescriptor>> {
        let bits = comm.participating_bits(self);
        let partners = self.partners(comm);
        let p = self.partner_index(comm, source_unit);
        let base = source_unit & !bits;
        let unit_of = |q: usize| base | expand_bits(q, bits);
        let d = layout.total;
        let shard = if op.splits_by_partner() {
            check_slot(d, partners, layout.element)?
        } else {
            d
        };
        let desc = |dest_units: Vec<usize>, source_offset, dest_offset, byte_length| {
            let rotations = dest_units
                .iter()
                .map(|&dst| Rotation::between(source_unit, source_offset, dst, dest_offset, byte_length))
                .collect();
            TransferDescriptor {
                source_unit,
                dest_units,
                source_offset,
                dest_offset,
                byte_length,
                element_size: layout.element,
                rotations,
            }
        };

        let plan = match op {
            CollectiveOp::AllToAll => (0..partners)
                .map(|q| desc(vec![unit_of(q)], layout.start + q * shard, layout.target + p * shard, shard))
                .collect(),
            CollectiveOp::ReduceScatter => (0..partners)
                .map(|q| desc(vec![unit_of(q)], layout.start + q * shard, layout.target, shard))
                .collect(),
            CollectiveOp::AllGather => vec![desc(
                (0..partners).map(unit_of).collect(),
                layout.start,
                layout.target + p * d,
                d,
            )],
            CollectiveOp::AllReduce => vec![desc(
                (0..partners).map(unit_of).collect(),
                layout.start,
                layout.target,
                d,
            )],
            // host-side: dest offset is the position in the group's host buffer
            CollectiveOp::Gather => vec![desc(Vec::new(), layout.start, p * d, d)],
            CollectiveOp::Reduce => vec![desc(Vec::new(), layout.start, 0, d)],
            CollectiveOp::Scatter => vec![desc(vec![source_unit], p * d, layout.target, d)],
            CollectiveOp::Broadcast => vec![desc(vec![source_unit], 0, layout.target, d)],
        };
        Ok(plan)
    }
}

const AXIS_NAMES: [char; MAX_AXES] = ['x', 'y', 'z'];

/// Participating axes of a collective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommAxis {
    mask: u8,
    dimension: u8,
}

impl CommAxis {
    /// Parse a `'0'/'1'` string, one character per axis (x first)
    ///
    /// # Errors
    ///
    /// Returns `InvalidAxisSpec` if the length differs from `dimension`,
    /// a character is not `0` or `1`, or no axis participates.
    pub fn parse(spec: &str, dimension: usize) -> Result<Self> {
        if spec.len() != dimension {
            return Err(CommError::invalid_axis(
                spec,
                format!("length {} does not match dimension {dimension}", spec.len()),
            ));
        }
        let mut mask = 0u8;
        for (i, c) in spec.chars().enumerate() {
            match c {
                '1' => mask |= 1 << i,
                '0' => {}
                other => {
                    return Err(CommError::invalid_axis(spec, format!("unexpected {other:?}")));
                }
            }
        }
        if mask == 0 {
            return Err(CommError::invalid_axis(spec, "no axis participates"));
        }
        #[allow(clippy::cast_possible_truncation)]
        let dimension = dimension as u8;
        Ok(Self { mask, dimension })
    }

    /// Whether `axis` (0 = x) participates
    pub const fn participates(self, axis: usize) -> bool {
        axis < MAX_AXES && self.mask & (1 << axis) != 0
    }

    /// Flat-index bits of the participating axes
    pub const fn participating_bits(self, cube: &HypercubeManager) -> usize {
        let mut bits = 0;
        let mut axis = 0;
        while axis < MAX_AXES {
            if self.participates(axis) {
                bits |= cube.axis_bits(axis);
            }
            axis += 1;
        }
        bits
    }

    /// Participating bits inside the CI lane
    pub const fn lane_bits(self, cube: &HypercubeManager) -> usize {
        self.participating_bits(cube) & LANE_BITS
    }

    /// Participating bits that select the row
    pub const fn row_bits(self, cube: &HypercubeManager) -> usize {
        self.participating_bits(cube) & !LANE_BITS
    }
}

impl fmt::Display for CommAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for axis in 0..usize::from(self.dimension) {
            f.write_str(if self.participates(axis) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// One communication group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommGroup {
    /// Group number, by lowest unit
    pub index: usize,
    /// Units in partner order
    pub units: Vec<usize>,
}

/// Collective operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectiveOp {
    /// Host data to every unit
    Broadcast,
    /// Personalised exchange
    AllToAll,
    /// Every partner receives every partner's block
    AllGather,
    /// Partner blocks to one host buffer per group
    Gather,
    /// Host buffer per group split over partners
    Scatter,
    /// Group total to one host buffer per group
    Reduce,
    /// Group total to every partner
    AllReduce,
    /// Shard `q` of the group total to partner `q`
    ReduceScatter,
}

impl CollectiveOp {
    /// Whether the per-unit block is split into one slot per partner
    pub const fn splits_by_partner(self) -> bool {
        matches!(self, Self::AllToAll | Self::ReduceScatter)
    }

    /// Whether the operation combines partner data
    pub const fn reduces(self) -> bool {
        matches!(self, Self::Reduce | Self::AllReduce | Self::ReduceScatter)
    }
}

impl fmt::Display for CollectiveOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Broadcast => "broadcast",
            Self::AllToAll => "alltoall",
            Self::AllGather => "all_gather",
            Self::Gather => "gather",
            Self::Scatter => "scatter",
            Self::Reduce => "reduce",
            Self::AllReduce => "all_reduce",
            Self::ReduceScatter => "reduce_scatter",
        };
        f.write_str(name)
    }
}

/// Offsets and sizes shared by every unit of a collective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLayout {
    /// Bytes per unit (`total_data_size`)
    pub total: usize,
    /// Source MRAM offset
    pub start: usize,
    /// Destination MRAM offset
    pub target: usize,
    /// Element width
    pub element: ElementWidth,
}

/// Lane and sub-word slot displacement of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rotation {
    /// `(lane(dest) - lane(source)) mod 8`
    pub lanes: usize,
    /// Slot displacement inside the 64-bit word, in slots of the transfer
    pub slot: usize,
}

impl Rotation {
    fn between(src: usize, src_off: usize, dst: usize, dst_off: usize, len: usize) -> Self {
        let lanes = (dst % NR_CIS + NR_CIS - src % NR_CIS) % NR_CIS;
        let slot = if len % WORD_SIZE == 0 || len == 0 {
            0
        } else {
            let per_word = WORD_SIZE / len;
            let s = (src_off % WORD_SIZE) / len;
            let d = (dst_off % WORD_SIZE) / len;
            (d + per_word - s) % per_word
        };
        Self { lanes, slot }
    }
}

/// One transfer issued by a source unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// Issuing unit
    pub source_unit: usize,
    /// Receiving units (empty for host-side destinations)
    pub dest_units: Vec<usize>,
    /// Source offset (MRAM, or host buffer for scatter/broadcast)
    pub source_offset: usize,
    /// Destination offset (MRAM, or host buffer for gather/reduce)
    pub dest_offset: usize,
    /// Bytes moved
    pub byte_length: usize,
    /// Element width
    pub element_size: ElementWidth,
    /// Displacement towards each destination
    ///
    /// Informational only. The library path takes its granule steps from
    /// [`GranulePlanner`], and host-staged collectives only use the offsets.
    pub rotations: Vec<Rotation>,
}

/// Per-partner slot size for a split collective
///
/// # Errors
///
/// Returns a configuration error if the block does not split evenly or the
/// slot is not a multiple of 8 bytes nor a 2- or 4-byte sub-word slot wide
/// enough for one element.
pub fn check_slot(total: usize, partners: usize, element: ElementWidth) -> Result<usize> {
    if total % partners != 0 {
        return Err(CommError::invalid_shape(format!(
            "{total} bytes do not split over {partners} partners"
        )));
    }
    let slot = total / partners;
    if slot % WORD_SIZE != 0 {
        slot_shape(slot)?;
    }
    if element.bytes() > slot {
        return Err(CommError::invalid_shape(format!(
            "{element} elements do not fit a {slot}-byte slot"
        )));
    }
    Ok(slot)
}

/// Whether lane partners exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Orientation {
    /// Partners share granules: lane rotation and butterfly
    Parallel,
    /// Partners sit in different rows at the same lane
    Perpendicular,
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Perpendicular => write!(f, "perpendicular"),
        }
    }
}

/// Rotation path of the hypercube shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RotationPath {
    /// x covers the whole lane field
    Base,
    /// x and y together cover the lane field
    Entangled24,
    /// z also reaches into the lane field
    Entangled22,
}

impl RotationPath {
    /// Path for a hypercube shape
    pub const fn of(cube: &HypercubeManager) -> Self {
        let [a, b, _] = cube.axis_len;
        if a >= NR_CIS {
            Self::Base
        } else if a * b >= NR_CIS {
            Self::Entangled24
        } else {
            Self::Entangled22
        }
    }
}

impl fmt::Display for RotationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base => write!(f, "rg"),
            Self::Entangled24 => write!(f, "rg_24"),
            Self::Entangled22 => write!(f, "rg_22"),
        }
    }
}

/// In-fabric collectives the granule planner handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryOp {
    /// See [`CollectiveOp::AllToAll`]
    AllToAll,
    /// See [`CollectiveOp::AllGather`]
    AllGather,
    /// See [`CollectiveOp::ReduceScatter`]
    ReduceScatter,
    /// See [`CollectiveOp::AllReduce`]
    AllReduce,
    /// Lane-preserving copy of every unit's block (bounce buffer)
    Copy,
}

/// Element rotation applied after the lane stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRotation {
    /// Slot shape
    pub shape: KernelShape,
    /// Positions to rotate by
    pub k: usize,
}

/// One source term of a destination granule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    /// Granules reduced element-wise in order (one for a plain copy)
    pub sources: Vec<GranuleAddr>,
    /// Lane bits reduced by butterfly after the vertical reduction
    pub lane_bits: usize,
    /// Lane rotation
    pub lane_rotation: usize,
    /// Sub-word slot rotation
    pub slot_rotation: Option<SlotRotation>,
    /// Bytes of the destination taken from this term
    pub mask: ByteMask,
}

/// Everything needed to produce one destination granule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GranuleStep {
    /// Destination granule
    pub dst: GranuleAddr,
    /// Source terms, with disjoint masks
    pub contributions: Vec<Contribution>,
    /// Whether the contributions cover every byte (no read-modify-write)
    pub full_overwrite: bool,
}

/// Steps executed between one acquire and one publish
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepBatch {
    /// Steps, in destination order
    pub steps: Vec<GranuleStep>,
}

impl StepBatch {
    /// Distinct lines to acquire before running the batch
    pub fn lines(&self) -> Vec<GranuleAddr> {
        let mut lines: Vec<GranuleAddr> = self
            .steps
            .iter()
            .flat_map(|s| {
                s.contributions
                    .iter()
                    .flat_map(|c| c.sources.iter().copied())
                    .chain((!s.full_overwrite).then_some(s.dst))
            })
            .collect();
        lines.sort_unstable();
        lines.dedup();
        lines
    }
}

/// Granule planner for one in-fabric collective
#[derive(Debug, Clone)]
pub struct GranulePlanner {
    op: LibraryOp,
    unit_count: usize,
    participating: usize,
    lane_bits: usize,
    row_bits: usize,
    rotation_path: RotationPath,
    start: usize,
    target: usize,
    total: usize,
    slot: usize,
    sub_word: Option<KernelShape>,
}

impl GranulePlanner {
    /// Plan `op` over `comm`
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unaligned offsets or a block that
    /// does not split into valid slots.
    pub fn new(
        cube: &HypercubeManager,
        comm: CommAxis,
        op: LibraryOp,
        layout: TransferLayout,
    ) -> Result<Self> {
        for (what, value) in [
            ("total data size", layout.total),
            ("start offset", layout.start),
            ("target offset", layout.target),
        ] {
            if value % WORD_SIZE != 0 {
                return Err(CommError::Misaligned {
                    what,
                    value,
                    align: WORD_SIZE,
                });
            }
        }
        let partners = cube.partners(comm);
        let slot = match op {
            LibraryOp::AllToAll | LibraryOp::ReduceScatter => {
                check_slot(layout.total, partners, layout.element)?
            }
            _ => layout.total,
        };
        let sub_word = if slot % WORD_SIZE == 0 {
            None
        } else {
            Some(slot_shape(slot)?)
        };
        Ok(Self {
            op,
            unit_count: cube.unit_count(),
            participating: comm.participating_bits(cube),
            lane_bits: comm.lane_bits(cube),
            row_bits: comm.row_bits(cube),
            rotation_path: RotationPath::of(cube),
            start: layout.start,
            target: layout.target,
            total: layout.total,
            slot,
            sub_word,
        })
    }

    /// Whether partners share granules
    pub const fn orientation(&self) -> Orientation {
        if self.lane_bits == 0 {
            Orientation::Perpendicular
        } else {
            Orientation::Parallel
        }
    }

    /// Rotation path of the hypercube
    pub const fn rotation_path(&self) -> RotationPath {
        self.rotation_path
    }

    /// Independent groups entangled in one granule (`a_length`)
    pub fn entangled_groups(&self) -> GroupSize {
        match self.lane_bits.count_ones() {
            1 => GroupSize::Four,
            2 => GroupSize::Two,
            _ => GroupSize::One,
        }
    }

    /// Bytes per partner slot
    pub const fn slot_bytes(&self) -> usize {
        self.slot
    }

    /// Destination bytes written per unit
    pub const fn output_len(&self) -> usize {
        let partners = 1 << self.participating.count_ones();
        match self.op {
            LibraryOp::AllToAll | LibraryOp::AllReduce | LibraryOp::Copy => self.total,
            LibraryOp::AllGather => self.total.saturating_mul(partners),
            LibraryOp::ReduceScatter => self.slot,
        }
    }

    /// Destination granules per row
    pub const fn dest_words(&self) -> usize {
        self.output_len().div_ceil(WORD_SIZE)
    }

    /// Rows holding units
    pub const fn rows(&self) -> usize {
        self.unit_count.div_ceil(NR_CIS)
    }

    fn valid_lanes(&self) -> u8 {
        if self.unit_count >= NR_CIS {
            0xFF
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let lanes = ((1u16 << self.unit_count) - 1) as u8;
            lanes
        }
    }

    fn lane_fields(&self) -> usize {
        1 << self.lane_bits.count_ones()
    }

    /// Lanes whose lane-partner field equals `field`
    fn field_lanes(&self, field: usize) -> u8 {
        let want = expand_bits(field, self.lane_bits);
        let mut lanes = 0u8;
        for lane in 0..NR_CIS {
            if lane & self.lane_bits == want {
                lanes |= 1 << lane;
            }
        }
        lanes & self.valid_lanes()
    }

    fn granule(row: usize, byte: usize) -> GranuleAddr {
        #[allow(clippy::cast_possible_truncation)]
        let member = (row % NR_DPUS_PER_CI) as u8;
        #[allow(clippy::cast_possible_truncation)]
        let logical = byte as u32;
        GranuleAddr::new(row / NR_DPUS_PER_CI, member, logical)
    }

    /// Rows of every row partner of `unit`, ascending partner order
    fn vertical_rows(&self, unit: usize) -> impl Iterator<Item = usize> + '_ {
        let base = unit & !self.row_bits;
        let count = 1usize << self.row_bits.count_ones();
        (0..count).map(move |r| (base | expand_bits(r, self.row_bits)) / NR_CIS)
    }

    fn lane_delta(&self, dst_field: usize, src_field: usize) -> usize {
        let d = expand_bits(dst_field, self.lane_bits);
        let s = expand_bits(src_field, self.lane_bits);
        (d + NR_CIS - s) % NR_CIS
    }

    /// Step producing destination word `word` of `row`
    pub fn step(&self, row: usize, word: usize) -> GranuleStep {
        let dst = Self::granule(row, self.target + word * WORD_SIZE);
        let lane_parts = self.lane_bits.count_ones();
        let mut contributions = Vec::new();
        for field in 0..self.lane_fields() {
            let lanes = self.field_lanes(field);
            if lanes == 0 {
                continue;
            }
            let q = row * NR_CIS | expand_bits(field, self.lane_bits);
            let q_idx = compress_bits(q, self.participating);
            let partner = |p: usize| (q & !self.participating) | expand_bits(p, self.participating);
            let src_field = |p: usize| p & ((1 << lane_parts) - 1);
            match (self.op, self.sub_word) {
                (LibraryOp::AllToAll, None) => {
                    let p = word * WORD_SIZE / self.slot;
                    let within = word * WORD_SIZE % self.slot;
                    contributions.push(Contribution {
                        sources: vec![Self::granule(
                            partner(p) / NR_CIS,
                            self.start + q_idx * self.slot + within,
                        )],
                        lane_bits: 0,
                        lane_rotation: self.lane_delta(field, src_field(p)),
                        slot_rotation: None,
                        mask: ByteMask::lanes(lanes),
                    });
                }
                (LibraryOp::AllToAll, Some(shape)) => {
                    let per_word = shape.group().get();
                    let src_slot = q_idx % per_word;
                    for j in 0..per_word {
                        let p = word * per_word + j;
                        contributions.push(Contribution {
                            sources: vec![Self::granule(
                                partner(p) / NR_CIS,
                                self.start + (q_idx * self.slot) / WORD_SIZE * WORD_SIZE,
                            )],
                            lane_bits: 0,
                            lane_rotation: self.lane_delta(field, src_field(p)),
                            slot_rotation: Some(SlotRotation {
                                shape,
                                k: (j + per_word - src_slot) % per_word,
                            }),
                            mask: ByteMask::slot(lanes, self.slot, j),
                        });
                    }
                }
                (LibraryOp::AllGather, _) => {
                    let p = word * WORD_SIZE / self.total;
                    let within = word * WORD_SIZE % self.total;
                    contributions.push(Contribution {
                        sources: vec![Self::granule(partner(p) / NR_CIS, self.start + within)],
                        lane_bits: 0,
                        lane_rotation: self.lane_delta(field, src_field(p)),
                        slot_rotation: None,
                        mask: ByteMask::lanes(lanes),
                    });
                }
                (LibraryOp::ReduceScatter, None) => {
                    let at = self.start + q_idx * self.slot + word * WORD_SIZE;
                    contributions.push(Contribution {
                        sources: self.vertical_rows(q).map(|r| Self::granule(r, at)).collect(),
                        lane_bits: self.lane_bits,
                        lane_rotation: 0,
                        slot_rotation: None,
                        mask: ByteMask::lanes(lanes),
                    });
                }
                (LibraryOp::ReduceScatter, Some(shape)) => {
                    let per_word = shape.group().get();
                    let at = self.start + (q_idx * self.slot) / WORD_SIZE * WORD_SIZE;
                    contributions.push(Contribution {
                        sources: self.vertical_rows(q).map(|r| Self::granule(r, at)).collect(),
                        lane_bits: self.lane_bits,
                        lane_rotation: 0,
                        slot_rotation: Some(SlotRotation {
                            shape,
                            k: (per_word - q_idx % per_word) % per_word,
                        }),
                        mask: ByteMask::slot(lanes, self.slot, 0),
                    });
                }
                (LibraryOp::AllReduce, _) => {
                    let at = self.start + word * WORD_SIZE;
                    contributions.push(Contribution {
                        sources: self.vertical_rows(q).map(|r| Self::granule(r, at)).collect(),
                        lane_bits: self.lane_bits,
                        lane_rotation: 0,
                        slot_rotation: None,
                        mask: ByteMask::lanes(self.valid_lanes()),
                    });
                    break;
                }
                (LibraryOp::Copy, _) => {
                    contributions.push(Contribution {
                        sources: vec![Self::granule(row, self.start + word * WORD_SIZE)],
                        lane_bits: 0,
                        lane_rotation: 0,
                        slot_rotation: None,
                        mask: ByteMask::lanes(self.valid_lanes()),
                    });
                    break;
                }
            }
        }
        let covered = contributions
            .iter()
            .fold(ByteMask::EMPTY, |acc, c| acc.union(c.mask));
        GranuleStep {
            dst,
            contributions,
            full_overwrite: covered.is_full(),
        }
    }

    /// Steps of `row` in batches of up to 8 consecutive destination granules
    pub fn plan_parallel(&self, row: usize) -> Vec<StepBatch> {
        let words: Vec<usize> = (0..self.dest_words()).collect();
        words
            .chunks(NR_CIS)
            .map(|chunk| StepBatch {
                steps: chunk.iter().map(|&w| self.step(row, w)).collect(),
            })
            .collect()
    }

    /// Steps of `row`, one destination granule per batch
    pub fn plan_perpendicular(&self, row: usize) -> Vec<StepBatch> {
        (0..self.dest_words())
            .map(|w| StepBatch {
                steps: vec![self.step(row, w)],
            })
            .collect()
    }

    /// Batches of `row` for this planner's orientation
    pub fn row_batches(&self, row: usize) -> Vec<StepBatch> {
        match self.orientation() {
            Orientation::Parallel => self.plan_parallel(row),
            Orientation::Perpendicular => self.plan_perpendicular(row),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(total: usize) -> TransferLayout {
        TransferLayout {
            total,
            start: 0,
            target: 0x1000,
            element: ElementWidth::W4,
        }
    }

    #[test]
    fn bit_helpers() {
        assert_eq!(expand_bits(0b11, 0b1010), 0b1010);
        assert_eq!(expand_bits(0b10, 0b1010), 0b1000);
        assert_eq!(compress_bits(0b1110, 0b1010), 0b11);
        for v in 0..16 {
            assert_eq!(compress_bits(expand_bits(v, 0b1_0110_0001), 0b1_0110_0001), v);
        }
    }

    #[test]
    fn manager_rejects_bad_shapes() {
        assert!(HypercubeManager::new(&[]).is_err());
        assert!(HypercubeManager::new(&[3]).is_err());
        assert!(HypercubeManager::new(&[2, 2, 2, 2]).is_err());
        assert!(matches!(
            HypercubeManager::new(&[1 << 32, 1 << 31, 2]),
            Err(CommError::InvalidTopology { .. })
        ));
        let m = HypercubeManager::new(&[4, 2]).unwrap();
        assert_eq!(m.axis_len(), [4, 2, 1]);
        assert_eq!(m.unit_count(), 8);
    }

    #[test]
    fn coords_and_locations() {
        let m = HypercubeManager::new(&[16, 4, 2]).unwrap();
        assert_eq!(m.coords(77), [13, 0, 1]);
        assert_eq!(m.unit_at([13, 0, 1]), 77);
        assert_eq!(m.location(77), UnitLocation { rank: 1, member: 1, lane: 5 });
        assert_eq!(m.ranks_needed(), 2);
    }

    #[test]
    fn axis_spec_parsing() {
        assert!(CommAxis::parse("10", 3).is_err());
        assert!(CommAxis::parse("000", 3).is_err());
        assert!(CommAxis::parse("1x0", 3).is_err());
        let c = CommAxis::parse("011", 3).unwrap();
        assert!(!c.participates(0) && c.participates(1) && c.participates(2));
        assert_eq!(c.to_string(), "011");
    }

    #[test]
    fn groups_and_partner_index() {
        let m = HypercubeManager::new(&[4, 4]).unwrap();
        let c = CommAxis::parse("01", 2).unwrap();
        let groups = m.groups(c);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[1].units, vec![1, 5, 9, 13]);
        assert_eq!(m.partner_index(c, 9), 2);
        assert_eq!(c.lane_bits(&m), 0b100);
        assert_eq!(c.row_bits(&m), 0b1000);
    }

    #[test]
    fn rotation_paths() {
        let path = |lens: &[usize]| RotationPath::of(&HypercubeManager::new(lens).unwrap());
        assert_eq!(path(&[8, 8]), RotationPath::Base);
        assert_eq!(path(&[4, 2, 8]), RotationPath::Entangled24);
        assert_eq!(path(&[2, 2, 16]), RotationPath::Entangled22);
    }

    #[test]
    fn descriptors_for_alltoall() {
        let m = HypercubeManager::new(&[4, 2]).unwrap();
        let c = CommAxis::parse("10", 2).unwrap();
        let plan = m.plan(CollectiveOp::AllToAll, c, 5, layout(64)).unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[2].dest_units, vec![6]);
        assert_eq!(plan[2].source_offset, 32);
        assert_eq!(plan[2].dest_offset, 0x1000 + 16);
        assert_eq!(plan[2].rotations[0].lanes, 1);
        let gather = m.plan(CollectiveOp::AllGather, c, 5, layout(64)).unwrap();
        assert_eq!(gather[0].dest_units, vec![4, 5, 6, 7]);
        assert!(m.plan(CollectiveOp::ReduceScatter, c, 5, layout(12)).is_err());
    }

    #[test]
    fn slot_validation() {
        assert_eq!(check_slot(64, 4, ElementWidth::W4).unwrap(), 16);
        assert_eq!(check_slot(8, 4, ElementWidth::W2).unwrap(), 2);
        assert!(check_slot(8, 8, ElementWidth::W1).is_err());
        assert!(check_slot(8, 2, ElementWidth::W8).is_err());
        assert!(check_slot(48, 4, ElementWidth::W4).is_err());
    }

    #[test]
    fn orientation_and_entanglement() {
        let m = HypercubeManager::new(&[2, 4, 8]).unwrap();
        let x = GranulePlanner::new(&m, CommAxis::parse("100", 3).unwrap(), LibraryOp::AllReduce, layout(64)).unwrap();
        assert_eq!(x.orientation(), Orientation::Parallel);
        assert_eq!(x.entangled_groups(), GroupSize::Four);
        let z = GranulePlanner::new(&m, CommAxis::parse("001", 3).unwrap(), LibraryOp::AllReduce, layout(64)).unwrap();
        assert_eq!(z.orientation(), Orientation::Perpendicular);
        assert_eq!(z.entangled_groups(), GroupSize::One);
        assert_eq!(z.row_batches(0).len(), 8);
        assert_eq!(x.row_batches(0).len(), 1);
    }

    #[test]
    fn alltoall_step_rotates_lane_fields() {
        // x = 8 lanes, one group per row
        let m = HypercubeManager::new(&[8]).unwrap();
        let p = GranulePlanner::new(&m, CommAxis::parse("1", 1).unwrap(), LibraryOp::AllToAll, layout(64)).unwrap();
        let step = p.step(0, 3);
        assert!(step.full_overwrite);
        assert_eq!(step.contributions.len(), 8);
        let c = &step.contributions[5];
        // dest lane 5 takes slot 5 of partner 3
        assert_eq!(c.lane_rotation, 2);
        assert_eq!(c.sources, vec![GranuleAddr::new(0, 0, 40)]);
        assert_eq!(c.mask, ByteMask::lanes(1 << 5));
    }

    #[test]
    fn sub_word_reduce_scatter_masks_one_slot() {
        let m = HypercubeManager::new(&[4, 2]).unwrap();
        let p = GranulePlanner::new(&m, CommAxis::parse("10", 2).unwrap(), LibraryOp::ReduceScatter, layout(16)).unwrap();
        assert_eq!(p.slot_bytes(), 4);
        assert_eq!(p.output_len(), 4);
        let step = p.step(0, 0);
        assert!(!step.full_overwrite);
        let lines = StepBatch { steps: vec![step.clone()] }.lines();
        assert!(lines.contains(&step.dst));
    }

    #[test]
    fn vertical_sources_for_row_partners() {
        let m = HypercubeManager::new(&[8, 4]).unwrap();
        let p = GranulePlanner::new(&m, CommAxis::parse("01", 2).unwrap(), LibraryOp::AllReduce, layout(8)).unwrap();
        let step = p.step(1, 0);
        let rows: Vec<u8> = step.contributions[0].sources.iter().map(|g| g.member).collect();
        assert_eq!(rows, vec![0, 1, 2, 3]);
        assert_eq!(step.contributions[0].lane_bits, 0);
    }
}
