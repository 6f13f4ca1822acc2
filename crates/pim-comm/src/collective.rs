//! Collective operation dispatcher
//!
//! Every collective validates its whole configuration (axis spec, element
//! width, slot shape, alignment, per-unit capacity, host buffer shapes and
//! bounce-buffer placement) before the first fabric access, then runs on one
//! of two paths:
//!
//! | Path | Data movement | Combine |
//! |------|---------------|---------|
//! | Library | granule to granule inside the fabric | lane/slot rotation, in-register reduce |
//! | Conventional | fabric → host → fabric | [`crate::merge`] loops |
//!
//! `gather`, `scatter`, `reduce` and `broadcast` have a host buffer on one
//! side and are host-staged on both paths.
//!
//! ## Library executor
//!
//! Destination rows are sharded over the transfer pool; each thread owns the
//! destination granules of its rows. A [`StepBatch`] is acquired once, every
//! source line is loaded once, and the stores of the batch are published by
//! one [`ScopedFabricWrite`](crate::fabric::ScopedFabricWrite).

use crate::error::{CommError, Result};
use crate::fabric::{run_sharded, FabricSession, GranuleAddr, ReadBatch, WriteBatch};
use crate::job::{CollectivePath, JobContext};
use crate::kernels::{
    blend, reduce_into, reduce_lanes, rotate_elements, rotate_lanes, ElementWidth, GroupSize, Lanes,
    ReduceKind, Signedness,
};
use crate::merge::{self, MergeLayout};
use crate::topology::{
    check_slot, CollectiveOp, CommAxis, Contribution, GranulePlanner, LibraryOp, Orientation,
    RotationPath, StepBatch, TransferLayout,
};
use pim_chip::rank::{GRANULE_SIZE, NR_CIS, NR_DPUS_PER_RANK, WORD_SIZE};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Phase of one collective call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Validated, no fabric access yet
    NotStarted,
    /// Moving data
    Transferring,
    /// Combining partner data
    Reducing,
    /// Every write published
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::Transferring => write!(f, "transferring"),
            Self::Reducing => write!(f, "reducing"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Phase state machine of one call
///
/// `NotStarted → Transferring → (Reducing ↔ Transferring)* → Done`
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    history: Vec<Phase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    /// Tracker in `NotStarted`
    pub fn new() -> Self {
        Self {
            history: vec![Phase::NotStarted],
        }
    }

    /// Current phase
    pub fn current(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::NotStarted)
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for a transition the state machine forbids.
    pub fn advance(&mut self, next: Phase) -> Result<()> {
        let current = self.current();
        let legal = matches!(
            (current, next),
            (Phase::NotStarted | Phase::Reducing, Phase::Transferring)
                | (Phase::Transferring, Phase::Reducing | Phase::Done)
                | (Phase::Reducing, Phase::Done)
        );
        if !legal {
            return Err(CommError::invalid_state(format!("phase {current} -> {next}")));
        }
        debug!("phase {current} -> {next}");
        self.history.push(next);
        Ok(())
    }

    /// Phases visited so far, starting with `NotStarted`
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    fn into_history(self) -> Vec<Phase> {
        self.history
    }
}

/// Outcome of one collective call
#[derive(Debug, Clone)]
pub struct CollectiveReport {
    /// Operation
    pub op: CollectiveOp,
    /// Path that moved the data
    pub path: CollectivePath,
    /// Library path orientation
    pub orientation: Option<Orientation>,
    /// Library path rotation variant
    pub rotation_path: Option<RotationPath>,
    /// Library path groups per granule
    pub entangled: Option<GroupSize>,
    /// Phases visited
    pub phases: Vec<Phase>,
    /// Granules loaded from the fabric
    pub granules_loaded: u64,
    /// Granules stored to the fabric
    pub granules_stored: u64,
    /// Fabric bytes moved in either direction
    pub bytes_moved: u64,
    /// Wall time of the call
    pub elapsed: Duration,
}

impl fmt::Display for CollectiveReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}", self.op, self.path)?;
        if let (Some(o), Some(r)) = (self.orientation, self.rotation_path) {
            write!(f, ", {o} {r}")?;
        }
        if let Some(g) = self.entangled {
            write!(f, ", {} groups/granule", g.get())?;
        }
        write!(
            f,
            "]: {} granules loaded, {} stored, {} bytes in {:?} (",
            self.granules_loaded, self.granules_stored, self.bytes_moved, self.elapsed
        )?;
        for (i, phase) in self.phases.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{phase}")?;
        }
        write!(f, ")")
    }
}

/// Element combine parameters for one call
#[derive(Debug, Clone, Copy)]
struct Combine {
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
}

impl Combine {
    const COPY: Self = Self {
        width: ElementWidth::W8,
        kind: ReduceKind::Sum,
        sign: Signedness::Signed,
    };
}

/// Validated unit-to-unit collective
#[derive(Debug)]
struct Prepared {
    op: CollectiveOp,
    comm: CommAxis,
    layout: TransferLayout,
    library_op: LibraryOp,
    planner: GranulePlanner,
    slot: usize,
    bounce: Option<usize>,
    combine: Combine,
}

const fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Collective operations over one job
#[derive(Debug, Clone, Copy)]
pub struct CollectiveEngine<'ctx> {
    job: &'ctx JobContext,
}

impl<'ctx> CollectiveEngine<'ctx> {
    /// Engine over `job`
    pub const fn new(job: &'ctx JobContext) -> Self {
        Self { job }
    }

    /// Job the engine runs on
    pub const fn job(&self) -> &'ctx JobContext {
        self.job
    }

    // ── public collectives ──────────────────────────────────────────────

    /// Copy `data` to `target` in every unit of the job
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` if the data does not fit, or a fabric
    /// error.
    pub fn broadcast(&self, data: &[u8], target: usize) -> Result<CollectiveReport> {
        self.check_capacity(target, data.len())?;
        let units = self.job.manager().unit_count();
        debug!("broadcast: {} bytes to {units} units @ {target:#x}", data.len());
        let started = Instant::now();
        let session = FabricSession::new(self.job.backend());
        let mut phases = PhaseTracker::new();
        phases.advance(Phase::Transferring)?;
        let blocks = vec![data; units];
        self.stage_out(&session, target, data.len(), &blocks)?;
        phases.advance(Phase::Done)?;
        Ok(self.finish(CollectiveOp::Broadcast, CollectivePath::Conventional, None, &session, phases, started))
    }

    /// Personalised exchange: `dst_q[target + p*S] = src_p[start + q*S]`
    /// with `S = total / partners`
    ///
    /// # Errors
    ///
    /// Returns a configuration or capacity error before any I/O, or a
    /// fabric error.
    pub fn alltoall(
        &self,
        comm: &str,
        total: usize,
        start: usize,
        target: usize,
        buffer: usize,
    ) -> Result<CollectiveReport> {
        let prepared = self.prepare(
            CollectiveOp::AllToAll,
            comm,
            TransferLayout { total, start, target, element: ElementWidth::W1 },
            buffer,
            Combine::COPY,
        )?;
        self.run(&prepared)
    }

    /// Every partner receives every partner's block:
    /// `dst_q[target + p*total] = src_p[start]`
    ///
    /// # Errors
    ///
    /// Returns a configuration or capacity error before any I/O, or a
    /// fabric error.
    pub fn all_gather(
        &self,
        comm: &str,
        total: usize,
        start: usize,
        target: usize,
        buffer: usize,
    ) -> Result<CollectiveReport> {
        let prepared = self.prepare(
            CollectiveOp::AllGather,
            comm,
            TransferLayout { total, start, target, element: ElementWidth::W1 },
            buffer,
            Combine::COPY,
        )?;
        self.run(&prepared)
    }

    /// Group total written to every partner
    ///
    /// # Errors
    ///
    /// Returns a configuration or capacity error before any I/O, or a
    /// fabric error.
    #[allow(clippy::too_many_arguments)]
    pub fn all_reduce(
        &self,
        comm: &str,
        total: usize,
        start: usize,
        target: usize,
        buffer: usize,
        element: usize,
        kind: ReduceKind,
    ) -> Result<CollectiveReport> {
        let width = ElementWidth::from_bytes(element)?;
        let prepared = self.prepare(
            CollectiveOp::AllReduce,
            comm,
            TransferLayout { total, start, target, element: width },
            buffer,
            self.combine(width, kind),
        )?;
        self.run(&prepared)
    }

    /// Summing reduce-scatter, see [`Self::reduce_scatter_with`]
    ///
    /// # Errors
    ///
    /// Returns a configuration or capacity error before any I/O, or a
    /// fabric error.
    pub fn reduce_scatter(
        &self,
        comm: &str,
        total: usize,
        start: usize,
        target: usize,
        buffer: usize,
        element: usize,
    ) -> Result<CollectiveReport> {
        self.reduce_scatter_with(comm, total, start, target, buffer, element, ReduceKind::Sum)
    }

    /// Shard `q` of the group total to partner `q`:
    /// `dst_q[target..target + S] = ⊕_p src_p[start + q*S..]`
    ///
    /// No byte outside `[target, target + S)` changes.
    ///
    /// # Errors
    ///
    /// Returns a configuration or capacity error before any I/O, or a
    /// fabric error.
    #[allow(clippy::too_many_arguments)]
    pub fn reduce_scatter_with(
        &self,
        comm: &str,
        total: usize,
        start: usize,
        target: usize,
        buffer: usize,
        element: usize,
        kind: ReduceKind,
    ) -> Result<CollectiveReport> {
        let width = ElementWidth::from_bytes(element)?;
        let prepared = self.prepare(
            CollectiveOp::ReduceScatter,
            comm,
            TransferLayout { total, start, target, element: width },
            buffer,
            self.combine(width, kind),
        )?;
        self.run(&prepared)
    }

    /// Partner blocks to one host buffer per group:
    /// `host[g][p*total..] = src_{g,p}[start..]`
    ///
    /// `host` holds one buffer of `partners * total` bytes per group, in
    /// group order.
    ///
    /// # Errors
    ///
    /// Returns a configuration, capacity or host buffer error before any
    /// I/O, or a fabric error.
    pub fn gather(
        &self,
        comm: &str,
        total: usize,
        start: usize,
        host: &mut [Vec<u8>],
    ) -> Result<CollectiveReport> {
        let (comm, groups) = self.host_groups(comm, total, start, host.len(), host.iter().map(Vec::len), true)?;
        let started = Instant::now();
        let session = FabricSession::new(self.job.backend());
        let mut phases = PhaseTracker::new();
        phases.advance(Phase::Transferring)?;
        let partials = self.stage_in(&session, start, total)?;
        let cube = self.job.manager();
        let layout = TransferLayout { total, start, target: 0, element: ElementWidth::W1 };
        for (buf, group) in host.iter_mut().zip(&groups) {
            for &unit in group {
                for desc in cube.plan(CollectiveOp::Gather, comm, unit, layout)? {
                    buf[desc.dest_offset..desc.dest_offset + desc.byte_length]
                        .copy_from_slice(&partials[unit]);
                }
            }
        }
        phases.advance(Phase::Done)?;
        Ok(self.finish(CollectiveOp::Gather, CollectivePath::Conventional, None, &session, phases, started))
    }

    /// Inverse of [`Self::gather`]: `dst_{g,p}[target..] = host[g][p*total..]`
    ///
    /// # Errors
    ///
    /// Returns a configuration, capacity or host buffer error before any
    /// I/O, or a fabric error.
    pub fn scatter(
        &self,
        comm: &str,
        total: usize,
        target: usize,
        host: &[Vec<u8>],
    ) -> Result<CollectiveReport> {
        let (comm, groups) = self.host_groups(comm, total, target, host.len(), host.iter().map(Vec::len), true)?;
        let cube = self.job.manager();
        let layout = TransferLayout { total, start: 0, target, element: ElementWidth::W1 };
        let mut blocks: Vec<&[u8]> = vec![&[]; cube.unit_count()];
        for (buf, group) in host.iter().zip(&groups) {
            for &unit in group {
                for desc in cube.plan(CollectiveOp::Scatter, comm, unit, layout)? {
                    blocks[unit] = &buf[desc.source_offset..desc.source_offset + desc.byte_length];
                }
            }
        }
        let started = Instant::now();
        let session = FabricSession::new(self.job.backend());
        let mut phases = PhaseTracker::new();
        phases.advance(Phase::Transferring)?;
        self.stage_out(&session, target, total, &blocks)?;
        phases.advance(Phase::Done)?;
        Ok(self.finish(CollectiveOp::Scatter, CollectivePath::Conventional, None, &session, phases, started))
    }

    /// Group total to one host buffer of `total` bytes per group
    ///
    /// # Errors
    ///
    /// Returns a configuration, capacity or host buffer error before any
    /// I/O, or a fabric error.
    pub fn reduce(
        &self,
        comm: &str,
        total: usize,
        start: usize,
        element: usize,
        kind: ReduceKind,
        host: &mut [Vec<u8>],
    ) -> Result<CollectiveReport> {
        let width = ElementWidth::from_bytes(element)?;
        let (_, groups) = self.host_groups(comm, total, start, host.len(), host.iter().map(Vec::len), false)?;
        check_elements(total, width)?;
        let combine = self.combine(width, kind);
        let started = Instant::now();
        let session = FabricSession::new(self.job.backend());
        let mut phases = PhaseTracker::new();
        phases.advance(Phase::Transferring)?;
        let partials = self.stage_in(&session, start, total)?;
        phases.advance(Phase::Reducing)?;
        let layout = MergeLayout::from_groups(groups)?;
        let merged = merge::reduce(&partials, &layout, combine.width, combine.kind, combine.sign)?;
        for (buf, total) in host.iter_mut().zip(merged) {
            buf.copy_from_slice(&total);
        }
        phases.advance(Phase::Done)?;
        Ok(self.finish(CollectiveOp::Reduce, CollectivePath::Conventional, None, &session, phases, started))
    }

    // ── validation ──────────────────────────────────────────────────────

    fn combine(&self, width: ElementWidth, kind: ReduceKind) -> Combine {
        Combine {
            width,
            kind,
            sign: self.job.config().signedness,
        }
    }

    fn parse_axis(&self, comm: &str) -> Result<CommAxis> {
        CommAxis::parse(comm, self.job.manager().dimension())
    }

    fn check_capacity(&self, offset: usize, len: usize) -> Result<()> {
        let limit = self.job.mram_bytes();
        let requested = offset.saturating_add(len);
        if requested > limit {
            return Err(CommError::CapacityExceeded {
                unit: 0,
                requested,
                limit,
            });
        }
        Ok(())
    }

    /// Groups of `comm` after checking `total` bytes at `offset` fit and
    /// one host buffer per group of `partners * total` (`per_partner`) or
    /// `total` bytes
    fn host_groups(
        &self,
        comm: &str,
        total: usize,
        offset: usize,
        buffers: usize,
        lens: impl Iterator<Item = usize>,
        per_partner: bool,
    ) -> Result<(CommAxis, Vec<Vec<usize>>)> {
        let comm = self.parse_axis(comm)?;
        check_total(total)?;
        self.check_capacity(offset, total)?;
        let cube = self.job.manager();
        let groups: Vec<Vec<usize>> = cube.groups(comm).into_iter().map(|g| g.units).collect();
        if buffers != groups.len() {
            return Err(CommError::host_buffer(format!(
                "{buffers} host buffers for {} groups",
                groups.len()
            )));
        }
        let expected = if per_partner { total.saturating_mul(cube.partners(comm)) } else { total };
        for (g, len) in lens.enumerate() {
            if len != expected {
                return Err(CommError::host_buffer(format!(
                    "host buffer {g} holds {len} bytes, expected {expected}"
                )));
            }
        }
        Ok((comm, groups))
    }

    fn prepare(
        &self,
        op: CollectiveOp,
        comm: &str,
        layout: TransferLayout,
        buffer: usize,
        combine: Combine,
    ) -> Result<Prepared> {
        let comm = self.parse_axis(comm)?;
        check_total(layout.total)?;
        self.check_capacity(layout.start, layout.total)?;
        let cube = self.job.manager();
        let partners = cube.partners(comm);
        let slot = if op.splits_by_partner() {
            check_slot(layout.total, partners, layout.element)?
        } else {
            layout.total
        };
        if op.reduces() {
            check_elements(layout.total, layout.element)?;
        }
        let library_op = match op {
            CollectiveOp::AllToAll => LibraryOp::AllToAll,
            CollectiveOp::AllGather => LibraryOp::AllGather,
            CollectiveOp::ReduceScatter => LibraryOp::ReduceScatter,
            CollectiveOp::AllReduce => LibraryOp::AllReduce,
            other => return Err(CommError::invalid_state(format!("{other} is host-staged"))),
        };
        let planner = GranulePlanner::new(cube, comm, library_op, layout)?;
        self.check_capacity(layout.target, planner.output_len())?;
        let source = layout.start..layout.start + layout.total;
        let output = layout.target..layout.target + planner.output_len();

        let bounce = if overlaps(&source, &output) {
            if buffer % WORD_SIZE != 0 {
                return Err(CommError::Misaligned {
                    what: "buffer offset",
                    value: buffer,
                    align: WORD_SIZE,
                });
            }
            self.check_capacity(buffer, layout.total)?;
            let scratch = buffer..buffer + layout.total;
            for (what, range) in [("source range", &source), ("target range", &output)] {
                if overlaps(&scratch, range) {
                    return Err(CommError::BufferOverlap {
                        buffer: scratch.start,
                        buffer_end: scratch.end,
                        what,
                    });
                }
            }
            Some(buffer)
        } else {
            None
        };
        debug!(
            "{op} over {comm}: {partners} partners, {} bytes/unit, slot {slot}, {} orientation, {}{}",
            layout.total,
            planner.orientation(),
            planner.rotation_path(),
            if bounce.is_some() { ", bounced" } else { "" }
        );
        Ok(Prepared {
            op,
            comm,
            layout,
            library_op,
            planner,
            slot,
            bounce,
            combine,
        })
    }

    // ── execution ───────────────────────────────────────────────────────

    fn run(&self, prepared: &Prepared) -> Result<CollectiveReport> {
        let started = Instant::now();
        let session = FabricSession::new(self.job.backend());
        let mut phases = PhaseTracker::new();
        let path = self.job.config().path;
        match path {
            CollectivePath::Library => self.run_library(&session, prepared, &mut phases)?,
            CollectivePath::Conventional => self.run_conventional(&session, prepared, &mut phases)?,
        }
        phases.advance(Phase::Done)?;
        let planner = (path == CollectivePath::Library).then_some(&prepared.planner);
        Ok(self.finish(prepared.op, path, planner, &session, phases, started))
    }

    fn run_library(&self, session: &FabricSession<'_>, prepared: &Prepared, phases: &mut PhaseTracker) -> Result<()> {
        phases.advance(Phase::Transferring)?;
        let mut planner = prepared.planner.clone();
        if let Some(buffer) = prepared.bounce {
            let copy = TransferLayout {
                target: buffer,
                ..prepared.layout
            };
            let bounce = GranulePlanner::new(self.job.manager(), prepared.comm, LibraryOp::Copy, copy)?;
            self.execute(session, &bounce, Combine::COPY)?;
            let from_buffer = TransferLayout {
                start: buffer,
                ..prepared.layout
            };
            planner = GranulePlanner::new(self.job.manager(), prepared.comm, prepared.library_op, from_buffer)?;
        }
        if prepared.op.reduces() {
            phases.advance(Phase::Reducing)?;
        }
        self.execute(session, &planner, prepared.combine)
    }

    /// Run every row of `planner`, rows sharded over the transfer pool
    fn execute(&self, session: &FabricSession<'_>, planner: &GranulePlanner, combine: Combine) -> Result<()> {
        let rows = planner.rows();
        let threads = self.job.config().threads.clamp(1, rows.max(1));
        let per = rows.div_ceil(threads).max(1);
        let shards: Vec<(Range<usize>, ())> = (0..rows)
            .step_by(per)
            .map(|r| (r..(r + per).min(rows), ()))
            .collect();
        run_sharded(shards, |rows, ()| {
            for row in rows {
                for batch in planner.row_batches(row) {
                    execute_batch(session, &batch, combine)?;
                }
            }
            Ok(())
        })
    }

    fn run_conventional(
        &self,
        session: &FabricSession<'_>,
        prepared: &Prepared,
        phases: &mut PhaseTracker,
    ) -> Result<()> {
        let TransferLayout { total, start, target, .. } = prepared.layout;
        let cube = self.job.manager();
        let layout = MergeLayout::from_groups(cube.groups(prepared.comm).into_iter().map(|g| g.units).collect())?;
        let Combine { width, kind, sign } = prepared.combine;

        phases.advance(Phase::Transferring)?;
        let partials = self.stage_in(session, start, total)?;
        if prepared.op.reduces() {
            phases.advance(Phase::Reducing)?;
        }
        let per_unit: Vec<Vec<u8>> = match prepared.op {
            CollectiveOp::AllToAll => merge::alltoall(&partials, &layout, prepared.slot)?,
            CollectiveOp::ReduceScatter => {
                merge::reduce_scatter(&partials, &layout, prepared.slot, width, kind, sign)?
            }
            CollectiveOp::AllGather => spread(merge::gather(&partials, &layout)?, &layout, partials.len()),
            CollectiveOp::AllReduce => {
                spread(merge::reduce(&partials, &layout, width, kind, sign)?, &layout, partials.len())
            }
            other => return Err(CommError::invalid_state(format!("{other} is host-staged"))),
        };
        if prepared.op.reduces() {
            phases.advance(Phase::Transferring)?;
        }
        let len = prepared.planner.output_len();
        self.stage_out(session, target, len, &per_unit)
    }

    /// Read `len` bytes at `offset` from every unit
    fn stage_in(&self, session: &FabricSession<'_>, offset: usize, len: usize) -> Result<Vec<Vec<u8>>> {
        let lo = offset / WORD_SIZE * WORD_SIZE;
        let hi = (offset + len).div_ceil(WORD_SIZE) * WORD_SIZE;
        let mut windows = self.read_window(session, lo, hi - lo)?;
        if lo != offset || hi != offset + len {
            for w in &mut windows {
                w.drain(..offset - lo);
                w.truncate(len);
            }
        }
        Ok(windows)
    }

    /// Write one block of `len` bytes per unit at `offset`
    ///
    /// Unaligned windows read the covering words first so neighbouring
    /// bytes keep their contents.
    fn stage_out<B: AsRef<[u8]>>(
        &self,
        session: &FabricSession<'_>,
        offset: usize,
        len: usize,
        blocks: &[B],
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if let Some(bad) = blocks.iter().position(|b| b.as_ref().len() != len) {
            return Err(CommError::host_buffer(format!(
                "block for unit {bad} holds {} bytes, expected {len}",
                blocks[bad].as_ref().len()
            )));
        }
        if offset % WORD_SIZE == 0 && len % WORD_SIZE == 0 {
            return self.write_window(session, offset, len, blocks);
        }
        let lo = offset / WORD_SIZE * WORD_SIZE;
        let hi = (offset + len).div_ceil(WORD_SIZE) * WORD_SIZE;
        trace!("patching {len} bytes @ {offset:#x} through {lo:#x}..{hi:#x}");
        let mut windows = self.read_window(session, lo, hi - lo)?;
        for (w, block) in windows.iter_mut().zip(blocks) {
            w[offset - lo..offset - lo + len].copy_from_slice(block.as_ref());
        }
        self.write_window(session, lo, hi - lo, &windows)
    }

    fn read_window(&self, session: &FabricSession<'_>, offset: usize, len: usize) -> Result<Vec<Vec<u8>>> {
        let units = self.job.manager().unit_count();
        let mut out = vec![vec![0u8; len]; units];
        if len == 0 {
            return Ok(out);
        }
        let pool = self.job.config().threads;
        for (rank, chunk) in out.chunks_mut(NR_DPUS_PER_RANK).enumerate() {
            let mut batch = ReadBatch::new(session, rank, offset, len, pool)?;
            for (i, buf) in chunk.iter_mut().enumerate() {
                batch.prepare(i, buf)?;
            }
            batch.commit()?;
        }
        Ok(out)
    }

    fn write_window<B: AsRef<[u8]>>(
        &self,
        session: &FabricSession<'_>,
        offset: usize,
        len: usize,
        blocks: &[B],
    ) -> Result<()> {
        let pool = self.job.config().threads;
        for (rank, chunk) in blocks.chunks(NR_DPUS_PER_RANK).enumerate() {
            let mut batch = WriteBatch::new(session, rank, offset, len, pool)?;
            for (i, block) in chunk.iter().enumerate() {
                batch.prepare(i, block.as_ref())?;
            }
            batch.commit()?;
        }
        Ok(())
    }

    fn finish(
        &self,
        op: CollectiveOp,
        path: CollectivePath,
        planner: Option<&GranulePlanner>,
        session: &FabricSession<'_>,
        phases: PhaseTracker,
        started: Instant,
    ) -> CollectiveReport {
        let (loaded, stored) = (session.granules_loaded(), session.granules_stored());
        let report = CollectiveReport {
            op,
            path,
            orientation: planner.map(GranulePlanner::orientation),
            rotation_path: planner.map(GranulePlanner::rotation_path),
            entangled: planner.map(GranulePlanner::entangled_groups),
            phases: phases.into_history(),
            granules_loaded: loaded,
            granules_stored: stored,
            bytes_moved: (loaded + stored) * GRANULE_SIZE as u64,
            elapsed: started.elapsed(),
        };
        info!("{report}");
        report
    }
}

fn check_total(total: usize) -> Result<()> {
    if total == 0 {
        return Err(CommError::invalid_shape("total data size is zero"));
    }
    Ok(())
}

fn check_elements(total: usize, width: ElementWidth) -> Result<()> {
    if total % width.bytes() != 0 {
        return Err(CommError::invalid_shape(format!(
            "{total} bytes is not a whole number of {width} elements"
        )));
    }
    Ok(())
}

/// Per-group results copied to every member of the group
fn spread(per_group: Vec<Vec<u8>>, layout: &MergeLayout, units: usize) -> Vec<Vec<u8>> {
    let mut out = vec![Vec::new(); units];
    for (block, group) in per_group.into_iter().zip(layout.groups()) {
        for &unit in group {
            out[unit].clone_from(&block);
        }
    }
    out
}

fn cached(cache: &HashMap<GranuleAddr, Lanes>, addr: GranuleAddr) -> Result<Lanes> {
    cache
        .get(&addr)
        .copied()
        .ok_or_else(|| CommError::invalid_state(format!("granule {addr:?} used before acquire")))
}

/// Value of one contribution before masking
fn evaluate(cache: &HashMap<GranuleAddr, Lanes>, term: &Contribution, combine: Combine) -> Result<Lanes> {
    let Some((first, rest)) = term.sources.split_first() else {
        return Err(CommError::invalid_state("contribution without sources"));
    };
    let mut acc = cached(cache, *first)?;
    for addr in rest {
        reduce_into(&mut acc, &cached(cache, *addr)?, combine.width, combine.kind, combine.sign);
    }
    if term.lane_bits != 0 {
        acc = reduce_lanes(&acc, term.lane_bits, combine.width, combine.kind, combine.sign);
    }
    if term.lane_rotation != 0 {
        acc = rotate_lanes(&acc, term.lane_rotation);
    }
    if let Some(slot) = term.slot_rotation {
        acc = rotate_elements(&acc, slot.k, slot.shape);
    }
    Ok(acc)
}

/// Acquire, load once, compute and publish one batch
fn execute_batch(session: &FabricSession<'_>, batch: &StepBatch, combine: Combine) -> Result<()> {
    let lines = batch.lines();
    session.acquire(&lines)?;
    let mut cache = HashMap::with_capacity(lines.len());
    for addr in lines {
        cache.insert(addr, session.load(addr)?);
    }
    let mut scope = session.scoped_write();
    for step in &batch.steps {
        let mut out = if step.full_overwrite {
            [0u64; NR_CIS]
        } else {
            cached(&cache, step.dst)?
        };
        for term in &step.contributions {
            out = blend(&out, &evaluate(&cache, term, combine)?, term.mask);
        }
        scope.store(step.dst, &out)?;
    }
    trace!("batch: {} loads, {} stores", cache.len(), scope.stored_lines().len());
    scope.finish()
}
