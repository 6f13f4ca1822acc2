//! Fabric primitive I/O
//!
//! Moves whole granules (one 64-bit word per CI of one member) between host
//! registers and the rank region, and owns the cache protocol that makes the
//! moves visible:
//!
//! ```text
//! write:  store lines ─► fence ─► flush stored lines ─► fence
//! read:   flush lines ─► fence ─► load lines ─► fence ─► flush ─► fence
//! ```
//!
//! Stores are non-temporal and loads may hit stale host cache lines, so every
//! path below goes through [`FabricSession::acquire`] before loading and
//! through a [`ScopedFabricWrite`] when storing.
//!
//! The rank-wide transfer matrix ([`WriteBatch`] / [`ReadBatch`]) moves one
//! buffer per unit at a common MRAM offset, sharded by member across a small
//! pool of scoped threads.

use crate::backend::FabricBackend;
use crate::error::{CommError, Result};
use crate::kernels::Lanes;
use pim_chip::interleave::{deinterleave, interleave};
use pim_chip::rank::{xfer_threads, NR_CIS, NR_DPUS_PER_CI, NR_DPUS_PER_RANK, WORD_SIZE};
use pim_chip::translate::line_offset;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Barrier;
use tracing::{debug, trace, warn};

/// One granule: a member's MRAM word at a logical offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GranuleAddr {
    /// Rank index
    pub rank: usize,
    /// Member (rotation group) inside the rank
    pub member: u8,
    /// Logical MRAM offset, 8-byte aligned
    pub logical: u32,
}

impl GranuleAddr {
    /// Create a granule address
    pub const fn new(rank: usize, member: u8, logical: u32) -> Self {
        Self {
            rank,
            member,
            logical,
        }
    }

    /// Granule holding `logical` of `unit`
    pub const fn of_unit(unit: usize, logical: u32) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let member = ((unit % NR_DPUS_PER_RANK) / NR_CIS) as u8;
        Self::new(unit / NR_DPUS_PER_RANK, member, logical)
    }

    /// Granule `words` MRAM words further on
    #[must_use]
    pub const fn advance(self, words: u32) -> Self {
        Self::new(self.rank, self.member, self.logical + words * WORD_SIZE as u32)
    }

    /// Region offset of the line
    pub const fn offset(self) -> u64 {
        line_offset(self.member, self.logical)
    }
}

fn load_granule(backend: &dyn FabricBackend, addr: GranuleAddr) -> Result<Lanes> {
    let line = backend.load_line(addr.rank, addr.offset())?;
    Ok(deinterleave(&line))
}

fn store_granule(backend: &dyn FabricBackend, addr: GranuleAddr, lanes: &Lanes) -> Result<()> {
    backend.store_line(addr.rank, addr.offset(), &interleave(lanes))
}

fn flush_all(backend: &dyn FabricBackend, lines: impl IntoIterator<Item = GranuleAddr>) -> Result<()> {
    for addr in lines {
        backend.flush_line(addr.rank, addr.offset())?;
    }
    Ok(())
}

/// Store consecutive granules starting at `addr` and make them visible.
///
/// # Errors
///
/// Returns a fabric error if any line primitive fails.
pub fn write_block(backend: &dyn FabricBackend, addr: GranuleAddr, granules: &[Lanes]) -> Result<()> {
    let addrs = (0u32..).map(|i| addr.advance(i));
    for (a, lanes) in addrs.clone().zip(granules) {
        store_granule(backend, a, lanes)?;
    }
    backend.fence();
    flush_all(backend, addrs.take(granules.len()))?;
    backend.fence();
    Ok(())
}

/// Load `count` consecutive granules starting at `addr`.
///
/// # Errors
///
/// Returns a fabric error if any line primitive fails.
pub fn read_block(backend: &dyn FabricBackend, addr: GranuleAddr, count: usize) -> Result<Vec<Lanes>> {
    let addrs = (0u32..).map(|i| addr.advance(i)).take(count);
    backend.fence();
    flush_all(backend, addrs.clone())?;
    backend.fence();
    let granules = addrs
        .clone()
        .map(|a| load_granule(backend, a))
        .collect::<Result<Vec<_>>>()?;
    backend.fence();
    flush_all(backend, addrs)?;
    backend.fence();
    Ok(granules)
}

/// Counting view of a backend for one collective or transfer
#[derive(Debug)]
pub struct FabricSession<'a> {
    backend: &'a dyn FabricBackend,
    loaded: AtomicU64,
    stored: AtomicU64,
}

impl<'a> FabricSession<'a> {
    /// Start a session on `backend`
    pub fn new(backend: &'a dyn FabricBackend) -> Self {
        Self {
            backend,
            loaded: AtomicU64::new(0),
            stored: AtomicU64::new(0),
        }
    }

    /// Underlying backend
    pub fn backend(&self) -> &'a dyn FabricBackend {
        self.backend
    }

    /// Make `lines` safe to load: flush each, then fence.
    ///
    /// # Errors
    ///
    /// Returns a fabric error if a flush fails.
    pub fn acquire(&self, lines: &[GranuleAddr]) -> Result<()> {
        flush_all(self.backend, lines.iter().copied())?;
        self.backend.fence();
        Ok(())
    }

    /// Load one granule (call [`Self::acquire`] first)
    ///
    /// # Errors
    ///
    /// Returns a fabric error if the load fails.
    pub fn load(&self, addr: GranuleAddr) -> Result<Lanes> {
        self.loaded.fetch_add(1, Ordering::Relaxed);
        load_granule(self.backend, addr)
    }

    /// Begin a write scope
    pub fn scoped_write(&self) -> ScopedFabricWrite<'_, 'a> {
        ScopedFabricWrite {
            session: self,
            lines: Vec::new(),
            finished: false,
        }
    }

    /// Full fence
    pub fn fence(&self) {
        self.backend.fence();
    }

    /// Granules loaded so far
    pub fn granules_loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    /// Granules stored so far
    pub fn granules_stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }
}

/// Write scope that publishes every stored line on `finish()` or drop
///
/// Publishing is fence, flush of each stored line, fence.
#[derive(Debug)]
pub struct ScopedFabricWrite<'s, 'a> {
    session: &'s FabricSession<'a>,
    lines: Vec<GranuleAddr>,
    finished: bool,
}

impl ScopedFabricWrite<'_, '_> {
    /// Store one granule
    ///
    /// # Errors
    ///
    /// Returns a fabric error if the store fails.
    pub fn store(&mut self, addr: GranuleAddr, lanes: &Lanes) -> Result<()> {
        store_granule(self.session.backend, addr, lanes)?;
        self.session.stored.fetch_add(1, Ordering::Relaxed);
        self.lines.push(addr);
        Ok(())
    }

    /// Lines stored in this scope
    pub fn stored_lines(&self) -> &[GranuleAddr] {
        &self.lines
    }

    fn publish(&mut self) -> Result<()> {
        self.finished = true;
        let backend = self.session.backend;
        backend.fence();
        flush_all(backend, self.lines.drain(..))?;
        backend.fence();
        Ok(())
    }

    /// Publish the stored lines
    ///
    /// # Errors
    ///
    /// Returns a fabric error if a flush fails.
    pub fn finish(mut self) -> Result<()> {
        self.publish()
    }
}

impl Drop for ScopedFabricWrite<'_, '_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.publish() {
                warn!("publishing scoped write failed during drop: {e}");
            }
        }
    }
}

/// Validate a per-unit MRAM window before any I/O
///
/// # Errors
///
/// Returns `Misaligned` or `CapacityExceeded`.
pub fn check_window(unit: usize, offset: usize, len: usize, mram_bytes: usize) -> Result<()> {
    if offset % WORD_SIZE != 0 {
        return Err(CommError::Misaligned {
            what: "MRAM offset",
            value: offset,
            align: WORD_SIZE,
        });
    }
    if len % WORD_SIZE != 0 {
        return Err(CommError::Misaligned {
            what: "transfer size",
            value: len,
            align: WORD_SIZE,
        });
    }
    let end = offset.saturating_add(len);
    if end > mram_bytes {
        return Err(CommError::CapacityExceeded {
            unit,
            requested: end,
            limit: mram_bytes,
        });
    }
    Ok(())
}

/// Members handled by each transfer thread: `members / threads` each, the
/// remainder going to the last thread.
pub fn member_shards(threads: usize) -> Vec<std::ops::Range<usize>> {
    let threads = threads.clamp(1, NR_DPUS_PER_CI);
    let per = NR_DPUS_PER_CI / threads;
    (0..threads)
        .map(|t| {
            let start = t * per;
            let end = if t + 1 == threads { NR_DPUS_PER_CI } else { start + per };
            start..end
        })
        .collect()
}

/// Run `work` on each member shard in its own scoped thread, all released
/// together by a barrier. A panicking worker is reported as an error.
pub(crate) fn run_sharded<T, F>(shards: Vec<(std::ops::Range<usize>, T)>, work: F) -> Result<()>
where
    T: Send,
    F: Fn(std::ops::Range<usize>, T) -> Result<()> + Sync,
{
    if shards.len() == 1 {
        let mut shards = shards;
        let (range, item) = shards.remove(0);
        return work(range, item);
    }
    let barrier = Barrier::new(shards.len());
    std::thread::scope(|s| {
        let handles: Vec<_> = shards
            .into_iter()
            .map(|(range, item)| {
                let barrier = &barrier;
                let work = &work;
                s.spawn(move || {
                    barrier.wait();
                    work(range, item)
                })
            })
            .collect();
        handles.into_iter().try_for_each(|h| {
            h.join()
                .map_err(|_| CommError::invalid_state("transfer thread panicked"))?
        })
    })
}

/// Host → rank transfer matrix at one MRAM offset and size
#[derive(Debug)]
pub struct WriteBatch<'s, 'a, 'b> {
    session: &'s FabricSession<'a>,
    rank: usize,
    logical: u32,
    size: usize,
    pool: usize,
    buffers: Vec<Option<&'b [u8]>>,
}

impl<'s, 'a, 'b> WriteBatch<'s, 'a, 'b> {
    /// Start a batch for `rank`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the window is misaligned or exceeds
    /// the MRAM.
    pub fn new(
        session: &'s FabricSession<'a>,
        rank: usize,
        logical: usize,
        size: usize,
        pool: usize,
    ) -> Result<Self> {
        let mram = session.backend().capabilities().mram_bytes();
        check_window(rank * NR_DPUS_PER_RANK, logical, size, mram)?;
        Ok(Self {
            session,
            rank,
            logical: to_logical(logical)?,
            size,
            pool,
            buffers: vec![None; NR_DPUS_PER_RANK],
        })
    }

    /// Attach the buffer for unit `index` (0..64) of the rank
    ///
    /// # Errors
    ///
    /// Returns a host buffer error for a bad index or length.
    pub fn prepare(&mut self, index: usize, buf: &'b [u8]) -> Result<()> {
        check_prepare(index, buf.len(), self.size)?;
        self.buffers[index] = Some(buf);
        Ok(())
    }

    /// Move every prepared buffer to the rank
    ///
    /// Members with only some units prepared are read first so the other
    /// lanes keep their contents.
    ///
    /// # Errors
    ///
    /// Returns a fabric error if any line primitive fails.
    pub fn commit(self) -> Result<()> {
        if self.size == 0 || self.buffers.iter().all(Option::is_none) {
            return Ok(());
        }
        let threads = xfer_threads::threads_for(self.size, self.pool);
        debug!(
            "write batch rank {} @ {:#x}: {} bytes/unit, {threads} threads",
            self.rank, self.logical, self.size
        );
        let shards = member_shards(threads).into_iter().map(|r| (r, ())).collect();
        let words = self.size / WORD_SIZE;
        run_sharded(shards, |members, ()| {
            let mut scope = self.session.scoped_write();
            for member in members {
                let row = &self.buffers[member * NR_CIS..(member + 1) * NR_CIS];
                if row.iter().all(Option::is_none) {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let base = GranuleAddr::new(self.rank, member as u8, self.logical);
                let partial = row.iter().any(Option::is_none);
                for w in 0..words {
                    #[allow(clippy::cast_possible_truncation)]
                    let addr = base.advance(w as u32);
                    let mut lanes = if partial {
                        self.session.acquire(&[addr])?;
                        self.session.load(addr)?
                    } else {
                        [0u64; NR_CIS]
                    };
                    for (lane, buf) in lanes.iter_mut().zip(row) {
                        if let Some(buf) = buf {
                            *lane = word_at(buf, w);
                        }
                    }
                    scope.store(addr, &lanes)?;
                }
            }
            trace!("write shard stored {} lines", scope.stored_lines().len());
            scope.finish()
        })
    }
}

/// Rank → host transfer matrix at one MRAM offset and size
#[derive(Debug)]
pub struct ReadBatch<'s, 'a, 'b> {
    session: &'s FabricSession<'a>,
    rank: usize,
    logical: u32,
    size: usize,
    pool: usize,
    buffers: Vec<Option<&'b mut [u8]>>,
}

impl<'s, 'a, 'b> ReadBatch<'s, 'a, 'b> {
    /// Start a batch for `rank`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the window is misaligned or exceeds
    /// the MRAM.
    pub fn new(
        session: &'s FabricSession<'a>,
        rank: usize,
        logical: usize,
        size: usize,
        pool: usize,
    ) -> Result<Self> {
        let mram = session.backend().capabilities().mram_bytes();
        check_window(rank * NR_DPUS_PER_RANK, logical, size, mram)?;
        Ok(Self {
            session,
            rank,
            logical: to_logical(logical)?,
            size,
            pool,
            buffers: (0..NR_DPUS_PER_RANK).map(|_| None).collect(),
        })
    }

    /// Attach the destination buffer for unit `index` (0..64) of the rank
    ///
    /// # Errors
    ///
    /// Returns a host buffer error for a bad index or length.
    pub fn prepare(&mut self, index: usize, buf: &'b mut [u8]) -> Result<()> {
        check_prepare(index, buf.len(), self.size)?;
        self.buffers[index] = Some(buf);
        Ok(())
    }

    /// Fill every prepared buffer from the rank
    ///
    /// # Errors
    ///
    /// Returns a fabric error if any line primitive fails.
    pub fn commit(mut self) -> Result<()> {
        if self.size == 0 || self.buffers.iter().all(Option::is_none) {
            return Ok(());
        }
        let threads = xfer_threads::threads_for(self.size, self.pool);
        debug!(
            "read batch rank {} @ {:#x}: {} bytes/unit, {threads} threads",
            self.rank, self.logical, self.size
        );
        let mut shards = Vec::new();
        let mut rest: &mut [Option<&'b mut [u8]>] = &mut self.buffers;
        for range in member_shards(threads) {
            let (head, tail) = rest.split_at_mut(range.len() * NR_CIS);
            shards.push((range, head));
            rest = tail;
        }
        let (session, rank, logical, words) = (self.session, self.rank, self.logical, self.size / WORD_SIZE);
        run_sharded(shards, |members, rows| {
            let first = members.start;
            let mut lines = Vec::new();
            for member in members {
                if rows[(member - first) * NR_CIS..][..NR_CIS].iter().all(Option::is_none) {
                    continue;
                }
                #[allow(clippy::cast_possible_truncation)]
                let base = GranuleAddr::new(rank, member as u8, logical);
                #[allow(clippy::cast_possible_truncation)]
                lines.extend((0..words).map(|w| base.advance(w as u32)));
            }
            session.fence();
            session.acquire(&lines)?;
            for addr in &lines {
                let lanes = session.load(*addr)?;
                let member = usize::from(addr.member) - first;
                let w = ((addr.logical - logical) as usize) / WORD_SIZE;
                for (lane, slot) in lanes.iter().zip(&mut rows[member * NR_CIS..][..NR_CIS]) {
                    if let Some(buf) = slot {
                        buf[w * WORD_SIZE..(w + 1) * WORD_SIZE].copy_from_slice(&lane.to_le_bytes());
                    }
                }
            }
            session.fence();
            session.acquire(&lines)
        })
    }
}

fn to_logical(offset: usize) -> Result<u32> {
    u32::try_from(offset).map_err(|_| CommError::Misaligned {
        what: "MRAM offset",
        value: offset,
        align: WORD_SIZE,
    })
}

fn check_prepare(index: usize, len: usize, size: usize) -> Result<()> {
    if index >= NR_DPUS_PER_RANK {
        return Err(CommError::host_buffer(format!(
            "unit index {index} outside the rank (0..{NR_DPUS_PER_RANK})"
        )));
    }
    if len != size {
        return Err(CommError::host_buffer(format!(
            "buffer for unit {index} holds {len} bytes, batch moves {size}"
        )));
    }
    Ok(())
}

fn word_at(buf: &[u8], word: usize) -> u64 {
    let mut bytes = [0u8; WORD_SIZE];
    bytes.copy_from_slice(&buf[word * WORD_SIZE..(word + 1) * WORD_SIZE]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedFabric;
    use pim_chip::rank::RankGeometry;

    fn fabric() -> SimulatedFabric {
        SimulatedFabric::new(1, RankGeometry::with_mram(4 << 20))
    }

    #[test]
    fn block_roundtrip() {
        let fab = fabric();
        let addr = GranuleAddr::new(0, 3, 0x3FF8);
        let granules: Vec<Lanes> = (0..4u64).map(|g| std::array::from_fn(|l| g * 100 + l as u64)).collect();
        write_block(&fab, addr, &granules).unwrap();
        assert_eq!(read_block(&fab, addr, 4).unwrap(), granules);
    }

    #[test]
    fn load_without_acquire_sees_stale_line() {
        let fab = fabric();
        let session = FabricSession::new(&fab);
        let addr = GranuleAddr::new(0, 0, 0);
        assert_eq!(session.load(addr).unwrap(), [0; NR_CIS]);
        let mut scope = session.scoped_write();
        scope.store(addr, &[9; NR_CIS]).unwrap();
        // drop publishes: fence, flush, fence
        drop(scope);
        assert_eq!(session.load(addr).unwrap(), [9; NR_CIS]);

        fab.store_line(0, addr.offset(), &interleave(&[5; NR_CIS])).unwrap();
        fab.fence();
        assert_eq!(session.load(addr).unwrap(), [9; NR_CIS]);
        session.acquire(&[addr]).unwrap();
        assert_eq!(session.load(addr).unwrap(), [5; NR_CIS]);
        assert_eq!(session.granules_stored(), 1);
        assert_eq!(session.granules_loaded(), 4);
    }

    #[test]
    fn shards_split_members() {
        assert_eq!(member_shards(1), vec![0..8]);
        assert_eq!(member_shards(3), vec![0..2, 2..4, 4..8]);
        assert_eq!(member_shards(8).len(), 8);
        assert_eq!(member_shards(0), vec![0..8]);
    }

    #[test]
    fn window_checks() {
        assert!(check_window(0, 8, 16, 64).is_ok());
        assert!(matches!(check_window(0, 4, 8, 64), Err(CommError::Misaligned { .. })));
        assert!(matches!(check_window(0, 8, 12, 64), Err(CommError::Misaligned { .. })));
        let err = check_window(5, 56, 16, 64).unwrap_err();
        assert!(err.to_string().contains("72"));
        assert!(err.to_string().contains("64"));
    }

    #[test]
    fn batch_roundtrip_all_units() {
        let fab = fabric();
        let session = FabricSession::new(&fab);
        let size = 4096;
        let data: Vec<Vec<u8>> = (0..NR_DPUS_PER_RANK)
            .map(|u| (0..size).map(|i| (u * 7 + i) as u8).collect())
            .collect();
        let mut batch = WriteBatch::new(&session, 0, 0x100, size, 4).unwrap();
        for (u, d) in data.iter().enumerate() {
            batch.prepare(u, d).unwrap();
        }
        batch.commit().unwrap();

        let mut out = vec![vec![0u8; size]; NR_DPUS_PER_RANK];
        let mut batch = ReadBatch::new(&session, 0, 0x100, size, 4).unwrap();
        for (u, o) in out.iter_mut().enumerate() {
            batch.prepare(u, o).unwrap();
        }
        batch.commit().unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn partial_member_keeps_neighbours() {
        let fab = fabric();
        let session = FabricSession::new(&fab);
        let a = vec![0x11u8; 64];
        let b = vec![0x22u8; 64];
        let mut batch = WriteBatch::new(&session, 0, 0, 64, 1).unwrap();
        batch.prepare(8, &a).unwrap();
        batch.commit().unwrap();
        let mut batch = WriteBatch::new(&session, 0, 0, 64, 1).unwrap();
        batch.prepare(9, &b).unwrap();
        batch.commit().unwrap();

        let (mut oa, mut ob) = (vec![0u8; 64], vec![0u8; 64]);
        let mut batch = ReadBatch::new(&session, 0, 0, 64, 1).unwrap();
        batch.prepare(8, &mut oa).unwrap();
        batch.prepare(9, &mut ob).unwrap();
        batch.commit().unwrap();
        assert_eq!((oa, ob), (a, b));
    }

    #[test]
    fn prepare_rejects_bad_buffers() {
        let fab = fabric();
        let session = FabricSession::new(&fab);
        let buf = vec![0u8; 16];
        let mut batch = WriteBatch::new(&session, 0, 0, 8, 1).unwrap();
        assert!(batch.prepare(0, &buf).is_err());
        assert!(batch.prepare(64, &buf[..8]).is_err());
        assert!(WriteBatch::new(&session, 0, 4 << 20, 8, 1).is_err());
    }

    #[test]
    fn sharded_worker_panic_is_an_error() {
        let shards = member_shards(4).into_iter().zip(0..4).collect();
        let result = run_sharded(shards, |range, shard| {
            assert!(shard != 2, "shard {shard} over {range:?} failed");
            Ok(())
        });
        assert!(matches!(result, Err(CommError::InvalidState { .. })));

        let done = std::sync::atomic::AtomicUsize::new(0);
        let shards = member_shards(4).into_iter().map(|r| (r, ())).collect();
        run_sharded(shards, |range, ()| {
            done.fetch_add(range.len(), std::sync::atomic::Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(done.into_inner(), NR_DPUS_PER_CI);
    }
}
