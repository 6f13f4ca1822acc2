// SPDX-License-Identifier: AGPL-3.0-only

//! Simulated rank fabric
//!
//! Implements [`FabricBackend`] over sparse in-memory rank regions, so every
//! collective runs without PIM hardware. The simulator keeps the two host
//! effects that make the flush/fence protocol necessary on real ranks:
//!
//! 1. **Write combining**: line stores are parked in a pending buffer and only
//!    reach the region on [`FabricBackend::fence`].
//! 2. **Stale cache**: a load is served from a host line cache once the line
//!    has been read, until [`FabricBackend::flush_line`] evicts it.
//!
//! ```text
//! store_line ──► pending ──fence──► region pages ──load──► line cache ──► caller
//!                                                 flush_line evicts ─┘
//! ```
//!
//! A caller that skips a flush or a fence observes old data, exactly as on a
//! Xeon SP host. Operation counts are exposed through [`FabricStats`].

use crate::backend::{check_line, BackendType, FabricBackend, Line, ProgramHandle};
use crate::capabilities::{Capabilities, Capability, CapabilitySet};
use crate::error::{CommError, Result};
use bytes::Bytes;
use pim_chip::rank::{RankGeometry, GRANULE_SIZE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// Bytes per lazily allocated region page
const PAGE_SIZE: u64 = 64 * 1024;

/// Snapshot of primitive operation counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FabricStats {
    /// Line stores issued
    pub stores: u64,
    /// Line loads issued
    pub loads: u64,
    /// Loads answered from the host cache
    pub cache_hits: u64,
    /// Line flushes issued
    pub flushes: u64,
    /// Fences issued
    pub fences: u64,
    /// Program launches
    pub launches: u64,
}

#[derive(Debug, Default)]
struct Counters {
    stores: AtomicU64,
    loads: AtomicU64,
    cache_hits: AtomicU64,
    flushes: AtomicU64,
    fences: AtomicU64,
    launches: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> FabricStats {
        FabricStats {
            stores: self.stores.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            fences: self.fences.load(Ordering::Relaxed),
            launches: self.launches.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for c in [
            &self.stores,
            &self.loads,
            &self.cache_hits,
            &self.flushes,
            &self.fences,
            &self.launches,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// One rank region: pages, host cache and write-combining buffer
#[derive(Debug, Default)]
struct RankRegion {
    pages: RwLock<HashMap<u64, Box<[u8]>>>,
    cache: Mutex<HashMap<u64, Line>>,
    pending: Mutex<HashMap<u64, Line>>,
}

impl RankRegion {
    fn read_memory(&self, offset: u64) -> Line {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        let mut line = [0u8; GRANULE_SIZE];
        if let Some(page) = pages.get(&(offset / PAGE_SIZE)) {
            #[allow(clippy::cast_possible_truncation)]
            let at = (offset % PAGE_SIZE) as usize;
            line.copy_from_slice(&page[at..at + GRANULE_SIZE]);
        }
        line
    }

    fn drain(&self) {
        let pending: Vec<(u64, Line)> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if pending.is_empty() {
            return;
        }
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        for (offset, line) in pending {
            #[allow(clippy::cast_possible_truncation)]
            let page = pages
                .entry(offset / PAGE_SIZE)
                .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
            #[allow(clippy::cast_possible_truncation)]
            let at = (offset % PAGE_SIZE) as usize;
            page[at..at + GRANULE_SIZE].copy_from_slice(&line);
        }
    }

    fn resident_pages(&self) -> usize {
        self.pages.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Simulated rank fabric.
///
/// Device ids have the form `sim:<ranks>[:<mram_mib>]`; MRAM defaults to
/// the production 64 MiB per unit. Memory is allocated only for pages that
/// were written.
#[derive(Debug)]
pub struct SimulatedFabric {
    ranks: Vec<RankRegion>,
    caps: Capabilities,
    counters: Counters,
    program: Option<Bytes>,
    next_handle: u32,
}

impl SimulatedFabric {
    /// Device id prefix recognised by [`crate::backend::select_backend`]
    pub const DEVICE_PREFIX: &'static str = "sim";

    /// Create a fabric of `ranks` ranks with the given wiring.
    pub fn new(ranks: usize, geometry: RankGeometry) -> Self {
        let flags = CapabilitySet::empty()
            .with(Capability::NonTemporalStore)
            .with(Capability::CacheFlush)
            .with(Capability::ProgramLoad)
            .with(Capability::SyncLaunch)
            .with(Capability::Statistics);
        let caps = Capabilities::new(ranks, geometry, flags);
        debug!(
            "Simulated fabric: {ranks} ranks, {} MiB MRAM per unit, {} MiB region per rank",
            geometry.mram_bytes >> 20,
            caps.region_bytes >> 20
        );
        Self {
            ranks: (0..ranks).map(|_| RankRegion::default()).collect(),
            caps,
            counters: Counters::default(),
            program: None,
            next_handle: 1,
        }
    }

    /// Parse a `sim:<ranks>[:<mram_mib>]` device id.
    ///
    /// # Errors
    ///
    /// Returns error if the id does not follow that form or names zero ranks.
    pub fn parse_device_id(device_id: &str) -> Result<(usize, RankGeometry)> {
        let bad = |reason: &str| CommError::fabric(format!("device id {device_id:?}: {reason}"));
        let mut parts = device_id.split(':');
        if parts.next() != Some(Self::DEVICE_PREFIX) {
            return Err(bad("expected sim:<ranks>[:<mram_mib>]"));
        }
        let ranks = match parts.next() {
            None | Some("") => 1,
            Some(r) => r.parse::<usize>().map_err(|_| bad("rank count not a number"))?,
        };
        if ranks == 0 {
            return Err(bad("at least one rank required"));
        }
        let geometry = match parts.next() {
            None => RankGeometry::UPMEM,
            Some(m) => {
                let mib = m.parse::<usize>().map_err(|_| bad("MRAM size not a number"))?;
                if mib == 0 || mib > 64 {
                    return Err(bad("MRAM size must be 1..=64 MiB"));
                }
                RankGeometry::with_mram(mib << 20)
            }
        };
        if parts.next().is_some() {
            return Err(bad("trailing fields"));
        }
        Ok((ranks, geometry))
    }

    /// Operation counts since creation or the last reset
    pub fn stats(&self) -> FabricStats {
        self.counters.snapshot()
    }

    /// Zero the operation counts
    pub fn reset_stats(&self) {
        self.counters.reset();
    }

    /// Lines currently held in the host cache of `rank`
    pub fn cached_lines(&self, rank: usize) -> usize {
        self.ranks.get(rank).map_or(0, |r| {
            r.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    /// Stores of `rank` not yet drained by a fence
    pub fn pending_lines(&self, rank: usize) -> usize {
        self.ranks.get(rank).map_or(0, |r| {
            r.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    /// Region pages allocated across all ranks
    pub fn resident_pages(&self) -> usize {
        self.ranks.iter().map(RankRegion::resident_pages).sum()
    }

    /// Loaded program image, if any
    pub fn program(&self) -> Option<&Bytes> {
        self.program.as_ref()
    }

    fn region(&self, rank: usize, offset: u64) -> Result<&RankRegion> {
        check_line(&self.caps, rank, offset)?;
        Ok(&self.ranks[rank])
    }
}

impl FabricBackend for SimulatedFabric {
    fn init(device_id: &str) -> Result<Self> {
        let (ranks, geometry) = Self::parse_device_id(device_id)?;
        info!("Simulated fabric {device_id}: {ranks} ranks");
        Ok(Self::new(ranks, geometry))
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Simulated
    }

    fn is_ready(&self) -> bool {
        !self.ranks.is_empty()
    }

    fn store_line(&self, rank: usize, offset: u64, line: &Line) -> Result<()> {
        let region = self.region(rank, offset)?;
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        region
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(offset, *line);
        Ok(())
    }

    fn load_line(&self, rank: usize, offset: u64) -> Result<Line> {
        let region = self.region(rank, offset)?;
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let mut cache = region.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(line) = cache.get(&offset) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*line);
        }
        let line = region.read_memory(offset);
        cache.insert(offset, line);
        Ok(line)
    }

    fn flush_line(&self, rank: usize, offset: u64) -> Result<()> {
        let region = self.region(rank, offset)?;
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        region
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&offset);
        Ok(())
    }

    fn fence(&self) {
        self.counters.fences.fetch_add(1, Ordering::Relaxed);
        for region in &self.ranks {
            region.drain();
        }
    }

    fn load_program(&mut self, image: &Bytes) -> Result<ProgramHandle> {
        if image.is_empty() {
            return Err(CommError::fabric("empty program image"));
        }
        let handle = ProgramHandle::new(self.next_handle);
        self.next_handle += 1;
        debug!("Loaded program {} ({} bytes)", handle.id(), image.len());
        self.program = Some(image.clone());
        Ok(handle)
    }

    fn launch(&mut self) -> Result<()> {
        if self.program.is_none() {
            return Err(CommError::fabric("launch without a loaded program"));
        }
        self.counters.launches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimulatedFabric {
        SimulatedFabric::new(2, RankGeometry::with_mram(4 << 20))
    }

    #[test]
    fn parse_device_ids() {
        assert_eq!(SimulatedFabric::parse_device_id("sim").unwrap().0, 1);
        let (ranks, geo) = SimulatedFabric::parse_device_id("sim:4:8").unwrap();
        assert_eq!((ranks, geo.mram_bytes), (4, 8 << 20));
        assert!(SimulatedFabric::parse_device_id("sim:0").is_err());
        assert!(SimulatedFabric::parse_device_id("sim:x").is_err());
        assert!(SimulatedFabric::parse_device_id("sim:1:128").is_err());
        assert!(SimulatedFabric::parse_device_id("dax0.0").is_err());
    }

    #[test]
    fn store_invisible_until_fence() {
        let fab = small();
        let line = [0xAB; GRANULE_SIZE];
        fab.store_line(0, 0x40, &line).unwrap();
        assert_eq!(fab.pending_lines(0), 1);
        assert_eq!(fab.load_line(0, 0x40).unwrap(), [0; GRANULE_SIZE]);
        fab.fence();
        assert_eq!(fab.pending_lines(0), 0);
        // still stale: the zero line is cached
        assert_eq!(fab.load_line(0, 0x40).unwrap(), [0; GRANULE_SIZE]);
        fab.flush_line(0, 0x40).unwrap();
        assert_eq!(fab.load_line(0, 0x40).unwrap(), line);
    }

    #[test]
    fn ranks_are_independent() {
        let fab = small();
        fab.store_line(1, 0, &[7; GRANULE_SIZE]).unwrap();
        fab.fence();
        assert_eq!(fab.load_line(0, 0).unwrap(), [0; GRANULE_SIZE]);
        assert_eq!(fab.load_line(1, 0).unwrap(), [7; GRANULE_SIZE]);
        assert_eq!(fab.resident_pages(), 1);
    }

    #[test]
    fn stats_count_primitives() {
        let fab = small();
        fab.store_line(0, 0, &[1; GRANULE_SIZE]).unwrap();
        fab.fence();
        fab.load_line(0, 0).unwrap();
        fab.load_line(0, 0).unwrap();
        fab.flush_line(0, 0).unwrap();
        let s = fab.stats();
        assert_eq!((s.stores, s.loads, s.cache_hits, s.flushes, s.fences), (1, 2, 1, 1, 1));
        fab.reset_stats();
        assert_eq!(fab.stats(), FabricStats::default());
    }

    #[test]
    fn out_of_region_rejected() {
        let fab = small();
        let end = fab.capabilities().region_bytes;
        assert!(fab.store_line(0, end, &[0; GRANULE_SIZE]).is_err());
        assert!(fab.load_line(2, 0).is_err());
        assert!(fab.flush_line(0, 3).is_err());
    }

    #[test]
    fn launch_needs_program() {
        let mut fab = small();
        assert!(fab.launch().is_err());
        let handle = fab.load_program(&Bytes::from_static(b"\x7fELF")).unwrap();
        assert_eq!(handle.id(), 1);
        fab.launch().unwrap();
        assert_eq!(fab.stats().launches, 1);
    }
}
