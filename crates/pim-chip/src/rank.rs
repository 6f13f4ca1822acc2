//! Rank geometry.
//!
//! A rank is the unit of physical transport: 64 DPUs wired as 8 chip
//! interfaces (CIs) × 8 DPUs per CI. One 64-byte cache line of the rank
//! region carries one 64-bit MRAM word from each of the 8 CIs, so the 8 DPUs
//! that share a position behind their CI (a *member*, or rotation group)
//! always move together.
//!
//! ```text
//!             CI 0   CI 1   CI 2   CI 3   CI 4   CI 5   CI 6   CI 7
//! member 0   dpu 0  dpu 1  dpu 2  dpu 3  dpu 4  dpu 5  dpu 6  dpu 7   ← one line
//! member 1   dpu 8  dpu 9  ...                                dpu 15
//!   ...
//! member 7   dpu 56 ...                                       dpu 63
//! ```

/// Chip interfaces per rank (lanes of one cache line).
pub const NR_CIS: usize = 8;

/// DPUs behind each chip interface (members / rotation groups per rank).
pub const NR_DPUS_PER_CI: usize = 8;

/// DPUs per rank.
pub const NR_DPUS_PER_RANK: usize = NR_CIS * NR_DPUS_PER_CI;

/// MRAM bank owned by each DPU.
pub const MRAM_SIZE: usize = 64 * 1024 * 1024; // 64 MiB

/// MRAM access word; all transfers are aligned to it.
pub const WORD_SIZE: usize = 8;

/// Physical access granule: one cache line, one word per CI.
pub const GRANULE_SIZE: usize = NR_CIS * WORD_SIZE;

/// Position of a DPU inside its rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DpuSlot {
    /// Chip interface (lane within a line).
    pub ci: u8,
    /// Member behind the chip interface (selects the bank).
    pub member: u8,
}

impl DpuSlot {
    /// Slot of the DPU at `index` (0..64) in transfer-matrix order.
    ///
    /// # Panics
    ///
    /// Panics if `index >= NR_DPUS_PER_RANK`.
    #[must_use]
    pub const fn from_rank_index(index: usize) -> Self {
        assert!(index < NR_DPUS_PER_RANK, "DPU index out of rank");
        #[allow(clippy::cast_possible_truncation)]
        let ci = (index % NR_CIS) as u8;
        #[allow(clippy::cast_possible_truncation)]
        let member = (index / NR_CIS) as u8;
        Self { ci, member }
    }

    /// Transfer-matrix index: `member * 8 + ci`.
    #[must_use]
    pub const fn rank_index(self) -> usize {
        self.member as usize * NR_CIS + self.ci as usize
    }
}

/// Static description of one rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankGeometry {
    /// Chip interfaces.
    pub cis: u8,
    /// DPUs per chip interface.
    pub dpus_per_ci: u8,
    /// MRAM bytes per DPU.
    pub mram_bytes: usize,
}

impl RankGeometry {
    /// Production UPMEM rank.
    pub const UPMEM: Self = Self {
        cis: NR_CIS as u8,
        dpus_per_ci: NR_DPUS_PER_CI as u8,
        mram_bytes: MRAM_SIZE,
    };

    /// Same wiring with a smaller MRAM, for simulation.
    #[must_use]
    pub const fn with_mram(mram_bytes: usize) -> Self {
        Self { mram_bytes, ..Self::UPMEM }
    }

    /// DPUs in the rank.
    #[must_use]
    pub const fn dpus(&self) -> usize {
        self.cis as usize * self.dpus_per_ci as usize
    }

    /// MRAM bytes across the whole rank.
    #[must_use]
    pub const fn total_mram(&self) -> usize {
        self.dpus() * self.mram_bytes
    }
}

/// Host thread sizing for rank transfers.
///
/// Small transfers are not worth waking the whole pool; the pool is split by
/// member, so more than 8 threads never helps.
pub mod xfer_threads {
    /// Threads per rank pool unless configured otherwise.
    pub const DEFAULT_POOL: usize = 4;
    /// Upper bound on a rank pool.
    pub const MAX_POOL: usize = 8;
    /// Below this size a single thread moves the rank.
    pub const SINGLE_BELOW: usize = 1024;
    /// Below this size two threads move the rank.
    pub const DUAL_BELOW: usize = 2 * 1024;
    /// Below this size four threads move the rank.
    pub const QUAD_BELOW: usize = 32 * 1024;

    /// Threads to use for a per-DPU transfer of `size` bytes with a pool of `pool`.
    #[must_use]
    pub const fn threads_for(size: usize, pool: usize) -> usize {
        let pool = if pool == 0 {
            1
        } else if pool > MAX_POOL {
            MAX_POOL
        } else {
            pool
        };
        let wanted = if size < SINGLE_BELOW {
            1
        } else if size < DUAL_BELOW {
            2
        } else if size < QUAD_BELOW {
            4
        } else {
            pool
        };
        if wanted < pool {
            wanted
        } else {
            pool
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upmem_rank_geometry() {
        let g = RankGeometry::UPMEM;
        assert_eq!(g.dpus(), 64);
        assert_eq!(g.total_mram(), 4 * 1024 * 1024 * 1024);
        assert_eq!(GRANULE_SIZE, 64);
    }

    #[test]
    fn slot_index_roundtrip() {
        for i in 0..NR_DPUS_PER_RANK {
            assert_eq!(DpuSlot::from_rank_index(i).rank_index(), i);
        }
        let s = DpuSlot::from_rank_index(13);
        assert_eq!((s.ci, s.member), (5, 1));
    }

    #[test]
    fn thread_sizing_thresholds() {
        use xfer_threads::threads_for;
        assert_eq!(threads_for(512, 8), 1);
        assert_eq!(threads_for(1024, 8), 2);
        assert_eq!(threads_for(4096, 8), 4);
        assert_eq!(threads_for(1 << 20, 8), 8);
        assert_eq!(threads_for(1 << 20, 4), 4);
        assert_eq!(threads_for(1 << 20, 64), 8);
        assert_eq!(threads_for(4096, 2), 2);
    }
}
