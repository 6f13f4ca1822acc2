//! Fabric capability description
//!
//! Backends report what they can actually do as a set of capability flags
//! instead of leaving optional operations unimplemented. Callers query the
//! flags before relying on an optional primitive.

use pim_chip::rank::{xfer_threads, RankGeometry};
use pim_chip::translate::region_span;
use std::fmt;

/// One optional fabric primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Capability {
    /// Line stores bypass the cache (write-combining)
    NonTemporalStore = 0,
    /// Individual lines can be flushed from the host cache
    CacheFlush = 1,
    /// Unit program images can be loaded
    ProgramLoad = 2,
    /// Units can be launched synchronously
    SyncLaunch = 3,
    /// Rank regions are backed by a mapping that outlives the process
    Persistent = 4,
    /// Backend counts primitive operations
    Statistics = 5,
}

impl Capability {
    /// All capabilities, in flag order
    pub const ALL: [Self; 6] = [
        Self::NonTemporalStore,
        Self::CacheFlush,
        Self::ProgramLoad,
        Self::SyncLaunch,
        Self::Persistent,
        Self::Statistics,
    ];

    const fn bit(self) -> u32 {
        1 << self as u8
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NonTemporalStore => "non-temporal store",
            Self::CacheFlush => "cache-line flush",
            Self::ProgramLoad => "program load",
            Self::SyncLaunch => "synchronous launch",
            Self::Persistent => "persistent mapping",
            Self::Statistics => "operation statistics",
        };
        f.write_str(name)
    }
}

/// Set of [`Capability`] flags
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// Empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set with one more capability
    #[must_use]
    pub const fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    /// Add a capability in place
    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    /// Whether `cap` is present
    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    /// Iterate present capabilities
    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = Self::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

/// Fabric capabilities reported by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Ranks mapped by the backend
    pub ranks: usize,

    /// Wiring of each rank
    pub geometry: RankGeometry,

    /// Bytes of rank region mapped per rank
    pub region_bytes: u64,

    /// Host threads per rank transfer pool
    pub threads_per_pool: usize,

    /// Optional primitives
    pub flags: CapabilitySet,
}

impl Capabilities {
    /// Capabilities for `ranks` ranks of `geometry`, full region span
    pub fn new(ranks: usize, geometry: RankGeometry, flags: CapabilitySet) -> Self {
        Self {
            ranks,
            geometry,
            region_bytes: region_span(geometry.mram_bytes),
            threads_per_pool: xfer_threads::DEFAULT_POOL,
            flags,
        }
    }

    /// MRAM bytes per unit
    pub const fn mram_bytes(&self) -> usize {
        self.geometry.mram_bytes
    }

    /// Units across all ranks
    pub const fn unit_count(&self) -> usize {
        self.ranks * self.geometry.dpus()
    }

    /// Whether the backend supports `cap`
    pub const fn supports(&self, cap: Capability) -> bool {
        self.flags.contains(cap)
    }
}
