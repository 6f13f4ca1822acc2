//! Backend abstraction for the rank fabric
//!
//! Every collective is expressed in four primitives on 64-byte lines of a
//! rank region: non-temporal store, load, cache-line flush and fence. A
//! backend only has to provide those (plus program load and launch); the
//! ordering protocol lives in [`crate::fabric`], not in the backends.

use crate::capabilities::Capabilities;
use crate::error::{CommError, Result};
use bytes::Bytes;
use pim_chip::rank::GRANULE_SIZE;
use std::fmt::Debug;

/// One 64-byte line of a rank region, as stored
pub type Line = [u8; GRANULE_SIZE];

/// Rank fabric backend trait - unified interface for real and simulated ranks
///
/// Line primitives take `&self`: transfer threads share one backend and
/// touch disjoint lines.
pub trait FabricBackend: Debug + Send + Sync {
    /// Initialize backend from a device id
    ///
    /// # Errors
    ///
    /// Returns error if the id is malformed or the ranks cannot be mapped.
    fn init(device_id: &str) -> Result<Self>
    where
        Self: Sized;

    /// Get the fabric capabilities
    fn capabilities(&self) -> &Capabilities;

    /// Get backend type for debugging
    fn backend_type(&self) -> BackendType;

    /// Check if backend is ready
    fn is_ready(&self) -> bool;

    /// Ranks mapped by the backend
    fn rank_count(&self) -> usize {
        self.capabilities().ranks
    }

    /// Non-temporal store of one line
    ///
    /// The store is not guaranteed visible to loads until [`Self::fence`].
    ///
    /// # Errors
    ///
    /// Returns error if the rank or offset is outside the mapped regions.
    fn store_line(&self, rank: usize, offset: u64, line: &Line) -> Result<()>;

    /// Load one line
    ///
    /// May return a stale cached copy unless the line was flushed and fenced.
    ///
    /// # Errors
    ///
    /// Returns error if the rank or offset is outside the mapped regions.
    fn load_line(&self, rank: usize, offset: u64) -> Result<Line>;

    /// Evict one line from the host cache (clflushopt)
    ///
    /// # Errors
    ///
    /// Returns error if the rank or offset is outside the mapped regions.
    fn flush_line(&self, rank: usize, offset: u64) -> Result<()>;

    /// Full memory fence (mfence)
    fn fence(&self);

    /// Load a unit program image on every rank
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot load programs.
    fn load_program(&mut self, image: &Bytes) -> Result<ProgramHandle>;

    /// Launch the loaded program and block until every unit is idle
    ///
    /// # Errors
    ///
    /// Returns error if no program is loaded or the launch fails.
    fn launch(&mut self) -> Result<()>;
}

/// Check a line address against the mapped regions
///
/// # Errors
///
/// Returns a fabric error for an unknown rank, an unaligned offset or an
/// offset past the region.
pub(crate) fn check_line(caps: &Capabilities, rank: usize, offset: u64) -> Result<()> {
    if rank >= caps.ranks {
        return Err(CommError::fabric(format!(
            "rank {rank} not mapped ({} ranks)",
            caps.ranks
        )));
    }
    if offset % GRANULE_SIZE as u64 != 0 {
        return Err(CommError::fabric(format!(
            "line offset {offset:#x} not aligned to {GRANULE_SIZE} bytes"
        )));
    }
    if offset + GRANULE_SIZE as u64 > caps.region_bytes {
        return Err(CommError::fabric(format!(
            "line offset {offset:#x} past region end {:#x}",
            caps.region_bytes
        )));
    }
    Ok(())
}

/// Program handle returned after loading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHandle(u32);

impl ProgramHandle {
    /// Create new program handle
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get program ID
    pub const fn id(&self) -> u32 {
        self.0
    }
}

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// In-memory rank regions with a modelled host cache
    Simulated,

    /// Rank regions mapped from files or DAX devices
    Mmap,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulated => write!(f, "Simulated"),
            Self::Mmap => write!(f, "Mmap"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelection {
    /// Pick from the device id (`sim:` prefix selects the simulator)
    Auto,

    /// Force the simulated fabric
    Simulated,

    /// Force the mmap fabric
    Mmap,
}

/// Select appropriate backend for a device id
///
/// # Errors
///
/// Returns error if no suitable backend can be initialized for the given device.
pub fn select_backend(
    selection: BackendSelection,
    device_id: &str,
) -> Result<Box<dyn FabricBackend>> {
    use crate::backends::mmap::MmapFabric;
    use crate::backends::simulated::SimulatedFabric;

    match selection {
        BackendSelection::Auto => {
            if device_id.starts_with(SimulatedFabric::DEVICE_PREFIX) {
                tracing::info!("Using simulated fabric for {device_id}");
                return SimulatedFabric::init(device_id)
                    .map(|b| Box::new(b) as Box<dyn FabricBackend>);
            }
            tracing::info!("Using mmap fabric for {device_id}");
            MmapFabric::init(device_id).map(|b| Box::new(b) as Box<dyn FabricBackend>)
        }

        BackendSelection::Simulated => {
            SimulatedFabric::init(device_id).map(|b| Box::new(b) as Box<dyn FabricBackend>)
        }

        BackendSelection::Mmap => {
            MmapFabric::init(device_id).map(|b| Box::new(b) as Box<dyn FabricBackend>)
        }
    }
}
