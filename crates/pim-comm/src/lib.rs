//! Collective communication for UPMEM-class processing-in-memory ranks.
//!
//! MPI-style collectives (broadcast, all-to-all, all-gather, gather,
//! scatter, reduce, all-reduce, reduce-scatter) over a hypercube of compute
//! units, run directly on the memory-mapped rank fabric.
//!
//! # Layers
//!
//! ```text
//! CollectiveEngine ─► topology (groups, descriptors, granule steps)
//!        │                 │
//!        │                 ▼
//!        ├─ library ──► kernels (rotate, reduce, blend) ─┐
//!        └─ conventional ► merge (host loops) ───────────┤
//!                                                        ▼
//!                        fabric (flush/fence protocol, transfer matrix)
//!                                                        ▼
//!                        FabricBackend: SimulatedFabric | MmapFabric
//! ```
//!
//! # Quick start
//!
//! ```
//! use pim_comm::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let job = JobContext::open(BackendSelection::Auto, "sim:1", &[8, 8], CommConfig::default())?;
//!
//! let blocks: Vec<Vec<u8>> = (0..64u8).map(|u| vec![u; 64]).collect();
//! job.write_units(0, &blocks)?;
//!
//! // sum along x, element width 4 bytes
//! let report = job.engine().all_reduce("10", 64, 0, 4096, 8192, 4, ReduceKind::Sum)?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! # Collective paths
//!
//! | Path | `PIM_COMM_PATH` | Moves data through |
//! |------|-----------------|--------------------|
//! | Library | `lib` | fabric granules, rotated and reduced in registers |
//! | Conventional | `conv` | host memory, merged with plain loops |
//!
//! Both paths produce bit-identical results.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod backend;
pub mod backends;
mod capabilities;
mod collective;
mod error;
pub mod fabric;
mod job;
pub mod kernels;
pub mod merge;
pub mod topology;

/// Rank geometry constants (re-exported from pim-chip).
pub mod geometry {
    pub use pim_chip::rank::{
        xfer_threads, RankGeometry, GRANULE_SIZE, MRAM_SIZE, NR_CIS, NR_DPUS_PER_CI,
        NR_DPUS_PER_RANK, WORD_SIZE,
    };
}

pub use backend::{select_backend, BackendSelection, BackendType, FabricBackend, Line, ProgramHandle};
pub use backends::{FabricStats, MmapFabric, SimulatedFabric};
pub use capabilities::{Capabilities, Capability, CapabilitySet};
pub use collective::{CollectiveEngine, CollectiveReport, Phase, PhaseTracker};
pub use error::{CommError, Result};
pub use job::{CollectivePath, CommConfig, JobContext, ENV_PATH, ENV_SIGNED_MAX, ENV_THREADS};
pub use kernels::{ElementWidth, GroupSize, ReduceKind, Signedness};
pub use topology::{CollectiveOp, CommAxis, HypercubeManager, Orientation, RotationPath};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BackendSelection, CollectiveEngine, CollectiveOp, CollectivePath, CollectiveReport,
        CommAxis, CommConfig, CommError, ElementWidth, FabricBackend, HypercubeManager,
        JobContext, ReduceKind, Result, Signedness, SimulatedFabric,
    };
}
