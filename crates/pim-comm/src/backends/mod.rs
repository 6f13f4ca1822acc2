//! Rank fabric backend implementations
//!
//! Two backends available:
//! - **Simulated**: sparse in-memory regions with a modelled host cache and
//!   write-combining buffer (CI, development, path comparison)
//! - **Mmap**: one mapped file or DAX device per rank

pub mod mmap;
pub mod simulated;

pub use mmap::MmapFabric;
pub use simulated::{FabricStats, SimulatedFabric};
