//! Job context: backend, hypercube and configuration of one program run
//!
//! A job owns the fabric backend and the hypercube it was launched on.
//! Host transfers, program load/launch and collectives all go through it.

use crate::backend::{select_backend, BackendSelection, FabricBackend, ProgramHandle};
use crate::collective::CollectiveEngine;
use crate::error::{CommError, Result};
use crate::fabric::{FabricSession, ReadBatch, WriteBatch};
use crate::kernels::Signedness;
use crate::topology::HypercubeManager;
use bytes::Bytes;
use pim_chip::rank::{xfer_threads, NR_DPUS_PER_RANK};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Environment variable selecting the collective path (`lib` / `conv`)
pub const ENV_PATH: &str = "PIM_COMM_PATH";
/// Environment variable sizing the transfer thread pool
pub const ENV_THREADS: &str = "PIM_COMM_THREADS";
/// Environment variable choosing signed (`1`) or unsigned (`0`) max
pub const ENV_SIGNED_MAX: &str = "PIM_COMM_SIGNED_MAX";

/// How in-fabric collectives are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CollectivePath {
    /// Granule-to-granule in the fabric with rotations and in-register reduction
    #[default]
    Library,
    /// Stage through host memory and merge with plain loops
    Conventional,
}

impl FromStr for CollectivePath {
    type Err = CommError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lib" | "library" | "1" => Ok(Self::Library),
            "conv" | "conventional" | "0" => Ok(Self::Conventional),
            other => Err(CommError::unsupported(format!("collective path {other:?}"))),
        }
    }
}

impl fmt::Display for CollectivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library => write!(f, "library"),
            Self::Conventional => write!(f, "conventional"),
        }
    }
}

/// Collective configuration knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommConfig {
    /// Collective path
    pub path: CollectivePath,

    /// Host threads per rank transfer (1..=8)
    pub threads: usize,

    /// Comparison used by max reductions
    pub signedness: Signedness,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            path: CollectivePath::Library,
            threads: xfer_threads::DEFAULT_POOL,
            signedness: Signedness::Signed,
        }
    }
}

impl CommConfig {
    /// Use `path` for in-fabric collectives
    #[must_use]
    pub const fn with_path(mut self, path: CollectivePath) -> Self {
        self.path = path;
        self
    }

    /// Use `threads` transfer threads (clamped to 1..=8)
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.clamp(1, xfer_threads::MAX_POOL);
        self
    }

    /// Use `signedness` for max reductions
    #[must_use]
    pub const fn with_signedness(mut self, signedness: Signedness) -> Self {
        self.signedness = signedness;
        self
    }

    /// Defaults overridden by `PIM_COMM_PATH`, `PIM_COMM_THREADS` and
    /// `PIM_COMM_SIGNED_MAX`
    ///
    /// # Errors
    ///
    /// Returns error if a variable is set to an unparsable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = lookup(ENV_PATH) {
            config = config.with_path(path.parse()?);
        }
        if let Some(threads) = lookup(ENV_THREADS) {
            let threads = threads
                .trim()
                .parse::<usize>()
                .map_err(|_| CommError::unsupported(format!("{ENV_THREADS}={threads}")))?;
            config = config.with_threads(threads);
        }
        if let Some(signed) = lookup(ENV_SIGNED_MAX) {
            let signedness = match signed.trim() {
                "1" | "true" | "signed" => Signedness::Signed,
                "0" | "false" | "unsigned" => Signedness::Unsigned,
                other => {
                    return Err(CommError::unsupported(format!("{ENV_SIGNED_MAX}={other}")));
                }
            };
            config = config.with_signedness(signedness);
        }
        debug!("Comm config: {config:?}");
        Ok(config)
    }
}

/// One job on a fabric
#[derive(Debug)]
pub struct JobContext {
    backend: Box<dyn FabricBackend>,
    manager: HypercubeManager,
    config: CommConfig,
    program: Option<(ProgramHandle, Bytes)>,
    launches: u64,
}

impl JobContext {
    /// Job over `manager` on `backend`
    ///
    /// # Errors
    ///
    /// Returns `InsufficientRanks` if the backend maps fewer ranks than the
    /// hypercube spans.
    pub fn new(
        backend: Box<dyn FabricBackend>,
        manager: HypercubeManager,
        config: CommConfig,
    ) -> Result<Self> {
        let needed = manager.ranks_needed();
        let available = backend.rank_count();
        if needed > available {
            return Err(CommError::InsufficientRanks { needed, available });
        }
        info!(
            "Job: {} units as {:?} on {} backend ({available} ranks), {} path",
            manager.unit_count(),
            &manager.axis_len()[..manager.dimension()],
            backend.backend_type(),
            config.path
        );
        Ok(Self {
            backend,
            manager,
            config,
            program: None,
            launches: 0,
        })
    }

    /// Select a backend for `device_id` and build a job over `axis_len`
    ///
    /// # Errors
    ///
    /// Returns error if the topology is invalid or no backend can be opened.
    pub fn open(
        selection: BackendSelection,
        device_id: &str,
        axis_len: &[usize],
        config: CommConfig,
    ) -> Result<Self> {
        let manager = HypercubeManager::new(axis_len)?;
        let backend = select_backend(selection, device_id)?;
        Self::new(backend, manager, config)
    }

    /// Fabric backend
    pub fn backend(&self) -> &dyn FabricBackend {
        self.backend.as_ref()
    }

    /// Hypercube
    pub const fn manager(&self) -> &HypercubeManager {
        &self.manager
    }

    /// Configuration
    pub const fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Replace the configuration
    pub fn set_config(&mut self, config: CommConfig) {
        self.config = config;
    }

    /// MRAM bytes per unit
    pub fn mram_bytes(&self) -> usize {
        self.backend.capabilities().mram_bytes()
    }

    /// Collective engine over this job
    pub const fn engine(&self) -> CollectiveEngine<'_> {
        CollectiveEngine::new(self)
    }

    /// Load a unit program on every rank
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot load programs.
    pub fn load_program(&mut self, image: Bytes) -> Result<ProgramHandle> {
        let handle = self.backend.load_program(&image)?;
        info!("Loaded program {} ({} bytes)", handle.id(), image.len());
        self.program = Some((handle, image));
        Ok(handle)
    }

    /// Launch the loaded program and wait for the units to finish
    ///
    /// # Errors
    ///
    /// Returns error if no program is loaded or the launch fails.
    pub fn launch(&mut self) -> Result<()> {
        if self.program.is_none() {
            return Err(CommError::invalid_state("launch before load_program"));
        }
        self.backend.launch()?;
        self.launches += 1;
        debug!("Launch {} complete", self.launches);
        Ok(())
    }

    /// Launches completed so far
    pub const fn launches(&self) -> u64 {
        self.launches
    }

    /// Loaded program, if any
    pub fn program(&self) -> Option<&Bytes> {
        self.program.as_ref().map(|(_, image)| image)
    }

    /// Write one buffer per unit (in unit order) at `offset`
    ///
    /// # Errors
    ///
    /// Returns a host buffer error if the buffer count or lengths do not
    /// match, a configuration error for a bad window, or a fabric error.
    pub fn write_units<B: AsRef<[u8]> + Sync>(&self, offset: usize, buffers: &[B]) -> Result<()> {
        let size = self.check_buffers(buffers.len(), buffers.first().map_or(0, |b| b.as_ref().len()))?;
        let session = FabricSession::new(self.backend());
        for (rank, chunk) in buffers.chunks(NR_DPUS_PER_RANK).enumerate() {
            let mut batch = WriteBatch::new(&session, rank, offset, size, self.config.threads)?;
            for (i, buf) in chunk.iter().enumerate() {
                batch.prepare(i, buf.as_ref())?;
            }
            batch.commit()?;
        }
        Ok(())
    }

    /// Read `size` bytes at `offset` from every unit, in unit order
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a bad window, or a fabric error.
    pub fn read_units(&self, offset: usize, size: usize) -> Result<Vec<Vec<u8>>> {
        let mut out = vec![vec![0u8; size]; self.manager.unit_count()];
        let session = FabricSession::new(self.backend());
        for (rank, chunk) in out.chunks_mut(NR_DPUS_PER_RANK).enumerate() {
            let mut batch = ReadBatch::new(&session, rank, offset, size, self.config.threads)?;
            for (i, buf) in chunk.iter_mut().enumerate() {
                batch.prepare(i, buf)?;
            }
            batch.commit()?;
        }
        Ok(out)
    }

    /// Write `data` to one unit at `offset`
    ///
    /// # Errors
    ///
    /// Returns error for an unknown unit, a bad window, or a fabric failure.
    pub fn write_unit(&self, unit: usize, offset: usize, data: &[u8]) -> Result<()> {
        self.check_unit(unit)?;
        let session = FabricSession::new(self.backend());
        let mut batch = WriteBatch::new(
            &session,
            unit / NR_DPUS_PER_RANK,
            offset,
            data.len(),
            self.config.threads,
        )?;
        batch.prepare(unit % NR_DPUS_PER_RANK, data)?;
        batch.commit()
    }

    /// Read `size` bytes from one unit at `offset`
    ///
    /// # Errors
    ///
    /// Returns error for an unknown unit, a bad window, or a fabric failure.
    pub fn read_unit(&self, unit: usize, offset: usize, size: usize) -> Result<Vec<u8>> {
        self.check_unit(unit)?;
        let mut out = vec![0u8; size];
        let session = FabricSession::new(self.backend());
        let mut batch = ReadBatch::new(
            &session,
            unit / NR_DPUS_PER_RANK,
            offset,
            size,
            self.config.threads,
        )?;
        batch.prepare(unit % NR_DPUS_PER_RANK, &mut out)?;
        batch.commit()?;
        Ok(out)
    }

    fn check_unit(&self, unit: usize) -> Result<()> {
        if unit >= self.manager.unit_count() {
            return Err(CommError::host_buffer(format!(
                "unit {unit} outside the job ({} units)",
                self.manager.unit_count()
            )));
        }
        Ok(())
    }

    fn check_buffers(&self, count: usize, size: usize) -> Result<usize> {
        if count != self.manager.unit_count() {
            return Err(CommError::host_buffer(format!(
                "{count} buffers for {} units",
                self.manager.unit_count()
            )));
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedFabric;
    use pim_chip::rank::RankGeometry;

    fn job(lens: &[usize]) -> JobContext {
        let backend = Box::new(SimulatedFabric::new(2, RankGeometry::with_mram(4 << 20)));
        JobContext::new(backend, HypercubeManager::new(lens).unwrap(), CommConfig::default()).unwrap()
    }

    #[test]
    fn path_parsing() {
        assert_eq!("lib".parse::<CollectivePath>().unwrap(), CollectivePath::Library);
        assert_eq!("Conventional".parse::<CollectivePath>().unwrap(), CollectivePath::Conventional);
        assert!("fast".parse::<CollectivePath>().is_err());
    }

    #[test]
    fn config_builder_clamps_threads() {
        let c = CommConfig::default().with_threads(64).with_path(CollectivePath::Conventional);
        assert_eq!(c.threads, 8);
        assert_eq!(c.path, CollectivePath::Conventional);
        assert_eq!(CommConfig::default().with_threads(0).threads, 1);
    }

    fn vars<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| pairs.iter().find(|(k, _)| *k == key).map(|(_, v)| (*v).to_string())
    }

    #[test]
    fn config_from_environment_values() {
        assert_eq!(CommConfig::from_lookup(vars(&[])).unwrap(), CommConfig::default());

        let c = CommConfig::from_lookup(vars(&[
            (ENV_PATH, "conv"),
            (ENV_THREADS, " 3 "),
            (ENV_SIGNED_MAX, "0"),
        ]))
        .unwrap();
        assert_eq!(c.path, CollectivePath::Conventional);
        assert_eq!(c.threads, 3);
        assert_eq!(c.signedness, Signedness::Unsigned);
        assert_eq!(CommConfig::from_lookup(vars(&[(ENV_THREADS, "99")])).unwrap().threads, 8);

        for bad in [(ENV_PATH, "fast"), (ENV_THREADS, "many"), (ENV_SIGNED_MAX, "maybe")] {
            let err = CommConfig::from_lookup(vars(&[bad])).unwrap_err();
            assert!(matches!(err, CommError::Unsupported { .. }), "{bad:?}: {err}");
        }
    }

    #[test]
    fn too_few_ranks() {
        let backend = Box::new(SimulatedFabric::new(1, RankGeometry::with_mram(4 << 20)));
        let err = JobContext::new(backend, HypercubeManager::new(&[128]).unwrap(), CommConfig::default())
            .unwrap_err();
        assert!(matches!(err, CommError::InsufficientRanks { needed: 2, available: 1 }));
    }

    #[test]
    fn units_roundtrip_across_ranks() {
        let job = job(&[16, 8]);
        let data: Vec<Vec<u8>> = (0..128u8).map(|u| vec![u; 24]).collect();
        job.write_units(0x800, &data).unwrap();
        assert_eq!(job.read_units(0x800, 24).unwrap(), data);
        job.write_unit(70, 0x800, &[0xEE; 8]).unwrap();
        assert_eq!(job.read_unit(70, 0x800, 16).unwrap()[..9], [0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 0xEE, 70]);
        assert!(job.read_unit(128, 0, 8).is_err());
        assert!(job.write_units(0, &data[..3]).is_err());
    }

    #[test]
    fn launch_requires_program() {
        let mut job = job(&[8]);
        assert!(job.launch().is_err());
        job.load_program(Bytes::from_static(b"kernel")).unwrap();
        job.launch().unwrap();
        assert_eq!(job.launches(), 1);
    }
}
