//! Memory-mapped rank fabric
//!
//! Maps one rank region per file: a DAX device exposing a PIM rank, or a
//! plain file for development. Lines are moved with volatile 64-bit accesses;
//! on x86_64 stores are non-temporal (`movnti`), flushes are `clflush` and
//! fences are `mfence`. Other targets fall back to plain volatile stores and
//! an atomic fence, and report no flush capability.
//!
//! Device ids: `[mmap:]<path>[,<path>...][@<mram_mib>]`, one path per rank.

use crate::backend::{check_line, BackendType, FabricBackend, Line, ProgramHandle};
use crate::capabilities::{Capabilities, Capability, CapabilitySet};
use crate::error::{CommError, Result};
use bytes::Bytes;
use pim_chip::rank::{RankGeometry, GRANULE_SIZE, NR_CIS};
use pim_chip::translate::region_span;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// One mapped rank region
#[derive(Debug)]
struct MappedRank {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    path: PathBuf,
}

impl MappedRank {
    fn open(path: &Path, size: u64) -> Result<Self> {
        tracing::debug!("Mapping rank region {}", path.display());

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let meta = file.metadata()?;
        if meta.is_file() && meta.len() < size {
            return Err(CommError::fabric(format!(
                "{} holds {} bytes, rank region needs {size}",
                path.display(),
                meta.len()
            )));
        }
        let size = usize::try_from(size)
            .map_err(|_| CommError::fabric("rank region larger than the address space"))?;

        // SAFETY: mmap of a file we just opened read/write:
        // - size is non-zero (region_span never returns 0)
        // - PROT_READ|PROT_WRITE with MAP_SHARED so stores reach the device
        // - offset 0, the whole region
        // - file is stored in the struct so the fd outlives the mapping
        // - Drop unmaps with the same size
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
            .map_err(|e| CommError::fabric(format!("mmap {} failed: {e}", path.display())))?
        };
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| CommError::fabric("mmap returned a null mapping"))?;

        tracing::info!(
            "Mapped rank region {} ({} MiB at {ptr:p})",
            path.display(),
            size >> 20
        );

        Ok(Self {
            ptr,
            size,
            _file: file,
            path: path.to_path_buf(),
        })
    }

    fn words(&self, offset: u64) -> *mut u64 {
        #[allow(clippy::cast_possible_truncation)]
        let at = offset as usize;
        assert!(at + GRANULE_SIZE <= self.size, "line offset out of bounds");
        // SAFETY: at + 64 <= size (asserted above) so the pointer stays inside
        // the mapping; line offsets are 64-byte aligned (checked by check_line)
        // and the mapping is page aligned, so the u64 cast is aligned.
        #[allow(clippy::cast_ptr_alignment)]
        let words = unsafe { self.ptr.as_ptr().add(at).cast::<u64>() };
        words
    }

    fn store(&self, offset: u64, line: &Line) {
        let dst = self.words(offset);
        let words: [u64; NR_CIS] = bytemuck::cast(*line);
        for (i, word) in words.into_iter().enumerate() {
            // SAFETY: dst points at 8 aligned words inside the mapping (see words()).
            #[cfg(target_arch = "x86_64")]
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                std::arch::x86_64::_mm_stream_si64(dst.add(i).cast::<i64>(), word as i64);
            };
            // SAFETY: dst points at 8 aligned words inside the mapping (see words()).
            #[cfg(not(target_arch = "x86_64"))]
            unsafe {
                dst.add(i).write_volatile(word);
            };
        }
    }

    fn load(&self, offset: u64) -> Line {
        let src = self.words(offset);
        let mut words = [0u64; NR_CIS];
        for (i, word) in words.iter_mut().enumerate() {
            // SAFETY: src points at 8 aligned words inside the mapping; volatile
            // because the units write the region behind the host's back.
            *word = unsafe { src.add(i).read_volatile() };
        }
        bytemuck::cast(words)
    }

    fn flush(&self, offset: u64) {
        let line = self.words(offset);
        // SAFETY: clflush on an address inside the mapping; no memory is accessed.
        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_clflush(line.cast::<u8>());
        };
        #[cfg(not(target_arch = "x86_64"))]
        let _ = line;
    }
}

impl Drop for MappedRank {
    fn drop(&mut self) {
        tracing::debug!(
            "Unmapping rank region {} ({} MiB)",
            self.path.display(),
            self.size >> 20
        );

        // SAFETY: ptr and size are exactly what mmap returned in open(); Drop
        // runs once and no line pointers outlive &self borrows.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::warn!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: MappedRank owns its mapping; moving it between threads does not
// invalidate the mapping, which is process-wide.
unsafe impl Send for MappedRank {}

// SAFETY: all accesses are bounds-checked volatile word accesses. Concurrent
// users touch disjoint lines (enforced by the transfer sharding), and the
// mapping itself is immutable for the lifetime of the struct.
unsafe impl Sync for MappedRank {}

/// Rank fabric over memory-mapped regions
#[derive(Debug)]
pub struct MmapFabric {
    ranks: Vec<MappedRank>,
    caps: Capabilities,
}

impl MmapFabric {
    /// Optional device id prefix
    pub const DEVICE_PREFIX: &'static str = "mmap:";

    /// Map one region per path, each large enough for `geometry`.
    ///
    /// # Errors
    ///
    /// Returns error if no path is given or any region cannot be mapped.
    pub fn open<P: AsRef<Path>>(paths: &[P], geometry: RankGeometry) -> Result<Self> {
        if paths.is_empty() {
            return Err(CommError::fabric("mmap fabric needs at least one rank path"));
        }
        let span = region_span(geometry.mram_bytes);
        let ranks = paths
            .iter()
            .map(|p| MappedRank::open(p.as_ref(), span))
            .collect::<Result<Vec<_>>>()?;

        let mut flags = CapabilitySet::empty().with(Capability::Persistent);
        if cfg!(target_arch = "x86_64") {
            flags.insert(Capability::NonTemporalStore);
            flags.insert(Capability::CacheFlush);
        }
        let caps = Capabilities::new(ranks.len(), geometry, flags);
        Ok(Self { ranks, caps })
    }

    /// Parse `[mmap:]<path>[,<path>...][@<mram_mib>]`.
    ///
    /// # Errors
    ///
    /// Returns error if the id names no path or a bad MRAM size.
    pub fn parse_device_id(device_id: &str) -> Result<(Vec<PathBuf>, RankGeometry)> {
        let body = device_id.strip_prefix(Self::DEVICE_PREFIX).unwrap_or(device_id);
        let (list, geometry) = match body.rsplit_once('@') {
            Some((list, mib)) => {
                let mib = mib.parse::<usize>().map_err(|_| {
                    CommError::fabric(format!("device id {device_id:?}: MRAM size not a number"))
                })?;
                if mib == 0 || mib > 64 {
                    return Err(CommError::fabric(format!(
                        "device id {device_id:?}: MRAM size must be 1..=64 MiB"
                    )));
                }
                (list, RankGeometry::with_mram(mib << 20))
            }
            None => (body, RankGeometry::UPMEM),
        };
        let paths: Vec<PathBuf> = list
            .split(',')
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .collect();
        if paths.is_empty() {
            return Err(CommError::fabric(format!("device id {device_id:?}: no rank path")));
        }
        Ok((paths, geometry))
    }

    fn rank(&self, rank: usize, offset: u64) -> Result<&MappedRank> {
        check_line(&self.caps, rank, offset)?;
        Ok(&self.ranks[rank])
    }
}

impl FabricBackend for MmapFabric {
    fn init(device_id: &str) -> Result<Self> {
        let (paths, geometry) = Self::parse_device_id(device_id)?;
        Self::open(&paths, geometry)
    }

    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Mmap
    }

    fn is_ready(&self) -> bool {
        !self.ranks.is_empty()
    }

    fn store_line(&self, rank: usize, offset: u64, line: &Line) -> Result<()> {
        self.rank(rank, offset)?.store(offset, line);
        Ok(())
    }

    fn load_line(&self, rank: usize, offset: u64) -> Result<Line> {
        Ok(self.rank(rank, offset)?.load(offset))
    }

    fn flush_line(&self, rank: usize, offset: u64) -> Result<()> {
        self.rank(rank, offset)?.flush(offset);
        Ok(())
    }

    fn fence(&self) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: mfence has no memory operands.
        #[allow(unused_unsafe)]
        unsafe {
            std::arch::x86_64::_mm_mfence();
        };
        #[cfg(not(target_arch = "x86_64"))]
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    fn load_program(&mut self, _image: &Bytes) -> Result<ProgramHandle> {
        Err(CommError::unsupported(Capability::ProgramLoad.to_string()))
    }

    fn launch(&mut self) -> Result<()> {
        Err(CommError::unsupported(Capability::SyncLaunch.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_file(mram: usize) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(region_span(mram)).unwrap();
        file
    }

    #[test]
    fn parse_device_ids() {
        let (paths, geo) = MmapFabric::parse_device_id("mmap:/dev/dax0.0,/dev/dax1.0@8").unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(geo.mram_bytes, 8 << 20);
        let (paths, geo) = MmapFabric::parse_device_id("/dev/dax0.0").unwrap();
        assert_eq!(paths, vec![PathBuf::from("/dev/dax0.0")]);
        assert_eq!(geo, RankGeometry::UPMEM);
        assert!(MmapFabric::parse_device_id("mmap:").is_err());
        assert!(MmapFabric::parse_device_id("/a@0").is_err());
    }

    #[test]
    fn short_file_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        assert!(MmapFabric::open(&[file.path()], RankGeometry::with_mram(4 << 20)).is_err());
    }

    #[test]
    fn line_roundtrip_through_file() {
        let mram = 4 << 20;
        let file = region_file(mram);
        let fabric = MmapFabric::open(&[file.path()], RankGeometry::with_mram(mram)).unwrap();
        let mut line = [0u8; GRANULE_SIZE];
        for (i, b) in line.iter_mut().enumerate() {
            *b = i as u8;
        }
        fabric.store_line(0, 0x1_0040, &line).unwrap();
        fabric.fence();
        fabric.flush_line(0, 0x1_0040).unwrap();
        fabric.fence();
        assert_eq!(fabric.load_line(0, 0x1_0040).unwrap(), line);
        assert!(fabric.load_line(1, 0).is_err());
        assert_eq!(fabric.backend_type(), BackendType::Mmap);
    }

    #[test]
    fn program_load_unsupported() {
        let mram = 4 << 20;
        let file = region_file(mram);
        let mut fabric = MmapFabric::open(&[file.path()], RankGeometry::with_mram(mram)).unwrap();
        assert!(matches!(
            fabric.load_program(&Bytes::from_static(b"img")),
            Err(CommError::Unsupported { .. })
        ));
    }
}
