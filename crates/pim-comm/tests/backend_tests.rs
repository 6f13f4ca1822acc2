//! Backend behaviour: cache protocol of the simulated fabric, mmap regions,
//! selection, and collectives on a mapped file

mod common;

use pim_comm::fabric::{read_block, write_block, GranuleAddr};
use pim_comm::geometry::RankGeometry;
use pim_comm::prelude::*;
use pim_comm::{select_backend, BackendType, Capability, MmapFabric};
use pim_chip::translate::region_span;

#[test]
fn simulated_cache_serves_stale_lines_until_flushed() {
    let fabric = SimulatedFabric::new(1, RankGeometry::with_mram(1 << 20));
    let addr = GranuleAddr::new(0, 3, 0x40);
    let offset = addr.offset();

    assert_eq!(fabric.load_line(0, offset).unwrap(), [0u8; 64]);
    fabric.store_line(0, offset, &[7u8; 64]).unwrap();
    // not fenced: still in the write-combining buffer
    assert_eq!(fabric.pending_lines(0), 1);
    fabric.fence();
    assert_eq!(fabric.pending_lines(0), 0);
    // fenced but the old line is still cached
    assert_eq!(fabric.load_line(0, offset).unwrap(), [0u8; 64]);
    fabric.flush_line(0, offset).unwrap();
    assert_eq!(fabric.load_line(0, offset).unwrap(), [7u8; 64]);
    assert!(fabric.stats().cache_hits >= 1);
}

#[test]
fn block_protocol_round_trip() {
    let fabric = SimulatedFabric::new(2, RankGeometry::with_mram(1 << 20));
    let addr = GranuleAddr::new(1, 6, 0x2000);
    let granules: Vec<[u64; 8]> = (0..5u64).map(|g| std::array::from_fn(|l| g << 8 | l as u64)).collect();
    // warm the cache with the old contents
    assert_eq!(read_block(&fabric, addr, 5).unwrap(), vec![[0u64; 8]; 5]);
    write_block(&fabric, addr, &granules).unwrap();
    assert_eq!(read_block(&fabric, addr, 5).unwrap(), granules);
    assert_eq!(fabric.cached_lines(1), 0);
}

#[test]
fn collective_counts_fabric_traffic() {
    let fabric = SimulatedFabric::new(1, RankGeometry::with_mram(1 << 20));
    fabric.reset_stats();
    let job = JobContext::new(
        Box::new(fabric),
        HypercubeManager::new(&[8, 8]).unwrap(),
        CommConfig::default(),
    )
    .unwrap();
    common::fill(&job, 0, 64, 1);
    let report = job.engine().all_reduce("10", 64, 0, 128, 256, 4, ReduceKind::Sum).unwrap();
    assert!(report.granules_loaded > 0);
    assert_eq!(report.granules_stored, 64);
    assert_eq!(report.bytes_moved, (report.granules_loaded + report.granules_stored) * 64);
}

#[test]
fn auto_selection_by_device_id() {
    let sim = select_backend(BackendSelection::Auto, "sim:2:8").unwrap();
    assert_eq!(sim.backend_type(), BackendType::Simulated);
    assert_eq!(sim.rank_count(), 2);
    assert_eq!(sim.capabilities().mram_bytes(), 8 << 20);
    assert!(sim.capabilities().supports(Capability::ProgramLoad));
    assert!(select_backend(BackendSelection::Simulated, "sim:0").is_err());
    assert!(select_backend(BackendSelection::Auto, "/nonexistent/rank0").is_err());
}

#[test]
fn program_load_and_launch() {
    let mut job = JobContext::open(BackendSelection::Auto, "sim:1", &[64], CommConfig::default()).unwrap();
    assert!(job.launch().is_err());
    job.load_program(bytes::Bytes::from_static(b"\x7fELF-unit-kernel")).unwrap();
    job.launch().unwrap();
    job.launch().unwrap();
    assert_eq!(job.launches(), 2);
    assert_eq!(job.program().map(|p| p.len()), Some(16));
}

#[test]
fn mmap_fabric_matches_simulated() {
    let mram = 4 << 20;
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(region_span(mram)).unwrap();
    let fabric = MmapFabric::open(&[file.path()], RankGeometry::with_mram(mram)).unwrap();
    assert!(fabric.capabilities().supports(Capability::Persistent));
    assert!(fabric.is_ready());

    let mapped = JobContext::new(
        Box::new(fabric),
        HypercubeManager::new(&[4, 4]).unwrap(),
        CommConfig::default(),
    )
    .unwrap();
    let simulated = common::job(&[4, 4], CollectivePath::Library);
    for job in [&mapped, &simulated] {
        common::fill(job, 0, 32, 99);
        job.engine().reduce_scatter("11", 32, 0, 64, 128, 2).unwrap();
        job.engine().all_gather("01", 16, 0, 256, 512).unwrap();
    }
    assert_eq!(mapped.read_units(0, 512).unwrap(), simulated.read_units(0, 512).unwrap());
}

#[test]
fn mmap_rejects_short_region() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file().set_len(4096).unwrap();
    assert!(MmapFabric::open(&[file.path()], RankGeometry::with_mram(4 << 20)).is_err());
}

#[test]
#[ignore] // Requires a PIM rank exposed as a DAX device
fn dax_rank_round_trip() {
    let device = std::env::var("PIM_DAX_DEVICE").unwrap_or_else(|_| "/dev/dax0.0".into());
    let job = JobContext::open(BackendSelection::Mmap, &device, &[64], CommConfig::default())
        .expect("mmap backend init");
    let data = common::fill(&job, 0, 64, 42);
    assert_eq!(job.read_units(0, 64).unwrap(), data);
    println!("{}", job.engine().all_reduce("1", 64, 0, 64, 128, 4, ReduceKind::Sum).unwrap());
}
