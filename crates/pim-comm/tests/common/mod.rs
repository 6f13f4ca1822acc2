//! Shared fixtures: jobs on the simulated fabric, seeded data and a host
//! reference model of every collective.

#![allow(dead_code)]

use pim_comm::geometry::RankGeometry;
use pim_comm::merge::reduce_bytes;
use pim_comm::prelude::*;

/// MRAM per unit in test jobs
pub const MRAM: usize = 1 << 20;

/// Job over `lens` on a simulated fabric with enough ranks
pub fn job(lens: &[usize], path: CollectivePath) -> JobContext {
    let cube = HypercubeManager::new(lens).expect("valid topology");
    let backend = Box::new(SimulatedFabric::new(
        cube.ranks_needed(),
        RankGeometry::with_mram(MRAM),
    ));
    let config = CommConfig::default().with_path(path).with_threads(3);
    JobContext::new(backend, cube, config).expect("job")
}

/// xorshift64* bytes, reproducible per seed
pub fn bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 56) as u8
        })
        .collect()
}

/// Write seeded blocks of `len` bytes at `offset` to every unit
pub fn fill(job: &JobContext, offset: usize, len: usize, seed: u64) -> Vec<Vec<u8>> {
    let blocks: Vec<Vec<u8>> = (0..job.manager().unit_count())
        .map(|u| bytes(seed ^ ((u as u64) << 20), len))
        .collect();
    job.write_units(offset, &blocks).expect("fill");
    blocks
}

/// Units of every group of `comm`, partner order
pub fn groups(job: &JobContext, comm: &str) -> Vec<Vec<usize>> {
    let cube = job.manager();
    let axis = CommAxis::parse(comm, cube.dimension()).expect("axis");
    cube.groups(axis).into_iter().map(|g| g.units).collect()
}

/// Fold `blocks` in order with the element-wise combine
pub fn fold(blocks: &[&[u8]], width: ElementWidth, kind: ReduceKind, sign: Signedness) -> Vec<u8> {
    let mut acc = blocks[0].to_vec();
    for b in &blocks[1..] {
        reduce_bytes(&mut acc, b, width, kind, sign);
    }
    acc
}

/// Expected all_to_all output per unit
pub fn expect_alltoall(src: &[Vec<u8>], groups: &[Vec<usize>]) -> Vec<Vec<u8>> {
    let mut out = vec![Vec::new(); src.len()];
    for group in groups {
        let slot = src[group[0]].len() / group.len();
        for (q, &dst) in group.iter().enumerate() {
            out[dst] = group
                .iter()
                .flat_map(|&p| src[p][q * slot..(q + 1) * slot].iter().copied())
                .collect();
        }
    }
    out
}

/// Expected all_gather output per unit
pub fn expect_all_gather(src: &[Vec<u8>], groups: &[Vec<usize>]) -> Vec<Vec<u8>> {
    let mut out = vec![Vec::new(); src.len()];
    for group in groups {
        let all: Vec<u8> = group.iter().flat_map(|&p| src[p].iter().copied()).collect();
        for &dst in group {
            out[dst].clone_from(&all);
        }
    }
    out
}

/// Expected all_reduce output per unit
pub fn expect_all_reduce(
    src: &[Vec<u8>],
    groups: &[Vec<usize>],
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
) -> Vec<Vec<u8>> {
    let mut out = vec![Vec::new(); src.len()];
    for group in groups {
        let blocks: Vec<&[u8]> = group.iter().map(|&p| src[p].as_slice()).collect();
        let total = fold(&blocks, width, kind, sign);
        for &dst in group {
            out[dst].clone_from(&total);
        }
    }
    out
}

/// Expected reduce_scatter shard per unit
pub fn expect_reduce_scatter(
    src: &[Vec<u8>],
    groups: &[Vec<usize>],
    width: ElementWidth,
    kind: ReduceKind,
    sign: Signedness,
) -> Vec<Vec<u8>> {
    let mut out = vec![Vec::new(); src.len()];
    for group in groups {
        let shard = src[group[0]].len() / group.len();
        for (q, &dst) in group.iter().enumerate() {
            let blocks: Vec<&[u8]> = group
                .iter()
                .map(|&p| &src[p][q * shard..(q + 1) * shard])
                .collect();
            out[dst] = fold(&blocks, width, kind, sign);
        }
    }
    out
}
