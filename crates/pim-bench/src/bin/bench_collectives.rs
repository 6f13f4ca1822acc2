//! Collective throughput benchmark — library vs conventional path.
//!
//! Runs each in-fabric collective over every axis combination of one
//! hypercube and prints wall time, fabric granules and the speedup of the
//! library path over the host-staged path.
//!
//! Usage:
//!   cargo run --release --bin bench_collectives
//!   cargo run --release --bin bench_collectives -- --size 4096 --iterations 20
//!   cargo run --release --bin bench_collectives -- --device sim:2 --shape 16,8

use anyhow::Result;
use pim_comm::prelude::*;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEFAULT_ITERATIONS: usize = 10;
const DEFAULT_SIZE: usize = 1024;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);
    let size = parse_arg(&args, "--size", DEFAULT_SIZE);
    let threads = parse_arg(&args, "--threads", 4);
    let device = parse_str(&args, "--device", "sim:1");
    let shape: Vec<usize> = parse_str(&args, "--shape", "8,8")
        .split(',')
        .map(str::parse)
        .collect::<Result<_, _>>()?;

    let cube = HypercubeManager::new(&shape)?;
    println!("Collective benchmark");
    println!("====================");
    println!("Device      : {device}");
    println!("Hypercube   : {shape:?} ({} units)", cube.unit_count());
    println!("Bytes/unit  : {size}");
    println!("Iterations  : {iterations}");
    println!("Threads     : {threads}");
    println!();
    println!(
        "  {:<15} {:>5}  {:>12}  {:>12}  {:>8}  {:>10}  {:>6}",
        "op", "comm", "library", "conventional", "speedup", "granules", "path"
    );

    for comm in comm_specs(shape.len()) {
        let axis = CommAxis::parse(&comm, shape.len())?;
        let partners = cube.partners(axis);
        // reduce_scatter and alltoall split the block: keep 8-byte slots
        let split = (size / partners).max(8) / 8 * 8 * partners;
        for (name, total) in [
            ("alltoall", split),
            ("all_gather", size),
            ("all_reduce", size),
            ("reduce_scatter", split),
        ] {
            let lib = run(&device, &shape, threads, CollectivePath::Library, name, &comm, total, iterations)?;
            let conv = run(&device, &shape, threads, CollectivePath::Conventional, name, &comm, total, iterations)?;
            println!(
                "  {:<15} {:>5}  {:>10.1}µs  {:>10.1}µs  {:>7.2}×  {:>10}  {:>6}",
                name,
                comm,
                lib.0.as_secs_f64() * 1e6,
                conv.0.as_secs_f64() * 1e6,
                conv.0.as_secs_f64() / lib.0.as_secs_f64().max(f64::EPSILON),
                lib.1,
                lib.2,
            );
        }
    }
    Ok(())
}

/// Every non-empty axis subset, as `0/1` strings
fn comm_specs(dimension: usize) -> Vec<String> {
    (1..1u32 << dimension)
        .map(|mask| {
            (0..dimension)
                .map(|a| if mask & (1 << a) != 0 { '1' } else { '0' })
                .collect()
        })
        .collect()
}

/// Mean time per call, granules moved by the last call, rotation path
#[allow(clippy::too_many_arguments)]
fn run(
    device: &str,
    shape: &[usize],
    threads: usize,
    path: CollectivePath,
    op: &str,
    comm: &str,
    total: usize,
    iterations: usize,
) -> Result<(Duration, u64, String)> {
    let config = CommConfig::default().with_path(path).with_threads(threads);
    let job = JobContext::open(BackendSelection::Auto, device, shape, config)?;
    let blocks: Vec<Vec<u8>> = (0..job.manager().unit_count())
        .map(|u| (0..total).map(|i| (u * 7 + i) as u8).collect())
        .collect();
    job.write_units(0, &blocks)?;

    let engine = job.engine();
    let (start, target, buffer) = (0, 1 << 20, 2 << 20);
    let mut elapsed = Duration::ZERO;
    let mut last = None;
    for _ in 0..iterations {
        let report = match op {
            "alltoall" => engine.alltoall(comm, total, start, target, buffer)?,
            "all_gather" => engine.all_gather(comm, total, start, target, buffer)?,
            "all_reduce" => engine.all_reduce(comm, total, start, target, buffer, 4, ReduceKind::Sum)?,
            _ => engine.reduce_scatter(comm, total, start, target, buffer, 4)?,
        };
        elapsed += report.elapsed;
        last = Some(report);
    }
    let (granules, rotation) = last.map_or((0, String::new()), |r| {
        (
            r.granules_loaded + r.granules_stored,
            r.rotation_path.map_or_else(|| "host".to_string(), |p| p.to_string()),
        )
    });
    Ok((elapsed / u32::try_from(iterations).unwrap_or(u32::MAX), granules, rotation))
}

fn parse_arg(args: &[String], flag: &str, default: usize) -> usize {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn parse_str(args: &[String], flag: &str, default: &str) -> String {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map_or_else(|| default.to_string(), |w| w[1].clone())
}
