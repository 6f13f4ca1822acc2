//! `pim` — command-line interface for PIM collective communication.
//!
//! ```text
//! USAGE:
//!   pim info [--device ID]              Backend geometry and capabilities
//!   pim translate <offset> [...]        Logical MRAM offset → region offset
//!   pim run <op> [...]                  Run one collective on seeded data
//!   pim verify [...]                    Compare library and conventional paths
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pim_chip::translate::{byte_region_offset, locate, permute_mram_offset};
use pim_comm::geometry::NR_DPUS_PER_CI;
use pim_comm::prelude::*;
use pim_comm::{select_backend, Capability};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pim", about = "PIM collective communication CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Args, Clone)]
struct Target {
    /// Device id: `sim:<ranks>[:<mram_mib>]` or `[mmap:]<path>[,<path>..][@<mram_mib>]`
    #[arg(long, default_value = "sim:2:16")]
    device: String,
    /// Hypercube axis lengths, x first (e.g. 8,8)
    #[arg(long, value_delimiter = ',', default_value = "8,8")]
    shape: Vec<usize>,
    /// Collective path (`lib` or `conv`); defaults to PIM_COMM_PATH
    #[arg(long)]
    path: Option<String>,
    /// Transfer threads per rank
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print backend geometry and capabilities.
    Info {
        /// Device id
        #[arg(long, default_value = "sim:1")]
        device: String,
    },
    /// Translate a logical MRAM offset to its rank region offset.
    Translate {
        /// Logical offset (decimal or 0x hex)
        #[arg(value_parser = parse_num)]
        offset: usize,
        /// Member (rotation group) 0..8
        #[arg(long, default_value_t = 0)]
        member: u8,
        /// CI lane 0..8
        #[arg(long, default_value_t = 0)]
        lane: u8,
    },
    /// Run one collective on seeded data and print its report.
    Run {
        /// Operation
        op: OpArg,
        #[command(flatten)]
        target: Target,
        /// Participating axes, one 0/1 per axis (x first)
        #[arg(long, default_value = "10")]
        comm: String,
        /// Bytes per unit
        #[arg(long, value_parser = parse_num, default_value = "64")]
        size: usize,
        /// Source offset
        #[arg(long, value_parser = parse_num, default_value = "0")]
        start: usize,
        /// Destination offset
        #[arg(long, value_parser = parse_num, default_value = "0x10000")]
        dest: usize,
        /// Bounce buffer offset
        #[arg(long, value_parser = parse_num, default_value = "0x20000")]
        buffer: usize,
        /// Element width in bytes
        #[arg(long, default_value_t = 4)]
        element: usize,
        /// Reduction
        #[arg(long, value_enum, default_value = "sum")]
        kind: KindArg,
    },
    /// Run every in-fabric collective on both paths and compare memory.
    Verify {
        #[command(flatten)]
        target: Target,
        /// Participating axes, one 0/1 per axis (x first)
        #[arg(long, default_value = "10")]
        comm: String,
        /// Bytes per partner slot
        #[arg(long, value_parser = parse_num, default_value = "8")]
        slot: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OpArg {
    Broadcast,
    Alltoall,
    AllGather,
    Gather,
    Scatter,
    Reduce,
    AllReduce,
    ReduceScatter,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Sum,
    Max,
}

impl From<KindArg> for ReduceKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Sum => Self::Sum,
            KindArg::Max => Self::Max,
        }
    }
}

fn parse_num(s: &str) -> Result<usize, String> {
    let s = s.trim().replace('_', "");
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Info { device } => cmd_info(&device)?,
        Cmd::Translate { offset, member, lane } => cmd_translate(offset, member, lane)?,
        Cmd::Run {
            op,
            target,
            comm,
            size,
            start,
            dest,
            buffer,
            element,
            kind,
        } => {
            let job = open_job(&target, None)?;
            let call = Call { comm: &comm, size, start, dest, buffer, element, kind: kind.into() };
            cmd_run(&job, op, &call)?;
        }
        Cmd::Verify { target, comm, slot } => cmd_verify(&target, &comm, slot)?,
    }

    Ok(())
}

fn open_job(target: &Target, path: Option<CollectivePath>) -> Result<JobContext> {
    let mut config = CommConfig::from_env()?;
    if let Some(p) = &target.path {
        config = config.with_path(p.parse()?);
    }
    if let Some(p) = path {
        config = config.with_path(p);
    }
    if let Some(t) = target.threads {
        config = config.with_threads(t);
    }
    debug!(device = %target.device, shape = ?target.shape, path = %config.path, threads = config.threads, "opening job");
    JobContext::open(BackendSelection::Auto, &target.device, &target.shape, config)
        .with_context(|| format!("opening {} as {:?}", target.device, target.shape))
}

fn cmd_info(device: &str) -> Result<()> {
    let backend = select_backend(BackendSelection::Auto, device)?;
    let caps = backend.capabilities();
    println!("Device        : {device}");
    println!("Backend       : {}", backend.backend_type());
    println!("Ranks         : {}", caps.ranks);
    println!("Units         : {}", caps.unit_count());
    println!("MRAM per unit : {} MiB", caps.mram_bytes() >> 20);
    println!("Region / rank : {} MiB", caps.region_bytes >> 20);
    println!("Xfer threads  : {}", caps.threads_per_pool);
    let flags: Vec<String> = Capability::ALL
        .iter()
        .filter(|c| caps.supports(**c))
        .map(ToString::to_string)
        .collect();
    println!("Capabilities  : {}", flags.join(", "));
    Ok(())
}

fn cmd_translate(offset: usize, member: u8, lane: u8) -> Result<()> {
    if usize::from(member) >= NR_DPUS_PER_CI || lane >= 8 {
        bail!("member and lane must be below 8");
    }
    let logical = u32::try_from(offset).context("offset exceeds the 32-bit MRAM space")?;
    let physical = byte_region_offset(member, lane, logical);
    println!("Logical   : {logical:#010x}");
    println!("Permuted  : {:#010x}", permute_mram_offset(logical & !7));
    println!("Region    : {physical:#012x}");
    match locate(physical) {
        Some(b) => println!(
            "Resolves  : member {} lane {} logical {:#010x}",
            b.member, b.lane, b.logical
        ),
        None => println!("Resolves  : outside the bank layout"),
    }
    Ok(())
}

struct Call<'a> {
    comm: &'a str,
    size: usize,
    start: usize,
    dest: usize,
    buffer: usize,
    element: usize,
    kind: ReduceKind,
}

fn seeded(unit: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| {
            let x = (unit as u64).wrapping_mul(0x9E37_79B9).wrapping_add(i as u64 * 31);
            #[allow(clippy::cast_possible_truncation)]
            let b = (x ^ (x >> 7)) as u8;
            b
        })
        .collect()
}

fn cmd_run(job: &JobContext, op: OpArg, c: &Call<'_>) -> Result<()> {
    let units = job.manager().unit_count();
    let blocks: Vec<Vec<u8>> = (0..units).map(|u| seeded(u, c.size)).collect();
    job.write_units(c.start, &blocks)?;

    let engine = job.engine();
    let axis = CommAxis::parse(c.comm, job.manager().dimension())?;
    let groups = job.manager().groups(axis).len();
    let partners = job.manager().partners(axis);
    let report = match op {
        OpArg::Broadcast => engine.broadcast(&blocks[0], c.dest)?,
        OpArg::Alltoall => engine.alltoall(c.comm, c.size, c.start, c.dest, c.buffer)?,
        OpArg::AllGather => engine.all_gather(c.comm, c.size, c.start, c.dest, c.buffer)?,
        OpArg::AllReduce => {
            engine.all_reduce(c.comm, c.size, c.start, c.dest, c.buffer, c.element, c.kind)?
        }
        OpArg::ReduceScatter => engine.reduce_scatter_with(
            c.comm, c.size, c.start, c.dest, c.buffer, c.element, c.kind,
        )?,
        OpArg::Gather => {
            let mut host = vec![vec![0u8; c.size * partners]; groups];
            engine.gather(c.comm, c.size, c.start, &mut host)?
        }
        OpArg::Scatter => {
            let host: Vec<Vec<u8>> = (0..groups).map(|g| seeded(g, c.size * partners)).collect();
            engine.scatter(c.comm, c.size, c.dest, &host)?
        }
        OpArg::Reduce => {
            let mut host = vec![vec![0u8; c.size]; groups];
            engine.reduce(c.comm, c.size, c.start, c.element, c.kind, &mut host)?
        }
    };
    println!("{report}");
    Ok(())
}

fn cmd_verify(target: &Target, comm: &str, slot: usize) -> Result<()> {
    let probe = open_job(target, None)?;
    let axis = CommAxis::parse(comm, probe.manager().dimension())?;
    let partners = probe.manager().partners(axis);
    let window = 0x30000;
    drop(probe);

    let cases = [
        (OpArg::Alltoall, slot * partners),
        (OpArg::AllGather, slot.max(8).next_multiple_of(8)),
        (OpArg::AllReduce, 64),
        (OpArg::ReduceScatter, slot * partners),
    ];
    let mut failures = 0;
    for (op, size) in cases {
        let mut images = Vec::new();
        for path in [CollectivePath::Library, CollectivePath::Conventional] {
            let job = open_job(target, Some(path))?;
            let call = Call {
                comm,
                size,
                start: 0,
                dest: 0x10000,
                buffer: 0x20000,
                element: slot.min(4),
                kind: ReduceKind::Sum,
            };
            cmd_run(&job, op, &call)?;
            images.push(job.read_units(0, window)?);
        }
        let same = images[0] == images[1];
        println!("  {} {}", if same { "✅" } else { "❌" }, op_name(op));
        if !same {
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} collectives differ between paths");
    }
    println!("Library and conventional paths agree over {comm}");
    Ok(())
}

const fn op_name(op: OpArg) -> &'static str {
    match op {
        OpArg::Broadcast => "broadcast",
        OpArg::Alltoall => "alltoall",
        OpArg::AllGather => "all_gather",
        OpArg::Gather => "gather",
        OpArg::Scatter => "scatter",
        OpArg::Reduce => "reduce",
        OpArg::AllReduce => "all_reduce",
        OpArg::ReduceScatter => "reduce_scatter",
    }
}
