// SPDX-License-Identifier: AGPL-3.0-only

//! Full Validation Suite — collective correctness on a live or simulated fabric
//!
//! Runs every correctness claim of the collective engine against the chosen
//! device. The simulated fabric needs no hardware; a DAX or file-backed
//! region validates the same claims through the real memory protocol.
//!
//! ## Validated claims
//!
//! | # | Claim | Threshold |
//! |---|-------|-----------|
//! | 1 | Address translation inverts through `locate` | every sampled byte |
//! | 2 | Line interleave inverts | every sampled line |
//! | 3 | Lane and element rotations invert | every shift |
//! | 4 | all_reduce sums every partner | exact match |
//! | 5 | Library and conventional paths agree | bit-identical window |
//! | 6 | reduce_scatter leaves bytes past the shard untouched | sentinel intact |
//! | 7 | all_gather output is stable under repetition | bit-identical |
//! | 8 | scatter then gather returns the host buffers | exact match |
//! | 9 | Overlapping source and target go through the bounce buffer | matches reference |
//!
//! ## Usage
//!
//!   cargo run --bin validate_all                          # simulated fabric
//!   cargo run --bin validate_all -- --device /dev/dax0.0  # DAX region
//!   cargo run --bin validate_all -- --verbose             # show detail for each check

use anyhow::{ensure, Result};
use pim_chip::interleave::{deinterleave, interleave};
use pim_chip::translate::{byte_region_offset, locate};
use pim_comm::kernels::{rotate_elements, rotate_lanes, slot_shape};
use pim_comm::prelude::*;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const SHAPE: [usize; 2] = [8, 8];
const TARGET: usize = 0x1_0000;
const BUFFER: usize = 0x4_0000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose");
    let device = args
        .windows(2)
        .find(|w| w[0] == "--device")
        .map_or_else(|| "sim:1:4".to_string(), |w| w[1].clone());

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  PIM Collective Validation Suite                             ║");
    println!("║  Translation, kernels and all in-fabric collectives          ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    match open(&device, CollectivePath::Library) {
        Ok(job) => {
            println!("Device   : {device}");
            println!("Backend  : {}", job.backend().backend_type());
            println!("Units    : {}", job.manager().unit_count());
            println!("MRAM     : {} KiB per unit", job.mram_bytes() >> 10);
        }
        Err(e) => {
            println!("Cannot open {device}: {e}");
            println!("Re-run without --device to use the simulated fabric.");
            std::process::exit(1);
        }
    }
    println!();

    let mut suite = ValidationSuite::new(device, verbose);

    // ── 1: Address translation ────────────────────────────────────────────────
    suite.run("1: Translation — locate inverts byte_region_offset", |_| {
        let mut checked = 0usize;
        for logical in (0u32..1 << 20).step_by(4093) {
            for member in 0..8u8 {
                for lane in 0..8u8 {
                    let physical = byte_region_offset(member, lane, logical);
                    let Some(back) = locate(physical) else {
                        return Ok(ValidationResult::fail(format!(
                            "{physical:#x} (member {member} lane {lane} logical {logical:#x}) did not resolve"
                        )));
                    };
                    if (back.member, back.lane, back.logical) != (member, lane, logical) {
                        return Ok(ValidationResult::fail(format!(
                            "{physical:#x} resolved to member {} lane {} logical {:#x}",
                            back.member, back.lane, back.logical
                        )));
                    }
                    checked += 1;
                }
            }
        }
        Ok(ValidationResult::pass(format!("{checked} bytes resolve to their origin")))
    });

    // ── 2: Interleave ─────────────────────────────────────────────────────────
    suite.run("2: Interleave — 8x8 byte transpose inverts", |_| {
        let n = 4096u64;
        for seed in 0..n {
            let words: [u64; 8] = std::array::from_fn(|l| {
                (seed + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(l as u32 * 7)
            });
            if deinterleave(&interleave(&words)) != words {
                return Ok(ValidationResult::fail(format!("line {seed} does not round-trip")));
            }
        }
        Ok(ValidationResult::pass(format!("{n} lines")))
    });

    // ── 3: Rotations ──────────────────────────────────────────────────────────
    suite.run("3: Rotations — lane and element shifts invert", |_| {
        let g: [u64; 8] = std::array::from_fn(|l| 0x0101_0101_0101_0101 * (l as u64 + 1) + l as u64);
        for k in 0..8 {
            if rotate_lanes(&rotate_lanes(&g, k), 8 - k) != g {
                return Ok(ValidationResult::fail(format!("lane shift {k}")));
            }
        }
        for slot in [2usize, 4] {
            let shape = slot_shape(slot)?;
            let n = shape.group().get();
            for k in 0..n {
                if rotate_elements(&rotate_elements(&g, k, shape), (n - k) % n, shape) != g {
                    return Ok(ValidationResult::fail(format!("{slot}-byte slots, shift {k}")));
                }
            }
        }
        Ok(ValidationResult::pass("8 lane shifts, 2/4-byte slot shifts".into()))
    });

    // ── 4: all_reduce ─────────────────────────────────────────────────────────
    suite.run("4: all_reduce — every unit holds the partner sum", |s| {
        let job = open(&s.device, CollectivePath::Library)?;
        let units = job.manager().unit_count();
        let blocks: Vec<Vec<u8>> = (0..units)
            .map(|u| (0..16u32).flat_map(|j| (u as u32 * 16 + j).to_le_bytes()).collect())
            .collect();
        job.write_units(0, &blocks)?;
        let t0 = Instant::now();
        let report = job.engine().all_reduce("10", 64, 0, TARGET, BUFFER, 4, ReduceKind::Sum)?;
        let us = t0.elapsed().as_secs_f64() * 1e6;
        let out = job.read_units(TARGET, 64)?;
        for (u, got) in out.iter().enumerate() {
            let row = u / 8 * 8;
            let expected: Vec<u8> = (0..16u32)
                .flat_map(|j| (row..row + 8).map(|p| p as u32 * 16 + j).sum::<u32>().to_le_bytes())
                .collect();
            if *got != expected {
                return Ok(ValidationResult::fail(format!("unit {u} holds the wrong sum")));
            }
        }
        Ok(ValidationResult::pass(format!("{report} in {us:.0}µs")))
    });

    // ── 5: Path parity ────────────────────────────────────────────────────────
    suite.run("5: Path parity — library ≡ conventional over every axis set", |s| {
        let mut compared = 0;
        for comm in ["10", "01", "11"] {
            for op in [
                CollectiveOp::AllToAll,
                CollectiveOp::AllGather,
                CollectiveOp::AllReduce,
                CollectiveOp::ReduceScatter,
            ] {
                let lib = image(&s.device, CollectivePath::Library, op, comm)?;
                let conv = image(&s.device, CollectivePath::Conventional, op, comm)?;
                if lib != conv {
                    return Ok(ValidationResult::fail(format!("{op} over {comm} differs")));
                }
                compared += 1;
            }
        }
        Ok(ValidationResult::pass(format!("{compared} collectives bit-identical")))
    });

    // ── 6: reduce_scatter untouched bytes ─────────────────────────────────────
    suite.run("6: reduce_scatter — bytes past the shard stay untouched", |s| {
        let job = open(&s.device, CollectivePath::Library)?;
        let units = job.manager().unit_count();
        job.write_units(0, &seeded(units, 64))?;
        job.write_units(TARGET, &vec![vec![0xABu8; 64]; units])?;
        job.engine().reduce_scatter("10", 64, 0, TARGET, BUFFER, 4)?;
        let out = job.read_units(TARGET, 64)?;
        let dirty = out.iter().filter(|b| b[8..].iter().any(|&x| x != 0xAB)).count();
        Ok(if dirty == 0 {
            ValidationResult::pass("56 sentinel bytes intact on every unit".into())
        } else {
            ValidationResult::fail(format!("{dirty} units written past their shard"))
        })
    });

    // ── 7: all_gather idempotence ─────────────────────────────────────────────
    suite.run("7: all_gather — repeated call reproduces the output", |s| {
        let job = open(&s.device, CollectivePath::Library)?;
        let units = job.manager().unit_count();
        job.write_units(0, &seeded(units, 16))?;
        job.engine().all_gather("11", 16, 0, TARGET, BUFFER)?;
        let first = job.read_units(TARGET, 16 * units)?;
        job.engine().all_gather("11", 16, 0, TARGET, BUFFER)?;
        let second = job.read_units(TARGET, 16 * units)?;
        Ok(if first == second {
            ValidationResult::pass(format!("{} bytes per unit stable", 16 * units))
        } else {
            ValidationResult::fail("second all_gather changed the output".into())
        })
    });

    // ── 8: scatter / gather ───────────────────────────────────────────────────
    suite.run("8: scatter → gather — host buffers survive the fabric", |s| {
        let job = open(&s.device, CollectivePath::Library)?;
        let axis = CommAxis::parse("01", job.manager().dimension())?;
        let groups = job.manager().groups(axis).len();
        let partners = job.manager().partners(axis);
        let host = seeded(groups, 24 * partners);
        let engine = job.engine();
        engine.scatter("01", 24, TARGET, &host)?;
        let mut back = vec![vec![0u8; 24 * partners]; groups];
        engine.gather("01", 24, TARGET, &mut back)?;
        Ok(if back == host {
            ValidationResult::pass(format!("{groups} groups of {partners} partners"))
        } else {
            ValidationResult::fail("gathered buffers differ from scattered ones".into())
        })
    });

    // ── 9: Bounce buffer ──────────────────────────────────────────────────────
    suite.run("9: Overlap — in-place all_reduce goes through the bounce buffer", |s| {
        let lib = open(&s.device, CollectivePath::Library)?;
        let conv = open(&s.device, CollectivePath::Conventional)?;
        let units = lib.manager().unit_count();
        for job in [&lib, &conv] {
            job.write_units(0, &seeded(units, 64))?;
        }
        lib.engine().all_reduce("11", 64, 0, 0, BUFFER, 8, ReduceKind::Sum)?;
        conv.engine().all_reduce("11", 64, 0, TARGET, BUFFER, 8, ReduceKind::Sum)?;
        ensure!(lib.read_units(0, 64)? == conv.read_units(TARGET, 64)?, "in-place result differs");
        Ok(ValidationResult::pass("in-place result matches the out-of-place one".into()))
    });

    println!();
    suite.finish();
    Ok(())
}

// ─── Validation infrastructure ───────────────────────────────────────────────

struct ValidationResult {
    passed: bool,
    message: String,
}

impl ValidationResult {
    fn pass(message: String) -> Self {
        Self { passed: true, message }
    }

    fn fail(message: String) -> Self {
        Self { passed: false, message }
    }
}

struct ValidationSuite {
    device:  String,
    verbose: bool,
    passed:  usize,
    failed:  usize,
}

impl ValidationSuite {
    fn new(device: String, verbose: bool) -> Self {
        Self { device, verbose, passed: 0, failed: 0 }
    }

    fn run<F>(&mut self, name: &str, f: F)
    where
        F: FnOnce(&Self) -> Result<ValidationResult>,
    {
        print!("  {name:<64} ");
        match f(self) {
            Ok(ValidationResult { passed: true, message }) => {
                println!("✓ PASS");
                if self.verbose { println!("         {message}"); }
                self.passed += 1;
            }
            Ok(ValidationResult { passed: false, message }) => {
                println!("✗ FAIL");
                println!("         {message}");
                self.failed += 1;
            }
            Err(e) => {
                println!("✗ ERROR");
                println!("         {e}");
                self.failed += 1;
            }
        }
    }

    fn finish(&self) {
        let total = self.passed + self.failed;
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("Result: {} passed, {} failed  ({}/{})", self.passed, self.failed, self.passed, total);
        if self.failed == 0 {
            println!("All checks passed ✓");
        } else {
            println!("VALIDATION FAILED — {} check(s) require attention", self.failed);
            std::process::exit(1);
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open(device: &str, path: CollectivePath) -> Result<JobContext> {
    let config = CommConfig::default().with_path(path).with_threads(4);
    Ok(JobContext::open(BackendSelection::Auto, device, &SHAPE, config)?)
}

fn seeded(count: usize, len: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|u| {
            let mut x = 0x2545_F491_4F6C_DD1Du64 ^ (u as u64 + 1);
            (0..len)
                .map(|_| {
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    x.to_le_bytes()[0]
                })
                .collect()
        })
        .collect()
}

/// Output window of one collective on a freshly seeded job
fn image(device: &str, path: CollectivePath, op: CollectiveOp, comm: &str) -> Result<Vec<Vec<u8>>> {
    let job = open(device, path)?;
    let units = job.manager().unit_count();
    let partners = job.manager().partners(CommAxis::parse(comm, SHAPE.len())?);
    job.write_units(0, &seeded(units, 8 * partners))?;
    job.write_units(TARGET, &vec![vec![0x5Au8; 8 * partners * partners]; units])?;
    let total = 8 * partners;
    let engine = job.engine();
    match op {
        CollectiveOp::AllToAll => engine.alltoall(comm, total, 0, TARGET, BUFFER)?,
        CollectiveOp::AllGather => engine.all_gather(comm, total, 0, TARGET, BUFFER)?,
        CollectiveOp::AllReduce => engine.all_reduce(comm, total, 0, TARGET, BUFFER, 4, ReduceKind::Sum)?,
        _ => engine.reduce_scatter(comm, total, 0, TARGET, BUFFER, 4)?,
    };
    Ok(job.read_units(TARGET, 8 * partners * partners)?)
}
