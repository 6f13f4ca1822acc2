//! Address translation and line kernel microbenchmark.
//!
//! Measures the logical → region offset translation, its inverse, the 8x8
//! byte interleave of a line, and the granule kernels the library path runs
//! per destination word.
//!
//! Usage:
//!   cargo run --release --bin bench_translation
//!   cargo run --release --bin bench_translation -- --iterations 10000000

use anyhow::Result;
use pim_chip::interleave::{deinterleave, interleave};
use pim_chip::translate::{line_offset, locate, translate};
use pim_comm::kernels::{
    reduce_into, reduce_lanes, rotate_elements, rotate_lanes, ElementWidth, GroupSize, KernelShape,
    ReduceKind, Signedness,
};
use std::hint::black_box;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const DEFAULT_ITERATIONS: usize = 1_000_000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let iterations = parse_arg(&args, "--iterations", DEFAULT_ITERATIONS).max(1);

    println!("Translation and kernel microbenchmark");
    println!("=====================================");
    println!("Iterations : {iterations}");
    println!();

    report("translate(logical)", iterations, |i| {
        black_box(translate(black_box((i as u32).wrapping_mul(8) & 0x03FF_FFF8)));
    });
    report("line_offset(member, logical)", iterations, |i| {
        black_box(line_offset((i % 8) as u8, (i as u32).wrapping_mul(64) & 0x03FF_FFF8));
    });
    report("locate(region)", iterations, |i| {
        black_box(locate(black_box(i as u64 * 64)));
    });

    let mut words = [0x0123_4567_89AB_CDEFu64; 8];
    report("interleave + deinterleave", iterations, |i| {
        words[i % 8] ^= i as u64;
        black_box(deinterleave(&interleave(black_box(&words))));
    });

    let g: [u64; 8] = std::array::from_fn(|l| 0x1111_1111_1111_1111 * (l as u64 + 1));
    report("rotate_lanes", iterations, |i| {
        black_box(rotate_lanes(black_box(&g), i % 8));
    });
    let native = KernelShape::new(ElementWidth::W2, GroupSize::Four)?;
    report("rotate_elements (native)", iterations, |i| {
        black_box(rotate_elements(black_box(&g), i % 4, native));
    });
    let shuffled = KernelShape::new(ElementWidth::W1, GroupSize::Two)?;
    report("rotate_elements (shuffle)", iterations, |i| {
        black_box(rotate_elements(black_box(&g), i % 2, shuffled));
    });
    let mut acc = g;
    report("reduce_into (i8 max)", iterations, |_| {
        reduce_into(&mut acc, black_box(&g), ElementWidth::W1, ReduceKind::Max, Signedness::Signed);
    });
    report("reduce_lanes (i32 sum, 3 bits)", iterations, |_| {
        black_box(reduce_lanes(black_box(&g), 0b111, ElementWidth::W4, ReduceKind::Sum, Signedness::Signed));
    });

    Ok(())
}

fn report(name: &str, iterations: usize, mut f: impl FnMut(usize)) {
    let t0 = Instant::now();
    for i in 0..iterations {
        f(i);
    }
    let ns = t0.elapsed().as_secs_f64() * 1e9 / iterations as f64;
    println!("  {name:<34} {ns:>8.2} ns/op  ({:>7.1} M/s)", 1e3 / ns);
}

fn parse_arg(args: &[String], flag: &str, default: usize) -> usize {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
