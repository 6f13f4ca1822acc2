//! Silicon model for UPMEM-class processing-in-memory ranks.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of how a rank is wired to the host: DPU geometry, the MRAM
//! address permutation, the bank chunk remap of the rank region, and the
//! byte interleave of a cache line across chip interfaces.
//!
//! Everything here was established by probing the memory-mapped rank region
//! on Xeon SP hosts; the driver crates build on it without re-deriving any
//! constant.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`rank`] | 8 CIs × 8 DPUs, 64 MiB MRAM, 64-byte granule, transfer thread sizing |
//! | [`translate`] | MRAM bit permutation, bank chunk remap, region offsets and their inverse |
//! | [`interleave`] | 8×8 byte transpose between per-CI words and the stored line |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod interleave;
pub mod rank;
pub mod translate;
