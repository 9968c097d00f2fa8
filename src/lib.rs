//! Sampling profiler and performance-tree analyzer for parallel native
//! workloads.
//!
//! Each worker process hosts an in-process [`Sampler`][sample::Sampler] that
//! captures a raw call stack on every PMU overflow or timer tick and interns
//! it into a fixed-capacity, signal-safe [`InternMap`][sample::InternMap].
//! Periodically the sampler flushes a compact binary trace (`.pflw`) together
//! with a snapshot of the process's executable memory layout (`.libmap`).
//!
//! A separate analyzer ingests those traces, resolves raw instruction
//! addresses to `(library, offset, function, file:line)` tuples and folds all
//! samples into a [`PerformanceTree`][analysis::PerformanceTree] that supports
//! balance analysis, hotspot ranking and visualization.
//!
//! ## Example
//!
//! Fold a set of per-rank trace files into a tree and rank its hotspots:
//!
//! ```no_run
//! use parprof::analysis::{
//!     top_hotspots, BuildMode, Concurrency, CountMode, SortKey, TreeBuilder,
//! };
//!
//! let mut builder = TreeBuilder::new(BuildMode::ContextFree, CountMode::Both, Concurrency::Serial);
//! builder.load_library_maps(&[("out/app_rank_0.libmap".into(), 0)]);
//! builder.build_from_files(&[("out/app_rank_0.pflw".into(), 0)]);
//!
//! for spot in top_hotspots(builder.tree(), SortKey::SelfSamples, 10) {
//!     println!("{:>6.2}% {}", spot.self_percentage, spot.function_name);
//! }
//! ```
//!
//! The sampler side is armed either programmatically through
//! [`Sampler`][sample::Sampler] or from the environment through
//! [`sample::arm_from_env`], which reads `ENABLE_SAMPLING`,
//! `SAMPLING_FREQUENCY`, `OUTPUT_DIRECTORY` and friends at startup.
//!
//! Only Linux is supported; stack capture walks frame pointers, so profiled
//! binaries should be built with `-C force-frame-pointers=yes`.

pub mod analysis;
pub mod codec;
mod error;
mod ffi;
pub mod sample;

pub use error::{CodecError, SamplerError};
