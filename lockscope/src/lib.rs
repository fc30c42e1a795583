//! # lockscope - Sampling Mutex Contention Profiler
//!
//! lockscope records where threads wait on mutexes. A [`ProfiledMutex`]
//! times contended acquisitions, an adaptive speed limit decides which
//! ones become samples, and a background collector aggregates the samples
//! into a pprof-compatible contention profile.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Host application threads                   │
//! │   ProfiledMutex::lock() ── try_lock fails ──▶ SpeedLimit admit  │
//! │   guard drop ── unlock ──▶ capture stack ──▶ pooled sample      │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ submit (per-thread combiner agent)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Collector (background threads)                 │
//! │                                                                 │
//! │  ┌──────────────┐   splice   ┌──────────────┐                   │
//! │  │ grab thread  │──────────▶│ dump thread  │──▶ ContentionProfiler
//! │  │ backpressure │            │ round order  │     (profile file)│
//! │  │ rate control │            └──────────────┘                   │
//! │  └──────────────┘                                               │
//! └─────────────────────────────────────────────────────────────────┘
//!                         │ offline
//!                         ▼
//!        analysis + symbolization  (`lockscope report`)
//! ```
//!
//! ## Module Structure
//!
//! - [`collection`]: the sampling engine (intrusive list, object pool,
//!   thread-local slots, sharded combiner, speed limit, collector)
//! - [`profiling`]: profiled mutex, stack capture, profile writer and the
//!   process-wide context
//! - [`symbolization`]: DWARF lookup and `/proc/<pid>/maps` parsing
//! - [`analysis`]: profile reading and contention site ranking
//! - [`demo`]: the multi-threaded demo scenario
//! - [`cli`]: command-line argument parsing
//! - [`domain`]: error types and newtypes shared across modules
//!
//! ## Typical Usage
//!
//! ```rust,no_run
//! use lockscope::profiling::{global, ProfiledMutex};
//!
//! static CACHE: ProfiledMutex<Vec<u64>> = ProfiledMutex::new(Vec::new());
//!
//! global().start_profiler("contention.prof")?;
//! CACHE.lock().unwrap().push(1);
//! let summary = global().stop_profiler()?;
//! println!("{} samples", summary.samples);
//! # Ok::<(), lockscope::domain::ProfilerError>(())
//! ```
//!
//! ```bash
//! lockscope demo --threads 20 --output contention.prof
//! lockscope report contention.prof --top 5
//! ```

pub mod analysis;
pub mod cli;
pub mod collection;
pub mod demo;
pub mod domain;
pub mod profiling;
pub mod symbolization;

pub use profiling::{ProfiledMutex, ProfiledMutexGuard};
