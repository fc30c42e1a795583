//! Lock contention profiling
//!
//! - `mutex`: `ProfiledMutex`, the interception point
//! - `context`: process-wide state (pool, speed limit, collector, profile)
//! - `stack`: return-address capture
//! - `sample`: the collected sample type
//! - `profiler`: aggregation and the pprof contention file

pub mod context;
pub mod mutex;
pub mod profiler;
pub mod sample;
pub mod stack;

pub use context::{global, install_global, ContentionContext, ContextOptions};
pub use mutex::{ProfiledMutex, ProfiledMutexGuard};
pub use profiler::{ContentionProfiler, ProfileSink, ProfileSummary};
pub use sample::ContentionSample;
pub use stack::StackTrace;
