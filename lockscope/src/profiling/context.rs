//! Process-wide contention profiling context
//!
//! Owns everything the lock hot path needs: the sample pool, the speed
//! limit for contention events, and the collector whose dump stage feeds the
//! active profile. The collector threads are started by the first
//! `start_profiler` and run for the rest of the process.
//!
//! [`global`] is the single access point used by [`ProfiledMutex::new`];
//! tests and embedders can build isolated contexts with
//! [`ContentionContext::leak`].
//!
//! [`ProfiledMutex::new`]: super::ProfiledMutex::new

use super::profiler::{ContentionProfiler, ProfileSink, ProfileSummary};
use super::sample::ContentionSample;
use super::stack::StackTrace;
use crate::collection::{lock, Collector, CollectorConfig, CollectorStats, ObjectPool, SpeedLimit, SubmitOutcome};
use crate::domain::{ConfigError, ProfilerError, Timestamp};
use lockscope_common::{ContentionSite, DEFAULT_EXPECTED_PER_SECOND};
use log::{info, warn};
use std::cell::Cell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Extra time `stop_profiler` allows in-flight samples beyond two rounds
const STOP_FLUSH_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextOptions {
    pub collector: CollectorConfig,
    pub expected_per_second: usize,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self { collector: CollectorConfig::default(), expected_per_second: DEFAULT_EXPECTED_PER_SECOND }
    }
}

thread_local! {
    /// Set while this thread builds or submits a sample; locks taken in
    /// that window are never sampled.
    static INSIDE_SAMPLING: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` if this thread is currently inside the sampling path (or
/// is exiting and cannot tell).
pub(crate) fn inside_sampling() -> bool {
    INSIDE_SAMPLING.try_with(Cell::get).unwrap_or(true)
}

struct SamplingScope;

impl SamplingScope {
    fn enter() -> Self {
        let _ = INSIDE_SAMPLING.try_with(|flag| flag.set(true));
        SamplingScope
    }
}

impl Drop for SamplingScope {
    fn drop(&mut self) {
        let _ = INSIDE_SAMPLING.try_with(|flag| flag.set(false));
    }
}

pub struct ContentionContext {
    pool: &'static ObjectPool<ContentionSample>,
    speed_limit: &'static SpeedLimit,
    options: ContextOptions,
    collector: OnceLock<Collector<ContentionSample>>,
    lifecycle: Mutex<()>,
    active: AtomicBool,
    version: AtomicU64,
}

static GLOBAL: OnceLock<&'static ContentionContext> = OnceLock::new();

/// The process-wide context, created with default options on first use.
pub fn global() -> &'static ContentionContext {
    GLOBAL.get_or_init(|| ContentionContext::leak_unchecked(ContextOptions::default()))
}

/// Create the process-wide context with `options`.
///
/// Fails if it already exists (including implicitly, through a
/// [`ProfiledMutex`](super::ProfiledMutex) lock).
pub fn install_global(options: ContextOptions) -> Result<&'static ContentionContext, ProfilerError> {
    let context = ContentionContext::leak(options).map_err(|e| ProfilerError::Collector(e.into()))?;
    let mut installed = false;
    let global = GLOBAL.get_or_init(|| {
        installed = true;
        context
    });
    if installed {
        Ok(global)
    } else {
        Err(ProfilerError::ContextAlreadyInstalled)
    }
}

impl ContentionContext {
    /// Build a standalone process-lifetime context.
    pub fn leak(options: ContextOptions) -> Result<&'static Self, ConfigError> {
        if options.expected_per_second == 0 {
            return Err(ConfigError::ZeroExpectedRate);
        }
        Ok(Self::leak_unchecked(options))
    }

    fn leak_unchecked(options: ContextOptions) -> &'static Self {
        let speed_limit = SpeedLimit::with_expected_per_second(options.expected_per_second).unwrap_or_default();
        Box::leak(Box::new(Self {
            pool: ObjectPool::leak(),
            speed_limit: Box::leak(Box::new(speed_limit)),
            options,
            collector: OnceLock::new(),
            lifecycle: Mutex::new(()),
            active: AtomicBool::new(false),
            version: AtomicU64::new(0),
        }))
    }

    #[must_use]
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    #[must_use]
    pub fn speed_limit(&self) -> &'static SpeedLimit {
        self.speed_limit
    }

    /// Returns `true` while a profile is being recorded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Profiling session counter, bumped by every `start_profiler`.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn collector_stats(&self) -> Option<CollectorStats> {
        self.collector.get().map(Collector::stats)
    }

    /// Start recording contention into a fresh profile at `path`.
    pub fn start_profiler(&self, path: impl Into<PathBuf>) -> Result<(), ProfilerError> {
        let _lifecycle = lock(&self.lifecycle);
        if self.is_active() {
            return Err(ProfilerError::AlreadyRunning);
        }
        let collector = self
            .collector
            .get_or_init(|| Collector::new(self.options.collector, ProfileSink::default()));
        collector.start()?;

        let profiler = ContentionProfiler::new(path);
        let path = profiler.path().to_path_buf();
        if collector.sink().install(profiler).is_err() {
            return Err(ProfilerError::AlreadyRunning);
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        self.active.store(true, Ordering::Release);
        info!("contention profiler started, writing to {}", path.display());
        Ok(())
    }

    /// Stop recording, drain in-flight samples and finish the profile.
    pub fn stop_profiler(&self) -> Result<ProfileSummary, ProfilerError> {
        let _lifecycle = lock(&self.lifecycle);
        if !self.active.swap(false, Ordering::AcqRel) {
            return Err(ProfilerError::NotRunning);
        }
        let collector = self.collector.get().ok_or(ProfilerError::NotRunning)?;

        let timeout = collector.grab_interval() * 2 + STOP_FLUSH_GRACE;
        if !collector.flush(timeout) {
            warn!("in-flight contention samples not drained within {:?}; finishing without them", timeout);
        }
        let profiler = collector.sink().take().ok_or(ProfilerError::NotRunning)?;
        let summary = profiler.finish()?;
        info!(
            "contention profiler stopped: {} samples in {} records, {}",
            summary.samples,
            summary.records,
            summary.path.display()
        );
        Ok(summary)
    }

    /// Admission check for a contended acquisition.
    pub(crate) fn admit(&self) -> Option<usize> {
        if !self.is_active() {
            return None;
        }
        let collector = self.collector.get()?;
        self.speed_limit.is_collectable(collector)
    }

    /// Turn a timed contention site into a sample and submit it.
    ///
    /// Runs outside the contended lock. Sites from an earlier profiling
    /// session (`version` mismatch) are discarded.
    pub(crate) fn submit_contention(&self, site: &ContentionSite, version: u64) -> SubmitOutcome {
        let Some(collector) = self.collector.get() else {
            return SubmitOutcome::Lost;
        };
        if !self.is_active() || version != self.version() {
            return SubmitOutcome::Stopped;
        }
        let _scope = SamplingScope::enter();
        let stack = StackTrace::capture();
        let Some(sample) = ContentionSample::from_site(site, stack, self.speed_limit) else {
            return SubmitOutcome::Lost;
        };
        match self.pool.acquire(sample) {
            Ok(item) => collector.submit(item, Timestamp::now()),
            Err(_) => {
                collector.record_lost();
                SubmitOutcome::Lost
            }
        }
    }
}

impl std::fmt::Debug for ContentionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentionContext")
            .field("active", &self.is_active())
            .field("version", &self.version())
            .field("sampling_range", &self.speed_limit.sampling_range())
            .finish_non_exhaustive()
    }
}
