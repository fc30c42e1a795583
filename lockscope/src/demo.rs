//! Contention demo scenario
//!
//! N threads take turns on one [`ProfiledMutex`], each holding it for a
//! fixed time, while a profile is recorded. Every thread also measures its
//! own lock waits, so the profile's estimate can be checked against what
//! actually happened.

// Averages intentionally convert counters to f64
#![allow(clippy::cast_precision_loss)]

use crate::collection::CollectorStats;
use crate::domain::DurationNs;
use crate::profiling::{ContentionContext, ProfileSummary, ProfiledMutex};
use anyhow::{ensure, Context, Result};
use log::debug;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Waits shorter than this are counted as uncontended
const CONTENDED_WAIT: Duration = Duration::from_micros(1);

#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub threads: usize,
    pub iterations: usize,
    pub hold: Duration,
    pub output: PathBuf,
}

/// What the demo measured next to what the profile estimated
#[derive(Debug, Clone, Serialize)]
pub struct DemoOutcome {
    pub profile: ProfileSummary,
    pub collector: Option<CollectorStats>,
    pub acquisitions: u64,
    /// Acquisitions that waited at least a microsecond
    pub contended_acquisitions: u64,
    pub observed_wait_ns: u64,
    pub elapsed_ms: u64,
}

impl DemoOutcome {
    #[must_use]
    pub fn observed_average_wait_ns(&self) -> Option<f64> {
        (self.contended_acquisitions > 0).then(|| self.observed_wait_ns as f64 / self.contended_acquisitions as f64)
    }

    /// Estimated total wait relative to the observed one (1.0 = exact).
    #[must_use]
    pub fn estimate_ratio(&self) -> Option<f64> {
        (self.observed_wait_ns > 0).then(|| self.profile.total_duration_ns as f64 / self.observed_wait_ns as f64)
    }

    #[must_use]
    pub fn render(&self) -> String {
        let fmt_avg = |ns: Option<f64>| ns.map_or_else(|| "n/a".to_string(), |ns| DurationNs(ns as u64).to_string());
        let mut lines = vec![
            format!("profile: {} ({} samples, {} records)", self.profile.path.display(), self.profile.samples, self.profile.records),
            format!(
                "acquisitions: {} ({} contended) in {} ms",
                self.acquisitions, self.contended_acquisitions, self.elapsed_ms
            ),
            format!(
                "total wait: observed {}, estimated {}",
                DurationNs(self.observed_wait_ns),
                DurationNs(self.profile.total_duration_ns)
            ),
            format!(
                "average contended wait: observed {}, estimated {}",
                fmt_avg(self.observed_average_wait_ns()),
                fmt_avg(self.profile.average_wait_ns())
            ),
        ];
        if let Some(stats) = &self.collector {
            lines.push(format!(
                "collector: {} submitted, {} dumped, {} dropped, {} rejected over {} rounds",
                stats.submitted, stats.dumped, stats.dropped, stats.rejected, stats.rounds
            ));
        }
        lines.join("\n")
    }
}

/// Run the scenario against `context`, which must not be profiling yet.
///
/// # Errors
/// Fails on an empty scenario, if a profiler is already running, or if the
/// profile cannot be written.
pub fn run_demo(context: &'static ContentionContext, options: &DemoOptions) -> Result<DemoOutcome> {
    ensure!(options.threads > 0, "threads must be greater than zero");
    ensure!(options.iterations > 0, "iterations must be greater than zero");

    context
        .start_profiler(&options.output)
        .with_context(|| format!("Failed to start profiler writing {}", options.output.display()))?;

    let mutex = Arc::new(ProfiledMutex::with_context(0_u64, context));
    let observed_wait_ns = Arc::new(AtomicU64::new(0));
    let contended = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..options.threads)
        .map(|worker| {
            let mutex = Arc::clone(&mutex);
            let observed_wait_ns = Arc::clone(&observed_wait_ns);
            let contended = Arc::clone(&contended);
            let iterations = options.iterations;
            let hold = options.hold;
            thread::Builder::new().name(format!("demo-{worker}")).spawn(move || {
                for _ in 0..iterations {
                    let wait_started = Instant::now();
                    let mut guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    let waited = wait_started.elapsed();
                    *guard += 1;
                    thread::sleep(hold);
                    drop(guard);

                    if waited >= CONTENDED_WAIT {
                        contended.fetch_add(1, Ordering::Relaxed);
                        observed_wait_ns
                            .fetch_add(u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX), Ordering::Relaxed);
                    }
                }
            })
        })
        .collect::<std::io::Result<_>>()
        .context("Failed to spawn demo threads")?;

    let mut panicked = 0;
    for handle in handles {
        if handle.join().is_err() {
            panicked += 1;
        }
    }
    let elapsed = started.elapsed();
    let profile = context.stop_profiler().context("Failed to finish contention profile")?;
    ensure!(panicked == 0, "{panicked} demo threads panicked");

    let acquisitions = *mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    debug!("demo finished {} acquisitions in {:?}", acquisitions, elapsed);

    Ok(DemoOutcome {
        profile,
        collector: context.collector_stats(),
        acquisitions,
        contended_acquisitions: contended.load(Ordering::Relaxed),
        observed_wait_ns: observed_wait_ns.load(Ordering::Relaxed),
        elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectorConfig;
    use crate::profiling::ContextOptions;

    #[test]
    fn test_empty_scenario_is_rejected() {
        let context = ContentionContext::leak(ContextOptions::default()).unwrap();
        let options = DemoOptions { threads: 0, iterations: 1, hold: Duration::ZERO, output: PathBuf::from("x") };
        assert!(run_demo(context, &options).is_err());
        assert!(!context.is_active());
    }

    #[test]
    fn test_small_demo_writes_profile() {
        let dir = tempfile::tempdir().unwrap();
        let context = ContentionContext::leak(ContextOptions {
            collector: CollectorConfig::new(Duration::from_millis(20), 1000).unwrap(),
            expected_per_second: 1000,
        })
        .unwrap();
        let options = DemoOptions {
            threads: 4,
            iterations: 10,
            hold: Duration::from_millis(1),
            output: dir.path().join("demo.prof"),
        };
        let outcome = run_demo(context, &options).unwrap();

        assert_eq!(outcome.acquisitions, 40);
        assert!(outcome.profile.path.exists());
        let stats = outcome.collector.unwrap();
        assert_eq!(stats.dumped + stats.dropped, stats.submitted);
        assert!(outcome.render().contains("acquisitions: 40"));
        assert!(serde_json::to_string(&outcome).unwrap().contains("\"acquisitions\":40"));
    }
}
