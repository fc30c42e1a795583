//! Contention profile writer
//!
//! Aggregates dumped samples by identical call stack and writes them in the
//! pprof-compatible contention text format:
//!
//! ```text
//! --- contention
//! cycles/second=10000000000
//! 30000000 3 @ 0x55d0c2a4b1f0 0x55d0c2a4a8e2 ...
//! <contents of /proc/self/maps>
//! ```
//!
//! The cache is flushed whenever it holds more than
//! `MAX_CACHED_CONTENTIONS` distinct stacks, and once more when the
//! profiler finishes. The same stack may therefore appear on several lines;
//! readers sum them.

use super::sample::ContentionSample;
use super::stack::StackTrace;
use crate::collection::lock;
use log::{debug, warn};
use lockscope_common::{
    MAX_CACHED_CONTENTIONS, PROFILE_CYCLES_LINE, PROFILE_HEADER, PROFILE_STACK_MARKER, SKIPPED_STACK_FRAMES,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct Aggregate {
    duration_ns: u64,
    count: f64,
}

/// What a finished profile contains
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileSummary {
    pub path: PathBuf,
    /// Samples merged into the profile
    pub samples: u64,
    /// Stack lines written
    pub records: u64,
    /// Estimated total wait time
    pub total_duration_ns: u64,
    /// Estimated number of contended acquisitions
    pub estimated_count: f64,
    /// Flushes that failed with an I/O error
    pub write_errors: u64,
}

impl ProfileSummary {
    /// Estimated mean wait per contended acquisition
    #[must_use]
    pub fn average_wait_ns(&self) -> Option<f64> {
        (self.estimated_count > 0.0).then(|| self.total_duration_ns as f64 / self.estimated_count)
    }
}

pub struct ContentionProfiler {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    cache: HashMap<StackTrace, Aggregate>,
    summary: ProfileSummary,
    finished: bool,
}

impl ContentionProfiler {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            summary: ProfileSummary { path: path.clone(), ..ProfileSummary::default() },
            path,
            out: None,
            cache: HashMap::new(),
            finished: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the target file and write the header, once.
    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        let out = match self.out.take() {
            Some(out) => out,
            None => {
                match fs::remove_file(&self.path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                    _ => {}
                }
                let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
                let mut out = BufWriter::new(file);
                writeln!(out, "{PROFILE_HEADER}")?;
                writeln!(out, "{PROFILE_CYCLES_LINE}")?;
                out
            }
        };
        Ok(self.out.insert(out))
    }

    /// Merge one sample into the cache.
    pub fn record(&mut self, sample: &ContentionSample) {
        let entry = self.cache.entry(sample.stack).or_default();
        entry.duration_ns = entry.duration_ns.saturating_add(sample.duration_ns);
        entry.count += sample.count;

        self.summary.samples += 1;
        self.summary.total_duration_ns = self.summary.total_duration_ns.saturating_add(sample.duration_ns);
        self.summary.estimated_count += sample.count;

        if self.cache.len() > MAX_CACHED_CONTENTIONS {
            if let Err(e) = self.flush_records() {
                self.summary.write_errors += 1;
                warn!("failed to flush contention profile {}: {}", self.path.display(), e);
            }
        }
    }

    /// Write and clear the cached stacks.
    pub fn flush_records(&mut self) -> io::Result<()> {
        let cache = std::mem::take(&mut self.cache);
        let records = cache.len() as u64;
        let out = self.writer()?;
        for (stack, aggregate) in cache {
            write!(out, "{} {} {}", aggregate.duration_ns, aggregate.count.ceil() as u64, PROFILE_STACK_MARKER)?;
            for addr in stack.frames().iter().skip(SKIPPED_STACK_FRAMES) {
                write!(out, " 0x{addr:x}")?;
            }
            writeln!(out)?;
        }
        out.flush()?;
        self.summary.records += records;
        debug!("flushed {} contention records to {}", records, self.path.display());
        Ok(())
    }

    /// Flush everything, append the process memory map and close.
    pub fn finish(mut self) -> io::Result<ProfileSummary> {
        self.finished = true;
        self.flush_records()?;
        let out = self.writer()?;
        match fs::read_to_string("/proc/self/maps") {
            Ok(maps) => out.write_all(maps.as_bytes())?,
            Err(e) => warn!("memory maps unavailable, profile cannot be symbolized offline: {}", e),
        }
        out.flush()?;
        Ok(std::mem::take(&mut self.summary))
    }
}

impl Drop for ContentionProfiler {
    fn drop(&mut self) {
        if self.finished || (self.out.is_none() && self.cache.is_empty()) {
            return;
        }
        if let Err(e) = self.flush_records().and_then(|()| self.writer()?.flush()) {
            warn!("contention profile {} left incomplete: {}", self.path.display(), e);
        }
    }
}

/// Dump-stage destination: the active profiler, if one is running
#[derive(Default)]
pub struct ProfileSink {
    profiler: Mutex<Option<ContentionProfiler>>,
}

impl ProfileSink {
    /// Merge a sample into the active profiler; without one the sample is
    /// simply destroyed by the caller.
    pub fn record(&self, sample: &ContentionSample) {
        if let Some(profiler) = lock(&self.profiler).as_mut() {
            profiler.record(sample);
        }
    }

    /// Install `profiler`, handing it back if one is already active.
    pub(crate) fn install(&self, profiler: ContentionProfiler) -> Result<(), ContentionProfiler> {
        let mut active = lock(&self.profiler);
        if active.is_some() {
            return Err(profiler);
        }
        *active = Some(profiler);
        Ok(())
    }

    pub(crate) fn take(&self) -> Option<ContentionProfiler> {
        lock(&self.profiler).take()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.profiler).is_some()
    }
}
