//! Two-stage collector pipeline (grab + dump)
//!
//! ```text
//!  producer threads            grab thread (every interval)          dump thread
//!  ────────────────            ────────────────────────────          ───────────
//!  submit(item, ts) ──▶ per-thread   reset() ─▶ bucket by preprocessor
//!                      pending list            ─▶ count per speed-limit class
//!                      (combiner agent)        ─▶ drop if backlog ≥ max_pending
//!                                              ─▶ splice into hand-off ──▶ dump_and_destroy()
//!                                              ─▶ update speed limits
//! ```
//!
//! Samples move between stages by list splice only. The hand-off mutex is
//! held just long enough to splice; dumping happens outside it.
//!
//! Rounds are sequential: the dump thread takes the whole hand-off list on
//! each wake, so it never sees a later round before an earlier one.

use super::combiner::{Adder, Combiner, Splice};
use super::lock;
use super::object_pool::{ItemList, PoolItem};
use super::speed_limit::{GrabWaker, SpeedLimit};
use crate::domain::{CollectorError, ConfigError, RoundIndex, Timestamp};
use log::{debug, error, info, warn};
use lockscope_common::{DEFAULT_GRAB_INTERVAL_US, DEFAULT_MAX_PENDING_SAMPLES};
use serde::Serialize;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A sample type the collector can carry
pub trait Collected: Send + Sized + 'static {
    /// Destination shared by every sample of this type
    type Sink: Send + Sync + 'static;

    /// Consume one sample. Called exactly once per sample, on the dump
    /// thread, in round order.
    fn dump_and_destroy(item: PoolItem<Self>, round: RoundIndex, sink: &Self::Sink);

    /// Rate-limiting class of this sample, if any
    fn speed_limit(&self) -> Option<&'static SpeedLimit> {
        None
    }

    /// Batch hook applied to all samples sharing it within a round
    fn preprocessor(&self) -> Option<&'static dyn Preprocessor<Self>> {
        None
    }
}

/// Batch-level transform run on the grab thread
pub trait Preprocessor<S: Collected>: Send + Sync {
    fn process(&self, batch: &mut Vec<PoolItem<S>>);
}

/// What happened to a submitted sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Enqueued for the next grab round
    Queued,
    /// Destroyed: timestamp two or more grab intervals past the last round
    Stale,
    /// Destroyed: the collector is stopping
    Stopped,
    /// No sample could be built (pool exhausted or thread exiting)
    Lost,
}

/// Collector configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    grab_interval: Duration,
    max_pending_samples: usize,
}

impl CollectorConfig {
    pub fn new(grab_interval: Duration, max_pending_samples: usize) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.set_grab_interval(grab_interval)?;
        config.set_max_pending_samples(max_pending_samples)?;
        Ok(config)
    }

    pub fn set_grab_interval(&mut self, grab_interval: Duration) -> Result<(), ConfigError> {
        if grab_interval.as_micros() == 0 {
            return Err(ConfigError::ZeroGrabInterval);
        }
        self.grab_interval = grab_interval;
        Ok(())
    }

    pub fn set_max_pending_samples(&mut self, max_pending_samples: usize) -> Result<(), ConfigError> {
        if max_pending_samples == 0 {
            return Err(ConfigError::ZeroMaxPending);
        }
        self.max_pending_samples = max_pending_samples;
        Ok(())
    }

    #[must_use]
    pub fn grab_interval(&self) -> Duration {
        self.grab_interval
    }

    #[must_use]
    pub fn max_pending_samples(&self) -> usize {
        self.max_pending_samples
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            grab_interval: Duration::from_micros(DEFAULT_GRAB_INTERVAL_US),
            max_pending_samples: DEFAULT_MAX_PENDING_SAMPLES,
        }
    }
}

/// Pipeline counters
///
/// Once the collector has stopped, `dumped + dropped == submitted`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Samples accepted by `submit`
    pub submitted: u64,
    /// Samples refused by `submit` (stale or stopping) or lost before it
    pub rejected: u64,
    /// Dump rounds completed
    pub rounds: u64,
    /// Samples taken by the grab thread
    pub grabbed: u64,
    /// Samples destroyed by backpressure or at shutdown
    pub dropped: u64,
    /// Samples handed to `dump_and_destroy`
    pub dumped: u64,
}

struct DumpQueue<S: Collected> {
    items: ItemList<S>,
    stop: bool,
}

/// Samples sharing one preprocessor, kept across rounds
struct Bucket<S: Collected> {
    preprocessor: Option<&'static dyn Preprocessor<S>>,
    items: Vec<PoolItem<S>>,
}

fn same_preprocessor<S: Collected>(
    a: Option<&'static dyn Preprocessor<S>>,
    b: Option<&'static dyn Preprocessor<S>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => ptr::addr_eq(a, b),
        _ => false,
    }
}

struct Inner<S: Collected> {
    sink: S::Sink,
    pending: Combiner<ItemList<S>, Splice<S>>,
    grab_interval_us: AtomicU64,
    max_pending_samples: AtomicUsize,
    stop: AtomicBool,
    /// Time of the last grab round; 0 until `start`
    last_active_us: AtomicU64,

    submitted: Adder<u64>,
    rejected: Adder<u64>,
    grabbed: AtomicU64,
    dropped: AtomicU64,
    dumped: AtomicU64,
    rounds: AtomicU64,

    dump: Mutex<DumpQueue<S>>,
    dump_cond: Condvar,
    /// Signalled (under `dump`) whenever `dumped` or `dropped` grows
    settled_cond: Condvar,
    wake: Mutex<bool>,
    wake_cond: Condvar,
}

impl<S: Collected> Inner<S> {
    /// Count everything still pending as dropped and destroy it.
    fn sweep_pending(&self) {
        let leftovers = self.pending.reset();
        if !leftovers.is_empty() {
            self.dropped.fetch_add(leftovers.len() as u64, Ordering::Release);
            drop(leftovers);
            self.notify_settled();
        }
    }

    fn settled(&self) -> u64 {
        self.dumped.load(Ordering::Acquire) + self.dropped.load(Ordering::Acquire)
    }

    fn notify_settled(&self) {
        let _queue = lock(&self.dump);
        self.settled_cond.notify_all();
    }

    fn wake(&self) {
        let mut woken = lock(&self.wake);
        *woken = true;
        self.wake_cond.notify_one();
    }

    /// Sleep until one interval after the last round, a wake call, or stop.
    /// Returns `true` when stopping.
    fn sleep_until_next_round(&self) -> bool {
        let deadline = self
            .last_active_us
            .load(Ordering::Relaxed)
            .saturating_add(self.grab_interval_us.load(Ordering::Relaxed));
        let mut woken = lock(&self.wake);
        loop {
            if self.stop.load(Ordering::Acquire) {
                return true;
            }
            if std::mem::take(&mut *woken) {
                return false;
            }
            let now = Timestamp::now().as_micros();
            if now >= deadline {
                return false;
            }
            woken = self
                .wake_cond
                .wait_timeout(woken, Duration::from_micros(deadline - now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn grab_loop(&self, dump_thread: JoinHandle<()>) {
        let mut buckets: Vec<Bucket<S>> = Vec::new();
        let mut last_round = Timestamp::from_micros(self.last_active_us.load(Ordering::Relaxed));
        loop {
            let stopping = self.sleep_until_next_round();
            let now = Timestamp::now();
            self.last_active_us.store(now.as_micros(), Ordering::Relaxed);
            let interval_us = now.micros_since(last_round);
            last_round = now;

            let interval = self.grab_interval_us.load(Ordering::Relaxed);
            if interval_us > interval.saturating_mul(2) {
                warn!("grab round delayed: {}µs since the previous round (interval {}µs)", interval_us, interval);
            }
            self.grab_round(&mut buckets, interval_us, now);
            if stopping {
                break;
            }
        }

        lock(&self.dump).stop = true;
        self.dump_cond.notify_all();
        if dump_thread.join().is_err() {
            error!("dump thread panicked");
        }
    }

    fn grab_round(&self, buckets: &mut Vec<Bucket<S>>, interval_us: u64, now: Timestamp) {
        let mut harvested = self.pending.reset();
        let expected = harvested.len();
        if expected == 0 {
            return;
        }

        while let Some(item) = harvested.pop_front() {
            let preprocessor = item.preprocessor();
            let index = match buckets.iter().position(|b| same_preprocessor(b.preprocessor, preprocessor)) {
                Some(index) => index,
                None => {
                    buckets.push(Bucket { preprocessor, items: Vec::new() });
                    buckets.len() - 1
                }
            };
            buckets[index].items.push(item);
        }
        let bucketed: usize = buckets.iter().map(|b| b.items.len()).sum();
        if bucketed != expected {
            error!("grab round lost samples: harvested {}, bucketed {}", expected, bucketed);
            std::process::abort();
        }

        let max_pending = self.max_pending_samples.load(Ordering::Relaxed) as u64;
        let mut classes: Vec<(&'static SpeedLimit, usize)> = Vec::new();
        let mut survivors = ItemList::new();
        let mut round_dropped = 0_u64;

        for bucket in buckets.iter_mut().filter(|b| !b.items.is_empty()) {
            if let Some(preprocessor) = bucket.preprocessor {
                preprocessor.process(&mut bucket.items);
            }
            for item in bucket.items.drain(..) {
                if let Some(limit) = item.speed_limit() {
                    match classes.iter_mut().find(|(l, _)| ptr::eq(*l, limit)) {
                        Some((_, count)) => *count += 1,
                        None => classes.push((limit, 1)),
                    }
                }
                let grabbed = self.grabbed.fetch_add(1, Ordering::Relaxed);
                let settled = self.dropped.load(Ordering::Relaxed) + self.dumped.load(Ordering::Acquire);
                if grabbed >= settled + max_pending {
                    drop(item);
                    self.dropped.fetch_add(1, Ordering::Release);
                    round_dropped += 1;
                } else {
                    survivors.push_back(item);
                }
            }
        }

        let forwarded = survivors.len();
        if !survivors.is_empty() {
            lock(&self.dump).items.append(&mut survivors);
            self.dump_cond.notify_one();
        }
        if round_dropped > 0 {
            self.notify_settled();
        }

        for (limit, count) in classes {
            limit.update(count, interval_us, now);
        }
        debug!(
            "grab round: {} harvested, {} forwarded, {} dropped over {}µs",
            expected, forwarded, round_dropped, interval_us
        );
    }

    fn dump_loop(&self) {
        let mut round = 0_u64;
        loop {
            let mut batch = {
                let mut queue = lock(&self.dump);
                while queue.items.is_empty() && !queue.stop {
                    queue = self.dump_cond.wait(queue).unwrap_or_else(PoisonError::into_inner);
                }
                if queue.items.is_empty() {
                    break;
                }
                std::mem::take(&mut queue.items)
            };

            round += 1;
            let size = batch.len();
            while let Some(item) = batch.pop_front() {
                S::dump_and_destroy(item, RoundIndex(round), &self.sink);
                self.dumped.fetch_add(1, Ordering::Release);
            }
            self.rounds.store(round, Ordering::Relaxed);
            self.notify_settled();
            debug!("dump round {}: {} samples", round, size);
        }
    }
}

/// Background grab/dump pipeline for samples of type `S`
pub struct Collector<S: Collected> {
    inner: Arc<Inner<S>>,
    grab_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Collected> Collector<S> {
    /// Create a stopped collector. Samples submitted before [`start`] are
    /// never stale; they wait for the first round.
    ///
    /// [`start`]: Collector::start
    #[must_use]
    pub fn new(config: CollectorConfig, sink: S::Sink) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                pending: Combiner::default(),
                grab_interval_us: AtomicU64::new(duration_micros(config.grab_interval)),
                max_pending_samples: AtomicUsize::new(config.max_pending_samples),
                stop: AtomicBool::new(false),
                last_active_us: AtomicU64::new(0),
                submitted: Adder::default(),
                rejected: Adder::default(),
                grabbed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                dumped: AtomicU64::new(0),
                rounds: AtomicU64::new(0),
                dump: Mutex::new(DumpQueue { items: ItemList::new(), stop: false }),
                dump_cond: Condvar::new(),
                settled_cond: Condvar::new(),
                wake: Mutex::new(false),
                wake_cond: Condvar::new(),
            }),
            grab_thread: Mutex::new(None),
        }
    }

    /// Spawn the dump and grab threads. No-op if already running or stopped.
    pub fn start(&self) -> Result<(), CollectorError> {
        let mut grab_thread = lock(&self.grab_thread);
        if grab_thread.is_some() || self.inner.stop.load(Ordering::Acquire) {
            return Ok(());
        }
        self.inner.last_active_us.store(Timestamp::now().as_micros(), Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        let dump = thread::Builder::new()
            .name("lockscope-dump".to_string())
            .spawn(move || inner.dump_loop())
            .map_err(|source| CollectorError::ThreadSpawn { thread: "dump", source })?;

        let inner = Arc::clone(&self.inner);
        let grab = thread::Builder::new()
            .name("lockscope-grab".to_string())
            .spawn(move || inner.grab_loop(dump));
        match grab {
            Ok(handle) => {
                *grab_thread = Some(handle);
                info!(
                    "collector started (interval {}µs, max pending {})",
                    self.inner.grab_interval_us.load(Ordering::Relaxed),
                    self.inner.max_pending_samples.load(Ordering::Relaxed)
                );
                Ok(())
            }
            Err(source) => {
                // The dump thread's handle went down with the closure; let it exit.
                lock(&self.inner.dump).stop = true;
                self.inner.dump_cond.notify_all();
                Err(CollectorError::ThreadSpawn { thread: "grab", source })
            }
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.grab_thread).is_some() && !self.inner.stop.load(Ordering::Acquire)
    }

    /// Hand a sample to the pipeline.
    ///
    /// Samples whose timestamp is two or more grab intervals past the last
    /// round are destroyed: the grab thread is that far behind. Before
    /// [`start`](Collector::start) nothing is stale.
    pub fn submit(&self, item: PoolItem<S>, timestamp: Timestamp) -> SubmitOutcome {
        let inner = &self.inner;
        if inner.stop.load(Ordering::Acquire) {
            inner.rejected.accumulate(1);
            return SubmitOutcome::Stopped;
        }
        let last_active = inner.last_active_us.load(Ordering::Relaxed);
        let horizon = last_active.saturating_add(inner.grab_interval_us.load(Ordering::Relaxed).saturating_mul(2));
        if last_active != 0 && timestamp.as_micros() >= horizon {
            inner.rejected.accumulate(1);
            return SubmitOutcome::Stale;
        }
        let mut one = ItemList::new();
        one.push_back(item);
        inner.pending.accumulate(one);
        inner.submitted.accumulate(1);
        if inner.stop.load(Ordering::Acquire) {
            // stop() may have swept before this sample landed
            inner.sweep_pending();
        }
        SubmitOutcome::Queued
    }

    /// Record a sample that could not be built.
    pub fn record_lost(&self) {
        self.inner.rejected.accumulate(1);
    }

    /// Stop both threads after a final round and wait for them.
    ///
    /// Every sample submitted before this call is dumped or dropped when it
    /// returns. Idempotent.
    pub fn stop(&self) {
        let was_stopping = self.inner.stop.swap(true, Ordering::AcqRel);
        {
            let _wake = lock(&self.inner.wake);
            self.inner.wake_cond.notify_all();
        }
        let handle = lock(&self.grab_thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("grab thread panicked");
            }
        }

        // Never-started collectors and submits that raced with the final
        // round leave samples in the agents.
        self.inner.sweep_pending();

        if !was_stopping {
            let stats = self.stats();
            info!(
                "collector stopped: {} submitted, {} dumped, {} dropped over {} rounds",
                stats.submitted, stats.dumped, stats.dropped, stats.rounds
            );
        }
    }

    /// Run a round now and wait until every sample accepted so far has been
    /// dumped or dropped. Returns `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        let inner = &self.inner;
        let target = inner.submitted.snapshot();
        let deadline = Instant::now() + timeout;
        inner.wake();
        let mut queue = lock(&inner.dump);
        loop {
            if inner.settled() >= target {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            queue = inner
                .settled_cond
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        let inner = &self.inner;
        CollectorStats {
            submitted: inner.submitted.snapshot(),
            rejected: inner.rejected.snapshot(),
            rounds: inner.rounds.load(Ordering::Relaxed),
            grabbed: inner.grabbed.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Acquire),
            dumped: inner.dumped.load(Ordering::Acquire),
        }
    }

    #[must_use]
    pub fn sink(&self) -> &S::Sink {
        &self.inner.sink
    }

    #[must_use]
    pub fn grab_interval(&self) -> Duration {
        Duration::from_micros(self.inner.grab_interval_us.load(Ordering::Relaxed))
    }

    pub fn set_grab_interval(&self, grab_interval: Duration) -> Result<(), ConfigError> {
        if grab_interval.as_micros() == 0 {
            return Err(ConfigError::ZeroGrabInterval);
        }
        self.inner.grab_interval_us.store(duration_micros(grab_interval), Ordering::Relaxed);
        Ok(())
    }

    pub fn set_max_pending_samples(&self, max_pending_samples: usize) -> Result<(), ConfigError> {
        if max_pending_samples == 0 {
            return Err(ConfigError::ZeroMaxPending);
        }
        self.inner.max_pending_samples.store(max_pending_samples, Ordering::Relaxed);
        Ok(())
    }
}

impl<S: Collected> GrabWaker for Collector<S> {
    fn wake_grab_thread(&self) {
        self.inner.wake();
    }
}

impl<S: Collected> Drop for Collector<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<S: Collected> std::fmt::Debug for Collector<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector").field("stats", &self.stats()).finish_non_exhaustive()
    }
}

fn duration_micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX / 4)
}
