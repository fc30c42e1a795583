//! Adaptive speed limiter
//!
//! Keeps the number of fully sampled events per second close to
//! `expected_per_second` for one class of events, whatever the true event
//! rate is. The sampling range `r` (out of `SAMPLING_BASE`) is the
//! acceptance probability numerator.
//!
//! Before the first grab the class is uncalibrated: every event is
//! accepted so the first round can measure the raw rate. Afterwards each
//! grab round re-estimates `r` from the round's accepted count and blends it
//! with the previous value, weighted by how much of a second the round
//! covered.

use crate::domain::{ConfigError, Timestamp};
use lockscope_common::{DEFAULT_EXPECTED_PER_SECOND, SAMPLING_BASE};
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

const MICROS_PER_SECOND: u128 = 1_000_000;

/// Requests an out-of-schedule grab round
pub trait GrabWaker {
    fn wake_grab_thread(&self);
}

thread_local! {
    static FAST_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Uniform draw in `[0, SAMPLING_BASE)`; `None` if the thread is exiting.
fn draw_below_base() -> Option<usize> {
    FAST_RNG
        .try_with(|rng| rng.try_borrow_mut().ok().map(|mut rng| rng.next_u32() as usize & (SAMPLING_BASE - 1)))
        .ok()
        .flatten()
}

#[derive(Debug)]
pub struct SpeedLimit {
    expected_per_second: AtomicUsize,
    sampling_range: AtomicUsize,
    ever_grabbed: AtomicBool,
    count_before_grabbed: AtomicUsize,
    first_sample_us: AtomicU64,
}

impl SpeedLimit {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            expected_per_second: AtomicUsize::new(DEFAULT_EXPECTED_PER_SECOND),
            sampling_range: AtomicUsize::new(SAMPLING_BASE),
            ever_grabbed: AtomicBool::new(false),
            count_before_grabbed: AtomicUsize::new(0),
            first_sample_us: AtomicU64::new(0),
        }
    }

    pub fn with_expected_per_second(expected_per_second: usize) -> Result<Self, ConfigError> {
        let limit = Self::new();
        limit.set_expected_per_second(expected_per_second)?;
        Ok(limit)
    }

    /// Change the target rate. Zero is rejected and leaves the old target.
    pub fn set_expected_per_second(&self, expected_per_second: usize) -> Result<(), ConfigError> {
        if expected_per_second == 0 {
            return Err(ConfigError::ZeroExpectedRate);
        }
        self.expected_per_second.store(expected_per_second, Ordering::Relaxed);
        Ok(())
    }

    #[must_use]
    pub fn expected_per_second(&self) -> usize {
        self.expected_per_second.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn sampling_range(&self) -> usize {
        self.sampling_range.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_calibrated(&self) -> bool {
        self.ever_grabbed.load(Ordering::Acquire)
    }

    /// Admission check for one event.
    ///
    /// Returns the sampling range the event was admitted with, or `None` if
    /// it should not be sampled. Uncalibrated classes admit everything and
    /// wake the grab thread on every event once a full second's worth of
    /// backlog is pending.
    pub fn is_collectable(&self, waker: &dyn GrabWaker) -> Option<usize> {
        if self.is_calibrated() {
            let range = self.sampling_range();
            return (draw_below_base()? < range).then_some(range);
        }
        let before = self.count_before_grabbed.fetch_add(1, Ordering::Relaxed);
        if before == 0 {
            self.first_sample_us.store(Timestamp::now().as_micros(), Ordering::Relaxed);
        }
        if before + 1 >= self.expected_per_second() {
            waker.wake_grab_thread();
        }
        Some(SAMPLING_BASE)
    }

    /// Re-estimate the range after a grab round. Grab thread only.
    ///
    /// `round_count` is the number of samples of this class grabbed in the
    /// round, `interval_us` the wall time the round covered. A round with no
    /// samples leaves the range unchanged.
    pub fn update(&self, round_count: usize, interval_us: u64, now: Timestamp) -> usize {
        let old = self.sampling_range();
        if round_count == 0 {
            return old;
        }
        let expected = self.expected_per_second() as u128;
        let count = round_count as u128;

        let new_range = if self.is_calibrated() {
            let interval = u128::from(interval_us);
            let estimate = expected * interval * old as u128 / (MICROS_PER_SECOND * count);
            if interval < MICROS_PER_SECOND {
                (estimate * interval + old as u128 * (MICROS_PER_SECOND - interval)) / MICROS_PER_SECOND
            } else {
                estimate
            }
        } else {
            let first = self.first_sample_us.load(Ordering::Relaxed);
            let elapsed = if first == 0 || now.as_micros() <= first {
                u128::from(interval_us)
            } else {
                u128::from(now.as_micros() - first)
            };
            expected * elapsed * SAMPLING_BASE as u128 / (MICROS_PER_SECOND * count)
        };

        let range = usize::try_from(new_range.clamp(1, SAMPLING_BASE as u128)).unwrap_or(SAMPLING_BASE);
        self.sampling_range.store(range, Ordering::Relaxed);
        self.ever_grabbed.store(true, Ordering::Release);
        range
    }
}

impl Default for SpeedLimit {
    fn default() -> Self {
        Self::new()
    }
}
