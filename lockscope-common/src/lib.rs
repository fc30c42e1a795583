//! # Shared Constants and Records (writer ↔ reader)
//!
//! Defines the constants and `#[repr(C)]` records shared between the
//! in-process contention collector (which writes profiles) and the offline
//! report tooling (which reads them). Keeping them in a `no_std` crate lets
//! an external reader depend on the profile format without pulling in the
//! collector runtime.
//!
//! ## Sampling
//!
//! Sampling decisions are expressed as a *range* out of [`SAMPLING_BASE`]:
//! an event class with range `r` is sampled with probability
//! `r / SAMPLING_BASE`, and every sampled duration is scaled back up by
//! `SAMPLING_BASE / r` so aggregated totals estimate the unsampled cost.
//!
//! ## Profile Text Format
//!
//! ```text
//! --- contention
//! cycles/second=10000000000
//! <duration_ns> <count> @ 0x<addr> 0x<addr> ...
//! ...
//! <contents of /proc/self/maps>
//! ```

#![no_std]

// ============================================================================
// Sampling Constants
// ============================================================================

/// Denominator of every sampling range.
///
/// Must be a power of two: the sampler draws `rand & (SAMPLING_BASE - 1)`.
pub const SAMPLING_BASE: usize = 16384;

/// Default period of the collector's grab round, in microseconds (100ms).
pub const DEFAULT_GRAB_INTERVAL_US: u64 = 100_000;

/// Default ceiling on samples grabbed but not yet dumped.
///
/// Samples beyond this are dropped by the grab stage (backpressure).
pub const DEFAULT_MAX_PENDING_SAMPLES: usize = 1000;

/// Default target of fully sampled events per second, per event class.
pub const DEFAULT_EXPECTED_PER_SECOND: usize = 1000;

// ============================================================================
// Stack Capture
// ============================================================================

/// Maximum number of return addresses captured per contention sample.
pub const MAX_STACK_FRAMES: usize = 26;

/// Innermost frames belonging to the capture machinery itself.
///
/// The profile writer omits these from every record.
pub const SKIPPED_STACK_FRAMES: usize = 2;

// ============================================================================
// Profile Format
// ============================================================================

/// First line of every contention profile.
pub const PROFILE_HEADER: &str = "--- contention";

/// Second line of every contention profile.
pub const PROFILE_CYCLES_LINE: &str = "cycles/second=10000000000";

/// Separator between the `<duration> <count>` prefix and the stack.
pub const PROFILE_STACK_MARKER: &str = "@";

/// Distinct stacks cached by the profile writer before it flushes to disk.
pub const MAX_CACHED_CONTENTIONS: usize = 512;

// ============================================================================
// Shared Records
// ============================================================================

/// A lock acquisition that blocked and was admitted for sampling.
///
/// Carried from the blocking `lock()` to the matching unlock, where the
/// unlock time is added and the site is turned into a sample.
///
/// **Memory Layout**: `#[repr(C)]` so the record can be shared with
/// non-Rust interception shims.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContentionSite {
    /// Time spent blocked in `lock()` (plus unlock time once released)
    pub duration_ns: u64,

    /// Sampling range granted by the speed limiter
    ///
    /// **Value**:
    /// - `0`: not sampled; the site carries no data
    /// - `1..=SAMPLING_BASE`: sampled with probability `range / SAMPLING_BASE`
    pub sampling_range: usize,
}

impl ContentionSite {
    /// A site admitted with `sampling_range` that has not been timed yet.
    #[must_use]
    pub const fn new(sampling_range: usize) -> Self {
        Self { duration_ns: 0, sampling_range }
    }

    /// Returns `true` if this site was admitted for sampling.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.sampling_range != 0
    }

    /// Mark the site as not sampled.
    pub fn invalidate(&mut self) {
        self.sampling_range = 0;
    }

    /// Duration scaled by the inverse sampling probability.
    ///
    /// Returns 0 for an invalid site.
    #[must_use]
    pub const fn scaled_duration_ns(&self) -> u64 {
        if self.sampling_range == 0 {
            return 0;
        }
        let scaled = self.duration_ns as u128 * SAMPLING_BASE as u128 / self.sampling_range as u128;
        if scaled > u64::MAX as u128 {
            u64::MAX
        } else {
            scaled as u64
        }
    }
}
