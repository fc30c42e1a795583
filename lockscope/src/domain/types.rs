//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep monotonic timestamps, round indices and
//! wall-clock durations apart in function signatures.

use std::fmt;
use std::sync::OnceLock;
use std::time::Instant;

/// Process-monotonic timestamp in microseconds
///
/// Measured from the first call to [`Timestamp::now`] in this process, so
/// values are only comparable within one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Timestamp(pub u64);

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

impl Timestamp {
    /// Current monotonic time
    #[must_use]
    pub fn now() -> Self {
        let micros = process_epoch().elapsed().as_micros();
        // Offset by one so a real reading is never the zero "unset" value.
        Timestamp(u64::try_from(micros).unwrap_or(u64::MAX - 1) + 1)
    }

    #[must_use]
    pub fn from_micros(micros: u64) -> Self {
        Timestamp(micros)
    }

    #[must_use]
    pub fn as_micros(self) -> u64 {
        self.0
    }

    /// Microseconds elapsed since `earlier` (0 if `earlier` is later)
    #[must_use]
    pub fn micros_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}s", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

/// Index of a dump round (1-based, strictly increasing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundIndex(pub u64);

impl fmt::Display for RoundIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Round#{}", self.0)
    }
}

/// Duration in nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct DurationNs(pub u64);

impl DurationNs {
    #[must_use]
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl fmt::Display for DurationNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            write!(f, "{:.2}ms", self.as_millis_f64())
        } else {
            write!(f, "{:.2}µs", self.0 as f64 / 1_000.0)
        }
    }
}
