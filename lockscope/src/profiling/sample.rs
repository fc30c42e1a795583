//! Sampled lock contention
//!
//! One sample per admitted contended acquisition. Duration and count are
//! scaled by the inverse sampling probability at construction, so sums over
//! samples estimate the unsampled totals directly.

use super::profiler::ProfileSink;
use super::stack::StackTrace;
use crate::collection::{Collected, PoolItem, SpeedLimit};
use crate::domain::RoundIndex;
use lockscope_common::{ContentionSite, SAMPLING_BASE};

pub struct ContentionSample {
    /// Estimated wait time represented by this sample
    pub duration_ns: u64,
    /// Estimated number of contended acquisitions represented
    pub count: f64,
    pub stack: StackTrace,
    limit: &'static SpeedLimit,
}

impl ContentionSample {
    /// Scale a timed site into a sample. Returns `None` for a site that was
    /// never admitted for sampling.
    #[must_use]
    pub fn from_site(site: &ContentionSite, stack: StackTrace, limit: &'static SpeedLimit) -> Option<Self> {
        if !site.is_valid() {
            return None;
        }
        Some(Self {
            duration_ns: site.scaled_duration_ns(),
            count: SAMPLING_BASE as f64 / site.sampling_range as f64,
            stack,
            limit,
        })
    }
}

impl Collected for ContentionSample {
    type Sink = ProfileSink;

    fn dump_and_destroy(item: PoolItem<Self>, _round: RoundIndex, sink: &ProfileSink) {
        sink.record(&item);
    }

    fn speed_limit(&self) -> Option<&'static SpeedLimit> {
        Some(self.limit)
    }
}
