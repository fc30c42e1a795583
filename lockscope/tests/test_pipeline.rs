//! End-to-end tests of the sampling engine with a custom sample type.

use lockscope::collection::{Collected, Collector, CollectorConfig, ObjectPool, PoolItem, SpeedLimit, SubmitOutcome};
use lockscope::domain::{RoundIndex, Timestamp};
use lockscope_common::SAMPLING_BASE;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A measured hold, with the sampling range it was admitted at
struct HoldSample {
    duration_ns: u64,
    sampling_range: usize,
    limit: &'static SpeedLimit,
}

#[derive(Default)]
struct HoldSink {
    /// (scaled duration, scaled count) sums
    totals: Mutex<(f64, f64)>,
    dumped: AtomicU64,
}

impl Collected for HoldSample {
    type Sink = HoldSink;

    fn dump_and_destroy(item: PoolItem<Self>, _round: RoundIndex, sink: &HoldSink) {
        let scale = SAMPLING_BASE as f64 / item.sampling_range as f64;
        let mut totals = sink.totals.lock().unwrap();
        totals.0 += item.duration_ns as f64 * scale;
        totals.1 += scale;
        sink.dumped.fetch_add(1, Ordering::Relaxed);
    }

    fn speed_limit(&self) -> Option<&'static SpeedLimit> {
        Some(self.limit)
    }
}

#[test]
fn test_twenty_threads_estimate_average_hold() {
    const THREADS: u64 = 20;
    const ITERATIONS: u64 = 50;
    const HOLD: Duration = Duration::from_millis(2);

    let pool = ObjectPool::<HoldSample>::leak();
    let limit: &'static SpeedLimit = Box::leak(Box::new(SpeedLimit::with_expected_per_second(200).unwrap()));
    let collector = Arc::new(Collector::<HoldSample>::new(
        CollectorConfig::new(Duration::from_millis(20), 1000).unwrap(),
        HoldSink::default(),
    ));
    collector.start().unwrap();

    let observed_ns = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let collector = Arc::clone(&collector);
            let observed_ns = Arc::clone(&observed_ns);
            thread::spawn(move || {
                for _ in 0..ITERATIONS {
                    let started = Instant::now();
                    thread::sleep(HOLD);
                    let held = u64::try_from(started.elapsed().as_nanos()).unwrap();
                    observed_ns.fetch_add(held, Ordering::Relaxed);

                    if let Some(sampling_range) = limit.is_collectable(&*collector) {
                        let sample = HoldSample { duration_ns: held, sampling_range, limit };
                        collector.submit(pool.acquire(sample).unwrap(), Timestamp::now());
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    collector.stop();

    let stats = collector.stats();
    assert_eq!(stats.dumped + stats.dropped, stats.submitted);
    assert!(stats.dumped > 0);
    assert_eq!(collector.sink().dumped.load(Ordering::Relaxed), stats.dumped);

    let (duration, count) = *collector.sink().totals.lock().unwrap();
    let estimated_avg = duration / count;
    let observed_avg = observed_ns.load(Ordering::Relaxed) as f64 / (THREADS * ITERATIONS) as f64;
    let error = (estimated_avg - observed_avg).abs() / observed_avg;
    assert!(error < 0.2, "estimated {estimated_avg:.0} ns vs observed {observed_avg:.0} ns");
    assert!((1..=SAMPLING_BASE).contains(&limit.sampling_range()));
}

#[test]
fn test_stop_with_samples_in_flight() {
    let pool = ObjectPool::<HoldSample>::leak();
    let limit: &'static SpeedLimit = Box::leak(Box::default());
    let collector = Arc::new(Collector::<HoldSample>::new(
        CollectorConfig::new(Duration::from_millis(2), 100).unwrap(),
        HoldSink::default(),
    ));
    collector.start().unwrap();

    let producers: Vec<_> = (0..8)
        .map(|_| {
            let collector = Arc::clone(&collector);
            thread::spawn(move || {
                let mut outcomes = [0_u64; 2];
                loop {
                    let sample = HoldSample { duration_ns: 1, sampling_range: SAMPLING_BASE, limit };
                    match collector.submit(pool.acquire(sample).unwrap(), Timestamp::now()) {
                        SubmitOutcome::Queued => outcomes[0] += 1,
                        SubmitOutcome::Stopped => break outcomes,
                        _ => outcomes[1] += 1,
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(30));
    collector.stop();
    let queued: u64 = producers.into_iter().map(|p| p.join().unwrap()[0]).sum();

    let stats = collector.stats();
    assert_eq!(stats.submitted, queued);
    assert_eq!(stats.dumped + stats.dropped, stats.submitted);
    assert_eq!(collector.sink().dumped.load(Ordering::Relaxed), stats.dumped);
}
