//! Profiled mutex to written profile to offline report.

use lockscope::analysis::{analyze_contention, AddressTranslator, ContentionProfile};
use lockscope::collection::CollectorConfig;
use lockscope::profiling::{ContentionContext, ContextOptions, ProfiledMutex};
use lockscope::symbolization::{find_binary_range, main_executable, Symbolizer};
use lockscope_common::{PROFILE_CYCLES_LINE, PROFILE_HEADER};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn contend(context: &'static ContentionContext, threads: usize, iterations: usize) {
    let mutex = Arc::new(ProfiledMutex::with_context(Vec::<usize>::new(), context));
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let mutex = Arc::clone(&mutex);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..iterations {
                    let mut guard = mutex.lock().unwrap();
                    guard.push(t * iterations + i);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(mutex.lock().unwrap().len(), threads * iterations);
}

#[test]
fn test_profiled_mutex_writes_readable_profile() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contention.prof");
    let context = ContentionContext::leak(ContextOptions {
        collector: CollectorConfig::new(Duration::from_millis(20), 1000).unwrap(),
        expected_per_second: 1000,
    })
    .unwrap();

    context.start_profiler(&path).unwrap();
    contend(context, 6, 10);
    let summary = context.stop_profiler().unwrap();
    assert!(summary.samples > 0, "six threads holding for 1ms must contend");

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with(&format!("{PROFILE_HEADER}\n{PROFILE_CYCLES_LINE}\n")));

    let profile = ContentionProfile::parse(&text).unwrap();
    assert_eq!(profile.records.len() as u64, summary.records);
    assert_eq!(profile.total_duration_ns(), summary.total_duration_ns);
    assert!(profile.total_count() >= summary.estimated_count.floor() as u64);

    if cfg!(target_os = "linux") {
        assert!(main_executable(&profile.maps).is_some());
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
#[test]
fn test_report_attributes_contention_to_caller() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attributed.prof");
    let context = ContentionContext::leak(ContextOptions {
        collector: CollectorConfig::new(Duration::from_millis(20), 1000).unwrap(),
        expected_per_second: 1000,
    })
    .unwrap();

    context.start_profiler(&path).unwrap();
    contend(context, 6, 10);
    context.stop_profiler().unwrap();

    let profile = ContentionProfile::load(&path).unwrap();
    let exe = std::env::current_exe().unwrap();
    let symbolizer = Symbolizer::new(&exe).unwrap();
    let translator = find_binary_range(&profile.maps, &exe).map_or_else(
        |_| AddressTranslator::identity(),
        |range| AddressTranslator::new(range, symbolizer.is_position_independent()),
    );
    let report = analyze_contention(&profile, &symbolizer, translator);

    assert_eq!(report.total_duration_ns, profile.total_duration_ns());
    assert!(
        report.hotspots.iter().any(|h| h.function.contains("contend")),
        "expected the test's contention loop among {:?}",
        report.hotspots.iter().map(|h| &h.function).collect::<Vec<_>>()
    );
}

#[test]
fn test_stopped_profiler_records_nothing_more() {
    let dir = tempfile::tempdir().unwrap();
    let context = ContentionContext::leak(ContextOptions::default()).unwrap();
    context.start_profiler(dir.path().join("first.prof")).unwrap();
    context.stop_profiler().unwrap();

    contend(context, 4, 5);
    let stats = context.collector_stats().unwrap();
    assert_eq!(stats.submitted, 0);
}
