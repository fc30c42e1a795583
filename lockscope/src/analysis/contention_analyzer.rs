//! Contention hotspot analysis
//!
//! Attributes every profile record to a single call site (the innermost
//! frame that is not part of the profiler, the standard library or an
//! unresolved address) and ranks sites by total estimated wait time.
//!
//! # Output
//!
//! ```text
//! CONTENTION SITES (3 records, 412.5 ms total wait)
//! ──────────────────────────────────────────────────
//!   demo::worker                  81.2%  335.1 ms   402 acquisitions
//!       at src/main.rs:120
//! ```

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use super::profile_reader::{ContentionProfile, ProfileRecord};
use crate::domain::DurationNs;
use crate::symbolization::{FrameResolver, MemoryRange, ResolvedFrame, SourceLocation, UNKNOWN_FUNCTION};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Representative stacks kept per site
const MAX_CALL_STACKS_PER_SITE: usize = 5;

/// Name used for records with no attributable frame
pub const UNATTRIBUTED: &str = "<unattributed>";

/// Functions that are never reported as the contention site
const INTERNAL_PREFIXES: &[&str] = &[
    "lockscope::profiling::",
    "lockscope::collection::",
    "std::",
    "core::",
    "alloc::",
];

/// Runtime to file address translation for one executable
#[derive(Debug, Clone, Copy)]
pub struct AddressTranslator {
    range: Option<MemoryRange>,
    rebase: bool,
}

impl AddressTranslator {
    /// Addresses inside `range` are rebased onto it when `rebase` is set
    /// (PIE); addresses outside belong to other objects and stay unresolved.
    #[must_use]
    pub fn new(range: MemoryRange, rebase: bool) -> Self {
        Self { range: Some(range), rebase }
    }

    /// Use addresses unchanged (no maps recorded).
    #[must_use]
    pub fn identity() -> Self {
        Self { range: None, rebase: false }
    }

    /// File address of the call instruction for return address `addr`.
    #[must_use]
    pub fn call_site(&self, addr: u64) -> Option<u64> {
        let file_addr = match self.range {
            None => addr,
            Some(range) if range.contains(addr) => {
                if self.rebase {
                    addr - range.start
                } else {
                    addr
                }
            }
            Some(_) => return None,
        };
        // return addresses point just past the call
        Some(file_addr.saturating_sub(1))
    }
}

/// One ranked contention site
#[derive(Debug, Clone, Serialize)]
pub struct ContentionHotspot {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub duration_ns: u64,
    /// Estimated contended acquisitions
    pub count: u64,
    /// Share of total wait time (0.0 - 100.0)
    pub percentage: f64,
    /// Most expensive distinct call paths, outermost frame last
    pub call_stacks: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContentionReport {
    pub records: usize,
    pub total_duration_ns: u64,
    pub total_count: u64,
    pub hotspots: Vec<ContentionHotspot>,
}

#[derive(Default)]
struct SiteStats {
    location: Option<SourceLocation>,
    duration_ns: u64,
    count: u64,
    call_stacks: HashMap<Vec<String>, u64>,
}

fn is_internal(function: &str) -> bool {
    let name = function.trim_start_matches('<');
    function == UNKNOWN_FUNCTION || INTERNAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Rank the contention sites of `profile`.
pub fn analyze_contention(
    profile: &ContentionProfile,
    resolver: &dyn FrameResolver,
    translator: AddressTranslator,
) -> ContentionReport {
    let mut sites: HashMap<String, SiteStats> = HashMap::new();

    for record in &profile.records {
        let resolved = resolve_record(record, resolver, translator);
        let names: Vec<String> = resolved
            .iter()
            .flat_map(|frame| frame.frames.iter().map(|f| f.function.clone()))
            .collect();
        let site = resolved
            .iter()
            .flat_map(|frame| frame.frames.iter())
            .find(|f| !is_internal(&f.function));

        let key = site.map_or_else(|| UNATTRIBUTED.to_string(), |f| f.function.clone());
        let stats = sites.entry(key).or_default();
        if stats.location.is_none() {
            stats.location = site.and_then(|f| f.location.clone());
        }
        stats.duration_ns = stats.duration_ns.saturating_add(record.duration_ns);
        stats.count = stats.count.saturating_add(record.count);
        let stack = names.into_iter().filter(|n| !is_internal(n)).collect::<Vec<_>>();
        *stats.call_stacks.entry(stack).or_insert(0) += record.duration_ns;
    }

    let total_duration_ns = profile.total_duration_ns();
    let mut hotspots: Vec<ContentionHotspot> = sites
        .into_iter()
        .map(|(function, stats)| {
            let percentage = if total_duration_ns > 0 {
                stats.duration_ns as f64 / total_duration_ns as f64 * 100.0
            } else {
                0.0
            };
            let mut stacks: Vec<(Vec<String>, u64)> = stats.call_stacks.into_iter().collect();
            stacks.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            stacks.truncate(MAX_CALL_STACKS_PER_SITE);
            ContentionHotspot {
                function,
                file: stats.location.as_ref().and_then(|l| l.file.clone()),
                line: stats.location.as_ref().and_then(|l| l.line),
                duration_ns: stats.duration_ns,
                count: stats.count,
                percentage,
                call_stacks: stacks.into_iter().map(|(stack, _)| stack).collect(),
            }
        })
        .collect();

    hotspots.sort_unstable_by(|a, b| b.duration_ns.cmp(&a.duration_ns).then_with(|| a.function.cmp(&b.function)));

    ContentionReport {
        records: profile.records.len(),
        total_duration_ns,
        total_count: profile.total_count(),
        hotspots,
    }
}

fn resolve_record(
    record: &ProfileRecord,
    resolver: &dyn FrameResolver,
    translator: AddressTranslator,
) -> Vec<ResolvedFrame> {
    record
        .frames
        .iter()
        .map(|&addr| match translator.call_site(addr) {
            Some(file_addr) => ResolvedFrame { addr, ..resolver.resolve(file_addr) },
            None => ResolvedFrame::unknown(addr),
        })
        .collect()
}

impl ContentionReport {
    /// Text rendering of the `top` most expensive sites.
    #[must_use]
    pub fn render(&self, top: usize) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "CONTENTION SITES ({} records, {} total wait, ~{} contended acquisitions)",
            self.records,
            DurationNs(self.total_duration_ns),
            self.total_count
        );
        let _ = writeln!(out, "{}", "─".repeat(72));
        if self.hotspots.is_empty() {
            let _ = writeln!(out, "  no contention recorded");
            return out;
        }
        for hotspot in self.hotspots.iter().take(top) {
            let _ = writeln!(
                out,
                "  {:<40} {:>5.1}%  {:>10}  {:>8} acquisitions",
                hotspot.function,
                hotspot.percentage,
                DurationNs(hotspot.duration_ns).to_string(),
                hotspot.count
            );
            if let Some(file) = &hotspot.file {
                match hotspot.line {
                    Some(line) => {
                        let _ = writeln!(out, "      at {file}:{line}");
                    }
                    None => {
                        let _ = writeln!(out, "      at {file}");
                    }
                }
            }
            if let Some(stack) = hotspot.call_stacks.first() {
                for caller in stack.iter().skip(1).take(3) {
                    let _ = writeln!(out, "        <- {caller}");
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbolization::InlinedFrame;

    /// Resolves file addresses from a fixed table
    struct TableResolver(HashMap<u64, Vec<&'static str>>);

    impl FrameResolver for TableResolver {
        fn resolve(&self, addr: u64) -> ResolvedFrame {
            match self.0.get(&addr) {
                Some(functions) => ResolvedFrame {
                    addr,
                    frames: functions
                        .iter()
                        .map(|&f| InlinedFrame {
                            function: f.to_string(),
                            location: Some(SourceLocation {
                                file: Some(format!("src/{}.rs", f.rsplit("::").next().unwrap_or(f))),
                                line: Some(10),
                                column: None,
                            }),
                        })
                        .collect(),
                },
                None => ResolvedFrame::unknown(addr),
            }
        }
    }

    fn resolver() -> TableResolver {
        // keys are call sites: return address - 1
        TableResolver(HashMap::from([
            (0x0f, vec!["lockscope::profiling::mutex::ProfiledMutex<T>::lock"]),
            (0x1f, vec!["std::sync::mutex::Mutex<T>::lock"]),
            (0x2f, vec!["app::cache::insert", "app::cache::Cache::put"]),
            (0x3f, vec!["app::main"]),
            (0x4f, vec!["app::stats::bump"]),
        ]))
    }

    fn record(duration_ns: u64, count: u64, frames: &[u64]) -> ProfileRecord {
        ProfileRecord { duration_ns, count, frames: frames.to_vec() }
    }

    #[test]
    fn test_attributes_first_non_internal_frame() {
        let profile = ContentionProfile {
            records: vec![
                record(3_000, 3, &[0x10, 0x20, 0x30, 0x40]),
                record(1_000, 1, &[0x10, 0x50, 0x40]),
                record(2_000, 2, &[0x10, 0x30, 0x40]),
            ],
            maps: String::new(),
        };
        let report = analyze_contention(&profile, &resolver(), AddressTranslator::identity());

        assert_eq!(report.records, 3);
        assert_eq!(report.total_duration_ns, 6_000);
        assert_eq!(report.total_count, 6);
        let names: Vec<&str> = report.hotspots.iter().map(|h| h.function.as_str()).collect();
        assert_eq!(names, vec!["app::cache::insert", "app::stats::bump"]);

        let top = &report.hotspots[0];
        assert_eq!(top.duration_ns, 5_000);
        assert_eq!(top.count, 5);
        assert!((top.percentage - 5000.0 / 6000.0 * 100.0).abs() < 1e-9);
        assert_eq!(top.file.as_deref(), Some("src/insert.rs"));
        assert_eq!(top.call_stacks[0], vec!["app::cache::insert", "app::cache::Cache::put", "app::main"]);
        assert_eq!(top.call_stacks.len(), 1);
    }

    #[test]
    fn test_unresolvable_records_are_unattributed() {
        let profile = ContentionProfile {
            records: vec![record(100, 1, &[0x10, 0x999]), record(5, 1, &[])],
            maps: String::new(),
        };
        let report = analyze_contention(&profile, &resolver(), AddressTranslator::identity());
        assert_eq!(report.hotspots.len(), 1);
        assert_eq!(report.hotspots[0].function, UNATTRIBUTED);
        assert_eq!(report.hotspots[0].duration_ns, 105);
    }

    #[test]
    fn test_translator_rebases_pie_addresses() {
        let range = MemoryRange { start: 0x5000, end: 0x9000 };
        let pie = AddressTranslator::new(range, true);
        assert_eq!(pie.call_site(0x5030), Some(0x2f));
        assert_eq!(pie.call_site(0x9000), None);

        let fixed = AddressTranslator::new(range, false);
        assert_eq!(fixed.call_site(0x5030), Some(0x502f));
        assert_eq!(AddressTranslator::identity().call_site(0x30), Some(0x2f));
    }

    #[test]
    fn test_render_limits_to_top() {
        let profile = ContentionProfile {
            records: vec![record(3_000_000, 3, &[0x30]), record(1_000_000, 1, &[0x50])],
            maps: String::new(),
        };
        let report = analyze_contention(&profile, &resolver(), AddressTranslator::identity());
        let text = report.render(1);
        assert!(text.contains("app::cache::insert"));
        assert!(!text.contains("app::stats::bump"));
        assert!(text.contains("at src/insert.rs:10"));

        let empty = ContentionReport::default().render(10);
        assert!(empty.contains("no contention recorded"));
    }

    #[test]
    fn test_report_serializes() {
        let report = ContentionReport::default();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["records"], 0);
        assert!(json["hotspots"].as_array().unwrap().is_empty());
    }
}
