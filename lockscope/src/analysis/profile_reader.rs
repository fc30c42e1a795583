//! Reader for contention profiles written by `ContentionProfiler`
//!
//! ```text
//! --- contention                       header
//! cycles/second=10000000000            header
//! <duration_ns> <count> @ 0x.. 0x..    one record per stack (may repeat)
//! <maps lines>                         /proc/self/maps of the profiled process
//! ```

use crate::domain::ReportError;
use crate::symbolization::parse_maps_line;
use lockscope_common::{PROFILE_CYCLES_LINE, PROFILE_HEADER, PROFILE_STACK_MARKER};
use std::fs;
use std::path::Path;

/// One stack line of a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub duration_ns: u64,
    pub count: u64,
    /// Return addresses, innermost first
    pub frames: Vec<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentionProfile {
    pub records: Vec<ProfileRecord>,
    /// Trailing memory maps, verbatim (empty if the writer could not read them)
    pub maps: String,
}

impl ContentionProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReportError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, ReportError> {
        let mut lines = text.lines().enumerate().peekable();
        if lines.next().map(|(_, l)| l.trim_end()) != Some(PROFILE_HEADER) {
            return Err(ReportError::MissingHeader { expected: PROFILE_HEADER });
        }
        let cycles_prefix = PROFILE_CYCLES_LINE.split('=').next().unwrap_or(PROFILE_CYCLES_LINE);
        if !lines.next().is_some_and(|(_, l)| l.starts_with(cycles_prefix)) {
            return Err(ReportError::MissingHeader { expected: PROFILE_CYCLES_LINE });
        }

        let mut profile = Self::default();
        while let Some(&(idx, line)) = lines.peek() {
            if line.trim().is_empty() {
                lines.next();
                continue;
            }
            if parse_maps_line(line).is_some() {
                break;
            }
            profile.records.push(parse_record(line, idx + 1)?);
            lines.next();
        }
        let maps: Vec<&str> = lines.map(|(_, l)| l).collect();
        profile.maps = maps.join("\n");
        Ok(profile)
    }

    #[must_use]
    pub fn total_duration_ns(&self) -> u64 {
        self.records.iter().map(|r| r.duration_ns).fold(0, u64::saturating_add)
    }

    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.records.iter().map(|r| r.count).fold(0, u64::saturating_add)
    }
}

fn parse_record(line: &str, line_number: usize) -> Result<ProfileRecord, ReportError> {
    let malformed = |reason: String| ReportError::MalformedRecord { line: line_number, reason };
    let mut fields = line.split_whitespace();

    let duration_ns = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| malformed("expected wait duration".to_string()))?;
    let count = fields
        .next()
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| malformed("expected contention count".to_string()))?;
    if fields.next() != Some(PROFILE_STACK_MARKER) {
        return Err(malformed(format!("expected {PROFILE_STACK_MARKER:?} before the stack")));
    }
    let frames = fields
        .map(|f| {
            f.strip_prefix("0x")
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .ok_or_else(|| malformed(format!("bad address {f:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ProfileRecord { duration_ns, count, frames })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE: &str = "\
--- contention
cycles/second=10000000000
2000 3 @ 0xaaa 0xbbb
500 1 @
55d0c2a00000-55d0c2a40000 r--p 00000000 fd:01 1234   /opt/app/bin/demo
7f1e2c000000-7f1e2c021000 rw-p 00000000 00:00 0
";

    #[test]
    fn test_parse_records_and_maps() {
        let profile = ContentionProfile::parse(PROFILE).unwrap();
        assert_eq!(
            profile.records,
            vec![
                ProfileRecord { duration_ns: 2000, count: 3, frames: vec![0xaaa, 0xbbb] },
                ProfileRecord { duration_ns: 500, count: 1, frames: vec![] },
            ]
        );
        assert_eq!(profile.maps.lines().count(), 2);
        assert!(profile.maps.starts_with("55d0c2a00000-"));
        assert_eq!(profile.total_duration_ns(), 2500);
        assert_eq!(profile.total_count(), 4);
    }

    #[test]
    fn test_header_is_required() {
        let err = ContentionProfile::parse("2000 3 @ 0xaaa\n").unwrap_err();
        assert!(matches!(err, ReportError::MissingHeader { expected } if expected == PROFILE_HEADER));

        let err = ContentionProfile::parse("--- contention\n2000 3 @ 0xaaa\n").unwrap_err();
        assert!(matches!(err, ReportError::MissingHeader { expected } if expected == PROFILE_CYCLES_LINE));
    }

    #[test]
    fn test_malformed_record_reports_line() {
        let text = "--- contention\ncycles/second=10000000000\n10 1 @ 0x1\n10 x @ 0x2\n";
        match ContentionProfile::parse(text).unwrap_err() {
            ReportError::MalformedRecord { line, reason } => {
                assert_eq!(line, 4);
                assert!(reason.contains("count"));
            }
            other => panic!("unexpected error: {other}"),
        }

        let text = "--- contention\ncycles/second=10000000000\n10 1 @ zz\n";
        assert!(matches!(ContentionProfile::parse(text), Err(ReportError::MalformedRecord { line: 3, .. })));
    }

    #[test]
    fn test_profile_without_records() {
        let profile = ContentionProfile::parse("--- contention\ncycles/second=10000000000\n").unwrap();
        assert!(profile.records.is_empty());
        assert!(profile.maps.is_empty());
    }
}
