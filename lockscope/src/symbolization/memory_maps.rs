//! `/proc/<pid>/maps` parsing
//!
//! Profiles carry the profiled process's maps verbatim; the report uses them
//! to locate the executable's load range for PIE address translation.

use anyhow::{Context, Result};
use log::info;
use std::path::Path;

/// Memory range of a loaded binary in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One line of a maps file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapsEntry<'a> {
    pub range: MemoryRange,
    pub perms: &'a str,
    pub offset: u64,
    /// Backing file, or a pseudo path like `[heap]`; `None` for anonymous
    pub path: Option<&'a str>,
}

impl MapsEntry<'_> {
    fn is_file_backed(&self) -> bool {
        self.path.is_some_and(|p| p.starts_with('/'))
    }
}

/// Parse `start-end perms offset dev inode [path]`.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<MapsEntry<'_>> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;

    let range = MemoryRange {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
    };
    if range.end < range.start || perms.len() != 4 {
        return None;
    }
    // the path may contain spaces; take the rest of the line after the inode
    let path = fields.next().map(|first| {
        let at = line.find(first).unwrap_or(0);
        line[at..].trim_end()
    });
    Some(MapsEntry { range, perms, offset, path })
}

/// Path of the first file-backed mapping: the main executable, which the
/// kernel maps before any shared library.
#[must_use]
pub fn main_executable(maps: &str) -> Option<&str> {
    maps.lines().filter_map(parse_maps_line).find(MapsEntry::is_file_backed).and_then(|e| e.path)
}

/// Full load range (lowest start to highest end) of `binary` in `maps`.
///
/// Mappings match on the exact path first, then on file name, so a
/// relative `--binary` argument still finds its mapping.
///
/// # Errors
/// Returns an error if no mapping belongs to `binary`.
pub fn find_binary_range(maps: &str, binary: &Path) -> Result<MemoryRange> {
    let entries: Vec<MapsEntry<'_>> = maps.lines().filter_map(parse_maps_line).collect();
    let file_name = binary.file_name().and_then(|n| n.to_str());

    let exact = |e: &&MapsEntry<'_>| e.path.is_some_and(|p| Path::new(p) == binary);
    let by_name = |e: &&MapsEntry<'_>| {
        e.is_file_backed() && e.path.and_then(|p| Path::new(p).file_name()?.to_str()) == file_name
    };
    let matching: Vec<&MapsEntry<'_>> = if entries.iter().any(|e| exact(&e)) {
        entries.iter().filter(exact).collect()
    } else {
        entries.iter().filter(by_name).collect()
    };

    let start = matching.iter().map(|e| e.range.start).min();
    let end = matching.iter().map(|e| e.range.end).max();
    let (start, end) = start
        .zip(end)
        .with_context(|| format!("Could not find memory range for {}", binary.display()))?;
    info!("Executable memory range: 0x{:x} - 0x{:x} (size: {} KB)", start, end, (end - start) / 1024);
    Ok(MemoryRange { start, end })
}
