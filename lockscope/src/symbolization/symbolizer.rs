use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use object::{Object, ObjectKind, ObjectSection};
use rustc_demangle::demangle;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// Function name of an address with no debug info
pub const UNKNOWN_FUNCTION: &str = "<unknown>";

/// Maps a file address to the (possibly inlined) functions at it
pub trait FrameResolver {
    fn resolve(&self, addr: u64) -> ResolvedFrame;
}

/// DWARF-backed resolver for one binary
///
/// Lookups are cached: contention stacks repeat the same few call sites.
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    position_independent: bool,
    cache: RefCell<HashMap<u64, ResolvedFrame>>,
}

impl Symbolizer {
    /// Load DWARF debug info from `binary_path`.
    ///
    /// # Errors
    /// Returns an error if the binary file cannot be read or parsed, or if DWARF debug info is missing
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self> {
        let binary_data = fs::read(binary_path.as_ref())
            .with_context(|| format!("Failed to read binary file {}", binary_path.as_ref().display()))?;
        let obj_file = object::File::parse(&*binary_data).context("Failed to parse object file")?;

        let endian = if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };
        let load_section = |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
            let data = obj_file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?;

        Ok(Self {
            ctx,
            position_independent: obj_file.kind() == ObjectKind::Dynamic,
            cache: RefCell::new(HashMap::new()),
        })
    }

    /// PIE binaries need runtime addresses rebased onto their load address.
    #[must_use]
    pub fn is_position_independent(&self) -> bool {
        self.position_independent
    }

    /// Demangle a Rust symbol name
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }

    fn lookup(&self, addr: u64) -> Vec<InlinedFrame> {
        let mut frames = Vec::new();
        let Ok(mut iter) = self.ctx.find_frames(addr).skip_all_loads() else {
            return frames;
        };
        while let Ok(Some(frame)) = iter.next() {
            let function = frame
                .function
                .and_then(|f| f.raw_name().ok().map(|raw| Self::demangle_symbol(&raw)))
                .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());
            let location = frame.location.map(|loc| SourceLocation {
                file: loc.file.map(ToString::to_string),
                line: loc.line,
                column: loc.column,
            });
            frames.push(InlinedFrame { function, location });
        }
        frames
    }
}

impl FrameResolver for Symbolizer {
    fn resolve(&self, addr: u64) -> ResolvedFrame {
        if let Some(cached) = self.cache.borrow().get(&addr) {
            return cached.clone();
        }
        let frames = self.lookup(addr);
        let resolved = if frames.is_empty() { ResolvedFrame::unknown(addr) } else { ResolvedFrame { addr, frames } };
        self.cache.borrow_mut().insert(addr, resolved.clone());
        resolved
    }
}

/// A resolved address: innermost inlined function first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub addr: u64,
    pub frames: Vec<InlinedFrame>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlinedFrame {
    pub function: String,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(file) = &self.file else {
            return f.write_str("??");
        };
        f.write_str(file)?;
        if let Some(line) = self.line {
            write!(f, ":{line}")?;
            if let Some(col) = self.column {
                write!(f, ":{col}")?;
            }
        }
        Ok(())
    }
}

impl ResolvedFrame {
    #[must_use]
    pub fn unknown(addr: u64) -> Self {
        Self { addr, frames: vec![InlinedFrame { function: UNKNOWN_FUNCTION.to_string(), location: None }] }
    }

    #[must_use]
    pub fn is_unknown(&self) -> bool {
        self.frames.iter().all(|f| f.function == UNKNOWN_FUNCTION)
    }

    /// Format the frame for display
    #[must_use]
    pub fn format(&self, frame_num: usize) -> String {
        let mut output = String::new();
        for (idx, inlined) in self.frames.iter().enumerate() {
            if idx > 0 {
                output.push('\n');
            }
            if idx == 0 {
                let _ = write!(output, "#{frame_num:<2} 0x{:016x} {}", self.addr, inlined.function);
            } else {
                let _ = write!(output, "    {:18} {} (inlined)", "", inlined.function);
            }
            if let Some(loc) = inlined.location.as_ref().filter(|l| l.file.is_some()) {
                let _ = write!(output, "\n                      at {loc}");
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function: &str, file: Option<&str>, line: Option<u32>) -> InlinedFrame {
        InlinedFrame {
            function: function.to_string(),
            location: Some(SourceLocation { file: file.map(str::to_string), line, column: None }),
        }
    }

    #[test]
    fn test_unknown_frame() {
        let unknown = ResolvedFrame::unknown(0x10);
        assert!(unknown.is_unknown());
        assert_eq!(unknown.format(0), "#0  0x0000000000000010 <unknown>");
    }

    #[test]
    fn test_format_includes_location_and_inlined_frames() {
        let resolved = ResolvedFrame {
            addr: 0xabc,
            frames: vec![frame("app::inner", Some("src/a.rs"), Some(7)), frame("app::outer", None, None)],
        };
        assert!(!resolved.is_unknown());
        let text = resolved.format(3);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "#3  0x0000000000000abc app::inner");
        assert_eq!(lines[1].trim(), "at src/a.rs:7");
        assert!(lines[2].ends_with("app::outer (inlined)"));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_source_location_display() {
        let loc = SourceLocation { file: Some("lib.rs".into()), line: Some(3), column: Some(9) };
        assert_eq!(loc.to_string(), "lib.rs:3:9");
        assert_eq!(SourceLocation { file: None, line: Some(1), column: None }.to_string(), "??");
    }

    #[test]
    fn test_demangle_strips_hash() {
        let name = Symbolizer::demangle_symbol("_ZN9lockscope4demo3run17h0123456789abcdefE");
        assert_eq!(name, "lockscope::demo::run");
    }
}
