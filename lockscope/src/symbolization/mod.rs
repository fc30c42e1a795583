//! # Address symbolization for contention profiles
//!
//! A profile records raw return addresses from the profiled process plus a
//! copy of its `/proc/self/maps`. Turning those into function names takes
//! two steps:
//!
//! ```text
//! 1. Find the executable's mapping in the trailing maps
//!    55d0c2a00000-55d0c2c00000 r-xp 00000000 ... /usr/bin/app
//!
//! 2. Translate runtime address to file address (PIE only)
//!    0x55d0c2a4b1f0 - 0x55d0c2a00000 = 0x4b1f0
//!
//! 3. Look the file address up in DWARF (inlined frames included)
//!    0x4b1f0 -> app::cache::Cache::insert at src/cache.rs:88
//! ```
//!
//! Addresses outside the executable (shared libraries) stay unresolved.
//! Binaries need debug info (`debug = true` or `debug = "line-tables-only"`)
//! for file and line information.

pub mod memory_maps;
pub mod symbolizer;

pub use memory_maps::{find_binary_range, main_executable, parse_maps_line, MapsEntry, MemoryRange};
pub use symbolizer::{FrameResolver, InlinedFrame, ResolvedFrame, SourceLocation, Symbolizer, UNKNOWN_FUNCTION};
