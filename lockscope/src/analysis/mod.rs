//! Offline analysis of written contention profiles
//!
//! Pure logic: parsing and ranking take already-loaded data and a
//! [`FrameResolver`](crate::symbolization::FrameResolver), so tests run
//! without binaries or debug info.

pub mod contention_analyzer;
pub mod profile_reader;

pub use contention_analyzer::{analyze_contention, AddressTranslator, ContentionHotspot, ContentionReport};
pub use profile_reader::{ContentionProfile, ProfileRecord};
