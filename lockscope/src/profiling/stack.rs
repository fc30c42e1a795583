//! Call stack capture
//!
//! Uses glibc's `backtrace(3)`, which walks the current thread's frames
//! and writes raw return addresses. Other targets capture no frames; their
//! samples still carry durations and counts but aggregate under one empty
//! stack.

use lockscope_common::MAX_STACK_FRAMES;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Up to `MAX_STACK_FRAMES` return addresses, innermost first
#[derive(Clone, Copy)]
pub struct StackTrace {
    frames: [usize; MAX_STACK_FRAMES],
    len: usize,
}

impl StackTrace {
    #[must_use]
    pub const fn empty() -> Self {
        Self { frames: [0; MAX_STACK_FRAMES], len: 0 }
    }

    /// Build from known addresses (extra addresses are ignored).
    #[must_use]
    pub fn from_addresses(addresses: &[usize]) -> Self {
        let mut stack = Self::empty();
        let len = addresses.len().min(MAX_STACK_FRAMES);
        stack.frames[..len].copy_from_slice(&addresses[..len]);
        stack.len = len;
        stack
    }

    /// Capture the calling thread's stack.
    #[inline(never)]
    #[must_use]
    pub fn capture() -> Self {
        let mut stack = Self::empty();
        stack.len = platform::backtrace(&mut stack.frames);
        stack
    }

    #[must_use]
    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for StackTrace {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for StackTrace {
    fn eq(&self, other: &Self) -> bool {
        self.frames() == other.frames()
    }
}

impl Eq for StackTrace {}

impl Hash for StackTrace {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.frames().hash(state);
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames().iter().map(|a| format!("0x{a:x}"))).finish()
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod platform {
    #![allow(unsafe_code)] // FFI into glibc

    use libc::{c_int, c_void};

    extern "C" {
        #[link_name = "backtrace"]
        fn raw_backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
    }

    pub(super) fn backtrace(frames: &mut [usize]) -> usize {
        let capacity = c_int::try_from(frames.len()).unwrap_or(c_int::MAX);
        // SAFETY: `usize` and `*mut c_void` have the same layout, and glibc
        // writes at most `capacity` entries into the buffer.
        let written = unsafe { raw_backtrace(frames.as_mut_ptr().cast::<*mut c_void>(), capacity) };
        usize::try_from(written).unwrap_or(0).min(frames.len())
    }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod platform {
    pub(super) fn backtrace(_frames: &mut [usize]) -> usize {
        0
    }
}
