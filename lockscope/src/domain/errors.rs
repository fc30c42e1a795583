//! Structured error types for lockscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Hot-path failures never reach the host program as errors; these types
//! cover the cold paths (configuration, lifecycle, offline reports).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Object pool exhausted after {blocks} blocks")]
    Exhausted { blocks: usize },

    #[error("Validator rejected the freshly constructed object")]
    Rejected,

    #[error("Thread-local pool is unavailable (thread is exiting)")]
    ThreadLocalUnavailable,

    #[error("Item does not belong to this pool")]
    ForeignItem,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("Slot id {0} was never allocated")]
    UnknownId(usize),

    #[error("Slot id {0} is already free")]
    AlreadyFree(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Grab interval must be greater than zero")]
    ZeroGrabInterval,

    #[error("max_pending_samples must be greater than zero")]
    ZeroMaxPending,

    #[error("expected_per_second must be greater than zero")]
    ZeroExpectedRate,
}

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Failed to spawn {thread} thread: {source}")]
    ThreadSpawn {
        thread: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Contention profiler is already running")]
    AlreadyRunning,

    #[error("Contention profiler is not running")]
    NotRunning,

    #[error("Global contention context already initialised")]
    ContextAlreadyInstalled,

    #[error(transparent)]
    Collector(#[from] CollectorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Missing profile header (expected {expected:?})")]
    MissingHeader { expected: &'static str },

    #[error("Malformed contention record at line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::Exhausted { blocks: 4096 };
        assert_eq!(err.to_string(), "Object pool exhausted after 4096 blocks");
    }

    #[test]
    fn test_thread_spawn_error_keeps_source() {
        let err = CollectorError::ThreadSpawn {
            thread: "grab",
            source: std::io::Error::other("resource temporarily unavailable"),
        };
        assert!(err.to_string().contains("grab"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_error_converts_into_collector_error() {
        let err: CollectorError = ConfigError::ZeroMaxPending.into();
        assert_eq!(err.to_string(), "max_pending_samples must be greater than zero");
    }

    #[test]
    fn test_malformed_record_error() {
        let err = ReportError::MalformedRecord { line: 7, reason: "missing '@'".to_string() };
        assert!(err.to_string().contains("line 7"));
        assert!(err.to_string().contains("missing '@'"));
    }
}
