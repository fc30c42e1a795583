//! Sampling and aggregation engine
//!
//! Leaf-to-root:
//! - `linked_list`: intrusive ring over pool slots (O(1) splice)
//! - `object_pool`: per-type arena with thread-local free batches
//! - `slot_directory`: per-thread storage addressed by a small id
//! - `combiner`: sharded accumulation (per-thread agents + global value)
//! - `speed_limit`: adaptive sampling-range controller
//! - `collector`: grab/dump background pipeline built on the above
//!
//! Producer threads only ever touch their own thread-local state plus one
//! per-agent mutex. Global locks are limited to id allocation, block growth,
//! the free-chunk stack and the grab → dump hand-off.

pub mod collector;
pub mod combiner;
pub mod linked_list;
pub mod object_pool;
pub mod slot_directory;
pub mod speed_limit;

pub use collector::{
    Collected, Collector, CollectorConfig, CollectorStats, Preprocessor, SubmitOutcome,
};
pub use combiner::{AddOp, Adder, BinaryOp, Combiner, MaxOp, Maxer, MinOp, Miner, Splice};
pub use object_pool::{ItemList, ObjectPool, PoolInfo, PoolItem, PoolOptions};
pub use speed_limit::{GrabWaker, SpeedLimit};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every mutex in the engine guards plain data whose invariants hold between
/// statements, so a poisoned lock is still consistent.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
