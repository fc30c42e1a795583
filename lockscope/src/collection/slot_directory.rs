//! Thread-local slot directory
//!
//! Every accumulator instance owns a [`SlotId`]; every thread lazily gets
//! its own slot for that id. Slots live in fixed-size blocks that are only
//! ever appended, so a slot never moves for the lifetime of its thread.
//!
//! Ids are recycled. A generation counter distinguishes the current owner
//! of an index from a previous one, so a stale slot left behind on some
//! thread is re-initialised instead of being handed to the new owner.
//!
//! When a thread exits, its slot blocks are dropped; the values' `Drop`
//! impls are the thread-exit hook (see `combiner::AgentHandle`). Those
//! impls run while the directory is being torn down, so they must not
//! block and must not rely on thread-local state.

use super::lock;
use crate::domain::SlotError;
use std::any::Any;
use std::cell::RefCell;
use std::sync::Mutex;

/// Slots per block
pub const SLOTS_PER_BLOCK: usize = 64;

/// Identity of one logical slot across all threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

impl SlotId {
    #[must_use]
    pub fn index(self) -> usize {
        self.index
    }
}

#[derive(Default)]
struct IdPool {
    generations: Vec<u64>,
    live: Vec<bool>,
    free: Vec<usize>,
}

static IDS: Mutex<IdPool> = Mutex::new(IdPool {
    generations: Vec::new(),
    live: Vec::new(),
    free: Vec::new(),
});

/// Allocate a fresh or recycled slot id.
pub fn create_id() -> SlotId {
    let mut ids = lock(&IDS);
    let index = match ids.free.pop() {
        Some(index) => index,
        None => {
            ids.generations.push(0);
            ids.live.push(false);
            ids.generations.len() - 1
        }
    };
    ids.live[index] = true;
    SlotId { index, generation: ids.generations[index] }
}

/// Return `id` to the recycle pool.
///
/// Slots already materialised for `id` on other threads are left in place
/// and re-initialised by whichever owner reuses the index.
pub fn destroy_id(id: SlotId) -> Result<(), SlotError> {
    let mut ids = lock(&IDS);
    if id.index >= ids.generations.len() {
        return Err(SlotError::UnknownId(id.index));
    }
    if !ids.live[id.index] || ids.generations[id.index] != id.generation {
        return Err(SlotError::AlreadyFree(id.index));
    }
    ids.live[id.index] = false;
    ids.generations[id.index] += 1;
    ids.free.push(id.index);
    Ok(())
}

struct Entry {
    generation: u64,
    value: Box<dyn Any>,
}

type Block = Box<[Option<Entry>]>;

#[derive(Default)]
struct ThreadSlots {
    blocks: Vec<Block>,
}

impl ThreadSlots {
    fn entry(&mut self, index: usize) -> &mut Option<Entry> {
        let block = index / SLOTS_PER_BLOCK;
        while self.blocks.len() <= block {
            self.blocks.push((0..SLOTS_PER_BLOCK).map(|_| None).collect());
        }
        &mut self.blocks[block][index % SLOTS_PER_BLOCK]
    }

    fn existing(&mut self, index: usize) -> Option<&mut Option<Entry>> {
        self.blocks.get_mut(index / SLOTS_PER_BLOCK).map(|b| &mut b[index % SLOTS_PER_BLOCK])
    }
}

thread_local! {
    static SLOTS: RefCell<ThreadSlots> = RefCell::new(ThreadSlots::default());
}

/// Run `f` on this thread's slot for `id`, creating it with `init` first if
/// the slot is empty or was left behind by a previous owner of the index.
///
/// Returns `None` when the directory is unavailable: the thread is exiting,
/// or this call is nested inside another `with_slot` on the same thread.
/// `init` and `f` run while the directory is borrowed and must not call back
/// into it.
pub fn with_slot<T, R>(id: SlotId, init: impl FnOnce() -> T, f: impl FnOnce(&mut T) -> R) -> Option<R>
where
    T: 'static,
{
    SLOTS
        .try_with(|cell| {
            let mut slots = cell.try_borrow_mut().ok()?;
            let entry = slots.entry(id.index);
            let current = entry
                .as_ref()
                .is_some_and(|e| e.generation == id.generation && e.value.is::<T>());
            let mut stale = None;
            if !current {
                stale = entry.replace(Entry { generation: id.generation, value: Box::new(init()) });
            }
            let result = entry
                .as_mut()
                .and_then(|e| e.value.downcast_mut::<T>())
                .map(f);
            drop(slots);
            // The previous owner's value may have a Drop that needs the
            // directory; run it after the borrow ends.
            drop(stale);
            result
        })
        .ok()
        .flatten()
}

/// Remove and return this thread's value for `id`, if it holds one.
pub fn take_slot<T: 'static>(id: SlotId) -> Option<T> {
    SLOTS
        .try_with(|cell| {
            let mut slots = cell.try_borrow_mut().ok()?;
            let entry = slots.existing(id.index)?;
            if !entry.as_ref().is_some_and(|e| e.generation == id.generation && e.value.is::<T>()) {
                return None;
            }
            let taken = entry.take()?;
            drop(slots);
            taken.value.downcast::<T>().ok().map(|boxed| *boxed)
        })
        .ok()
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ids_are_recycled_with_new_generation() {
        let a = create_id();
        destroy_id(a).unwrap();
        let b = create_id();
        // Another test may grab the freed index first; only check that a
        // reused index never repeats a generation.
        if b.index() == a.index() {
            assert_ne!(a, b);
        }
        destroy_id(b).unwrap();
    }

    #[test]
    fn test_double_destroy_is_rejected() {
        let id = create_id();
        destroy_id(id).unwrap();
        assert_eq!(destroy_id(id), Err(SlotError::AlreadyFree(id.index())));
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let bogus = SlotId { index: usize::MAX / 2, generation: 0 };
        assert_eq!(destroy_id(bogus), Err(SlotError::UnknownId(usize::MAX / 2)));
    }

    #[test]
    fn test_slot_is_per_thread() {
        let id = create_id();
        with_slot(id, || 0_u32, |v| *v += 5).unwrap();
        assert_eq!(with_slot(id, || 0_u32, |v| *v), Some(5));

        let other = std::thread::spawn(move || with_slot(id, || 0_u32, |v| *v)).join().unwrap();
        assert_eq!(other, Some(0));
        destroy_id(id).unwrap();
    }

    #[test]
    fn test_stale_generation_is_reinitialised() {
        let old = create_id();
        with_slot(old, || 7_u32, |_| ()).unwrap();
        let forged = SlotId { index: old.index(), generation: old.generation + 1 };
        assert_eq!(with_slot(forged, || 1_u32, |v| *v), Some(1));
        destroy_id(old).unwrap();
    }

    #[test]
    fn test_nested_access_is_refused() {
        let outer = create_id();
        let inner = create_id();
        let nested = with_slot(outer, || 0_u8, |_| with_slot(inner, || 0_u8, |v| *v));
        assert_eq!(nested, Some(None));
        destroy_id(outer).unwrap();
        destroy_id(inner).unwrap();
    }

    #[test]
    fn test_take_slot_and_thread_exit_drop() {
        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let id = create_id();

        let taken = with_slot(id, || Counted(Arc::clone(&drops)), |_| ())
            .and_then(|()| take_slot::<Counted>(id));
        assert!(taken.is_some());
        drop(taken);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(take_slot::<Counted>(id).is_none());

        let thread_drops = Arc::clone(&drops);
        std::thread::spawn(move || {
            with_slot(id, || Counted(thread_drops), |_| ());
        })
        .join()
        .unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        destroy_id(id).unwrap();
    }

    #[test]
    fn test_slots_beyond_first_block() {
        let ids: Vec<SlotId> = (0..SLOTS_PER_BLOCK + 3).map(|_| create_id()).collect();
        for (i, id) in ids.iter().enumerate() {
            with_slot(*id, || i, |_| ()).unwrap();
        }
        for (i, id) in ids.iter().enumerate() {
            assert_eq!(with_slot(*id, || usize::MAX, |v| *v), Some(i));
        }
        for id in ids {
            destroy_id(id).unwrap();
        }
    }
}
