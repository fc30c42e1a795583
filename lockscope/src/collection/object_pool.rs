//! Arena object pool
//!
//! Per-type allocator for sample records. Storage is carved out of
//! fixed-size blocks that are never freed, so a slot address stays valid for
//! the whole process and a recycled slot can never be observed through a
//! dangling reference.
//!
//! ```text
//!   acquire:  local free batch ─▶ global free chunk ─▶ bump in local block ─▶ new block
//!   release:  local free batch ──(batch full)──▶ global free-chunk stack
//! ```
//!
//! The global free-chunk stack is the only cross-thread contention point
//! and is touched once per batch, not once per item. Block growth takes a
//! short lock; reads of the block directory are lock-free.
//!
//! Ownership of a live value is carried by exactly one [`PoolItem`] or one
//! [`ItemList`]. Dropping either destroys the value and recycles the slot.

#![allow(unsafe_code)] // slot values are `MaybeUninit`, ownership is tracked by the tokens below

use super::linked_list::{Linked, Links};
use super::lock;
use super::slot_directory::{self, SlotId};
use crate::domain::PoolError;
use serde::Serialize;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{ManuallyDrop, MaybeUninit};
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

/// Upper bound on block groups in one pool
pub const MAX_BLOCK_GROUPS: usize = 512;

/// Blocks per block group
pub const BLOCKS_PER_GROUP: usize = 256;

const BLOCK_BYTES: usize = 64 * 1024;
const MAX_ITEMS_PER_BLOCK: usize = 256;

/// Storage for one item plus its intrusive links
pub struct Slot<T: Send + 'static> {
    links: Links<Slot<T>>,
    pool: &'static ObjectPool<T>,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the value is only reached through the single `PoolItem` or
// `ItemList` that owns the slot; shared `&Slot` access touches atomics only.
unsafe impl<T: Send + 'static> Sync for Slot<T> {}

impl<T: Send + 'static> Linked for Slot<T> {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

impl<T: Send + 'static> Slot<T> {
    /// # Safety
    /// The slot must hold a live value owned by the caller.
    unsafe fn value_ref(&self) -> &T {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.value.get()).assume_init_ref() }
    }

    /// # Safety
    /// The slot must hold a live value exclusively owned by the caller.
    #[allow(clippy::mut_from_ref)]
    unsafe fn value_mut(&self) -> &mut T {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.value.get()).assume_init_mut() }
    }
}

struct BlockGroup<T: Send + 'static> {
    blocks: Box<[OnceLock<&'static [Slot<T>]>]>,
    len: AtomicUsize,
}

impl<T: Send + 'static> BlockGroup<T> {
    fn new() -> Self {
        Self { blocks: (0..BLOCKS_PER_GROUP).map(|_| OnceLock::new()).collect(), len: AtomicUsize::new(0) }
    }
}

/// Construction options for [`ObjectPool`]
pub struct PoolOptions<T> {
    /// Rejects a freshly constructed value; the value is destroyed and the
    /// acquisition fails with [`PoolError::Rejected`].
    pub validator: Option<fn(&T) -> bool>,
    /// Hard cap on blocks (never above `MAX_BLOCK_GROUPS * BLOCKS_PER_GROUP`)
    pub max_blocks: usize,
}

impl<T> Default for PoolOptions<T> {
    fn default() -> Self {
        Self { validator: None, max_blocks: MAX_BLOCK_GROUPS * BLOCKS_PER_GROUP }
    }
}

/// Snapshot of a pool's footprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub block_groups: usize,
    pub blocks: usize,
    pub items_per_block: usize,
    pub item_size: usize,
    pub free_chunks: usize,
}

/// Per-thread allocation state, kept in the slot directory
struct LocalPool<T: Send + 'static> {
    free: Vec<&'static Slot<T>>,
    block: Option<&'static [Slot<T>]>,
    used: usize,
    pool: &'static ObjectPool<T>,
}

impl<T: Send + 'static> Drop for LocalPool<T> {
    fn drop(&mut self) {
        // Hand everything this thread still holds back to other threads.
        if !self.free.is_empty() {
            self.pool.push_chunk(std::mem::take(&mut self.free));
        }
        if let Some(block) = self.block.take() {
            if self.used < block.len() {
                self.pool.push_chunk(block[self.used..].iter().collect());
            }
        }
    }
}

pub struct ObjectPool<T: Send + 'static> {
    local: SlotId,
    groups: Box<[OnceLock<BlockGroup<T>>]>,
    ngroup: AtomicUsize,
    nblock: AtomicUsize,
    grow: Mutex<()>,
    free_chunks: Mutex<Vec<Vec<&'static Slot<T>>>>,
    free_chunk_count: AtomicUsize,
    options: PoolOptions<T>,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Items per block, sized so a block stays around 64 KiB.
    pub const ITEMS_PER_BLOCK: usize = {
        let size = std::mem::size_of::<Slot<T>>();
        let fit = if size == 0 { MAX_ITEMS_PER_BLOCK } else { BLOCK_BYTES / size };
        if fit == 0 {
            1
        } else if fit > MAX_ITEMS_PER_BLOCK {
            MAX_ITEMS_PER_BLOCK
        } else {
            fit
        }
    };

    /// Items per thread-local free batch before it is pushed globally.
    pub const FREE_CHUNK_ITEMS: usize = Self::ITEMS_PER_BLOCK;

    /// Create a process-lifetime pool.
    #[must_use]
    pub fn leak() -> &'static Self {
        Self::leak_with(PoolOptions::default())
    }

    #[must_use]
    pub fn leak_with(options: PoolOptions<T>) -> &'static Self {
        let max_groups = options.max_blocks.div_ceil(BLOCKS_PER_GROUP).clamp(1, MAX_BLOCK_GROUPS);
        Box::leak(Box::new(Self {
            local: slot_directory::create_id(),
            groups: (0..max_groups).map(|_| OnceLock::new()).collect(),
            ngroup: AtomicUsize::new(0),
            nblock: AtomicUsize::new(0),
            grow: Mutex::new(()),
            free_chunks: Mutex::new(Vec::new()),
            free_chunk_count: AtomicUsize::new(0),
            options,
        }))
    }

    /// Move `value` into a pooled slot.
    pub fn acquire(&'static self, value: T) -> Result<PoolItem<T>, PoolError> {
        self.acquire_with(|| value)
    }

    /// Construct the value only once a slot is available.
    pub fn acquire_with(&'static self, make: impl FnOnce() -> T) -> Result<PoolItem<T>, PoolError> {
        let slot = slot_directory::with_slot(
            self.local,
            || self.new_local(),
            |local| self.take_slot(local),
        )
        .ok_or(PoolError::ThreadLocalUnavailable)??;

        // SAFETY: the slot came off a free list or fresh block storage, so
        // it is uninitialised and owned by nobody else.
        unsafe { (*slot.value.get()).write(make()) };
        let item = PoolItem { slot, _owns: PhantomData };

        if let Some(validate) = self.options.validator {
            if !validate(&*item) {
                return Err(PoolError::Rejected);
            }
        }
        Ok(item)
    }

    #[must_use]
    pub fn describe(&self) -> PoolInfo {
        PoolInfo {
            block_groups: self.ngroup.load(Ordering::Acquire),
            blocks: self.nblock.load(Ordering::Acquire),
            items_per_block: Self::ITEMS_PER_BLOCK,
            item_size: std::mem::size_of::<T>(),
            free_chunks: self.free_chunk_count.load(Ordering::Relaxed),
        }
    }

    /// Lock-free lookup of a block by its global index.
    fn block_at(&self, index: usize) -> Option<&'static [Slot<T>]> {
        let group = self.groups.get(index / BLOCKS_PER_GROUP)?.get()?;
        if index % BLOCKS_PER_GROUP >= group.len.load(Ordering::Acquire) {
            return None;
        }
        group.blocks[index % BLOCKS_PER_GROUP].get().copied()
    }

    fn new_local(&'static self) -> LocalPool<T> {
        LocalPool { free: Vec::with_capacity(Self::FREE_CHUNK_ITEMS), block: None, used: 0, pool: self }
    }

    fn take_slot(&'static self, local: &mut LocalPool<T>) -> Result<&'static Slot<T>, PoolError> {
        if let Some(slot) = local.free.pop() {
            return Ok(slot);
        }
        if let Some(chunk) = self.pop_chunk() {
            local.free = chunk;
            if let Some(slot) = local.free.pop() {
                return Ok(slot);
            }
        }
        if let Some(block) = local.block {
            if local.used < block.len() {
                local.used += 1;
                return Ok(&block[local.used - 1]);
            }
        }
        let block = self.add_block()?;
        local.block = Some(block);
        local.used = 1;
        Ok(&block[0])
    }

    fn add_block(&'static self) -> Result<&'static [Slot<T>], PoolError> {
        let _grow = lock(&self.grow);
        let index = self.nblock.load(Ordering::Relaxed);
        if index >= self.options.max_blocks || index / BLOCKS_PER_GROUP >= self.groups.len() {
            return Err(PoolError::Exhausted { blocks: index });
        }

        let group_index = index / BLOCKS_PER_GROUP;
        let group = self.groups[group_index].get_or_init(BlockGroup::new);
        self.ngroup.store(group_index + 1, Ordering::Release);

        let slots: Box<[Slot<T>]> = (0..Self::ITEMS_PER_BLOCK)
            .map(|_| Slot { links: Links::new(), pool: self, value: UnsafeCell::new(MaybeUninit::uninit()) })
            .collect();
        let block: &'static [Slot<T>] = Box::leak(slots);
        let block = *group.blocks[index % BLOCKS_PER_GROUP].get_or_init(|| block);
        group.len.store(index % BLOCKS_PER_GROUP + 1, Ordering::Release);
        self.nblock.store(index + 1, Ordering::Release);
        Ok(block)
    }

    fn pop_chunk(&self) -> Option<Vec<&'static Slot<T>>> {
        if self.free_chunk_count.load(Ordering::Relaxed) == 0 {
            return None;
        }
        let chunk = lock(&self.free_chunks).pop();
        if chunk.is_some() {
            self.free_chunk_count.fetch_sub(1, Ordering::Relaxed);
        }
        chunk
    }

    fn push_chunk(&self, chunk: Vec<&'static Slot<T>>) {
        lock(&self.free_chunks).push(chunk);
        self.free_chunk_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Return a slot whose value has already been destroyed.
    fn recycle(&'static self, slot: &'static Slot<T>) {
        debug_assert!(!slot.is_linked());
        let pushed = slot_directory::with_slot(
            self.local,
            || self.new_local(),
            |local| {
                local.free.push(slot);
                if local.free.len() >= Self::FREE_CHUNK_ITEMS {
                    let full = std::mem::replace(&mut local.free, Vec::with_capacity(Self::FREE_CHUNK_ITEMS));
                    self.push_chunk(full);
                }
            },
        );
        if pushed.is_none() {
            // Thread is exiting or the directory is busy: publish directly.
            self.push_chunk(vec![slot]);
        }
    }

    /// Returns `true` if `slot` lives in one of this pool's blocks.
    fn owns(&self, slot: &Slot<T>) -> bool {
        (0..self.nblock.load(Ordering::Acquire))
            .filter_map(|i| self.block_at(i))
            .any(|block| block.as_ptr_range().contains(&ptr::from_ref(slot)))
    }
}

impl<T: Send + 'static> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool").field("info", &self.describe()).finish()
    }
}

/// Owning handle to one pooled value
pub struct PoolItem<T: Send + 'static> {
    slot: &'static Slot<T>,
    _owns: PhantomData<T>,
}

impl<T: Send + 'static> PoolItem<T> {
    /// The pool this item returns to.
    #[must_use]
    pub fn pool(&self) -> &'static ObjectPool<T> {
        self.slot.pool
    }

    /// Move the value out and recycle the slot.
    #[must_use]
    pub fn into_inner(self) -> T {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` owned the live value and is never dropped, so the
        // value is read exactly once.
        let value = unsafe { (*this.slot.value.get()).assume_init_read() };
        this.slot.pool.recycle(this.slot);
        value
    }

    /// Give the item back to `pool` explicitly.
    ///
    /// Fails with [`PoolError::ForeignItem`] (returning nothing) if the
    /// item belongs to another pool; the item is still released to its
    /// own pool.
    pub fn release_to(self, pool: &ObjectPool<T>) -> Result<(), PoolError> {
        let foreign = !ptr::eq(self.slot.pool, pool) || !pool.owns(self.slot);
        drop(self);
        if foreign {
            Err(PoolError::ForeignItem)
        } else {
            Ok(())
        }
    }

    fn into_slot(self) -> &'static Slot<T> {
        ManuallyDrop::new(self).slot
    }
}

impl<T: Send + 'static> Deref for PoolItem<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a PoolItem always owns a live value.
        unsafe { self.slot.value_ref() }
    }
}

impl<T: Send + 'static> DerefMut for PoolItem<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a PoolItem always owns a live value, exclusively.
        unsafe { self.slot.value_mut() }
    }
}

impl<T: Send + 'static> Drop for PoolItem<T> {
    fn drop(&mut self) {
        // SAFETY: the value is live and owned by this item; the slot is
        // recycled right after, so it is never read again.
        unsafe { (*self.slot.value.get()).assume_init_drop() };
        self.slot.pool.recycle(self.slot);
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for PoolItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PoolItem").field(&**self).finish()
    }
}

/// Ordered list of pooled items, spliced in O(1)
pub struct ItemList<T: Send + 'static> {
    head: Option<&'static Slot<T>>,
    len: usize,
    _owns: PhantomData<T>,
}

impl<T: Send + 'static> ItemList<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None, len: 0, _owns: PhantomData }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, item: PoolItem<T>) {
        let slot = item.into_slot();
        match self.head {
            Some(head) => head.insert_before(slot),
            None => self.head = Some(slot),
        }
        self.len += 1;
    }

    pub fn pop_front(&mut self) -> Option<PoolItem<T>> {
        let head = self.head?;
        let next = head.next_node();
        self.head = if ptr::eq(next, head) { None } else { Some(next) };
        head.remove_from_list();
        self.len -= 1;
        Some(PoolItem { slot: head, _owns: PhantomData })
    }

    /// Move every item of `other` to the back of `self`, leaving `other`
    /// empty.
    pub fn append(&mut self, other: &mut ItemList<T>) {
        let Some(other_head) = other.head.take() else {
            return;
        };
        match self.head {
            Some(head) => head.insert_before_as_list(other_head),
            None => self.head = Some(other_head),
        }
        self.len += std::mem::take(&mut other.len);
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { head: self.head, next: self.head, remaining: self.len, _list: PhantomData }
    }
}

impl<T: Send + 'static> Default for ItemList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Drop for ItemList<T> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for ItemList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Send + 'static> Extend<PoolItem<T>> for ItemList<T> {
    fn extend<I: IntoIterator<Item = PoolItem<T>>>(&mut self, iter: I) {
        for item in iter {
            self.push_back(item);
        }
    }
}

impl<T: Send + 'static> FromIterator<PoolItem<T>> for ItemList<T> {
    fn from_iter<I: IntoIterator<Item = PoolItem<T>>>(iter: I) -> Self {
        let mut list = Self::new();
        list.extend(iter);
        list
    }
}

pub struct Iter<'a, T: Send + 'static> {
    head: Option<&'static Slot<T>>,
    next: Option<&'static Slot<T>>,
    remaining: usize,
    _list: PhantomData<&'a ItemList<T>>,
}

impl<'a, T: Send + 'static> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.next?;
        self.remaining -= 1;
        let after = slot.next_node();
        self.next = if self.head.is_some_and(|h| ptr::eq(after, h)) { None } else { Some(after) };
        // SAFETY: the list owns the live value and is borrowed for 'a.
        Some(unsafe { slot.value_ref() })
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a ItemList<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
