//! Intrusive circular doubly-linked list
//!
//! Nodes are `'static` (pool slots are never freed), so a link can always be
//! turned back into a reference. An unlinked node is a ring of one: its
//! links point at itself, encoded as null so links can be built in `const`
//! context.
//!
//! Links are atomics with `Relaxed` ordering only to make nodes `Sync`; a
//! ring is owned by exactly one list owner at a time and every hand-off
//! between threads goes through a mutex, which provides the ordering.

#![allow(unsafe_code)] // link pointers are turned back into `&'static` nodes

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Prev/next links embedded in a node
pub struct Links<N> {
    prev: AtomicPtr<N>,
    next: AtomicPtr<N>,
}

impl<N> Links<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { prev: AtomicPtr::new(ptr::null_mut()), next: AtomicPtr::new(ptr::null_mut()) }
    }
}

impl<N> Default for Links<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> std::fmt::Debug for Links<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Links")
            .field("prev", &self.prev.load(Ordering::Relaxed))
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

fn resolve<N: Linked>(node: &'static N, link: *mut N) -> &'static N {
    if link.is_null() {
        node
    } else {
        // SAFETY: links only ever store pointers derived from `&'static N`
        // (see `encode`), and nodes are never freed.
        unsafe { &*link }
    }
}

fn encode<N>(node: &'static N, target: &'static N) -> *mut N {
    if ptr::eq(node, target) {
        ptr::null_mut()
    } else {
        ptr::from_ref(target).cast_mut()
    }
}

/// A node that can live in an intrusive ring.
///
/// All ring operations require that the caller owns every ring involved;
/// they are memory-safe regardless, but concurrent mutation of one ring
/// from two threads scrambles its order.
pub trait Linked: Sized + Sync + 'static {
    fn links(&self) -> &Links<Self>;

    fn next_node(&'static self) -> &'static Self {
        resolve(self, self.links().next.load(Ordering::Relaxed))
    }

    fn prev_node(&'static self) -> &'static Self {
        resolve(self, self.links().prev.load(Ordering::Relaxed))
    }

    /// Returns `true` if the node shares a ring with at least one other node.
    fn is_linked(&'static self) -> bool {
        !ptr::eq(self.next_node(), self)
    }

    /// Insert the single node `node` right before `self`.
    ///
    /// `node` must be unlinked. Inserting before the head of a ring appends
    /// at its tail.
    fn insert_before(&'static self, node: &'static Self) {
        debug_assert!(!node.is_linked());
        let prev = self.prev_node();
        set_next(node, self);
        set_prev(node, prev);
        set_next(prev, node);
        set_prev(self, node);
    }

    /// Insert the single node `node` right after `self`.
    fn insert_after(&'static self, node: &'static Self) {
        debug_assert!(!node.is_linked());
        let next = self.next_node();
        set_prev(node, self);
        set_next(node, next);
        set_prev(next, node);
        set_next(self, node);
    }

    /// Splice the whole ring containing `head` right before `self`, keeping
    /// its order starting at `head`. O(1) regardless of ring length.
    fn insert_before_as_list(&'static self, head: &'static Self) {
        let tail = head.prev_node();
        let prev = self.prev_node();
        set_next(tail, self);
        set_prev(head, prev);
        set_next(prev, head);
        set_prev(self, tail);
    }

    /// Unlink `self`, leaving it as a ring of one. No-op when unlinked.
    fn remove_from_list(&'static self) {
        let prev = self.prev_node();
        let next = self.next_node();
        set_next(prev, next);
        set_prev(next, prev);
        self.links().prev.store(ptr::null_mut(), Ordering::Relaxed);
        self.links().next.store(ptr::null_mut(), Ordering::Relaxed);
    }
}

fn set_next<N: Linked>(node: &'static N, target: &'static N) {
    node.links().next.store(encode(node, target), Ordering::Relaxed);
}

fn set_prev<N: Linked>(node: &'static N, target: &'static N) {
    node.links().prev.store(encode(node, target), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        links: Links<Node>,
        value: u32,
    }

    impl Linked for Node {
        fn links(&self) -> &Links<Self> {
            &self.links
        }
    }

    fn node(value: u32) -> &'static Node {
        Box::leak(Box::new(Node { links: Links::new(), value }))
    }

    fn ring_values(head: &'static Node) -> Vec<u32> {
        let mut values = vec![head.value];
        let mut cur = head.next_node();
        while !ptr::eq(cur, head) {
            values.push(cur.value);
            cur = cur.next_node();
        }
        values
    }

    #[test]
    fn test_unlinked_node_is_its_own_ring() {
        let a = node(1);
        assert!(!a.is_linked());
        assert!(ptr::eq(a.next_node(), a));
        assert!(ptr::eq(a.prev_node(), a));
    }

    #[test]
    fn test_insert_before_appends_at_tail() {
        let head = node(1);
        head.insert_before(node(2));
        head.insert_before(node(3));
        assert_eq!(ring_values(head), vec![1, 2, 3]);
        assert_eq!(head.prev_node().value, 3);
    }

    #[test]
    fn test_insert_after() {
        let head = node(1);
        head.insert_after(node(3));
        head.insert_after(node(2));
        assert_eq!(ring_values(head), vec![1, 2, 3]);
    }

    #[test]
    fn test_splice_whole_ring_keeps_order() {
        let a = node(1);
        a.insert_before(node(2));
        let b = node(3);
        b.insert_before(node(4));
        b.insert_before(node(5));

        a.insert_before_as_list(b);
        assert_eq!(ring_values(a), vec![1, 2, 3, 4, 5]);
        assert_eq!(ring_values(b), vec![3, 4, 5, 1, 2]);
    }

    #[test]
    fn test_splice_single_nodes() {
        let a = node(1);
        let b = node(2);
        a.insert_before_as_list(b);
        assert_eq!(ring_values(a), vec![1, 2]);
    }

    #[test]
    fn test_remove_from_list() {
        let head = node(1);
        let mid = node(2);
        head.insert_before(mid);
        head.insert_before(node(3));

        mid.remove_from_list();
        assert!(!mid.is_linked());
        assert_eq!(ring_values(head), vec![1, 3]);

        // removing an unlinked node is harmless
        mid.remove_from_list();
        assert!(!mid.is_linked());
    }
}
