use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_utils::Backoff;
use petek::{HazardManaged, HazardMem, HazardMemConfig, HazardNode, Link, LinkVal};

use crate::cursor::{Cursor, Iter};

/// Hazard slots the list operations themselves need at their deepest;
/// cursors draw from `ITER_MAX` extra slots on top.
const ALG_HAZARDS: usize = 6;

#[repr(C)]
pub(crate) struct ListNode<T> {
    base: HazardNode,
    pub(crate) next: Link<ListNode<T>>,
    pub(crate) prev: Link<ListNode<T>>,
    val: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: values move between threads only through owned pops; shared
// access to links and metadata is atomic.
unsafe impl<T: Send> Send for ListNode<T> {}
unsafe impl<T: Send> Sync for ListNode<T> {}

impl<T> ListNode<T> {
    fn sentinel() -> Self {
        Self {
            base: HazardNode::new(),
            next: Link::new(),
            prev: Link::new(),
            val: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn with_value(value: T) -> Self {
        Self {
            base: HazardNode::new(),
            next: Link::new(),
            prev: Link::new(),
            val: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }
}

impl<T> HazardManaged for ListNode<T> {
    fn hazard_node(&self) -> &HazardNode {
        &self.base
    }
}

/// The list is its own reclamation config: two links per node, both of
/// which may transiently reference deleted nodes.
pub(crate) struct ListConfig<T, const ITER_MAX: usize>(PhantomData<fn(T)>);

impl<T: Send, const ITER_MAX: usize> HazardMemConfig for ListConfig<T, ITER_MAX> {
    type Node = ListNode<T>;
    const LINK_MAX: usize = 2;
    const LINK_DEL_MAX: usize = 2;
    const HAZARD_MAX: usize = ALG_HAZARDS + ITER_MAX;

    fn clean_up_node(&self, mem: &HazardMem<Self>, node: *mut ListNode<T>) {
        // Swing the tombstone's links past neighboring tombstones so a
        // chain of deleted nodes always reaches a live node in bounded
        // steps. `prev` walks left, `next` walks right.
        loop {
            let prev = mem.de_ref_link(unsafe { &(*node).prev });
            if prev.is_null() {
                break; // terminated concurrently
            }
            // A marked link on the neighbor itself is the deletion
            // witness; it is set before the neighbor ever reaches
            // delete_node.
            if !unsafe { &(*prev).prev }.load(Ordering::SeqCst).mark() {
                mem.release_ref(prev);
                break;
            }
            let prev2 = mem.de_ref_link(unsafe { &(*prev).prev });
            let cur = unsafe { &(*node).prev }.load(Ordering::SeqCst);
            if cur.ptr() == prev && !prev2.is_null() {
                let _ = mem.cas_ref(
                    unsafe { &(*node).prev },
                    LinkVal::new(prev2, cur.mark()),
                    cur,
                );
            }
            if !prev2.is_null() {
                mem.release_ref(prev2);
            }
            mem.release_ref(prev);
        }
        loop {
            let next = mem.de_ref_link(unsafe { &(*node).next });
            if next.is_null() {
                break;
            }
            if !unsafe { &(*next).next }.load(Ordering::SeqCst).mark() {
                mem.release_ref(next);
                break;
            }
            let next2 = mem.de_ref_link(unsafe { &(*next).next });
            let cur = unsafe { &(*node).next }.load(Ordering::SeqCst);
            if cur.ptr() == next && !next2.is_null() {
                let _ = mem.cas_ref(
                    unsafe { &(*node).next },
                    LinkVal::new(next2, cur.mark()),
                    cur,
                );
            }
            if !next2.is_null() {
                mem.release_ref(next2);
            }
            mem.release_ref(next);
        }
    }

    fn terminate_node(&self, mem: &HazardMem<Self>, node: *mut ListNode<T>, concurrent: bool) {
        let prev = unsafe { &(*node).prev };
        let next = unsafe { &(*node).next };
        if !concurrent {
            mem.store_ref(prev, LinkVal::null());
            mem.store_ref(next, LinkVal::null());
            return;
        }
        for link in [prev, next] {
            loop {
                let old = link.load(Ordering::SeqCst);
                if old.ptr().is_null() {
                    break;
                }
                if mem.cas_ref(link, LinkVal::new(ptr::null_mut(), old.mark()), old) {
                    break;
                }
            }
        }
    }
}

/// Lock-free doubly-linked list.
///
/// At most `thread_max` distinct threads may touch one instance (see
/// [`LinkedList::with_thread_max`]); each thread may keep up to
/// `ITER_MAX` cursors alive at once.
pub struct LinkedList<T: Send, const ITER_MAX: usize = 4> {
    pub(crate) mem: HazardMem<ListConfig<T, ITER_MAX>>,
    pub(crate) head: *mut ListNode<T>,
    pub(crate) tail: *mut ListNode<T>,
    size: AtomicIsize,
}

// SAFETY: all shared state is managed through the hazard memory manager
// and atomic links.
unsafe impl<T: Send, const ITER_MAX: usize> Send for LinkedList<T, ITER_MAX> {}
unsafe impl<T: Send, const ITER_MAX: usize> Sync for LinkedList<T, ITER_MAX> {}

impl<T: Send> LinkedList<T> {
    pub fn new() -> Self {
        Self::with_thread_max(8)
    }
}

impl<T: Send> Default for LinkedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send, const ITER_MAX: usize> LinkedList<T, ITER_MAX> {
    /// Create a list usable by up to `thread_max` threads.
    pub fn with_thread_max(thread_max: usize) -> Self {
        let mem = HazardMem::new(ListConfig(PhantomData), thread_max);
        let head = mem.create_node(ListNode::sentinel());
        let tail = mem.create_node(ListNode::sentinel());
        mem.store_ref(unsafe { &(*head).next }, LinkVal::new(tail, false));
        mem.store_ref(unsafe { &(*tail).prev }, LinkVal::new(head, false));
        mem.release_ref(head);
        mem.release_ref(tail);
        Self {
            mem,
            head,
            tail,
            size: AtomicIsize::new(0),
        }
    }

    /// Number of elements. Transiently imprecise under concurrency,
    /// clamped to zero.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert at the front.
    pub fn push_front(&self, value: T) {
        let node = self.mem.create_node(ListNode::with_value(value));
        let mut next = self.mem.de_ref_link(unsafe { &(*self.head).next });
        let backoff = Backoff::new();
        loop {
            self.mem
                .store_ref(unsafe { &(*node).prev }, LinkVal::new(self.head, false));
            self.mem
                .store_ref(unsafe { &(*node).next }, LinkVal::new(next, false));
            if self.mem.cas_ref(
                unsafe { &(*self.head).next },
                LinkVal::new(node, false),
                LinkVal::new(next, false),
            ) {
                break;
            }
            self.mem.release_ref(next);
            next = self.mem.de_ref_link(unsafe { &(*self.head).next });
            backoff.spin();
        }
        self.push_end(node, next);
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    /// Insert at the back.
    pub fn push_back(&self, value: T) {
        let node = self.mem.create_node(ListNode::with_value(value));
        let next = self.tail;
        self.mem.ref_node(next);
        let mut prev = self.mem.de_ref_link(unsafe { &(*next).prev });
        let backoff = Backoff::new();
        loop {
            if unsafe { &(*prev).next }.load(Ordering::SeqCst) != LinkVal::new(next, false) {
                prev = self.correct_prev(prev, next);
                continue;
            }
            self.mem
                .store_ref(unsafe { &(*node).prev }, LinkVal::new(prev, false));
            self.mem
                .store_ref(unsafe { &(*node).next }, LinkVal::new(next, false));
            if self.mem.cas_ref(
                unsafe { &(*prev).next },
                LinkVal::new(node, false),
                LinkVal::new(next, false),
            ) {
                break;
            }
            backoff.spin();
        }
        self.mem.release_ref(prev);
        self.push_end(node, next);
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove and return the first element.
    pub fn pop_front(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let node = self.mem.de_ref_link(unsafe { &(*self.head).next });
            if node == self.tail {
                self.mem.release_ref(node);
                return None;
            }
            let link1 = unsafe { &(*node).next }.load(Ordering::SeqCst);
            if link1.mark() {
                // First node is mid-erase by another thread: help splice
                // it out of the forward chain, then retry.
                self.set_mark(unsafe { &(*node).prev });
                let _ = self.mem.cas_ref(
                    unsafe { &(*self.head).next },
                    LinkVal::new(link1.ptr(), false),
                    LinkVal::new(node, false),
                );
                self.mem.release_ref(node);
                backoff.spin();
                continue;
            }
            if unsafe { &(*node).next }.cas(link1, LinkVal::new(link1.ptr(), true)) {
                self.finish_remove(node);
                let value = unsafe { (*(*node).val.get()).assume_init_read() };
                self.size.fetch_sub(1, Ordering::AcqRel);
                self.mem.release_ref(node);
                self.mem.delete_node(node);
                return Some(value);
            }
            self.mem.release_ref(node);
            backoff.spin();
        }
    }

    /// Remove and return the last element.
    pub fn pop_back(&self) -> Option<T> {
        let next = self.tail;
        let mut node = self.mem.de_ref_link(unsafe { &(*next).prev });
        let backoff = Backoff::new();
        loop {
            if unsafe { &(*node).next }.load(Ordering::SeqCst) != LinkVal::new(next, false) {
                node = self.correct_prev(node, next);
                continue;
            }
            if node == self.head {
                self.mem.release_ref(node);
                return None;
            }
            if unsafe { &(*node).next }
                .cas(LinkVal::new(next, false), LinkVal::new(next, true))
            {
                self.finish_remove(node);
                let value = unsafe { (*(*node).val.get()).assume_init_read() };
                self.size.fetch_sub(1, Ordering::AcqRel);
                self.mem.release_ref(node);
                self.mem.delete_node(node);
                return Some(value);
            }
            backoff.spin();
        }
    }

    /// Copy of the first element, if any.
    pub fn front(&self) -> Option<T>
    where
        T: Copy,
    {
        let backoff = Backoff::new();
        loop {
            let node = self.mem.de_ref_link(unsafe { &(*self.head).next });
            if node == self.tail {
                self.mem.release_ref(node);
                return None;
            }
            if let Some(value) = self.read_validated(node) {
                self.mem.release_ref(node);
                return Some(value);
            }
            // Tombstone at the front: help and retry.
            self.set_mark(unsafe { &(*node).prev });
            let succ = unsafe { &(*node).next }.load(Ordering::SeqCst).ptr();
            let _ = self.mem.cas_ref(
                unsafe { &(*self.head).next },
                LinkVal::new(succ, false),
                LinkVal::new(node, false),
            );
            self.mem.release_ref(node);
            backoff.spin();
        }
    }

    /// Copy of the last element, if any.
    pub fn back(&self) -> Option<T>
    where
        T: Copy,
    {
        let next = self.tail;
        let mut node = self.mem.de_ref_link(unsafe { &(*next).prev });
        loop {
            if node == self.head {
                self.mem.release_ref(node);
                return None;
            }
            if unsafe { &(*node).next }.load(Ordering::SeqCst) == LinkVal::new(next, false) {
                if let Some(value) = self.read_validated(node) {
                    self.mem.release_ref(node);
                    return Some(value);
                }
            }
            node = self.correct_prev(node, next);
        }
    }

    /// Cursor on the first live element (or at the end when empty).
    pub fn cursor_front(&self) -> Cursor<'_, T, ITER_MAX> {
        self.mem.ref_node(self.head);
        let mut cursor = Cursor::new(self, self.head);
        cursor.move_next();
        cursor
    }

    /// Cursor on the last live element (or at the start when empty).
    pub fn cursor_back(&self) -> Cursor<'_, T, ITER_MAX> {
        self.mem.ref_node(self.tail);
        let mut cursor = Cursor::new(self, self.tail);
        cursor.move_prev();
        cursor
    }

    /// Iterator over element copies. Skips concurrently erased nodes.
    pub fn iter(&self) -> Iter<'_, T, ITER_MAX> {
        Iter::new(self.cursor_front())
    }

    /// Insert `value` before the cursor position. If the cursor sits on
    /// a tombstone it first advances to the next live node (or the end)
    /// and inserts before that.
    pub fn insert(&self, cursor: &mut Cursor<'_, T, ITER_MAX>, value: T) {
        assert!(
            cursor.node != self.head,
            "petek-list: insert before head sentinel"
        );
        if cursor.node != self.tail && unsafe { &(*cursor.node).next }.load(Ordering::SeqCst).mark()
        {
            cursor.move_next();
        }
        let node = self.mem.create_node(ListNode::with_value(value));
        let mut next = cursor.node;
        let mut prev = self.mem.de_ref_link(unsafe { &(*next).prev });
        let backoff = Backoff::new();
        loop {
            if unsafe { &(*prev).next }.load(Ordering::SeqCst) != LinkVal::new(next, false) {
                prev = self.correct_prev(prev, next);
                if unsafe { &(*next).next }.load(Ordering::SeqCst).mark() {
                    // The target was erased mid-insert: chase its
                    // replacement and retry there.
                    self.mem.release_ref(prev);
                    cursor.move_next();
                    next = cursor.node;
                    prev = self.mem.de_ref_link(unsafe { &(*next).prev });
                }
                continue;
            }
            self.mem
                .store_ref(unsafe { &(*node).prev }, LinkVal::new(prev, false));
            self.mem
                .store_ref(unsafe { &(*node).next }, LinkVal::new(next, false));
            if self.mem.cas_ref(
                unsafe { &(*prev).next },
                LinkVal::new(node, false),
                LinkVal::new(next, false),
            ) {
                break;
            }
            backoff.spin();
        }
        self.mem.release_ref(prev);
        // push_end consumes one hold on `next`; the cursor keeps its own.
        self.mem.ref_node(next);
        self.push_end(node, next);
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    /// Erase the element under the cursor. Returns the value when this
    /// call won the erase; a concurrent winner makes it return `None`.
    /// The cursor advances to the next live element either way.
    pub fn erase(&self, cursor: &mut Cursor<'_, T, ITER_MAX>) -> Option<T> {
        let node = cursor.node;
        assert!(
            node != self.head && node != self.tail,
            "petek-list: erase at sentinel"
        );
        let backoff = Backoff::new();
        let mut result = None;
        loop {
            let link1 = unsafe { &(*node).next }.load(Ordering::SeqCst);
            if link1.mark() {
                break; // another thread erased it first
            }
            if unsafe { &(*node).next }.cas(link1, LinkVal::new(link1.ptr(), true)) {
                self.finish_remove(node);
                result = Some(unsafe { (*(*node).val.get()).assume_init_read() });
                self.size.fetch_sub(1, Ordering::AcqRel);
                self.mem.delete_node(node);
                break;
            }
            backoff.spin();
        }
        cursor.move_next();
        result
    }

    /// Pop everything.
    pub fn clear(&self) {
        while self.pop_front().is_some() {}
    }

    /// Read a value copy bracketed by two unmarked observations of the
    /// node's `next` link. A winner moves the value out only after
    /// marking, so an unmarked re-read proves the bits were stable.
    pub(crate) fn read_validated(&self, node: *mut ListNode<T>) -> Option<T>
    where
        T: Copy,
    {
        if unsafe { &(*node).next }.load(Ordering::SeqCst).mark() {
            return None;
        }
        let bits = unsafe { ptr::read((*node).val.get()) };
        if unsafe { &(*node).next }.load(Ordering::SeqCst).mark() {
            return None;
        }
        Some(unsafe { bits.assume_init() })
    }

    /// Complete the physical removal of a node whose `next` is marked:
    /// mark its `prev`, then splice it out of both chains.
    fn finish_remove(&self, node: *mut ListNode<T>) {
        self.set_mark(unsafe { &(*node).prev });
        let next = self.mem.de_ref_link(unsafe { &(*node).next });
        let prev = self.mem.de_ref_link(unsafe { &(*node).prev });
        let prev = self.correct_prev(prev, next);
        self.mem.release_ref(prev);
        self.mem.release_ref(next);
    }

    /// Second half of an insertion: point `next.prev` back at `node`.
    /// Consumes the caller's holds on both `node` and `next`. Gives up
    /// when `node` was erased mid-insert or `next` gained a new
    /// predecessor; whoever caused that repairs the prev chain.
    fn push_end(&self, node: *mut ListNode<T>, next: *mut ListNode<T>) {
        let backoff = Backoff::new();
        loop {
            let link1 = unsafe { &(*next).prev }.load(Ordering::SeqCst);
            if link1.mark()
                || unsafe { &(*node).next }.load(Ordering::SeqCst) != LinkVal::new(next, false)
            {
                break;
            }
            if self
                .mem
                .cas_ref(unsafe { &(*next).prev }, LinkVal::new(node, false), link1)
            {
                if unsafe { &(*node).prev }.load(Ordering::SeqCst).mark() {
                    // Someone erased node between our two CASes; finish
                    // their prev repair.
                    self.mem.ref_node(node);
                    let p = self.correct_prev(node, next);
                    self.mem.release_ref(p);
                }
                break;
            }
            backoff.spin();
        }
        self.mem.release_ref(next);
        self.mem.release_ref(node);
    }

    /// Walk left/right from `prev` chasing over tombstones until finding
    /// the live predecessor of `node`, CAS `node.prev` to it, and splice
    /// out any tombstone crossed on the way. Consumes the caller's hold
    /// on `prev`; returns the (held) final predecessor candidate.
    pub(crate) fn correct_prev(
        &self,
        mut prev: *mut ListNode<T>,
        node: *mut ListNode<T>,
    ) -> *mut ListNode<T> {
        let mut last_link: *mut ListNode<T> = ptr::null_mut();
        let backoff = Backoff::new();
        loop {
            let link1 = unsafe { &(*node).prev }.load(Ordering::SeqCst);
            if link1.mark() {
                // node itself got deleted: undo the last advance and let
                // the caller observe the deletion.
                if !last_link.is_null() {
                    self.mem.release_ref(prev);
                    prev = last_link;
                    last_link = ptr::null_mut();
                }
                break;
            }
            let prev2 = self.mem.de_ref_link(unsafe { &(*prev).next });
            if prev2.is_null() {
                break;
            }
            if unsafe { &(*prev).next }.load(Ordering::SeqCst).mark() {
                if !last_link.is_null() {
                    // We advanced past a live link before `prev` died:
                    // splice the tombstone out of the forward chain.
                    self.set_mark(unsafe { &(*prev).prev });
                    let _ = self.mem.cas_ref(
                        unsafe { &(*last_link).next },
                        LinkVal::new(prev2, false),
                        LinkVal::new(prev, false),
                    );
                    self.mem.release_ref(prev2);
                    self.mem.release_ref(prev);
                    prev = last_link;
                    last_link = ptr::null_mut();
                    continue;
                }
                self.mem.release_ref(prev2);
                let prev3 = self.mem.de_ref_link(unsafe { &(*prev).prev });
                self.mem.release_ref(prev);
                prev = prev3;
                continue;
            }
            if prev2 != node {
                if !last_link.is_null() {
                    self.mem.release_ref(last_link);
                }
                last_link = prev;
                prev = prev2;
                continue;
            }
            self.mem.release_ref(prev2);
            if self
                .mem
                .cas_ref(unsafe { &(*node).prev }, LinkVal::new(prev, false), link1)
            {
                if unsafe { &(*prev).prev }.load(Ordering::SeqCst).mark() {
                    continue;
                }
                break;
            }
            backoff.spin();
        }
        if !last_link.is_null() {
            self.mem.release_ref(last_link);
        }
        prev
    }

    pub(crate) fn set_mark(&self, link: &Link<ListNode<T>>) {
        loop {
            let l = link.load(Ordering::SeqCst);
            if l.mark() || link.cas(l, LinkVal::new(l.ptr(), true)) {
                break;
            }
        }
    }
}

impl<T: Send, const ITER_MAX: usize> Drop for LinkedList<T, ITER_MAX> {
    fn drop(&mut self) {
        // Drain values; node memory goes back through the manager's pool.
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build the half-erased state a concurrent eraser leaves between
    /// marking a node's links and repairing the chains, then check that
    /// a traversal walking past the tombstones physically unlinks them
    /// from the forward chain rather than just skipping them.
    #[test]
    fn traversal_splices_tombstones_out_of_the_forward_chain() {
        let list: LinkedList<i32> = LinkedList::new();
        for i in 0..5 {
            list.push_back(i);
        }
        unsafe {
            let n0 = (*list.head).next.load(Ordering::SeqCst).ptr();
            let n1 = (*n0).next.load(Ordering::SeqCst).ptr();
            let n2 = (*n1).next.load(Ordering::SeqCst).ptr();
            let n3 = (*n2).next.load(Ordering::SeqCst).ptr();

            // Mark 1 and 2 the way erase winners do, but leave the
            // forward chain unrepaired: 0 still points at 1, 1 at 2.
            list.set_mark(&(*n1).next);
            list.set_mark(&(*n1).prev);
            list.set_mark(&(*n2).next);
            list.set_mark(&(*n2).prev);
            assert_eq!((*n0).next.load(Ordering::SeqCst).ptr(), n1);

            let mut cursor = list.cursor_front(); // at 0
            assert!(cursor.move_next()); // must land on 3, splicing 1 and 2
            assert_eq!(cursor.get(), Some(3));

            // The traversal itself removed both tombstones from the
            // forward chain: 0's next link now points straight at 3.
            let after = (*n0).next.load(Ordering::SeqCst);
            assert!(!after.mark());
            assert_eq!(after.ptr(), n3);
        }
        assert_eq!(list.iter().collect::<Vec<_>>(), vec![0, 3, 4]);
    }
}
