use core::sync::atomic::Ordering;

use petek::LinkVal;

use crate::list::{LinkedList, ListNode};

/// Position in a [`LinkedList`].
///
/// A cursor keeps a hazard hold on its node, so the node's memory stays
/// live for as long as the cursor points at it, even across a concurrent
/// erase. Cloning acquires a hold of its own; dropping releases it. Each
/// live cursor occupies one of the thread's `ITER_MAX` extra hazard
/// slots.
pub struct Cursor<'a, T: Send, const ITER_MAX: usize> {
    pub(crate) list: &'a LinkedList<T, ITER_MAX>,
    pub(crate) node: *mut ListNode<T>,
}

impl<'a, T: Send, const ITER_MAX: usize> Cursor<'a, T, ITER_MAX> {
    pub(crate) fn new(list: &'a LinkedList<T, ITER_MAX>, node: *mut ListNode<T>) -> Self {
        Self { list, node }
    }

    /// Whether the cursor points at a live element: not a sentinel and
    /// not erased.
    pub fn valid(&self) -> bool {
        self.node != self.list.head
            && self.node != self.list.tail
            && !unsafe { &(*self.node).next }.load(Ordering::SeqCst).mark()
    }

    /// Past-the-end position.
    pub fn at_end(&self) -> bool {
        self.node == self.list.tail
    }

    /// Before-the-start position.
    pub fn at_start(&self) -> bool {
        self.node == self.list.head
    }

    /// Copy of the element under the cursor; `None` on sentinels and on
    /// nodes that lost their value to an erase.
    pub fn get(&self) -> Option<T>
    where
        T: Copy,
    {
        if self.node == self.list.head || self.node == self.list.tail {
            return None;
        }
        self.list.read_validated(self.node)
    }

    /// Advance to the next live element. Returns `false` once the cursor
    /// reaches the end sentinel. Looks one node ahead: a tombstone seen
    /// there is spliced out of the forward chain (while the predecessor
    /// is still held) instead of being stepped onto.
    pub fn move_next(&mut self) -> bool {
        let list = self.list;
        loop {
            if self.node == list.tail {
                return false;
            }
            let next = list.mem.de_ref_link(unsafe { &(*self.node).next });
            if next == list.tail {
                list.mem.release_ref(self.node);
                self.node = next;
                return false;
            }
            let look = unsafe { &(*next).next }.load(Ordering::SeqCst);
            if look.mark() {
                // The node ahead is a tombstone: finish its prev mark,
                // then unlink it from our node's forward chain.
                list.set_mark(unsafe { &(*next).prev });
                let own = unsafe { &(*self.node).next }.load(Ordering::SeqCst);
                if !own.mark() {
                    if own.ptr() == next {
                        let _ = list.mem.cas_ref(
                            unsafe { &(*self.node).next },
                            LinkVal::new(look.ptr(), false),
                            own,
                        );
                    }
                    list.mem.release_ref(next);
                    continue; // re-read our next link
                }
                // Our own node is a tombstone too; its link cannot be
                // swung from here, so walk onto the next one.
                list.mem.release_ref(self.node);
                self.node = next;
                continue;
            }
            list.mem.release_ref(self.node);
            self.node = next;
            return true;
        }
    }

    /// Step to the previous live element. Returns `false` once the
    /// cursor reaches the start sentinel. Falls back to repairing (or
    /// walking) the forward chain when the prev chain lags.
    pub fn move_prev(&mut self) -> bool {
        let list = self.list;
        loop {
            if self.node == list.head {
                return false;
            }
            let prev = list.mem.de_ref_link(unsafe { &(*self.node).prev });
            if prev.is_null() {
                // Only terminated nodes have null links; a held hazard
                // rules that out for our own node.
                unreachable!("petek-list: cursor node terminated while held");
            }
            if unsafe { &(*prev).next }.load(Ordering::SeqCst) == LinkVal::new(self.node, false) {
                list.mem.release_ref(self.node);
                self.node = prev;
                if self.node == list.head {
                    return false;
                }
                if !unsafe { &(*self.node).next }.load(Ordering::SeqCst).mark() {
                    return true;
                }
                continue;
            }
            if unsafe { &(*self.node).next }.load(Ordering::SeqCst).mark() {
                // Our node is being erased under us: fall forward to a
                // live successor and try again from there.
                list.mem.release_ref(prev);
                self.move_next();
                continue;
            }
            let p = list.correct_prev(prev, self.node);
            list.mem.release_ref(p);
        }
    }
}

impl<T: Send, const ITER_MAX: usize> Clone for Cursor<'_, T, ITER_MAX> {
    fn clone(&self) -> Self {
        self.list.mem.ref_node(self.node);
        Self {
            list: self.list,
            node: self.node,
        }
    }
}

impl<T: Send, const ITER_MAX: usize> Drop for Cursor<'_, T, ITER_MAX> {
    fn drop(&mut self) {
        self.list.mem.release_ref(self.node);
    }
}

/// Iterator over element copies, skipping concurrently erased nodes.
pub struct Iter<'a, T: Send, const ITER_MAX: usize> {
    cursor: Cursor<'a, T, ITER_MAX>,
}

impl<'a, T: Send, const ITER_MAX: usize> Iter<'a, T, ITER_MAX> {
    pub(crate) fn new(cursor: Cursor<'a, T, ITER_MAX>) -> Self {
        Self { cursor }
    }
}

impl<T: Send + Copy, const ITER_MAX: usize> Iterator for Iter<'_, T, ITER_MAX> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            if self.cursor.at_end() {
                return None;
            }
            let value = self.cursor.get();
            self.cursor.move_next();
            if value.is_some() {
                return value;
            }
        }
    }
}
