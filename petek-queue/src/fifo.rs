//! Michael–Scott FIFO queue over pool tagged handles.
//!
//! The queue keeps a dummy head node. Links hold `(slot index, tag)`
//! pairs in one `AtomicU64`; every successful publication bumps the tag,
//! so a recycled slot never matches a stale snapshot and the classic
//! ABA hazard of free-list queues disappears. Nodes go back to their
//! allocating thread's free list on pop; memory is released only when
//! the queue is dropped.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicIsize, Ordering};

use crossbeam_utils::Backoff;
use petek::{CacheAligned, NodePool, TaggedHandle, TaggedLink};

struct QueueNode<T> {
    next: TaggedLink,
    val: UnsafeCell<MaybeUninit<T>>,
}

/// Unbounded lock-free FIFO queue.
///
/// At most `thread_max` distinct threads may touch one instance.
pub struct FifoQueue<T> {
    head: CacheAligned<TaggedLink>,
    tail: CacheAligned<TaggedLink>,
    size: AtomicIsize,
    pool: NodePool<QueueNode<T>>,
}

// SAFETY: values move between threads only through owned pops; all
// shared bookkeeping is atomic.
unsafe impl<T: Send> Send for FifoQueue<T> {}
unsafe impl<T: Send> Sync for FifoQueue<T> {}

impl<T: Send> FifoQueue<T> {
    pub fn new() -> Self {
        Self::with_thread_max(8)
    }

    /// Create a queue usable by up to `thread_max` threads.
    pub fn with_thread_max(thread_max: usize) -> Self {
        let pool = NodePool::new(thread_max);
        let dummy = pool.construct(QueueNode {
            next: TaggedLink::new(TaggedHandle::nil(0)),
            val: UnsafeCell::new(MaybeUninit::uninit()),
        });
        let index = pool.handle(dummy);
        // Seed the dummy's next tag from its slot sequence, like every
        // later node (see alloc_node).
        unsafe {
            (*dummy)
                .next
                .store(TaggedHandle::nil(pool.tag(index)), Ordering::Release);
        }
        Self {
            head: CacheAligned::new(TaggedLink::new(TaggedHandle::new(index, 0))),
            tail: CacheAligned::new(TaggedLink::new(TaggedHandle::new(index, 0))),
            size: AtomicIsize::new(0),
            pool,
        }
    }

    /// Construct a node whose `next` tag continues its slot's sequence,
    /// so a CAS snapshotted against the slot's previous life still fails.
    fn alloc_node(&self, value: T) -> u32 {
        let node = self.pool.construct(QueueNode {
            next: TaggedLink::new(TaggedHandle::nil(0)),
            val: UnsafeCell::new(MaybeUninit::new(value)),
        });
        let index = self.pool.handle(node);
        // Not yet published; plain store is fine.
        unsafe {
            (*node)
                .next
                .store(TaggedHandle::nil(self.pool.tag(index)), Ordering::Release);
        }
        index
    }

    /// Append `value`.
    pub fn push(&self, value: T) {
        let index = self.alloc_node(value);
        let backoff = Backoff::new();
        loop {
            let tail_h = self.tail.load(Ordering::Acquire);
            let tail_node = self.node(tail_h.index());
            let next_h = tail_node.next.load(Ordering::Acquire);
            if self.tail.load(Ordering::Acquire) != tail_h {
                continue;
            }
            if !next_h.is_nil() {
                // Tail lags behind the real last node; help it forward.
                let _ = self.tail.cas(tail_h, tail_h.bump(next_h.index()));
                continue;
            }
            if tail_node.next.cas(next_h, next_h.bump(index)) {
                // Best effort: a failed swing is fixed by later ops.
                let _ = self.tail.cas(tail_h, tail_h.bump(index));
                self.size.fetch_add(1, Ordering::AcqRel);
                return;
            }
            backoff.spin();
        }
    }

    /// Remove and return the oldest element.
    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let head_h = self.head.load(Ordering::Acquire);
            let tail_h = self.tail.load(Ordering::Acquire);
            let head_node = self.node(head_h.index());
            let next_h = head_node.next.load(Ordering::Acquire);
            if self.head.load(Ordering::Acquire) != head_h {
                continue;
            }
            if head_h.index() == tail_h.index() {
                if next_h.is_nil() {
                    return None;
                }
                let _ = self.tail.cas(tail_h, tail_h.bump(next_h.index()));
                continue;
            }
            if next_h.is_nil() {
                continue; // torn snapshot
            }
            // Read the value before publishing past the node; the bits
            // only count if the head CAS (tag included) wins.
            let bits = unsafe { ptr::read(self.node(next_h.index()).val.get()) };
            if self.head.cas(head_h, head_h.bump(next_h.index())) {
                self.size.fetch_sub(1, Ordering::AcqRel);
                // The old dummy is ours now; its value was consumed when
                // it became dummy.
                self.pool.destruct(self.pool.deref(head_h.index()));
                return Some(unsafe { bits.assume_init() });
            }
            backoff.spin();
        }
    }

    /// Copy of the oldest element, if any.
    pub fn front(&self) -> Option<T>
    where
        T: Copy,
    {
        loop {
            let head_h = self.head.load(Ordering::Acquire);
            let tail_h = self.tail.load(Ordering::Acquire);
            let head_node = self.node(head_h.index());
            let next_h = head_node.next.load(Ordering::Acquire);
            if self.head.load(Ordering::Acquire) != head_h {
                continue;
            }
            if head_h.index() == tail_h.index() {
                if next_h.is_nil() {
                    return None;
                }
                let _ = self.tail.cas(tail_h, tail_h.bump(next_h.index()));
                continue;
            }
            if next_h.is_nil() {
                continue;
            }
            let bits = unsafe { ptr::read(self.node(next_h.index()).val.get()) };
            // An unchanged head (tag included) proves the first node was
            // not popped or recycled while we read it.
            if self.head.load(Ordering::SeqCst) == head_h {
                return Some(unsafe { bits.assume_init() });
            }
        }
    }

    /// Copy of the newest element, if any.
    pub fn back(&self) -> Option<T>
    where
        T: Copy,
    {
        loop {
            let tail_h = self.tail.load(Ordering::Acquire);
            let head_h = self.head.load(Ordering::Acquire);
            let tail_node = self.node(tail_h.index());
            let next_h = tail_node.next.load(Ordering::Acquire);
            if self.tail.load(Ordering::Acquire) != tail_h {
                continue;
            }
            if !next_h.is_nil() {
                let _ = self.tail.cas(tail_h, tail_h.bump(next_h.index()));
                continue;
            }
            if head_h.index() == tail_h.index() {
                return None; // tail is the dummy
            }
            let bits = unsafe { ptr::read(tail_node.val.get()) };
            // Still the last node and not recycled: snapshot is valid.
            if tail_node.next.load(Ordering::SeqCst) == next_h
                && self.tail.load(Ordering::SeqCst) == tail_h
            {
                return Some(unsafe { bits.assume_init() });
            }
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

    /// Pop everything.
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }

    /// Pre-commit pool capacity for at least `cap` nodes.
    pub fn reserve(&self, cap: usize) {
        self.pool.reserve(cap);
    }

    /// Pool slots committed so far.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

impl<T> FifoQueue<T> {
    #[inline]
    fn node(&self, index: u32) -> &QueueNode<T> {
        // SAFETY: pool slots are never unmapped while the queue lives.
        // The node may be recycled concurrently; readers validate with
        // tagged CASes / re-reads before trusting anything they saw.
        unsafe { &*self.pool.deref(index) }
    }
}

impl<T: Send> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for FifoQueue<T> {
    fn drop(&mut self) {
        // Drop the values still queued (everything after the dummy); the
        // pool releases the slot memory.
        let head_h = self.head.load(Ordering::Relaxed);
        let mut cur = self.node(head_h.index()).next.load(Ordering::Relaxed);
        while !cur.is_nil() {
            let node = self.node(cur.index());
            // SAFETY: exclusive access in Drop; every node past the
            // dummy holds a live value.
            unsafe { ptr::drop_in_place((*node.val.get()).as_mut_ptr()) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}
