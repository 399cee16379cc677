//! Typed node pool with slab storage and per-slot tag sequences.
//!
//! Nodes are constructed out of a lazily growing set of slabs and
//! recycled through per-thread free lists: a freed node goes back to the
//! free list of the thread that allocated it, which keeps slot-reuse
//! contention low. Slot tags increase monotonically across reuse; the
//! FIFO queue folds them into its tagged handles, and the free-list
//! heads use the same trick to stay ABA-safe.
//!
//! `deref` is lock-free: slabs are published through an `AtomicPtr`
//! directory and never move. Only growth takes the spin lock.

use crate::link::{NIL, TaggedHandle, TaggedLink};
use crate::registry::ThreadRegistry;
use crate::ttas::TTas;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

/// Smallest slab; slab `k` holds `SLAB_BASE << k` slots.
const SLAB_BASE: usize = 64;

/// Directory size. Total addressable capacity stays below `u32::MAX`,
/// so `NIL` is never a valid index.
const SLAB_MAX: usize = 26;

#[repr(C)]
struct Slot<N> {
    /// Global slot index, fixed at slab allocation.
    index: u32,
    /// Publication tag, bumped on every construct and preserved across
    /// reuse.
    tag: AtomicU32,
    /// Id of the thread that last constructed this slot; the destruct
    /// side pushes the slot back onto that thread's free list.
    owner: AtomicU32,
    /// Free-list chain link (slot index, `NIL` terminated).
    next_free: AtomicU32,
    node: UnsafeCell<MaybeUninit<N>>,
}

/// Per-type node pool.
pub struct NodePool<N> {
    slabs: [AtomicPtr<Slot<N>>; SLAB_MAX],
    grow: TTas<()>,
    /// Slots committed across all published slabs.
    committed: AtomicU32,
    /// Bump cursor over never-used slots.
    next_fresh: AtomicU32,
    /// Per-thread free-list heads, tag-protected against ABA.
    free_heads: Box<[TaggedLink]>,
    registry: ThreadRegistry,
}

// SAFETY: slot payloads are only reached through raw pointers handed out
// by construct/deref; the pool's own bookkeeping is atomic or behind the
// growth lock.
unsafe impl<N: Send> Send for NodePool<N> {}
unsafe impl<N: Send> Sync for NodePool<N> {}

impl<N> NodePool<N> {
    pub fn new(thread_max: usize) -> Self {
        // The list packs a delete mark into pointer bit 0.
        assert!(
            align_of::<N>() >= 2,
            "petek: pool node type must be at least 2-byte aligned"
        );
        let free_heads = (0..thread_max)
            .map(|_| TaggedLink::new(TaggedHandle::nil(0)))
            .collect();
        Self {
            slabs: [const { AtomicPtr::new(core::ptr::null_mut()) }; SLAB_MAX],
            grow: TTas::new(()),
            committed: AtomicU32::new(0),
            next_fresh: AtomicU32::new(0),
            free_heads,
            registry: ThreadRegistry::new(thread_max),
        }
    }

    /// Slab level and in-slab offset for a global index. Slab `k` covers
    /// `[SLAB_BASE * (2^k - 1), SLAB_BASE * (2^(k+1) - 1))`.
    #[inline]
    fn locate(index: u32) -> (usize, usize) {
        let q = index as usize / SLAB_BASE + 1;
        let k = (usize::BITS - 1 - q.leading_zeros()) as usize;
        let start = SLAB_BASE * ((1 << k) - 1);
        (k, index as usize - start)
    }

    #[inline]
    fn slot(&self, index: u32) -> &Slot<N> {
        debug_assert_ne!(index, NIL);
        let (k, offset) = Self::locate(index);
        let slab = self.slabs[k].load(Ordering::Acquire);
        debug_assert!(!slab.is_null());
        // SAFETY: a non-NIL index below `committed` always lands in a
        // published slab; slabs never move or shrink.
        unsafe { &*slab.add(offset) }
    }

    /// Raw pointer to the node storage of `index`. The slot may be free
    /// or mid-recycle; callers validate with tags before trusting reads.
    #[inline]
    pub fn deref(&self, index: u32) -> *mut N {
        self.slot(index).node.get() as *mut N
    }

    /// Global index of a node handed out by [`construct`](Self::construct).
    #[inline]
    pub fn handle(&self, node: *mut N) -> u32 {
        let offset = core::mem::offset_of!(Slot<N>, node);
        // SAFETY: `node` came out of construct/deref, so it is the `node`
        // field of a live Slot.
        unsafe { (*((node as usize - offset) as *const Slot<N>)).index }
    }

    /// Current publication tag of a slot.
    #[inline]
    pub fn tag(&self, index: u32) -> u32 {
        self.slot(index).tag.load(Ordering::Acquire)
    }

    /// Construct a node, recycling a slot freed by this thread if one
    /// exists and committing a fresh slot otherwise.
    pub fn construct(&self, value: N) -> *mut N {
        let tid = self.registry.thread_id();
        let index = match self.pop_free(tid) {
            Some(index) => index,
            None => self.fresh(),
        };
        let slot = self.slot(index);
        slot.tag.fetch_add(1, Ordering::AcqRel);
        slot.owner.store(tid as u32, Ordering::Release);
        let ptr = slot.node.get() as *mut N;
        // SAFETY: the slot is owned by this thread until published; free
        // slots hold no live node.
        unsafe { ptr.write(value) };
        ptr
    }

    /// Drop the node in place and return its slot to the free list of
    /// the thread that allocated it.
    pub fn destruct(&self, node: *mut N) {
        let index = self.handle(node);
        let slot = self.slot(index);
        // SAFETY: callers hand back a node they own exclusively (won by
        // the reclamation protocol or by container teardown).
        unsafe { core::ptr::drop_in_place(node) };
        let owner = slot.owner.load(Ordering::Acquire) as usize;
        self.push_free(owner, index);
    }

    fn pop_free(&self, tid: usize) -> Option<u32> {
        let head = &self.free_heads[tid];
        loop {
            let cur = head.load(Ordering::Acquire);
            if cur.is_nil() {
                return None;
            }
            let next = self.slot(cur.index()).next_free.load(Ordering::Acquire);
            if head.cas(cur, cur.bump(next)) {
                return Some(cur.index());
            }
        }
    }

    fn push_free(&self, tid: usize, index: u32) {
        let head = &self.free_heads[tid];
        let slot = self.slot(index);
        loop {
            let cur = head.load(Ordering::Acquire);
            slot.next_free.store(cur.index(), Ordering::Release);
            if head.cas(cur, cur.bump(index)) {
                return;
            }
        }
    }

    /// Claim a never-used slot, growing the slab directory on demand.
    fn fresh(&self) -> u32 {
        loop {
            let cur = self.next_fresh.load(Ordering::Relaxed);
            if cur < self.committed.load(Ordering::Acquire) {
                if self
                    .next_fresh
                    .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return cur;
                }
                continue;
            }
            self.grow();
        }
    }

    /// Publish the next slab level. O(slab) initialization under the
    /// lock, but amortized over the slots it commits.
    fn grow(&self) {
        let _held = self.grow.lock();
        if self.next_fresh.load(Ordering::Relaxed) < self.committed.load(Ordering::Relaxed) {
            return; // another thread grew while we waited
        }
        let k = self
            .slabs
            .iter()
            .position(|s| s.load(Ordering::Relaxed).is_null());
        let k = k.expect("petek: pool slab directory exhausted");
        let len = SLAB_BASE << k;
        let start = SLAB_BASE * ((1 << k) - 1);
        let mut slab: Vec<Slot<N>> = Vec::with_capacity(len);
        for i in 0..len {
            slab.push(Slot {
                index: (start + i) as u32,
                tag: AtomicU32::new(0),
                owner: AtomicU32::new(0),
                next_free: AtomicU32::new(NIL),
                node: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        let ptr = Box::into_raw(slab.into_boxed_slice()) as *mut Slot<N>;
        assert_eq!(ptr as usize & 1, 0, "petek: pool slab misaligned");
        self.slabs[k].store(ptr, Ordering::Release);
        self.committed
            .store((start + len) as u32, Ordering::Release);
    }

    /// Grow committed capacity to at least `cap` slots.
    pub fn reserve(&self, cap: usize) {
        while (self.committed.load(Ordering::Acquire) as usize) < cap {
            self.grow();
        }
    }

    /// Slots committed so far (free or live).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.committed.load(Ordering::Acquire) as usize
    }
}

impl<N> Drop for NodePool<N> {
    fn drop(&mut self) {
        // Live nodes are drained by the owning container before the pool
        // goes away; only the slab memory is released here.
        for (k, slab) in self.slabs.iter().enumerate() {
            let ptr = slab.load(Ordering::Relaxed);
            if ptr.is_null() {
                break;
            }
            let len = SLAB_BASE << k;
            // SAFETY: slab `k` was published as a boxed slice of `len`
            // slots and is exclusively ours in Drop.
            unsafe {
                drop(Box::from_raw(core::ptr::slice_from_raw_parts_mut(
                    ptr, len,
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_covers_slab_boundaries() {
        assert_eq!(NodePool::<u64>::locate(0), (0, 0));
        assert_eq!(NodePool::<u64>::locate(63), (0, 63));
        assert_eq!(NodePool::<u64>::locate(64), (1, 0));
        assert_eq!(NodePool::<u64>::locate(191), (1, 127));
        assert_eq!(NodePool::<u64>::locate(192), (2, 0));
        assert_eq!(NodePool::<u64>::locate(447), (2, 255));
        assert_eq!(NodePool::<u64>::locate(448), (3, 0));
    }

    #[test]
    fn construct_recycles_own_slots() {
        let pool = NodePool::<u64>::new(2);
        let a = pool.construct(7);
        let idx = pool.handle(a);
        let tag = pool.tag(idx);
        pool.destruct(a);
        let b = pool.construct(8);
        assert_eq!(pool.handle(b), idx, "freed slot should be reused first");
        assert_eq!(pool.tag(idx), tag.wrapping_add(1));
        assert_eq!(unsafe { *b }, 8);
        pool.destruct(b);
        assert_eq!(pool.capacity(), SLAB_BASE);
    }

    #[test]
    fn reserve_grows_capacity() {
        let pool = NodePool::<u64>::new(1);
        pool.reserve(200);
        assert!(pool.capacity() >= 200);
        let before = pool.capacity();
        pool.reserve(10);
        assert_eq!(pool.capacity(), before);
    }

    #[test]
    fn handle_round_trips_through_deref() {
        let pool = NodePool::<[u64; 3]>::new(1);
        let n = pool.construct([1, 2, 3]);
        let idx = pool.handle(n);
        assert_eq!(pool.deref(idx), n);
        pool.destruct(n);
    }
}
