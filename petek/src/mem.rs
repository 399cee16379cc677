//! Hazard-pointer memory manager.
//!
//! Lock-free memory reclamation for concurrent containers, based on the
//! paper "Efficient and Reliable Lock-Free Memory Reclamation Based on
//! Reference Counting", Gidenstam et al., 2005.
//!
//! Every node carries a link reference count; every thread additionally
//! publishes hazard pointers for the nodes it is actively dereferencing.
//! A logically deleted node sits on the deleting thread's reclamation
//! list until a scan pass observes `ref_count == 0` stable (the `trace`
//! witness) and no thread hazard pointing at it; only then is it handed
//! back to its pool. Containers plug in two callbacks: `clean_up_node`
//! redirects links of a deleted node away from other deleted nodes, and
//! `terminate_node` nulls its links right before reclamation.

use crate::link::{Link, LinkVal};
use crate::node::HazardManaged;
use crate::pool::NodePool;
use crate::registry::ThreadRegistry;
use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicUsize, Ordering};
use foldhash::fast::FixedState;
use std::collections::HashSet;

/// Container-side configuration of a [`HazardMem`].
///
/// The constants size the per-thread structures; the callbacks let the
/// manager repair and finalize container links during reclamation.
pub trait HazardMemConfig: Sized {
    type Node: HazardManaged + Send;

    /// Upper bound on out-links per node.
    const LINK_MAX: usize;
    /// Upper bound on out-links that may transiently reference deleted
    /// nodes.
    const LINK_DEL_MAX: usize;
    /// Hazard-pointer slots per thread.
    const HAZARD_MAX: usize;

    /// Replace outgoing links of `node` that point at deleted nodes with
    /// equivalent links to live successors. Called on logically deleted
    /// nodes, possibly many times and from several threads at once.
    fn clean_up_node(&self, mem: &HazardMem<Self>, node: *mut Self::Node);

    /// Null all outgoing links of `node`. When `concurrent` is false the
    /// node is unreachable and [`HazardMem::store_ref`] may be used
    /// instead of the CAS path.
    fn terminate_node(&self, mem: &HazardMem<Self>, node: *mut Self::Node, concurrent: bool);
}

const NO_ENTRY: usize = usize::MAX;

/// Reclamation entry: one logically deleted node awaiting safe reuse.
struct DelEntry<N> {
    node: AtomicPtr<N>,
    /// Concurrent `clean_up_all` passes working on this entry.
    claim: AtomicIsize,
    /// Terminated while claimed; skip in later clean-up passes.
    done: AtomicBool,
    /// Owner-thread list chain (entry index, `NO_ENTRY` terminated).
    next: AtomicUsize,
}

impl<N> DelEntry<N> {
    fn new() -> Self {
        Self {
            node: AtomicPtr::new(core::ptr::null_mut()),
            claim: AtomicIsize::new(0),
            done: AtomicBool::new(false),
            next: AtomicUsize::new(NO_ENTRY),
        }
    }
}

type HazardSet = HashSet<usize, FixedState>;

/// Per-thread record. Shared fields (`hazards`, `del_nodes`) are read by
/// scanning threads; everything else belongs to the owning thread.
struct ThreadData<N> {
    /// Published hazard pointers, one slot per concurrent hold.
    hazards: Box<[AtomicPtr<N>]>,
    /// Hold count per hazard slot. Owner thread only.
    hazard_refs: UnsafeCell<Box<[usize]>>,
    /// Free hazard slot indices. Owner thread only.
    hazard_free: UnsafeCell<Vec<usize>>,
    /// Fixed array of reclamation entries, `thresh_clean` long.
    del_nodes: Box<[DelEntry<N>]>,
    /// Free entry indices. Owner thread only.
    del_free: UnsafeCell<Vec<usize>>,
    /// Head of the pending list through `del_nodes`. Owner thread only.
    del_head: Cell<usize>,
    del_count: Cell<usize>,
    /// Scratch set used inside `scan`. Owner thread only.
    del_hazards: UnsafeCell<HazardSet>,
}

// SAFETY: cross-thread access is confined to the atomic fields; the
// UnsafeCell/Cell fields are only touched by the thread this record was
// registered to (enforced by the per-instance thread registry).
unsafe impl<N> Send for ThreadData<N> {}
unsafe impl<N> Sync for ThreadData<N> {}

impl<N> ThreadData<N> {
    fn new(hazard_max: usize, thresh_clean: usize) -> Self {
        Self {
            hazards: (0..hazard_max)
                .map(|_| AtomicPtr::new(core::ptr::null_mut()))
                .collect(),
            hazard_refs: UnsafeCell::new((0..hazard_max).map(|_| 0).collect()),
            hazard_free: UnsafeCell::new((0..hazard_max).collect()),
            del_nodes: (0..thresh_clean).map(|_| DelEntry::new()).collect(),
            del_free: UnsafeCell::new((0..thresh_clean).collect()),
            del_head: Cell::new(NO_ENTRY),
            del_count: Cell::new(0),
            del_hazards: UnsafeCell::new(HashSet::with_hasher(FixedState::default())),
        }
    }
}

/// Lock-free memory manager for concurrent containers.
///
/// One instance per container. At most `thread_max` distinct threads may
/// ever touch it; drive it from a thread pool that outlives it.
pub struct HazardMem<C: HazardMemConfig> {
    config: C,
    thresh_clean: usize,
    thresh_scan: usize,
    threads: Box<[ThreadData<C::Node>]>,
    registry: ThreadRegistry,
    pool: NodePool<C::Node>,
}

impl<C: HazardMemConfig> HazardMem<C> {
    pub fn new(config: C, thread_max: usize) -> Self {
        assert!(thread_max > 0, "petek: thread_max must be at least 1");
        // Sized so the reclamation-entry free list can never run dry
        // while the algorithmic invariants hold.
        let thresh_clean = thread_max * (C::HAZARD_MAX + C::LINK_MAX + C::LINK_DEL_MAX + 1);
        let thresh_scan = (C::HAZARD_MAX * 2).min(thresh_clean);
        Self {
            config,
            thresh_clean,
            thresh_scan,
            threads: (0..thread_max)
                .map(|_| ThreadData::new(C::HAZARD_MAX, thresh_clean))
                .collect(),
            registry: ThreadRegistry::new(thread_max),
            pool: NodePool::new(thread_max),
        }
    }

    #[inline]
    fn td(&self) -> &ThreadData<C::Node> {
        &self.threads[self.registry.thread_id()]
    }

    /// Slots committed by the backing pool. Useful for asserting the
    /// reclamation bound in tests.
    pub fn node_capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Allocate a node from the calling thread's pool. The node starts
    /// with one hazard hold by the caller; pair with
    /// [`release_ref`](Self::release_ref).
    pub fn create_node(&self, node: C::Node) -> *mut C::Node {
        let ptr = self.pool.construct(node);
        self.ref_node(ptr);
        ptr
    }

    /// Logically delete a detached node and move it onto this thread's
    /// reclamation list, reclaiming en route when thresholds are hit.
    pub fn delete_node(&self, node: *mut C::Node) {
        let td = self.td();
        // SAFETY: links only ever hold live pool nodes, and `node` was
        // just detached from one; only metadata is touched here.
        let base = unsafe { (*node).hazard_node() };
        base.del.store(true, Ordering::SeqCst);
        base.trace.store(false, Ordering::SeqCst);

        let entry_idx = {
            // SAFETY: owner-thread field (see ThreadData).
            let free = unsafe { &mut *td.del_free.get() };
            assert!(
                !free.is_empty(),
                "petek: reclamation entries exhausted, thresholds miscomputed"
            );
            free.pop().unwrap()
        };
        let entry = &td.del_nodes[entry_idx];
        entry.done.store(false, Ordering::SeqCst);
        entry.node.store(node, Ordering::SeqCst);
        entry.next.store(td.del_head.get(), Ordering::Relaxed);
        td.del_head.set(entry_idx);
        td.del_count.set(td.del_count.get() + 1);

        loop {
            if td.del_count.get() == self.thresh_clean {
                self.clean_up_local();
            }
            if td.del_count.get() >= self.thresh_scan {
                self.scan();
            }
            if td.del_count.get() == self.thresh_clean {
                self.clean_up_all();
            } else {
                break;
            }
        }
    }

    /// Dereference a link under hazard protection. May return null.
    ///
    /// The returned node stays live until the matching
    /// [`release_ref`](Self::release_ref).
    pub fn de_ref_link(&self, link: &Link<C::Node>) -> *mut C::Node {
        let td = self.td();
        let index = {
            // SAFETY: owner-thread field.
            let free = unsafe { &*td.hazard_free.get() };
            assert!(!free.is_empty(), "petek: hazard pointers exhausted");
            *free.last().unwrap()
        };

        let mut node;
        loop {
            node = link.load(Ordering::Acquire).ptr();
            td.hazards[index].store(node, Ordering::SeqCst);
            // The SeqCst re-read cannot drift before the hazard store;
            // once the two reads agree, the hazard was visible while the
            // link still pointed at `node`.
            if link.load(Ordering::SeqCst).ptr() == node {
                break;
            }
        }

        if !node.is_null() {
            // SAFETY: owner-thread fields.
            let refs = unsafe { &mut *td.hazard_refs.get() };
            let held = (0..td.hazards.len())
                .find(|&i| i != index && refs[i] > 0 && td.hazards[i].load(Ordering::Relaxed) == node);
            match held {
                Some(i) => {
                    // Already protected by this thread; the fresh slot is
                    // redundant.
                    refs[i] += 1;
                    td.hazards[index].store(core::ptr::null_mut(), Ordering::Release);
                }
                None => {
                    refs[index] = 1;
                    let free = unsafe { &mut *td.hazard_free.get() };
                    free.pop();
                }
            }
        }
        node
    }

    /// Add a hazard hold on `node`. The caller must know the node is
    /// live (it allocated it, or it is a sentinel, or it already holds a
    /// hazard elsewhere, e.g. when cloning a cursor).
    pub fn ref_node(&self, node: *mut C::Node) {
        let td = self.td();
        // SAFETY: owner-thread fields.
        let refs = unsafe { &mut *td.hazard_refs.get() };
        if let Some(i) =
            (0..td.hazards.len()).find(|&i| refs[i] > 0 && td.hazards[i].load(Ordering::Relaxed) == node)
        {
            refs[i] += 1;
            return;
        }
        let free = unsafe { &mut *td.hazard_free.get() };
        assert!(!free.is_empty(), "petek: hazard pointers exhausted");
        let index = free.pop().unwrap();
        refs[index] = 1;
        td.hazards[index].store(node, Ordering::SeqCst);
    }

    /// Drop one hazard hold on `node`, freeing the slot on the last one.
    pub fn release_ref(&self, node: *mut C::Node) {
        let td = self.td();
        // SAFETY: owner-thread fields.
        let refs = unsafe { &mut *td.hazard_refs.get() };
        let i = (0..td.hazards.len())
            .find(|&i| refs[i] > 0 && td.hazards[i].load(Ordering::Relaxed) == node);
        let i = i.expect("petek: releasing a node this thread does not hold");
        refs[i] -= 1;
        if refs[i] == 0 {
            td.hazards[i].store(core::ptr::null_mut(), Ordering::Release);
            let free = unsafe { &mut *td.hazard_free.get() };
            free.push(i);
        }
    }

    /// Compare-and-swap a link. On success the new target is referenced
    /// before the old one is released, so a reachable node's count never
    /// transiently touches zero.
    pub fn cas_ref(&self, link: &Link<C::Node>, new: LinkVal<C::Node>, old: LinkVal<C::Node>) -> bool {
        if !link.cas(old, new) {
            return false;
        }
        if !new.ptr().is_null() {
            // SAFETY: `new` targets a live node; the link now keeps it so.
            let base = unsafe { (*new.ptr()).hazard_node() };
            base.ref_count.fetch_add(1, Ordering::AcqRel);
            base.trace.store(false, Ordering::SeqCst);
        }
        if !old.ptr().is_null() {
            // SAFETY: the link held a reference on `old` until the CAS.
            let base = unsafe { (*old.ptr()).hazard_node() };
            base.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
        true
    }

    /// Store a link in a single-threaded context (init, teardown).
    pub fn store_ref(&self, link: &Link<C::Node>, new: LinkVal<C::Node>) {
        let old = link.load(Ordering::Relaxed);
        link.store(new, Ordering::Release);
        if !new.ptr().is_null() {
            // SAFETY: as in cas_ref.
            let base = unsafe { (*new.ptr()).hazard_node() };
            base.ref_count.fetch_add(1, Ordering::AcqRel);
            base.trace.store(false, Ordering::SeqCst);
        }
        if !old.ptr().is_null() {
            // SAFETY: as in cas_ref.
            let base = unsafe { (*old.ptr()).hazard_node() };
            base.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Repair links of every node this thread has deleted, so chains of
    /// deleted nodes stay traversable in bounded steps.
    fn clean_up_local(&self) {
        let td = self.td();
        let mut e = td.del_head.get();
        while e != NO_ENTRY {
            let entry = &td.del_nodes[e];
            let node = entry.node.load(Ordering::SeqCst);
            self.config.clean_up_node(self, node);
            e = entry.next.load(Ordering::Relaxed);
        }
    }

    /// Repair links of nodes deleted by any thread. Walks the fixed
    /// entry arrays (not the live lists) so entries observed mid-recycle
    /// are still caught; the `claim` counter keeps the owning scan from
    /// reclaiming the node under us.
    fn clean_up_all(&self) {
        for ti in 0..self.registry.registered() {
            let td = &self.threads[ti];
            for entry in td.del_nodes.iter() {
                let node = entry.node.load(Ordering::SeqCst);
                if !node.is_null() && !entry.done.load(Ordering::SeqCst) {
                    entry.claim.fetch_add(1, Ordering::SeqCst);
                    if node == entry.node.load(Ordering::SeqCst) {
                        self.config.clean_up_node(self, node);
                    }
                    entry.claim.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Reclaim every node on this thread's list whose count was witnessed
    /// stable at zero and which no thread hazard protects.
    fn scan(&self) {
        let td = self.td();

        // Phase 1: arm the trace witness. A node whose count is zero
        // both before and after the flag flip cannot regain references
        // later: the container already marked it deleted, so no link CAS
        // will publish it again (I2).
        let mut e = td.del_head.get();
        while e != NO_ENTRY {
            let entry = &td.del_nodes[e];
            let node = entry.node.load(Ordering::SeqCst);
            // SAFETY: entries on our own live list hold non-null nodes
            // whose memory is ours to inspect until reclaimed.
            let base = unsafe { (*node).hazard_node() };
            if base.ref_count.load(Ordering::SeqCst) == 0 {
                base.trace.store(true, Ordering::SeqCst);
                if base.ref_count.load(Ordering::SeqCst) != 0 {
                    base.trace.store(false, Ordering::SeqCst);
                }
            }
            e = entry.next.load(Ordering::Relaxed);
        }

        // Phase 2: snapshot every thread's hazard slots.
        // SAFETY: owner-thread scratch field.
        let del_hazards = unsafe { &mut *td.del_hazards.get() };
        for ti in 0..self.registry.registered() {
            for slot in self.threads[ti].hazards.iter() {
                let p = slot.load(Ordering::SeqCst);
                if !p.is_null() {
                    del_hazards.insert(p as usize);
                }
            }
        }

        // Phase 3: reclaim what the witnesses allow; rebuild the pending
        // list from the rest.
        let mut new_head = NO_ENTRY;
        let mut new_count = 0usize;
        let mut e = td.del_head.get();
        while e != NO_ENTRY {
            let entry = &td.del_nodes[e];
            let next = entry.next.load(Ordering::Relaxed);
            let node = entry.node.load(Ordering::SeqCst);
            // SAFETY: as in phase 1.
            let base = unsafe { (*node).hazard_node() };
            if base.ref_count.load(Ordering::SeqCst) == 0
                && base.trace.load(Ordering::SeqCst)
                && !del_hazards.contains(&(node as usize))
            {
                entry.node.store(core::ptr::null_mut(), Ordering::SeqCst);
                if entry.claim.load(Ordering::SeqCst) == 0 {
                    self.config.terminate_node(self, node, false);
                    // SAFETY: owner-thread field.
                    let free = unsafe { &mut *td.del_free.get() };
                    free.push(e);
                    self.pool.destruct(node);
                    e = next;
                    continue;
                }
                // A clean_up_all pass still claims the entry: terminate
                // concurrently and keep the entry until the claim drops.
                self.config.terminate_node(self, node, true);
                entry.done.store(true, Ordering::SeqCst);
                entry.node.store(node, Ordering::SeqCst);
            }
            entry.next.store(new_head, Ordering::Relaxed);
            new_head = e;
            new_count += 1;
            e = next;
        }

        del_hazards.clear();
        td.del_head.set(new_head);
        td.del_count.set(new_count);
    }
}

impl<C: HazardMemConfig> Drop for HazardMem<C> {
    fn drop(&mut self) {
        // Quiesced by contract; whatever is still pending goes straight
        // back to the pool.
        for td in self.threads.iter() {
            let mut e = td.del_head.get();
            while e != NO_ENTRY {
                let entry = &td.del_nodes[e];
                let node = entry.node.load(Ordering::Relaxed);
                if !node.is_null() {
                    self.pool.destruct(node);
                }
                e = entry.next.load(Ordering::Relaxed);
            }
        }
    }
}
