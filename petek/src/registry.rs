//! Per-instance thread registration.
//!
//! Every manager or pool hands participating threads a dense small id on
//! first use. Ids are instance-scoped: the same OS thread may carry
//! different ids in different managers. Registration runs once per
//! (thread, instance) pair under a spin lock; after that the lookup is a
//! scan of a small thread-local table.
//!
//! Ids are never recycled within an instance. Per-thread records owned by
//! the instance stay alive after the thread exits and are torn down when
//! the instance itself is dropped, so callers should drive an instance
//! from a thread pool whose lifetime exceeds it.

use crate::ttas::TTas;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::{Cell, RefCell};

static NEXT_INSTANCE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // (instance id, local thread id) pairs for every instance this thread
    // has touched. A thread rarely participates in more than a handful of
    // instances, so a linear scan beats a map here.
    static LOCAL_IDS: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    // Hot-path cache: the instance touched by the previous call. Ops on
    // one container resolve their tid with a single compare.
    static LAST_ID: Cell<(usize, usize)> = const { Cell::new((usize::MAX, 0)) };
}

/// Dense thread-id allocator scoped to one manager or pool instance.
pub struct ThreadRegistry {
    instance: usize,
    thread_max: usize,
    count: AtomicUsize,
    lock: TTas<()>,
}

impl ThreadRegistry {
    pub fn new(thread_max: usize) -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            thread_max,
            count: AtomicUsize::new(0),
            lock: TTas::new(()),
        }
    }

    /// Id of the calling thread within this instance, registering it on
    /// first use. Over-subscription is a programmer error.
    #[inline]
    pub fn thread_id(&self) -> usize {
        let (instance, tid) = LAST_ID.get();
        if instance == self.instance {
            return tid;
        }
        let tid = self.lookup_or_register();
        LAST_ID.set((self.instance, tid));
        tid
    }

    #[cold]
    fn lookup_or_register(&self) -> usize {
        LOCAL_IDS.with(|ids| {
            let mut ids = ids.borrow_mut();
            if let Some(&(_, tid)) = ids.iter().find(|&&(inst, _)| inst == self.instance) {
                return tid;
            }
            let tid = {
                let _held = self.lock.lock();
                let tid = self.count.load(Ordering::Relaxed);
                assert!(
                    tid < self.thread_max,
                    "petek: more than {} threads accessing instance",
                    self.thread_max
                );
                // SeqCst so reclamation scans that snapshot all hazard
                // arrays cannot miss a thread that registered and
                // published a hazard before the snapshot.
                self.count.store(tid + 1, Ordering::SeqCst);
                tid
            };
            ids.push((self.instance, tid));
            tid
        })
    }

    /// Number of threads registered so far. Records for ids below this
    /// watermark are initialized and may be scanned by any thread.
    #[inline]
    pub fn registered(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn thread_max(&self) -> usize {
        self.thread_max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ids_are_dense_and_stable() {
        let reg = ThreadRegistry::new(4);
        let a = reg.thread_id();
        assert_eq!(a, reg.thread_id());
        assert_eq!(reg.registered(), 1);
    }

    #[test]
    fn instances_are_independent() {
        let r1 = ThreadRegistry::new(2);
        let r2 = ThreadRegistry::new(2);
        assert_eq!(r1.thread_id(), 0);
        assert_eq!(r2.thread_id(), 0);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn concurrent_registration_is_dense() {
        let reg = Arc::new(ThreadRegistry::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(thread::spawn(move || reg.thread_id()));
        }
        let mut ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }
}
