//! Single-producer single-consumer double-ended ring buffer.
//!
//! A growable ring with one spin lock per end. When the two ends are far
//! apart (`size` outside `{0, 1, capacity-1, capacity}`) an operation
//! takes only its own end's lock; at those boundary sizes the end
//! indices touch adjacent slots, so the operation takes both locks, head
//! first, to keep lock order fixed. Growth and explicit resizing also
//! take both locks, copy the active region into a fresh array and reseat
//! `head = 0`, `tail = size`.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use petek::TTas;

/// Growable double-ended ring buffer for exactly two threads.
pub struct SpscDeque<T> {
    head_lock: TTas<()>,
    tail_lock: TTas<()>,
    /// Replaced only under both locks; read under at least one.
    buf: UnsafeCell<Box<[UnsafeCell<MaybeUninit<T>>]>>,
    head: AtomicUsize,
    tail: AtomicUsize,
    size: AtomicUsize,
    cap: AtomicUsize,
}

// SAFETY: slot access is serialized by the end locks; indices and size
// are atomic.
unsafe impl<T: Send> Send for SpscDeque<T> {}
unsafe impl<T: Send> Sync for SpscDeque<T> {}

impl<T: Send> SpscDeque<T> {
    pub fn new() -> Self {
        Self::with_capacity(8)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(2);
        Self {
            head_lock: TTas::new(()),
            tail_lock: TTas::new(()),
            buf: UnsafeCell::new(Self::alloc_buf(cap)),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            cap: AtomicUsize::new(cap),
        }
    }

    fn alloc_buf(cap: usize) -> Box<[UnsafeCell<MaybeUninit<T>>]> {
        (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect()
    }

    /// Sizes at which the two end indices touch adjacent slots and an
    /// operation must hold both locks.
    #[inline]
    fn is_boundary(size: usize, cap: usize) -> bool {
        size <= 1 || size + 1 >= cap
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap.load(Ordering::Acquire)
    }

    pub fn push_back(&self, value: T) {
        loop {
            let size = self.size.load(Ordering::Acquire);
            let cap = self.cap.load(Ordering::Acquire);
            if Self::is_boundary(size, cap) {
                let _hg = self.head_lock.lock();
                let _tg = self.tail_lock.lock();
                if self.size.load(Ordering::Relaxed) == self.cap.load(Ordering::Relaxed) {
                    self.expand();
                }
                // SAFETY: both locks held.
                unsafe { self.write_back(value) };
                return;
            }
            let _tg = self.tail_lock.lock();
            let now = self.size.load(Ordering::Acquire);
            if Self::is_boundary(now, self.cap.load(Ordering::Acquire)) {
                continue; // classification moved; retake with both locks
            }
            // SAFETY: tail lock held and the other end stays ≥ 1 slot
            // away (its boundary path would block on our lock).
            unsafe { self.write_back(value) };
            return;
        }
    }

    pub fn push_front(&self, value: T) {
        loop {
            let size = self.size.load(Ordering::Acquire);
            let cap = self.cap.load(Ordering::Acquire);
            if Self::is_boundary(size, cap) {
                let _hg = self.head_lock.lock();
                let _tg = self.tail_lock.lock();
                if self.size.load(Ordering::Relaxed) == self.cap.load(Ordering::Relaxed) {
                    self.expand();
                }
                // SAFETY: both locks held.
                unsafe { self.write_front(value) };
                return;
            }
            let _hg = self.head_lock.lock();
            let now = self.size.load(Ordering::Acquire);
            if Self::is_boundary(now, self.cap.load(Ordering::Acquire)) {
                continue;
            }
            // SAFETY: head lock held, see push_back.
            unsafe { self.write_front(value) };
            return;
        }
    }

    pub fn pop_front(&self) -> Option<T> {
        loop {
            let size = self.size.load(Ordering::Acquire);
            let cap = self.cap.load(Ordering::Acquire);
            if Self::is_boundary(size, cap) {
                let _hg = self.head_lock.lock();
                let _tg = self.tail_lock.lock();
                if self.size.load(Ordering::Relaxed) == 0 {
                    return None;
                }
                // SAFETY: both locks held.
                return Some(unsafe { self.take_front() });
            }
            let _hg = self.head_lock.lock();
            let now = self.size.load(Ordering::Acquire);
            if Self::is_boundary(now, self.cap.load(Ordering::Acquire)) {
                continue;
            }
            // SAFETY: head lock held, size stays ≥ 1 (see push_back).
            return Some(unsafe { self.take_front() });
        }
    }

    pub fn pop_back(&self) -> Option<T> {
        loop {
            let size = self.size.load(Ordering::Acquire);
            let cap = self.cap.load(Ordering::Acquire);
            if Self::is_boundary(size, cap) {
                let _hg = self.head_lock.lock();
                let _tg = self.tail_lock.lock();
                if self.size.load(Ordering::Relaxed) == 0 {
                    return None;
                }
                // SAFETY: both locks held.
                return Some(unsafe { self.take_back() });
            }
            let _tg = self.tail_lock.lock();
            let now = self.size.load(Ordering::Acquire);
            if Self::is_boundary(now, self.cap.load(Ordering::Acquire)) {
                continue;
            }
            // SAFETY: tail lock held, see pop_front.
            return Some(unsafe { self.take_back() });
        }
    }

    /// Grow capacity to at least `cap`, if it is not already there.
    pub fn reserve(&self, cap: usize) {
        let _hg = self.head_lock.lock();
        let _tg = self.tail_lock.lock();
        if cap > self.cap.load(Ordering::Relaxed) {
            self.realloc_to(cap);
        }
    }

    /// Set capacity to exactly `max(new_cap, len)`. Always reallocates
    /// and reseats the indices (`head = 0`, `tail = len`), even when the
    /// capacity does not change.
    pub fn resize(&self, new_cap: usize) {
        let _hg = self.head_lock.lock();
        let _tg = self.tail_lock.lock();
        let new_cap = new_cap.max(self.size.load(Ordering::Relaxed)).max(2);
        self.realloc_to(new_cap);
    }

    /// 50% + 1 growth. Caller holds both locks.
    fn expand(&self) {
        let cap = self.cap.load(Ordering::Relaxed);
        self.realloc_to(cap + cap / 2 + 1);
    }

    /// Caller holds both locks and guarantees `new_cap >= size`.
    fn realloc_to(&self, new_cap: usize) {
        let cap = self.cap.load(Ordering::Relaxed);
        let size = self.size.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        let new_buf = Self::alloc_buf(new_cap);
        // SAFETY: exclusive slot access under both locks; the active
        // region holds exactly `size` initialized values.
        unsafe {
            let old = &*self.buf.get();
            for i in 0..size {
                let value = (*old[(head + i) % cap].get()).assume_init_read();
                (*new_buf[i].get()).write(value);
            }
        }
        // SAFETY: old references above are out of scope; replacing the
        // buffer drops only the empty old box.
        unsafe { *self.buf.get() = new_buf };
        self.cap.store(new_cap, Ordering::Release);
        self.head.store(0, Ordering::Release);
        self.tail.store(size, Ordering::Release);
    }

    unsafe fn write_back(&self, value: T) {
        let cap = self.cap.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        unsafe {
            let buf = &*self.buf.get();
            (*buf[tail].get()).write(value);
        }
        self.tail.store((tail + 1) % cap, Ordering::Release);
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    unsafe fn write_front(&self, value: T) {
        let cap = self.cap.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        let head = (head + cap - 1) % cap;
        unsafe {
            let buf = &*self.buf.get();
            (*buf[head].get()).write(value);
        }
        self.head.store(head, Ordering::Release);
        self.size.fetch_add(1, Ordering::AcqRel);
    }

    unsafe fn take_front(&self) -> T {
        let cap = self.cap.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        let value = unsafe {
            let buf = &*self.buf.get();
            (*buf[head].get()).assume_init_read()
        };
        self.head.store((head + 1) % cap, Ordering::Release);
        self.size.fetch_sub(1, Ordering::AcqRel);
        value
    }

    unsafe fn take_back(&self) -> T {
        let cap = self.cap.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let tail = (tail + cap - 1) % cap;
        let value = unsafe {
            let buf = &*self.buf.get();
            (*buf[tail].get()).assume_init_read()
        };
        self.tail.store(tail, Ordering::Release);
        self.size.fetch_sub(1, Ordering::AcqRel);
        value
    }
}

impl<T: Send> Default for SpscDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SpscDeque<T> {
    fn drop(&mut self) {
        let cap = self.cap.load(Ordering::Relaxed);
        let size = self.size.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Relaxed);
        // SAFETY: exclusive access in Drop.
        unsafe {
            let buf = &*self.buf.get();
            for i in 0..size {
                core::ptr::drop_in_place((*buf[(head + i) % cap].get()).as_mut_ptr());
            }
        }
    }
}
