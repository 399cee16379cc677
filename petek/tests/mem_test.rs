//! Reclamation tests for the hazard memory manager.
//!
//! A minimal single-link node config exercises the full protocol:
//! create, publish, detach, delete, scan, reuse.

use petek::{HazardManaged, HazardMem, HazardMemConfig, HazardNode, Link, LinkVal};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

struct Cell {
    base: HazardNode,
    out: Link<Cell>,
    value: usize,
}

impl Cell {
    fn new(value: usize) -> Self {
        Self {
            base: HazardNode::new(),
            out: Link::new(),
            value,
        }
    }
}

impl HazardManaged for Cell {
    fn hazard_node(&self) -> &HazardNode {
        &self.base
    }
}

struct Cfg;

impl HazardMemConfig for Cfg {
    type Node = Cell;
    const LINK_MAX: usize = 1;
    const LINK_DEL_MAX: usize = 1;
    const HAZARD_MAX: usize = 4;

    fn clean_up_node(&self, mem: &HazardMem<Self>, node: *mut Cell) {
        // A neighbor is worth swinging past when its own out-link
        // carries the delete mark, the same witness containers set
        // before they ever call delete_node.
        loop {
            let target = mem.de_ref_link(unsafe { &(*node).out });
            if target.is_null() {
                break;
            }
            if !unsafe { &(*target).out }.load(Ordering::SeqCst).mark() {
                mem.release_ref(target);
                break;
            }
            let target2 = mem.de_ref_link(unsafe { &(*target).out });
            let cur = unsafe { &(*node).out }.load(Ordering::SeqCst);
            if cur.ptr() == target {
                let _ = mem.cas_ref(
                    unsafe { &(*node).out },
                    LinkVal::new(target2, cur.mark()),
                    cur,
                );
            }
            if !target2.is_null() {
                mem.release_ref(target2);
            }
            mem.release_ref(target);
        }
    }

    fn terminate_node(&self, mem: &HazardMem<Self>, node: *mut Cell, concurrent: bool) {
        let out = unsafe { &(*node).out };
        if !concurrent {
            mem.store_ref(out, LinkVal::null());
            return;
        }
        loop {
            let old = out.load(Ordering::SeqCst);
            if old.ptr().is_null() || mem.cas_ref(out, LinkVal::null(), old) {
                break;
            }
        }
    }
}

#[test]
fn publish_detach_delete_cycle_stays_bounded() {
    let mem = HazardMem::new(Cfg, 2);
    let slot: Link<Cell> = Link::new();
    for i in 0..10_000 {
        let node = mem.create_node(Cell::new(i));
        mem.store_ref(&slot, LinkVal::new(node, false));
        mem.release_ref(node);

        let cur = slot.load(Ordering::SeqCst);
        assert!(mem.cas_ref(&slot, LinkVal::null(), cur));
        mem.delete_node(cur.ptr());
    }
    // thresh_clean = 2 * (4 + 1 + 1 + 1) = 14 pending nodes at most, far
    // below one slab.
    assert!(
        mem.node_capacity() <= 64,
        "reclamation failed to recycle slots: capacity {}",
        mem.node_capacity()
    );
}

#[test]
fn chained_deletes_are_cleaned_up() {
    let mem = HazardMem::new(Cfg, 2);
    let slot: Link<Cell> = Link::new();
    for round in 0..2_000 {
        let a = mem.create_node(Cell::new(round));
        let b = mem.create_node(Cell::new(round + 1));
        mem.store_ref(unsafe { &(*a).out }, LinkVal::new(b, false));
        mem.store_ref(&slot, LinkVal::new(a, false));
        mem.release_ref(a);
        mem.release_ref(b);

        // Detach b first so a's out-link dangles on a deleted node until
        // clean_up_node swings it.
        let b_link = unsafe { &(*a).out }.load(Ordering::SeqCst);
        assert!(mem.cas_ref(unsafe { &(*a).out }, LinkVal::null(), b_link));
        mem.delete_node(b_link.ptr());

        let a_link = slot.load(Ordering::SeqCst);
        assert!(mem.cas_ref(&slot, LinkVal::null(), a_link));
        mem.delete_node(a_link.ptr());
    }
    assert!(mem.node_capacity() <= 64);
}

#[test]
fn de_ref_link_is_idempotent_per_thread() {
    let mem = HazardMem::new(Cfg, 2);
    let slot: Link<Cell> = Link::new();
    let node = mem.create_node(Cell::new(7));
    mem.store_ref(&slot, LinkVal::new(node, false));
    mem.release_ref(node);

    // Far more dereferences than hazard slots: repeats must share one.
    let mut held = Vec::new();
    for _ in 0..32 {
        let p = mem.de_ref_link(&slot);
        assert_eq!(p, node);
        held.push(p);
    }
    for p in held {
        mem.release_ref(p);
    }

    let cur = slot.load(Ordering::SeqCst);
    assert!(mem.cas_ref(&slot, LinkVal::null(), cur));
    mem.delete_node(cur.ptr());
}

#[test]
fn delete_marks_the_node_deleted() {
    let mem = HazardMem::new(Cfg, 2);
    let node = mem.create_node(Cell::new(3));
    assert!(!unsafe { (*node).hazard_node() }.is_deleted());
    mem.delete_node(node);
    // Our hazard hold keeps the node pinned, so the flag is observable.
    assert!(unsafe { (*node).hazard_node() }.is_deleted());
    mem.release_ref(node);
}

#[test]
fn null_links_dereference_to_null() {
    let mem = HazardMem::new(Cfg, 2);
    let slot: Link<Cell> = Link::new();
    assert!(mem.de_ref_link(&slot).is_null());
}

#[test]
#[cfg_attr(miri, ignore)]
fn held_nodes_are_never_recycled_under_us() {
    // A writer keeps swapping the published node and deleting the old
    // one; a reader holds each node through a hazard and checks that the
    // value it read stays the value it reads, which fails if the slot is
    // recycled while held.
    let mem = Arc::new(HazardMem::new(Cfg, 4));
    let slot = Arc::new(Link::<Cell>::new());

    let writer = {
        let mem = mem.clone();
        let slot = slot.clone();
        thread::spawn(move || {
            for i in 0..50_000usize {
                let node = mem.create_node(Cell::new(i));
                loop {
                    let old = slot.load(Ordering::SeqCst);
                    if mem.cas_ref(&slot, LinkVal::new(node, false), old) {
                        if !old.ptr().is_null() {
                            mem.delete_node(old.ptr());
                        }
                        break;
                    }
                }
                mem.release_ref(node);
            }
        })
    };

    let reader = {
        let mem = mem.clone();
        let slot = slot.clone();
        thread::spawn(move || {
            for _ in 0..50_000 {
                let p = mem.de_ref_link(&slot);
                if p.is_null() {
                    continue;
                }
                let v1 = unsafe { (*p).value };
                std::hint::spin_loop();
                let v2 = unsafe { (*p).value };
                assert_eq!(v1, v2, "node recycled while hazard was held");
                mem.release_ref(p);
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();

    let cur = slot.load(Ordering::SeqCst);
    if !cur.ptr().is_null() {
        assert!(mem.cas_ref(&slot, LinkVal::null(), cur));
        mem.delete_node(cur.ptr());
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn over_subscription_panics() {
    let mem = Arc::new(HazardMem::new(Cfg, 1));
    // First registration from this thread.
    let node = mem.create_node(Cell::new(0));
    mem.release_ref(node);
    mem.delete_node(node);

    let mem2 = mem.clone();
    let second = thread::spawn(move || {
        let node = mem2.create_node(Cell::new(1));
        mem2.release_ref(node);
    });
    assert!(second.join().is_err(), "second thread must trip the limit");
}
