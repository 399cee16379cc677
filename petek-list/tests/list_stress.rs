//! Multi-threaded list tests.

use petek_list::LinkedList;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
#[cfg_attr(miri, ignore)]
fn four_thread_pushes_meet_in_the_middle() {
    let list: Arc<LinkedList<u32>> = Arc::new(LinkedList::new());
    let mut handles = vec![];

    for side in 0..4 {
        let list = list.clone();
        handles.push(thread::spawn(move || {
            for v in 1..=1000u32 {
                if side % 2 == 0 {
                    list.push_front(v);
                } else {
                    list.push_back(v);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(list.len(), 4000);
    let mut counts: HashMap<u32, usize> = HashMap::new();
    let mut seen = 0usize;
    for v in list.iter() {
        *counts.entry(v).or_insert(0) += 1;
        seen += 1;
    }
    assert_eq!(seen, 4000);
    for v in 1..=1000u32 {
        assert_eq!(counts.get(&v), Some(&4), "value {v} lost or duplicated");
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn iterate_while_erasing() {
    const N: u32 = 10_000;
    let list: Arc<LinkedList<u32>> = Arc::new(LinkedList::new());
    for v in 0..N {
        list.push_back(v);
    }

    let mut handles = vec![];

    // Two erasers split the value space by parity and sweep until the
    // list is drained.
    for parity in 0..2u32 {
        let list = list.clone();
        handles.push(thread::spawn(move || {
            let mut erased = 0usize;
            while list.len() > 0 {
                let mut cursor = list.cursor_front();
                while !cursor.at_end() {
                    match cursor.get() {
                        Some(v) if v % 2 == parity => {
                            if list.erase(&mut cursor).is_some() {
                                erased += 1;
                            }
                        }
                        _ => {
                            cursor.move_next();
                        }
                    }
                }
            }
            erased
        }));
    }

    // A reader iterates concurrently; it must only ever see values that
    // were actually inserted, each at most once per pass.
    let reader = {
        let list = list.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                let mut last: Option<u32> = None;
                for v in list.iter() {
                    assert!(v < N);
                    if let Some(prev) = last {
                        assert!(v > prev, "iteration went backwards: {prev} then {v}");
                    }
                    last = Some(v);
                }
            }
        })
    };

    let erased: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    reader.join().unwrap();

    assert_eq!(erased, N as usize, "every element erased exactly once");
    assert_eq!(list.len(), 0);
    assert_eq!(list.iter().count(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_pop_drains_exactly_once() {
    const N: u32 = 10_000;
    let list: Arc<LinkedList<u32>> = Arc::new(LinkedList::new());
    for v in 0..N {
        list.push_back(v);
    }

    let popped = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];
    for side in 0..4 {
        let list = list.clone();
        let popped = popped.clone();
        handles.push(thread::spawn(move || {
            let mut seen = vec![];
            loop {
                let v = if side % 2 == 0 {
                    list.pop_front()
                } else {
                    list.pop_back()
                };
                match v {
                    Some(v) => {
                        seen.push(v);
                        popped.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
            seen
        }));
    }

    let mut all: Vec<u32> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), N as usize, "duplicate or lost pops");
    assert_eq!(popped.load(Ordering::Relaxed), N as usize);
    assert_eq!(list.len(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn randomized_mixed_operations() {
    let list: Arc<LinkedList<u64>> = Arc::new(LinkedList::new());
    let net = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for _ in 0..4 {
        let list = list.clone();
        let net = net.clone();
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            for _ in 0..20_000 {
                match rng.random_range(0..4u8) {
                    0 => {
                        list.push_front(rng.random_range(0..1000));
                        net.fetch_add(1, Ordering::Relaxed);
                    }
                    1 => {
                        list.push_back(rng.random_range(0..1000));
                        net.fetch_add(1, Ordering::Relaxed);
                    }
                    2 => {
                        if list.pop_front().is_some() {
                            net.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                    _ => {
                        if list.pop_back().is_some() {
                            net.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Quiescent: the clamped size and a full walk agree with the ledger.
    let expected = net.load(Ordering::Relaxed);
    assert_eq!(list.len(), expected);
    assert_eq!(list.iter().count(), expected);
}
