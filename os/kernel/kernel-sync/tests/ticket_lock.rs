use kernel_sync::{RawTicket, TicketMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex as StdMutex};
use std::{panic, thread};

#[test]
fn basic_lock_and_raii() {
    let l = TicketMutex::new(0_u32);

    // take the lock, mutate, and drop
    {
        let mut g = l.lock();
        *g = 41;
    }

    // lock again; previous drop must have unlocked
    {
        let mut g = l.lock();
        *g += 1;
        assert_eq!(*g, 42);
    }
    assert!(!l.raw().is_locked());
}

#[test]
fn try_lock_semantics() {
    let l = TicketMutex::new(1u8);

    let g1 = l.try_lock();
    assert!(g1.is_some());
    assert_eq!(**g1.as_ref().unwrap(), 1);

    // while held, try_lock must fail
    assert!(l.try_lock().is_none());

    drop(g1);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_works_and_unlocks() {
    let l = TicketMutex::new(String::from("a"));
    let len = l.with_lock(|s| {
        s.push('b');
        s.len()
    });
    assert_eq!(len, 2);

    let got = l.with_lock(|s| s.clone());
    assert_eq!(got, "ab");
}

#[test]
fn get_mut_allows_direct_mutation() {
    let mut l = TicketMutex::new(vec![1, 2, 3]);
    l.get_mut().push(4);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3, 4]);
    assert_eq!(l.into_inner(), vec![1, 2, 3, 4]);
}

#[test]
fn debug_output_never_blocks() {
    let l = TicketMutex::new(7_u16);
    assert_eq!(format!("{l:?}"), "Mutex { data: 7, .. }");
    let g = l.lock();
    assert_eq!(format!("{g:?}"), "7");
    assert_eq!(format!("{l:?}"), "Mutex { data: <locked>, .. }");
    drop(g);
    assert!(!l.raw().is_locked());
    assert_eq!(unsafe { *l.data_ptr() }, 7);
}

#[test]
fn contended_increments_are_exact_and_exclusive() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(TicketMutex::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let lock = Arc::clone(&lock);
        let in_cs = Arc::clone(&in_cs);
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..iters {
                lock.with_lock(|v| {
                    let prev = in_cs.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(prev, 0, "mutual exclusion violated");
                    *v += 1;
                    in_cs.fetch_sub(1, Ordering::SeqCst);
                });
                thread::yield_now();
            }
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(lock.with_lock(|v| *v), threads * iters);
    assert_eq!(in_cs.load(Ordering::SeqCst), 0);
}

#[test]
fn contenders_are_served_in_ticket_order() {
    let threads = 6;
    let iters = 500;

    let lock = Arc::new(RawTicket::new());
    // Only touched inside the ticket lock, so the std mutex is never contended.
    let served = Arc::new(StdMutex::new(Vec::with_capacity(threads * iters)));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let served = Arc::clone(&served);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    let ticket = lock.take();
                    served.lock().unwrap().push(ticket);
                    unsafe { lock.give() };
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let served = served.lock().unwrap();
    assert_eq!(served.len(), threads * iters);
    for (position, ticket) in served.iter().enumerate() {
        assert_eq!(*ticket, position, "ticket {ticket} served out of order");
    }
    assert!(!lock.is_locked());
}

#[test]
fn lock_is_released_on_panic() {
    let l = TicketMutex::new(0u32);

    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err(), "expected panic");

    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn early_return_releases_lock() {
    fn bump_if_even(l: &TicketMutex<u32>) -> Result<u32, &'static str> {
        let mut g = l.lock();
        if *g % 2 == 1 {
            return Err("odd");
        }
        *g += 1;
        Ok(*g)
    }

    let l = TicketMutex::new(0);
    assert_eq!(bump_if_even(&l), Ok(1));
    assert_eq!(bump_if_even(&l), Err("odd"));
    assert!(!l.raw().is_locked());
}

#[test]
fn ticket_mutex_is_sync_for_send_t() {
    fn takes_sync<S: Sync>(_s: &S) {}
    let l = TicketMutex::new(0u8);
    takes_sync(&l);
}
