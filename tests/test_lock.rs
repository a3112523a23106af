// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for process-shared locks constructed inside the segment. Threads
// stand in for processes: each one re-derives the lock address from the
// segment offset through its own pool handle, exactly as a second process
// would after attaching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use shmpool::{ShmMutex, ShmPool, ShmRwLock};

const MIB: usize = 1024 * 1024;

fn pool() -> Arc<ShmPool> {
    Arc::new(ShmPool::bootstrap(MIB, false).expect("bootstrap"))
}

#[test]
fn mutex_lock_unlock_cycles() {
    let p = pool();
    let storage = p.alloc(ShmMutex::SIZE).expect("alloc mutex storage");
    let mtx = unsafe { ShmMutex::init_at(storage).expect("init mutex") };

    for _ in 0..100 {
        mtx.lock().expect("lock");
        mtx.unlock().expect("unlock");
    }
}

#[test]
fn mutex_guards_shared_counter() {
    let p = pool();
    let mtx_off = p.addr_to_offset(p.alloc(ShmMutex::SIZE).expect("alloc mutex storage"));
    let counter_off = p.addr_to_offset(p.alloc(8).expect("alloc counter"));

    unsafe {
        ShmMutex::init_at(p.offset_to_addr(mtx_off)).expect("init mutex");
        *(p.offset_to_addr(counter_off) as *mut u64) = 0;
    }

    let threads = 4;
    let iterations = 250u64;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let p = Arc::clone(&p);
            thread::spawn(move || {
                let mtx = unsafe { ShmMutex::from_raw(p.offset_to_addr(mtx_off)) };
                let counter = p.offset_to_addr(counter_off) as *mut u64;
                for _ in 0..iterations {
                    mtx.lock().expect("lock");
                    // Non-atomic update; only the mutex keeps this sound.
                    unsafe { *counter += 1 };
                    mtx.unlock().expect("unlock");
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let total = unsafe { *(p.offset_to_addr(counter_off) as *const u64) };
    assert_eq!(total, threads as u64 * iterations);
}

#[test]
fn mutex_try_lock_reports_contention() {
    let p = pool();
    let off = p.addr_to_offset(p.alloc(ShmMutex::SIZE).expect("alloc mutex storage"));
    let mtx = unsafe { ShmMutex::init_at(p.offset_to_addr(off)).expect("init mutex") };

    mtx.lock().expect("lock main");

    let contended = Arc::new(AtomicBool::new(false));
    let contended_ref = Arc::clone(&contended);
    let p2 = Arc::clone(&p);
    let t = thread::spawn(move || {
        let mtx = unsafe { ShmMutex::from_raw(p2.offset_to_addr(off)) };
        match mtx.try_lock().expect("try_lock") {
            true => mtx.unlock().expect("unlock"),
            false => contended_ref.store(true, Ordering::SeqCst),
        }
    });
    t.join().unwrap();

    mtx.unlock().expect("unlock main");
    assert!(contended.load(Ordering::SeqCst), "try_lock should have failed under contention");
}

#[test]
fn rwlock_readers_share_the_lock() {
    let p = pool();
    let off = p.addr_to_offset(p.alloc(ShmRwLock::SIZE).expect("alloc rwlock storage"));
    unsafe { ShmRwLock::init_at(p.offset_to_addr(off)).expect("init rwlock") };

    let readers = 3;
    // Every reader must be inside the critical section at the same time for
    // the barrier to release.
    let barrier = Arc::new(Barrier::new(readers));

    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let p = Arc::clone(&p);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let rw = unsafe { ShmRwLock::from_raw(p.offset_to_addr(off)) };
                rw.read_lock().expect("read_lock");
                barrier.wait();
                rw.unlock().expect("unlock");
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn rwlock_writer_excludes_readers() {
    let p = pool();
    let off = p.addr_to_offset(p.alloc(ShmRwLock::SIZE).expect("alloc rwlock storage"));
    let rw = unsafe { ShmRwLock::init_at(p.offset_to_addr(off)).expect("init rwlock") };

    rw.write_lock().expect("write_lock");

    let got_in = Arc::new(AtomicBool::new(false));
    let got_in_ref = Arc::clone(&got_in);
    let p2 = Arc::clone(&p);
    let reader = thread::spawn(move || {
        let rw = unsafe { ShmRwLock::from_raw(p2.offset_to_addr(off)) };
        rw.read_lock().expect("read_lock");
        got_in_ref.store(true, Ordering::SeqCst);
        rw.unlock().expect("unlock");
    });

    thread::sleep(Duration::from_millis(50));
    assert!(!got_in.load(Ordering::SeqCst), "reader entered while the writer held the lock");

    rw.unlock().expect("unlock writer");
    reader.join().unwrap();
    assert!(got_in.load(Ordering::SeqCst));
}

#[test]
fn lock_storage_fits_smallest_chunks() {
    // Both lock types must fit in pool chunks without special casing.
    let p = pool();
    let m = p.alloc(ShmMutex::SIZE).expect("mutex storage");
    let r = p.alloc(ShmRwLock::SIZE).expect("rwlock storage");
    unsafe {
        ShmMutex::init_at(m).expect("init mutex");
        ShmRwLock::init_at(r).expect("init rwlock");
    }
}
