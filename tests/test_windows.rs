// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The mutex-pair lock on Windows. Attachments open the same named objects;
// contention always comes from another thread since the mutexes are
// owned per thread.

#![cfg(windows)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use prwlock::{Access, Error, LockConfig, RwLock, Snapshot, TimeoutStrategy};

fn init_logging() {
    let _ = env_logger::builder()
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

fn attachment(lock: &RwLock) -> RwLock {
    RwLock::attach(lock.snapshot()).expect("attach")
}

#[test]
fn basic_write_and_read() {
    init_logging();
    let lock = RwLock::new().expect("new");
    assert!(lock.acquire_write(None).unwrap());
    lock.release().unwrap();
    assert!(lock.acquire_read(None).unwrap());
    lock.release().unwrap();
    assert!(matches!(lock.release(), Err(Error::NotHeld)));
}

#[test]
fn snapshot_names_the_objects() {
    let lock = RwLock::new().expect("new");
    let snap = lock.snapshot();
    assert_eq!(snap.owner_pid(), std::process::id());
    assert!(snap.tag().starts_with("prwlock-"));
    assert_eq!(snap.to_string().parse::<Snapshot>().unwrap(), snap);

    let other = attachment(&lock);
    assert!(!other.is_creator());
    assert_eq!(other.snapshot().tag(), snap.tag());
}

#[test]
fn attaching_an_unknown_tag_fails() {
    let err = RwLock::attach(Snapshot::new("prwlock-no-such-lock", 1, 0)).unwrap_err();
    assert!(matches!(err, Error::Segment { .. }), "{err}");
}

#[test]
fn writer_excludes_other_attachment() {
    init_logging();
    let lock = RwLock::new().expect("new");
    let other = attachment(&lock);

    assert!(lock.try_acquire_write().unwrap());
    thread::scope(|s| {
        s.spawn(|| {
            assert!(!other.try_acquire_read().unwrap());
            assert!(!other.try_acquire_write().unwrap());
            assert_eq!(other.held_count(), 0);
        });
    });
    lock.release().unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            assert!(other.try_acquire_write().unwrap());
            other.release().unwrap();
        });
    });
}

#[test]
fn readers_share_and_block_writers() {
    let lock = RwLock::new().expect("new");
    let other = attachment(&lock);

    assert!(lock.try_acquire_read().unwrap());
    thread::scope(|s| {
        s.spawn(|| {
            assert!(other.try_acquire_read().unwrap());
            other.release().unwrap();
            assert!(!other.try_acquire_write().unwrap());
        });
    });
    lock.release().unwrap();
}

#[test]
fn waiting_writer_gets_in_after_the_reader_leaves() {
    let lock = RwLock::new().expect("new");
    let other = attachment(&lock);
    let writer_in = AtomicBool::new(false);

    let g = lock.read().unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            let w = other.write().unwrap();
            assert_eq!(w.access(), Access::Write);
            writer_in.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!writer_in.load(Ordering::SeqCst));
        drop(g);
    });
    assert!(writer_in.load(Ordering::SeqCst));
}

#[test]
fn announced_writer_turns_new_readers_away() {
    let config = LockConfig::new().poll_interval(Duration::from_millis(10));
    let lock = RwLock::with_config(config).expect("new");
    let other = RwLock::attach_with_config(lock.snapshot(), config).expect("attach");

    assert!(lock.try_acquire_read().unwrap());
    thread::scope(|s| {
        let writer = s.spawn(|| {
            let got = other.acquire_write(Some(Duration::from_millis(300))).unwrap();
            if got {
                other.release().unwrap();
            }
            got
        });
        thread::sleep(Duration::from_millis(50));
        // The writer is announced and waiting on us, so a fresh read backs off.
        thread::scope(|inner| {
            inner.spawn(|| assert!(!lock.try_acquire_read().unwrap()));
        });
        lock.release().unwrap();
        assert!(writer.join().unwrap());
    });
    assert_eq!(other.held_count(), 0);
}

fn timed_write_times_out(strategy: TimeoutStrategy) {
    init_logging();
    let config = LockConfig::new()
        .timeout_strategy(strategy)
        .poll_interval(Duration::from_millis(20));
    let lock = RwLock::with_config(config).expect("new");
    let other = RwLock::attach_with_config(lock.snapshot(), config).expect("attach");
    assert_eq!(other.timeout_strategy(), strategy);

    let timeout = Duration::from_millis(200);
    assert!(lock.acquire_write(None).unwrap());
    thread::scope(|s| {
        s.spawn(|| {
            let start = Instant::now();
            assert!(!other.acquire_write(Some(timeout)).unwrap());
            let elapsed = start.elapsed();
            assert!(elapsed >= timeout - Duration::from_millis(16), "returned early: {elapsed:?}");
            assert!(
                elapsed < timeout + Duration::from_millis(20) + Duration::from_millis(100),
                "returned late: {elapsed:?}"
            );
            assert!(!other.acquire_read(Some(Duration::from_millis(30))).unwrap());
            assert_eq!(other.held_count(), 0);
        });
    });
    lock.release().unwrap();
}

#[test]
fn timed_write_times_out_natively() {
    timed_write_times_out(TimeoutStrategy::Native);
}

#[test]
fn timed_write_times_out_by_polling() {
    timed_write_times_out(TimeoutStrategy::Emulated);
}

#[test]
fn writer_that_cannot_drain_readers_backs_out() {
    let lock = RwLock::new().expect("new");
    let other = attachment(&lock);

    assert!(lock.try_acquire_read().unwrap());
    thread::scope(|s| {
        s.spawn(|| {
            assert!(!other.acquire_write(Some(Duration::from_millis(100))).unwrap());
        });
    });
    // The failed writer left nothing behind: a second reader gets in.
    thread::scope(|s| {
        s.spawn(|| {
            assert!(other.try_acquire_read().unwrap());
            other.release().unwrap();
        });
    });
    lock.release().unwrap();
}

#[test]
fn drop_releases_outstanding_holds() {
    let lock = RwLock::new().expect("new");
    let other = attachment(&lock);
    {
        let third = attachment(&lock);
        assert!(third.try_acquire_read().unwrap());
        assert!(third.try_acquire_read().unwrap());
    }
    assert!(other.try_acquire_write().unwrap());
    other.release().unwrap();
}
