// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Parent and forked child sharing one lock page.
// No logger is installed here: a child forked while another test thread
// holds the stderr lock would hang on its first log line.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use common::{code, in_child, FAILED, OK};
use prwlock::{RwLock, Snapshot};

fn getpid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

#[test]
fn child_attach_starts_with_nothing_held() {
    let lock = RwLock::new().expect("new");
    lock.acquire_read(None).unwrap();
    let snap = lock.snapshot();
    assert_eq!(snap.held_count(), 1);

    let status = in_child(|| {
        let Ok(child) = RwLock::attach(snap) else {
            return FAILED;
        };
        let ok = child.held_count() == 0 && child.owner_pid() == getpid() && !child.is_creator();
        code(ok)
    });
    assert_eq!(status, OK);
    lock.release().unwrap();
}

#[test]
fn same_pid_attach_keeps_the_held_count() {
    let lock = RwLock::new().expect("new");

    let status = in_child(move || {
        // A snapshot handed over within one process carries its count.
        let snap = Snapshot::new(std::os::fd::AsRawFd::as_raw_fd(&lock), getpid(), 2);
        let Ok(again) = RwLock::attach(snap) else {
            return FAILED;
        };
        let ok = again.held_count() == 2;
        // Nothing is really held; leave through _exit without unlocking.
        std::mem::forget(again);
        std::mem::forget(lock);
        code(ok)
    });
    assert_eq!(status, OK);
}

#[test]
fn child_sees_parent_writer() {
    let lock = RwLock::new().expect("new");
    assert!(lock.acquire_write(None).unwrap());
    let snap = lock.snapshot();

    let status = in_child(|| {
        let Ok(child) = RwLock::attach(snap) else {
            return FAILED;
        };
        let busy = matches!(child.try_acquire_write(), Ok(false))
            && matches!(child.try_acquire_read(), Ok(false));
        let start = Instant::now();
        let timed_out = matches!(child.acquire_read(Some(Duration::from_millis(200))), Ok(false))
            && start.elapsed() >= Duration::from_millis(200);
        code(busy && timed_out && child.held_count() == 0)
    });
    assert_eq!(status, OK);

    lock.release().unwrap();
    let status = in_child(|| {
        let Ok(child) = RwLock::attach(snap) else {
            return FAILED;
        };
        let got = matches!(child.try_acquire_write(), Ok(true));
        code(got && child.release().is_ok())
    });
    assert_eq!(status, OK);
}

#[test]
fn readers_share_across_processes() {
    let lock = RwLock::new().expect("new");
    assert!(lock.acquire_read(None).unwrap());
    let snap = lock.snapshot();

    let status = in_child(|| {
        let Ok(child) = RwLock::attach(snap) else {
            return FAILED;
        };
        let shared = matches!(child.try_acquire_read(), Ok(true));
        let excluded = matches!(child.try_acquire_write(), Ok(false));
        code(shared && excluded && child.release().is_ok())
    });
    assert_eq!(status, OK);
    lock.release().unwrap();
}

#[test]
fn child_writer_blocks_parent_until_it_exits() {
    let lock = RwLock::new().expect("new");
    let snap = lock.snapshot();

    // Pipe so the parent only probes once the child holds the lock.
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (rd, wr) = (fds[0], fds[1]);

    let child = match unsafe { libc::fork() } {
        -1 => panic!("fork: {}", std::io::Error::last_os_error()),
        0 => {
            let rc = match RwLock::attach(snap) {
                Ok(c) if matches!(c.acquire_write(None), Ok(true)) => {
                    unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) };
                    std::thread::sleep(Duration::from_millis(300));
                    // Teardown releases the held write lock.
                    drop(c);
                    OK
                }
                _ => FAILED,
            };
            unsafe { libc::_exit(rc) }
        }
        pid => pid,
    };

    unsafe { libc::close(wr) };
    let mut byte = 0u8;
    let n = unsafe { libc::read(rd, (&mut byte as *mut u8).cast(), 1) };
    unsafe { libc::close(rd) };
    assert_eq!(n, 1, "child never took the lock");

    assert!(!lock.try_acquire_read().unwrap());
    assert!(lock.acquire_write(Some(Duration::from_secs(5))).unwrap());
    lock.release().unwrap();
    assert_eq!(common::wait_for(child), OK);
}

#[test]
fn forked_copy_drops_without_touching_parent_holds() {
    let lock = RwLock::new().expect("new");
    assert!(lock.acquire_write(None).unwrap());

    let status = in_child(|| {
        // The child's copy of the instance believes it holds one lock, but
        // that hold belongs to the parent.
        let copy: RwLock = unsafe { std::ptr::read(&lock) };
        let reset = copy.held_count() == 0 && !copy.is_creator();
        drop(copy);
        code(reset)
    });
    assert_eq!(status, OK);

    // Still held by us, and still a live lock.
    assert_eq!(lock.held_count(), 1);
    lock.release().unwrap();
    assert!(lock.try_acquire_write().unwrap());
    lock.release().unwrap();
}

#[test]
fn end_to_end_with_timeouts() {
    let lock = RwLock::new().expect("new");
    let timeout = Duration::from_millis(200);
    assert!(lock.acquire_write(Some(timeout)).unwrap());
    let snap = lock.snapshot();

    let status = in_child(|| {
        let Ok(child) = RwLock::attach(snap) else {
            return FAILED;
        };
        code(matches!(child.acquire_write(Some(timeout)), Ok(false)))
    });
    assert_eq!(status, OK);

    lock.release().unwrap();
    let status = in_child(|| {
        let Ok(child) = RwLock::attach(snap) else {
            return FAILED;
        };
        let got = matches!(child.acquire_write(Some(timeout)), Ok(true));
        code(got && child.release().is_ok())
    });
    assert_eq!(status, OK);
}
