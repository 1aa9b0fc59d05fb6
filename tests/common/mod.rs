// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fork helper for the cross-process tests.

#![allow(dead_code)]

use std::panic::{catch_unwind, AssertUnwindSafe};

/// Run `body` in a forked child and return its exit status.
///
/// The child never returns into the test harness: it leaves through
/// `_exit`, so nothing inherited from the parent (including lock instances
/// the closure forgets) is dropped there. A panic becomes exit status 101.
pub fn in_child<F>(body: F) -> i32
where
    F: FnOnce() -> i32,
{
    match unsafe { libc::fork() } {
        -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
        0 => {
            let code = catch_unwind(AssertUnwindSafe(body)).unwrap_or(101);
            unsafe { libc::_exit(code) }
        }
        child => wait_for(child),
    }
}

pub fn wait_for(child: libc::pid_t) -> i32 {
    let mut status = 0;
    loop {
        let rc = unsafe { libc::waitpid(child, &mut status, 0) };
        if rc == child {
            break;
        }
        let err = std::io::Error::last_os_error();
        assert_eq!(err.raw_os_error(), Some(libc::EINTR), "waitpid: {err}");
    }
    assert!(libc::WIFEXITED(status), "child did not exit normally: {status:#x}");
    libc::WEXITSTATUS(status)
}

/// Exit codes used by children to say which check failed.
pub const OK: i32 = 0;
pub const FAILED: i32 = 1;

pub fn code(ok: bool) -> i32 {
    if ok {
        OK
    } else {
        FAILED
    }
}
