// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows implementation of the lock page and the named mutexes the lock is
// built from. The page is a pagefile-backed named file mapping holding the
// active writer and the reader count. All three kernel objects share one
// name tag, so any process that knows the tag can open them.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::warn;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, FALSE, HANDLE, INVALID_HANDLE_VALUE, TRUE,
    WAIT_ABANDONED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE, SEC_COMMIT,
};
use windows_sys::Win32::System::Threading::{
    CreateMutexW, GetCurrentProcessId, GetCurrentThreadId, OpenMutexW, ReleaseMutex,
    WaitForMultipleObjects, WaitForSingleObject, INFINITE, MUTEX_ALL_ACCESS,
};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Host facts
// ---------------------------------------------------------------------------

pub fn current_pid() -> u32 {
    unsafe { GetCurrentProcessId() }
}

pub fn current_tid() -> u32 {
    unsafe { GetCurrentThreadId() }
}

/// Fresh tag for a new lock: `prwlock-<pid>-<n>`.
pub fn unique_tag() -> String {
    static NEXT: AtomicU32 = AtomicU32::new(0);
    format!(
        "prwlock-{}-{}",
        current_pid(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// Wait budget in milliseconds, rounded up. `None` waits forever.
pub fn millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => INFINITE,
        Some(t) => t.as_nanos().div_ceil(1_000_000).min(u128::from(INFINITE - 1)) as u32,
    }
}

/// Encode a name as a null-terminated wide string for Win32 APIs.
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_error(op: &'static str) -> Error {
    Error::Native {
        op,
        code: unsafe { GetLastError() } as i32,
    }
}

/// Handles are inheritable so a spawned child can use them directly.
fn inheritable() -> SECURITY_ATTRIBUTES {
    SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    }
}

fn close_handle(handle: HANDLE, what: &str) {
    if unsafe { CloseHandle(handle) } == 0 {
        warn!("closing {what} failed: {}", io::Error::last_os_error());
    }
}

fn already_exists(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("kernel object {name:?} already exists"),
    )
}

// ---------------------------------------------------------------------------
// LockState: the shared words at the start of the page
// ---------------------------------------------------------------------------

/// Writer identity and reader count. Changed only with the reader mutex held.
#[repr(C)]
pub struct LockState {
    writer_pid: AtomicU32,
    writer_tid: AtomicU32,
    readers: AtomicU32,
}

impl LockState {
    /// `(pid, thread id)` of the announced writer, if any.
    pub fn writer(&self) -> Option<(u32, u32)> {
        match self.writer_pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some((pid, self.writer_tid.load(Ordering::Acquire))),
        }
    }

    pub fn set_writer(&self, pid: u32, tid: u32) {
        self.writer_tid.store(tid, Ordering::Release);
        self.writer_pid.store(pid, Ordering::Release);
    }

    pub fn clear_writer(&self) {
        self.writer_pid.store(0, Ordering::Release);
        self.writer_tid.store(0, Ordering::Release);
    }

    pub fn readers(&self) -> u32 {
        self.readers.load(Ordering::Acquire)
    }

    pub fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    /// `false` if there was no reader to remove.
    pub fn remove_reader(&self) -> bool {
        self.readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn reset(&self) {
        self.clear_writer();
        self.readers.store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// NamedPage: pagefile-backed named mapping
// ---------------------------------------------------------------------------

const PAGE_LEN: u32 = 4096;

pub struct NamedPage {
    handle: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
}

// Safety: the view is process-shared by design; the words in it are atomics.
unsafe impl Send for NamedPage {}
unsafe impl Sync for NamedPage {}

impl NamedPage {
    /// Create the page; fails if a page with this name already exists.
    pub fn create(name: &str) -> Result<Self> {
        let wide = to_wide(name);
        let sa = inheritable();
        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                &sa,
                PAGE_READWRITE | SEC_COMMIT,
                0,
                PAGE_LEN,
                wide.as_ptr(),
            )
        };
        if handle.is_null() {
            return Err(Error::segment("CreateFileMappingW", io::Error::last_os_error()));
        }
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            close_handle(handle, "file mapping");
            return Err(Error::segment("CreateFileMappingW", already_exists(name)));
        }
        let page = Self::map(handle)?;
        page.state().reset();
        Ok(page)
    }

    /// Open the page another lock instance created.
    pub fn open(name: &str) -> Result<Self> {
        let wide = to_wide(name);
        let handle = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, FALSE, wide.as_ptr()) };
        if handle.is_null() {
            return Err(Error::segment("OpenFileMappingW", io::Error::last_os_error()));
        }
        Self::map(handle)
    }

    fn map(handle: HANDLE) -> Result<Self> {
        let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, PAGE_LEN as usize) };
        if view.Value.is_null() {
            let err = io::Error::last_os_error();
            close_handle(handle, "file mapping");
            return Err(Error::segment("MapViewOfFile", err));
        }
        Ok(Self { handle, view })
    }

    pub fn state(&self) -> &LockState {
        unsafe { &*(self.view.Value as *const LockState) }
    }
}

impl Drop for NamedPage {
    fn drop(&mut self) {
        if unsafe { UnmapViewOfFile(self.view) } == 0 {
            warn!("unmapping lock page failed: {}", io::Error::last_os_error());
        }
        close_handle(self.handle, "file mapping");
    }
}

// ---------------------------------------------------------------------------
// NamedMutex
// ---------------------------------------------------------------------------

/// Map a wait result over `count` handles: signalled or abandoned is `true`,
/// timeout is `false`. An abandoned mutex is ours now; its owner exited.
fn waited(op: &'static str, rc: u32, count: u32) -> Result<bool> {
    if (WAIT_OBJECT_0..WAIT_OBJECT_0 + count).contains(&rc) {
        Ok(true)
    } else if (WAIT_ABANDONED..WAIT_ABANDONED + count).contains(&rc) {
        warn!("{op}: previous owner exited while holding the lock");
        Ok(true)
    } else if rc == WAIT_TIMEOUT {
        Ok(false)
    } else {
        Err(last_error(op))
    }
}

/// A named Win32 mutex. Owned by a thread, recursive for that thread.
pub struct NamedMutex {
    handle: HANDLE,
}

unsafe impl Send for NamedMutex {}
unsafe impl Sync for NamedMutex {}

impl NamedMutex {
    /// Create the mutex unowned; fails if one with this name already exists.
    pub fn create(name: &str) -> Result<Self> {
        let wide = to_wide(name);
        let sa = inheritable();
        let handle = unsafe { CreateMutexW(&sa, FALSE, wide.as_ptr()) };
        if handle.is_null() {
            return Err(Error::segment("CreateMutexW", io::Error::last_os_error()));
        }
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            close_handle(handle, "mutex");
            return Err(Error::segment("CreateMutexW", already_exists(name)));
        }
        Ok(Self { handle })
    }

    pub fn open(name: &str) -> Result<Self> {
        let wide = to_wide(name);
        let handle = unsafe { OpenMutexW(MUTEX_ALL_ACCESS, TRUE, wide.as_ptr()) };
        if handle.is_null() {
            return Err(Error::segment("OpenMutexW", io::Error::last_os_error()));
        }
        Ok(Self { handle })
    }

    /// Block until this thread owns the mutex.
    pub fn lock(&self) -> Result<()> {
        let rc = unsafe { WaitForSingleObject(self.handle, INFINITE) };
        match waited("WaitForSingleObject", rc, 1)? {
            true => Ok(()),
            false => Err(last_error("WaitForSingleObject")),
        }
    }

    /// Single non-blocking attempt.
    pub fn try_lock(&self) -> Result<bool> {
        let rc = unsafe { WaitForSingleObject(self.handle, 0) };
        waited("WaitForSingleObject", rc, 1)
    }

    pub fn unlock(&self) -> Result<()> {
        if unsafe { ReleaseMutex(self.handle) } == 0 {
            return Err(last_error("ReleaseMutex"));
        }
        Ok(())
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        close_handle(self.handle, "mutex");
    }
}

/// Own both mutexes at once or neither, waiting at most `ms` milliseconds.
pub fn lock_both(first: &NamedMutex, second: &NamedMutex, ms: u32) -> Result<bool> {
    let handles = [first.handle, second.handle];
    let rc = unsafe { WaitForMultipleObjects(2, handles.as_ptr(), TRUE, ms) };
    waited("WaitForMultipleObjects", rc, 2)
}
