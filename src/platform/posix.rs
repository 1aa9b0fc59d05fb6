// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the lock page and the native rwlock binding.
// The page is a `MAP_SHARED` mapping of an unlinked temporary file; the
// `pthread_rwlock_t` and `pthread_rwlockattr_t` live inside it at the offsets
// given by the platform descriptor.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::{self, NonNull};

use log::warn;

use super::Access;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Host facts
// ---------------------------------------------------------------------------

/// Host page size; the lock page is exactly one of these.
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

pub fn current_pid() -> libc::pid_t {
    unsafe { libc::getpid() }
}

/// Wall-clock time, the clock the timed rwlock calls measure deadlines against.
pub fn realtime_now() -> libc::timespec {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    ts
}

// ---------------------------------------------------------------------------
// PlatformSegment: one shared page backed by a file descriptor
// ---------------------------------------------------------------------------

/// A one-page `MAP_SHARED` mapping plus the descriptor it was mapped from.
///
/// Every segment owns its own descriptor: `create` owns the temp file,
/// `attach` owns a duplicate of the caller's descriptor.
pub struct PlatformSegment {
    mem: Option<NonNull<u8>>,
    len: usize,
    fd: Option<RawFd>,
}

// Safety: the mapping is process-shared by design; all mutation of its
// contents goes through the pthread calls, which are thread-safe.
unsafe impl Send for PlatformSegment {}
unsafe impl Sync for PlatformSegment {}

impl PlatformSegment {
    /// Create a fresh zero-filled page backed by an unlinked temporary file.
    pub fn create() -> Result<Self> {
        let len = page_size();
        let mut file: File = tempfile::tempfile().map_err(|e| Error::segment("tempfile", e))?;
        file.write_all(&vec![0u8; len])
            .map_err(|e| Error::segment("zero-fill", e))?;
        // From here on the descriptor is closed by `map_owned` on failure.
        Self::map_owned(file.into_raw_fd(), len)
    }

    /// Map the page behind a descriptor that already holds an initialised lock.
    ///
    /// The descriptor is duplicated, so the caller keeps ownership of `fd`.
    pub fn attach(fd: RawFd) -> Result<Self> {
        let len = page_size();
        let own = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if own == -1 {
            return Err(Error::segment("dup", io::Error::last_os_error()));
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(own, &mut st) } == -1 {
            let err = io::Error::last_os_error();
            close_fd(own);
            return Err(Error::segment("fstat", err));
        }
        // Touching a mapping past EOF raises SIGBUS, so refuse short files.
        if (st.st_size as u64) < len as u64 {
            close_fd(own);
            return Err(Error::segment(
                "attach",
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("descriptor backs {} bytes, a lock page needs {len}", st.st_size),
                ),
            ));
        }

        Self::map_owned(own, len)
    }

    fn map_owned(fd: RawFd, len: usize) -> Result<Self> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            close_fd(fd);
            return Err(Error::segment("mmap", err));
        }

        Ok(Self {
            mem: NonNull::new(mem as *mut u8),
            len,
            fd: Some(fd),
        })
    }

    /// Start of the mapped page.
    ///
    /// # Panics
    /// Panics if called after [`destroy`](Self::destroy).
    pub fn base(&self) -> NonNull<u8> {
        match self.mem {
            Some(mem) => mem,
            None => panic!("lock page used after unmap"),
        }
    }

    /// Mapped length in bytes (one host page).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_mapped(&self) -> bool {
        self.mem.is_some()
    }

    /// Descriptor backing the mapping, or -1 once closed.
    pub fn raw_fd(&self) -> RawFd {
        self.fd.unwrap_or(-1)
    }

    /// Toggle `FD_CLOEXEC` so an exec'd child can inherit the descriptor.
    pub fn set_inheritable(&self, inheritable: bool) -> Result<()> {
        let fd = self.raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            return Err(Error::segment("fcntl(F_GETFD)", io::Error::last_os_error()));
        }
        let wanted = if inheritable {
            flags & !libc::FD_CLOEXEC
        } else {
            flags | libc::FD_CLOEXEC
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } == -1 {
            return Err(Error::segment("fcntl(F_SETFD)", io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Unmap, then close. Each step runs even if the other fails; failures are
    /// logged and dropped since nothing can be done about them at this point.
    /// Safe to call more than once.
    pub fn destroy(&mut self) {
        if let Some(mem) = self.mem.take() {
            let rc = unsafe { libc::munmap(mem.as_ptr() as *mut libc::c_void, self.len) };
            if rc != 0 {
                warn!("munmap of lock page failed: {}", io::Error::last_os_error());
            }
        }
        if let Some(fd) = self.fd.take() {
            close_fd(fd);
        }
    }
}

impl fmt::Debug for PlatformSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformSegment")
            .field("mapped", &self.is_mapped())
            .field("len", &self.len)
            .field("fd", &self.raw_fd())
            .finish()
    }
}

impl AsRawFd for PlatformSegment {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd()
    }
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn close_fd(fd: RawFd) {
    if unsafe { libc::close(fd) } != 0 {
        warn!("close({fd}) failed: {}", io::Error::last_os_error());
    }
}

// ---------------------------------------------------------------------------
// NativeLock: error-checked pthread_rwlock binding
// ---------------------------------------------------------------------------

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
extern "C" {
    fn pthread_rwlock_timedrdlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
    fn pthread_rwlock_timedwrlock(
        lock: *mut libc::pthread_rwlock_t,
        abstime: *const libc::timespec,
    ) -> libc::c_int;
}

/// Whether this build can call the native timed rwlock functions.
pub const HAS_TIMED_LOCK: bool = cfg!(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly"
));

/// Map a pthread return code: success is `true`, the two "could not get it"
/// codes are `false`, anything else is a fault.
fn check(op: &'static str, rc: libc::c_int) -> Result<bool> {
    match rc {
        0 => Ok(true),
        libc::EBUSY | libc::ETIMEDOUT => Ok(false),
        code => Err(Error::Native { op, code }),
    }
}

/// Strict variant for calls with no "busy" outcome: only 0 is success.
fn check_status(op: &'static str, rc: libc::c_int) -> Result<()> {
    match rc {
        0 => Ok(()),
        code => Err(Error::Native { op, code }),
    }
}

/// Typed view onto the lock and attribute blocks of a mapped page.
///
/// Borrows the page, so it cannot outlive the mapping.
#[derive(Clone, Copy)]
pub struct NativeLock<'page> {
    lock: *mut libc::pthread_rwlock_t,
    attr: *mut libc::pthread_rwlockattr_t,
    _page: PhantomData<&'page PlatformSegment>,
}

impl<'page> NativeLock<'page> {
    /// `lock` and `attr` must point into a page borrowed for `'page`, at
    /// blocks sized for this host's rwlock and rwlock attribute types.
    pub(crate) fn new(lock: NonNull<u8>, attr: NonNull<u8>) -> Self {
        Self {
            lock: lock.as_ptr() as *mut libc::pthread_rwlock_t,
            attr: attr.as_ptr() as *mut libc::pthread_rwlockattr_t,
            _page: PhantomData,
        }
    }

    /// # Safety
    /// The attribute block must not hold a live attribute object.
    pub unsafe fn attr_init(&self) -> Result<()> {
        check_status("pthread_rwlockattr_init", libc::pthread_rwlockattr_init(self.attr))
    }

    /// # Safety
    /// The attribute block must have been initialised by [`attr_init`](Self::attr_init).
    pub unsafe fn attr_set_pshared(&self, flag: i32) -> Result<()> {
        check_status(
            "pthread_rwlockattr_setpshared",
            libc::pthread_rwlockattr_setpshared(self.attr, flag),
        )
    }

    /// # Safety
    /// The attribute block must hold a live attribute object.
    pub unsafe fn attr_destroy(&self) -> Result<()> {
        check_status("pthread_rwlockattr_destroy", libc::pthread_rwlockattr_destroy(self.attr))
    }

    /// # Safety
    /// The lock block must not hold a live lock; the attribute block must.
    pub unsafe fn init(&self) -> Result<()> {
        check_status("pthread_rwlock_init", libc::pthread_rwlock_init(self.lock, self.attr))
    }

    /// # Safety
    /// The lock block must hold a live, unlocked lock that no other
    /// attachment is going to use afterwards.
    pub unsafe fn destroy(&self) -> Result<()> {
        check_status("pthread_rwlock_destroy", libc::pthread_rwlock_destroy(self.lock))
    }

    /// Block until the lock is held.
    pub fn lock(&self, access: Access) -> Result<()> {
        let (op, rc) = match access {
            Access::Read => ("pthread_rwlock_rdlock", unsafe {
                libc::pthread_rwlock_rdlock(self.lock)
            }),
            Access::Write => ("pthread_rwlock_wrlock", unsafe {
                libc::pthread_rwlock_wrlock(self.lock)
            }),
        };
        match check(op, rc)? {
            true => Ok(()),
            // A blocking lock never reports busy; treat it as a fault.
            false => Err(Error::Native { op, code: rc }),
        }
    }

    /// Single non-blocking attempt. `Ok(false)` means the lock is held elsewhere.
    pub fn try_lock(&self, access: Access) -> Result<bool> {
        match access {
            Access::Read => check("pthread_rwlock_tryrdlock", unsafe {
                libc::pthread_rwlock_tryrdlock(self.lock)
            }),
            Access::Write => check("pthread_rwlock_trywrlock", unsafe {
                libc::pthread_rwlock_trywrlock(self.lock)
            }),
        }
    }

    /// Wait until `deadline` (CLOCK_REALTIME). `Ok(false)` on timeout.
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly"
    ))]
    pub fn timed_lock(&self, access: Access, deadline: &libc::timespec) -> Result<bool> {
        loop {
            let (op, rc) = match access {
                Access::Read => ("pthread_rwlock_timedrdlock", unsafe {
                    pthread_rwlock_timedrdlock(self.lock, deadline)
                }),
                Access::Write => ("pthread_rwlock_timedwrlock", unsafe {
                    pthread_rwlock_timedwrlock(self.lock, deadline)
                }),
            };
            if rc == libc::EINTR {
                continue;
            }
            return check(op, rc);
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly"
    )))]
    pub fn timed_lock(&self, _access: Access, _deadline: &libc::timespec) -> Result<bool> {
        Err(Error::Unsupported("native timed rwlock calls"))
    }

    /// Release one hold, read or write; the native lock knows which.
    pub fn unlock(&self) -> Result<()> {
        check_status("pthread_rwlock_unlock", unsafe {
            libc::pthread_rwlock_unlock(self.lock)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_accepts_busy_and_timeout_as_not_acquired() {
        assert!(check("op", 0).unwrap());
        assert!(!check("op", libc::EBUSY).unwrap());
        assert!(!check("op", libc::ETIMEDOUT).unwrap());
        let err = check("pthread_rwlock_unlock", libc::EPERM).unwrap_err();
        assert_eq!(err.code(), Some(libc::EPERM));
    }

    #[test]
    fn status_calls_treat_busy_as_a_fault() {
        assert!(check_status("pthread_rwlock_init", 0).is_ok());
        for code in [libc::EBUSY, libc::ETIMEDOUT, libc::EPERM] {
            let err = check_status("pthread_rwlock_unlock", code).unwrap_err();
            assert!(
                matches!(err, Error::Native { op: "pthread_rwlock_unlock", code: c } if c == code),
                "{err}"
            );
        }
    }

    #[test]
    fn debug_shows_the_descriptor() {
        let seg = PlatformSegment::create().expect("create");
        let shown = format!("{seg:?}");
        assert!(shown.contains(&format!("fd: {}", seg.raw_fd())), "{shown}");
        assert!(shown.contains("mapped: true"), "{shown}");
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let sz = page_size();
        assert!(sz >= 4096);
        assert!(sz.is_power_of_two());
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut seg = PlatformSegment::create().expect("create");
        assert!(seg.is_mapped());
        seg.destroy();
        assert!(!seg.is_mapped());
        assert_eq!(seg.raw_fd(), -1);
        seg.destroy();
    }
}
