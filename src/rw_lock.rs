// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process read-write lock.
// A PTHREAD_PROCESS_SHARED rwlock lives at the start of a page of a shared
// file mapping; every process that maps the same descriptor operates on the
// same lock. `held` and `owner_pid` are bookkeeping private to this process:
// they drive cleanup and the post-fork reset, never contention decisions.

use std::fmt;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::platform::posix::{current_pid, NativeLock};
use crate::platform::{Access, PlatformDescriptor};
use crate::segment::SharedSegment;
use crate::snapshot::Snapshot;
use crate::timeout::{TimeoutPolicy, TimeoutStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    /// Initialised the native blocks, in process `pid`.
    Created { pid: libc::pid_t },
    /// Mapped a page someone else initialised. Never destroys the blocks.
    Attached,
}

/// A read-write lock shared between processes.
///
/// Create one with [`RwLock::new`], hand [`RwLock::snapshot`] to a child that
/// inherited the descriptor, and call [`RwLock::attach`] there. Both
/// instances then guard the same native lock.
///
/// Dropping the instance tears it down: locks this process still holds are
/// released, the creator destroys the native lock and attribute blocks, and
/// the page is unmapped and its descriptor closed.
pub struct RwLock {
    segment: SharedSegment,
    policy: TimeoutPolicy,
    config: LockConfig,
    ownership: Ownership,
    held: AtomicUsize,
    owner_pid: AtomicI32,
}

impl RwLock {
    /// Create and initialise a lock on a fresh page with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(LockConfig::default())
    }

    /// Create and initialise a lock on a fresh page.
    ///
    /// If any step fails, everything set up so far is undone in reverse
    /// order and the error from the failing step is returned.
    pub fn with_config(config: LockConfig) -> Result<Self> {
        Self::create_on(PlatformDescriptor::current()?, config)
    }

    fn create_on(platform: &'static PlatformDescriptor, config: LockConfig) -> Result<Self> {
        let policy = TimeoutPolicy::resolve(platform, &config)?;

        // On error the segment drops here, after `init_blocks` has unwound
        // its own partial state: unmap, then close.
        let segment = SharedSegment::create(platform)?;
        init_blocks(&segment)?;

        let pid = current_pid();
        debug!(
            "rwlock ready: fd={} pid={pid} timeouts={}",
            segment.as_raw_fd(),
            policy.strategy()
        );
        Ok(Self {
            segment,
            policy,
            config,
            ownership: Ownership::Created { pid },
            held: AtomicUsize::new(0),
            owner_pid: AtomicI32::new(pid),
        })
    }

    /// Attach to a lock created elsewhere, with default settings.
    pub fn attach(snapshot: Snapshot) -> Result<Self> {
        Self::attach_with_config(snapshot, LockConfig::default())
    }

    /// Attach to the lock behind `snapshot.fd()`, which must be open in this
    /// process. No native initialisation happens: the page already holds a
    /// live lock.
    ///
    /// In the process that took the snapshot the held count carries over.
    /// In any other process it starts at zero: a child holds nothing.
    pub fn attach_with_config(snapshot: Snapshot, config: LockConfig) -> Result<Self> {
        let platform = PlatformDescriptor::current()?;
        let policy = TimeoutPolicy::resolve(platform, &config)?;
        let segment = SharedSegment::attach(platform, snapshot.fd())?;

        let pid = current_pid();
        let held = if snapshot.owner_pid() == pid {
            snapshot.held_count()
        } else {
            0
        };
        debug!(
            "rwlock attached: snapshot={snapshot} pid={pid} held={held} fd={}",
            segment.as_raw_fd()
        );
        Ok(Self {
            segment,
            policy,
            config,
            ownership: Ownership::Attached,
            held: AtomicUsize::new(held),
            owner_pid: AtomicI32::new(pid),
        })
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Acquire shared access.
    ///
    /// `None` blocks until the lock is held and only ever returns `Ok(true)`.
    /// `Some(timeout)` returns `Ok(false)` if the lock could not be taken in time.
    pub fn acquire_read(&self, timeout: Option<Duration>) -> Result<bool> {
        self.acquire(Access::Read, timeout)
    }

    /// Acquire exclusive access. Same contract as [`acquire_read`](Self::acquire_read).
    pub fn acquire_write(&self, timeout: Option<Duration>) -> Result<bool> {
        self.acquire(Access::Write, timeout)
    }

    /// One non-blocking attempt at shared access.
    pub fn try_acquire_read(&self) -> Result<bool> {
        self.try_acquire(Access::Read)
    }

    /// One non-blocking attempt at exclusive access.
    pub fn try_acquire_write(&self) -> Result<bool> {
        self.try_acquire(Access::Write)
    }

    fn acquire(&self, access: Access, timeout: Option<Duration>) -> Result<bool> {
        self.reconcile_pid();
        let native = self.segment.native();
        let acquired = match timeout {
            None => {
                native.lock(access)?;
                true
            }
            Some(timeout) => self.policy.acquire_within(&native, access, timeout)?,
        };
        self.record(access, acquired);
        Ok(acquired)
    }

    fn try_acquire(&self, access: Access) -> Result<bool> {
        self.reconcile_pid();
        let acquired = self.policy.try_once(&self.segment.native(), access)?;
        self.record(access, acquired);
        Ok(acquired)
    }

    fn record(&self, access: Access, acquired: bool) {
        if acquired {
            let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
            trace!("{access:?} lock acquired, held={held}");
        } else {
            trace!("{access:?} lock busy");
        }
    }

    /// Release one hold taken through this instance.
    ///
    /// Fails with [`Error::NotHeld`] when this process holds nothing here;
    /// acquisitions and releases must pair up.
    pub fn release(&self) -> Result<()> {
        self.reconcile_pid();
        self.held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Error::NotHeld)?;
        if let Err(e) = self.segment.native().unlock() {
            self.held.fetch_add(1, Ordering::AcqRel);
            return Err(e);
        }
        trace!("lock released, held={}", self.held.load(Ordering::Acquire));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Scoped helpers
    // -----------------------------------------------------------------------

    /// Block for shared access; released when the guard drops.
    pub fn read(&self) -> Result<RwLockGuard<'_>> {
        self.acquire(Access::Read, None)?;
        Ok(RwLockGuard::new(self, Access::Read))
    }

    /// Block for exclusive access; released when the guard drops.
    pub fn write(&self) -> Result<RwLockGuard<'_>> {
        self.acquire(Access::Write, None)?;
        Ok(RwLockGuard::new(self, Access::Write))
    }

    /// Shared access within `timeout`, or `None`.
    pub fn try_read_for(&self, timeout: Duration) -> Result<Option<RwLockGuard<'_>>> {
        let acquired = self.acquire(Access::Read, Some(timeout))?;
        Ok(acquired.then(|| RwLockGuard::new(self, Access::Read)))
    }

    /// Exclusive access within `timeout`, or `None`.
    pub fn try_write_for(&self, timeout: Duration) -> Result<Option<RwLockGuard<'_>>> {
        let acquired = self.acquire(Access::Write, Some(timeout))?;
        Ok(acquired.then(|| RwLockGuard::new(self, Access::Write)))
    }

    // -----------------------------------------------------------------------
    // Bookkeeping
    // -----------------------------------------------------------------------

    /// Record for [`RwLock::attach`] in another process.
    pub fn snapshot(&self) -> Snapshot {
        let pid = self.reconcile_pid();
        Snapshot::new(
            self.segment.as_raw_fd(),
            pid,
            self.held.load(Ordering::Acquire),
        )
    }

    /// Locks this process holds through this instance.
    pub fn held_count(&self) -> usize {
        self.reconcile_pid();
        self.held.load(Ordering::Acquire)
    }

    /// Process the bookkeeping belongs to; always the calling process.
    pub fn owner_pid(&self) -> libc::pid_t {
        self.reconcile_pid()
    }

    /// Whether this instance initialised the native lock in this process
    /// and will destroy it on drop.
    pub fn is_creator(&self) -> bool {
        matches!(self.ownership, Ownership::Created { pid } if pid == current_pid())
    }

    pub fn timeout_strategy(&self) -> TimeoutStrategy {
        self.policy.strategy()
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Let the backing descriptor survive `exec`, so a spawned program can
    /// attach with the snapshot.
    pub fn set_inheritable(&self, inheritable: bool) -> Result<()> {
        self.segment.set_inheritable(inheritable)
    }

    /// The held count recorded under another pid belongs to the parent of a
    /// fork; a child starts from zero.
    fn reconcile_pid(&self) -> libc::pid_t {
        let pid = current_pid();
        let prev = self.owner_pid.swap(pid, Ordering::AcqRel);
        if prev != pid {
            let inherited = self.held.swap(0, Ordering::AcqRel);
            debug!("rwlock crossed fork ({prev} -> {pid}), dropped {inherited} inherited hold(s)");
        }
        pid
    }
}

impl AsRawFd for RwLock {
    fn as_raw_fd(&self) -> RawFd {
        self.segment.as_raw_fd()
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("fd", &self.segment.as_raw_fd())
            .field("ownership", &self.ownership)
            .field("held", &self.held.load(Ordering::Relaxed))
            .field("owner_pid", &self.owner_pid.load(Ordering::Relaxed))
            .field("timeouts", &self.policy.strategy())
            .finish()
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        let pid = current_pid();
        let held = if self.owner_pid.load(Ordering::Acquire) == pid {
            self.held.swap(0, Ordering::AcqRel)
        } else {
            0
        };

        let native = self.segment.native();
        for _ in 0..held {
            if let Err(e) = native.unlock() {
                warn!("teardown release failed: {e}");
            }
        }

        match self.ownership {
            Ownership::Created { pid: creator } if creator == pid => destroy_blocks(&self.segment),
            Ownership::Created { pid: creator } => {
                debug!("lock created by pid {creator}; pid {pid} leaves the native blocks alone");
            }
            Ownership::Attached => {}
        }

        self.segment.destroy();
        trace!("rwlock torn down in pid {pid}");
    }
}

// ---------------------------------------------------------------------------
// Native block setup / teardown
// ---------------------------------------------------------------------------

fn init_blocks(segment: &SharedSegment) -> Result<()> {
    let native = segment.native();
    let mut unwind = InitUnwind {
        native,
        attr: false,
        lock: false,
    };

    unsafe { native.attr_init()? };
    unwind.attr = true;

    let flag = segment.platform().process_shared_flag();
    if flag != 0 {
        unsafe { native.attr_set_pshared(flag)? };
    }

    unsafe { native.init()? };
    unwind.lock = true;

    unwind.disarm();
    Ok(())
}

/// Undoes a partial [`init_blocks`] in reverse order when dropped armed.
/// Each step runs regardless of the previous one failing.
struct InitUnwind<'page> {
    native: NativeLock<'page>,
    attr: bool,
    lock: bool,
}

impl InitUnwind<'_> {
    fn disarm(&mut self) {
        self.attr = false;
        self.lock = false;
    }
}

impl Drop for InitUnwind<'_> {
    fn drop(&mut self) {
        if self.lock {
            if let Err(e) = unsafe { self.native.destroy() } {
                warn!("unwinding lock init: {e}");
            }
        }
        if self.attr {
            if let Err(e) = unsafe { self.native.attr_destroy() } {
                warn!("unwinding attribute init: {e}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Attr,
    Lock,
}

/// Creator teardown: the attribute object goes first, then the lock.
/// Construction unwind uses the reverse of init instead.
const TEARDOWN_ORDER: [Block; 2] = [Block::Attr, Block::Lock];

fn destroy_blocks(segment: &SharedSegment) {
    let native = segment.native();
    for block in TEARDOWN_ORDER {
        match block {
            Block::Attr => {
                if let Err(e) = unsafe { native.attr_destroy() } {
                    warn!("destroying attribute block: {e}");
                }
            }
            Block::Lock => {
                let still_live = segment.platform().pre_destroy_check();
                if !still_live(segment.lock_block()) {
                    debug!("lock block already destroyed, skipping");
                } else if let Err(e) = unsafe { native.destroy() } {
                    warn!("destroying lock block: {e}");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Holds one acquisition of an [`RwLock`] and releases it on drop.
///
/// Not `Send`: POSIX wants a write lock released by the thread that took it.
#[must_use = "if unused the lock will immediately unlock"]
pub struct RwLockGuard<'a> {
    lock: &'a RwLock,
    access: Access,
    _not_send: PhantomData<*const ()>,
}

impl<'a> RwLockGuard<'a> {
    fn new(lock: &'a RwLock, access: Access) -> Self {
        Self {
            lock,
            access,
            _not_send: PhantomData,
        }
    }

    pub fn access(&self) -> Access {
        self.access
    }
}

impl Drop for RwLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("releasing {:?} guard failed: {e}", self.access);
        }
    }
}
