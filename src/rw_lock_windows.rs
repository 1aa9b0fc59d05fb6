// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process read-write lock on Windows, built from two named mutexes and
// a named page. `wr` serialises writers; `rd` guards the page, which records
// the announced writer and the reader count. Readers poll. A writer takes
// both mutexes, announces itself, gives `rd` back and waits for the readers
// already inside to leave; new readers back off while a writer is announced.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use windows_sys::Win32::Foundation::ERROR_POSSIBLE_DEADLOCK;

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::platform::windows::{self, current_pid, current_tid, NamedMutex, NamedPage};
use crate::platform::Access;
use crate::snapshot::Snapshot;
use crate::timeout::{poll_within, TimeoutStrategy};

/// A read-write lock shared between processes.
///
/// Create one with [`RwLock::new`], pass [`RwLock::snapshot`] to another
/// process and call [`RwLock::attach`] there. Both instances then guard the
/// same lock.
///
/// Dropping the instance releases what this process still holds through it
/// and closes its handles. The kernel objects go away with the last handle.
pub struct RwLock {
    // Field order is drop order: mutexes first, then the page.
    wr: NamedMutex,
    rd: NamedMutex,
    page: NamedPage,
    tag: String,
    strategy: TimeoutStrategy,
    config: LockConfig,
    creator: bool,
    held: AtomicUsize,
    owner_pid: u32,
}

impl RwLock {
    /// Create a lock with default settings.
    pub fn new() -> Result<Self> {
        Self::with_config(LockConfig::default())
    }

    /// Create a lock under a fresh name tag. Objects created before a failing
    /// step are closed again before the error is returned.
    pub fn with_config(config: LockConfig) -> Result<Self> {
        let tag = windows::unique_tag();
        let page = NamedPage::create(&tag)?;
        let rd = NamedMutex::create(&format!("{tag}-rd"))?;
        let wr = NamedMutex::create(&format!("{tag}-wr"))?;

        let strategy = config.timeout_strategy.unwrap_or(TimeoutStrategy::Native);
        debug!("rwlock ready: tag={tag} pid={} timeouts={strategy}", current_pid());
        Ok(Self {
            wr,
            rd,
            page,
            tag,
            strategy,
            config,
            creator: true,
            held: AtomicUsize::new(0),
            owner_pid: current_pid(),
        })
    }

    /// Attach to a lock created elsewhere, with default settings.
    pub fn attach(snapshot: Snapshot) -> Result<Self> {
        Self::attach_with_config(snapshot, LockConfig::default())
    }

    /// Open the objects named by `snapshot.tag()`. In the process that took
    /// the snapshot the held count carries over; elsewhere it starts at zero.
    pub fn attach_with_config(snapshot: Snapshot, config: LockConfig) -> Result<Self> {
        let tag = snapshot.tag().to_string();
        let page = NamedPage::open(&tag)?;
        let rd = NamedMutex::open(&format!("{tag}-rd"))?;
        let wr = NamedMutex::open(&format!("{tag}-wr"))?;

        let pid = current_pid();
        let held = if snapshot.owner_pid() == pid {
            snapshot.held_count()
        } else {
            0
        };
        debug!("rwlock attached: snapshot={snapshot} pid={pid} held={held}");
        Ok(Self {
            wr,
            rd,
            page,
            tag,
            strategy: config.timeout_strategy.unwrap_or(TimeoutStrategy::Native),
            config,
            creator: false,
            held: AtomicUsize::new(held),
            owner_pid: pid,
        })
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Acquire shared access.
    ///
    /// `None` blocks until the lock is held and only ever returns `Ok(true)`.
    /// `Some(timeout)` returns `Ok(false)` if the lock could not be taken in time.
    /// Shared access always polls, one poll interval between attempts.
    pub fn acquire_read(&self, timeout: Option<Duration>) -> Result<bool> {
        let got = poll_within(
            timeout.unwrap_or(Duration::MAX),
            self.quantum(),
            || self.enter_read(),
            thread::sleep,
        )?;
        self.record(Access::Read, got);
        Ok(got)
    }

    /// Acquire exclusive access. Same contract as [`acquire_read`](Self::acquire_read).
    ///
    /// Asking again from the thread that already writes is an error, since
    /// it could only ever wait for itself.
    pub fn acquire_write(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.writing_here() {
            return Err(Error::Native {
                op: "acquire_write",
                code: ERROR_POSSIBLE_DEADLOCK as i32,
            });
        }
        let got = self.write_within(timeout)?;
        self.record(Access::Write, got);
        Ok(got)
    }

    /// Single non-blocking attempt at shared access.
    pub fn try_acquire_read(&self) -> Result<bool> {
        let got = self.enter_read()?;
        self.record(Access::Read, got);
        Ok(got)
    }

    /// Single non-blocking attempt at exclusive access.
    pub fn try_acquire_write(&self) -> Result<bool> {
        if self.writing_here() {
            return Ok(false);
        }
        let got = self.enter_write(0)? && self.drained_or_back_out(Some(Duration::ZERO))?;
        self.record(Access::Write, got);
        Ok(got)
    }

    fn record(&self, access: Access, acquired: bool) {
        if acquired {
            let held = self.held.fetch_add(1, Ordering::AcqRel) + 1;
            trace!("{access:?} acquired on {}, held={held}", self.tag);
        }
    }

    fn quantum(&self) -> Duration {
        self.config.effective_poll_interval()
    }

    fn writing_here(&self) -> bool {
        self.page.state().writer() == Some((current_pid(), current_tid()))
    }

    /// One reader entry attempt: count ourselves in unless a writer is announced.
    fn enter_read(&self) -> Result<bool> {
        if !self.rd.try_lock()? {
            return Ok(false);
        }
        let state = self.page.state();
        let free = state.writer().is_none();
        if free {
            state.add_reader();
        }
        self.rd.unlock()?;
        Ok(free)
    }

    fn write_within(&self, timeout: Option<Duration>) -> Result<bool> {
        let start = Instant::now();
        let entered = match (timeout, self.strategy) {
            (Some(t), TimeoutStrategy::Emulated) => {
                poll_within(t, self.quantum(), || self.enter_write(0), thread::sleep)?
            }
            _ => self.enter_write(windows::millis(timeout))?,
        };
        if !entered {
            return Ok(false);
        }
        let left = timeout.map(|t| t.saturating_sub(start.elapsed()));
        self.drained_or_back_out(left)
    }

    /// Take both mutexes within `ms`, announce this thread as the writer and
    /// give `rd` back. `wr` stays owned until release.
    fn enter_write(&self, ms: u32) -> Result<bool> {
        if !windows::lock_both(&self.wr, &self.rd, ms)? {
            return Ok(false);
        }
        self.page.state().set_writer(current_pid(), current_tid());
        self.rd.unlock()?;
        Ok(true)
    }

    /// Wait for the readers inside to leave. If they do not leave in time,
    /// withdraw the announcement and give `wr` back.
    fn drained_or_back_out(&self, budget: Option<Duration>) -> Result<bool> {
        let drained = poll_within(
            budget.unwrap_or(Duration::MAX),
            self.quantum(),
            || self.no_readers(),
            thread::sleep,
        )?;
        if !drained {
            self.leave_write()?;
        }
        Ok(drained)
    }

    fn no_readers(&self) -> Result<bool> {
        self.rd.lock()?;
        let none = self.page.state().readers() == 0;
        self.rd.unlock()?;
        Ok(none)
    }

    fn leave_write(&self) -> Result<()> {
        self.rd.lock()?;
        self.page.state().clear_writer();
        self.rd.unlock()?;
        self.wr.unlock()
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Release one hold taken through this instance.
    ///
    /// Fails with [`Error::NotHeld`] when nothing is held here, or when the
    /// page shows neither this thread as writer nor any reader.
    pub fn release(&self) -> Result<()> {
        self.held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| Error::NotHeld)?;

        if let Err(e) = self.leave() {
            self.held.fetch_add(1, Ordering::AcqRel);
            return Err(e);
        }
        trace!("released on {}, held={}", self.tag, self.held_count());
        Ok(())
    }

    fn leave(&self) -> Result<()> {
        self.rd.lock()?;
        let state = self.page.state();
        if state.writer() == Some((current_pid(), current_tid())) {
            state.clear_writer();
            self.rd.unlock()?;
            self.wr.unlock()
        } else if state.remove_reader() {
            self.rd.unlock()
        } else {
            self.rd.unlock()?;
            Err(Error::NotHeld)
        }
    }

    // -----------------------------------------------------------------------
    // Guards
    // -----------------------------------------------------------------------

    /// Block for shared access; released when the guard drops.
    pub fn read(&self) -> Result<RwLockGuard<'_>> {
        self.acquire_read(None)?;
        Ok(RwLockGuard::new(self, Access::Read))
    }

    /// Block for exclusive access; released when the guard drops.
    pub fn write(&self) -> Result<RwLockGuard<'_>> {
        self.acquire_write(None)?;
        Ok(RwLockGuard::new(self, Access::Write))
    }

    /// Shared access within `timeout`, or `None` if it could not be taken.
    pub fn try_read_for(&self, timeout: Duration) -> Result<Option<RwLockGuard<'_>>> {
        Ok(self
            .acquire_read(Some(timeout))?
            .then(|| RwLockGuard::new(self, Access::Read)))
    }

    /// Exclusive access within `timeout`, or `None` if it could not be taken.
    pub fn try_write_for(&self, timeout: Duration) -> Result<Option<RwLockGuard<'_>>> {
        Ok(self
            .acquire_write(Some(timeout))?
            .then(|| RwLockGuard::new(self, Access::Write)))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Transfer record: the name tag plus this process's bookkeeping.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.tag.clone(), self.owner_pid, self.held_count())
    }

    pub fn held_count(&self) -> usize {
        self.held.load(Ordering::Acquire)
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// `true` for the instance that created the kernel objects.
    pub fn is_creator(&self) -> bool {
        self.creator
    }

    /// Strategy used for timed exclusive acquisitions.
    pub fn timeout_strategy(&self) -> TimeoutStrategy {
        self.strategy
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }
}

impl fmt::Debug for RwLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLock")
            .field("tag", &self.tag)
            .field("creator", &self.creator)
            .field("held", &self.held.load(Ordering::Relaxed))
            .field("owner_pid", &self.owner_pid)
            .field("timeouts", &self.strategy)
            .finish()
    }
}

impl Drop for RwLock {
    fn drop(&mut self) {
        let held = self.held.swap(0, Ordering::AcqRel);
        for _ in 0..held {
            if let Err(e) = self.leave() {
                warn!("teardown release failed: {e}");
            }
        }
        trace!("rwlock {} torn down in pid {}", self.tag, self.owner_pid);
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Holds one acquisition of an [`RwLock`] and releases it on drop.
///
/// Not `Send`: the write side is a mutex owned by the thread that took it.
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
