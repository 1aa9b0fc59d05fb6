// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Timed acquisition. Hosts with `pthread_rwlock_timed*lock` get an absolute
// CLOCK_REALTIME deadline; the rest poll the try-lock calls and sleep a fixed
// quantum between attempts, the way the mutex timeout is emulated on macOS.
// Windows reuses the poll loop for shared access, which has no native wait.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use log::trace;

use crate::error::{Error, Result};
#[cfg(unix)]
use crate::{
    config::LockConfig,
    platform::posix::{self, NativeLock},
    platform::{Access, PlatformDescriptor},
};

/// How a timed acquisition waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStrategy {
    /// Native `pthread_rwlock_timedrdlock` / `timedwrlock` with a deadline.
    Native,
    /// Non-blocking try-lock, then sleep one poll interval, until the budget runs out.
    Emulated,
}

impl fmt::Display for TimeoutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutStrategy::Native => "native",
            TimeoutStrategy::Emulated => "emulated",
        })
    }
}

impl FromStr for TimeoutStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "native" => Ok(TimeoutStrategy::Native),
            "emulated" | "poll" => Ok(TimeoutStrategy::Emulated),
            other => Err(Error::InvalidConfig(format!(
                "unknown timeout strategy {other:?} (expected \"native\" or \"emulated\")"
            ))),
        }
    }
}

/// Resolved per-lock acquisition policy.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeoutPolicy {
    strategy: TimeoutStrategy,
    quantum: Duration,
    busy_codes: &'static [i32],
}

#[cfg(unix)]
impl TimeoutPolicy {
    pub(crate) fn resolve(platform: &PlatformDescriptor, config: &LockConfig) -> Result<Self> {
        let strategy = match config.timeout_strategy {
            None => platform.timeout_strategy(),
            Some(TimeoutStrategy::Native) if !posix::HAS_TIMED_LOCK => {
                return Err(Error::Unsupported("native timed rwlock calls"));
            }
            Some(forced) => forced,
        };
        Ok(Self {
            strategy,
            quantum: config.effective_poll_interval(),
            busy_codes: platform.busy_codes(),
        })
    }

    pub(crate) fn strategy(&self) -> TimeoutStrategy {
        self.strategy
    }

    /// One non-blocking attempt. Host-specific busy codes count as "held elsewhere".
    pub(crate) fn try_once(&self, native: &NativeLock<'_>, access: Access) -> Result<bool> {
        match native.try_lock(access) {
            Err(Error::Native { code, .. }) if self.busy_codes.contains(&code) => Ok(false),
            other => other,
        }
    }

    /// Try for at most `timeout`. `Ok(false)` when the budget ran out.
    pub(crate) fn acquire_within(
        &self,
        native: &NativeLock<'_>,
        access: Access,
        timeout: Duration,
    ) -> Result<bool> {
        match self.strategy {
            TimeoutStrategy::Native => {
                let deadline = deadline_after(posix::realtime_now(), timeout);
                native.timed_lock(access, &deadline)
            }
            TimeoutStrategy::Emulated => poll_within(
                timeout,
                self.quantum,
                || self.try_once(native, access),
                std::thread::sleep,
            ),
        }
    }
}

/// `now + timeout` as a `timespec`, carrying nanoseconds into seconds and
/// saturating at the largest representable `time_t`.
#[cfg(unix)]
pub(crate) fn deadline_after(now: libc::timespec, timeout: Duration) -> libc::timespec {
    const NANOS_PER_SEC: i64 = 1_000_000_000;

    let nsec = now.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    let add_secs = i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX);
    let secs = (now.tv_sec as i64)
        .saturating_add(add_secs)
        .saturating_add(nsec / NANOS_PER_SEC);

    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = secs.min(libc::time_t::MAX as i64) as libc::time_t;
    ts.tv_nsec = (nsec % NANOS_PER_SEC) as _;
    ts
}

/// Poll loop behind the emulated strategy.
///
/// Tries once up front, then sleeps `min(quantum, remaining)` and retries
/// until the budget is spent. Returns no earlier than `timeout` when the lock
/// never frees up, and at most one quantum past it.
pub(crate) fn poll_within<T, S>(
    timeout: Duration,
    quantum: Duration,
    mut try_once: T,
    mut sleep: S,
) -> Result<bool>
where
    T: FnMut() -> Result<bool>,
    S: FnMut(Duration),
{
    let mut remaining = timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if try_once()? {
            trace!("acquired after {attempts} attempt(s)");
            return Ok(true);
        }
        if remaining.is_zero() {
            trace!("gave up after {attempts} attempt(s)");
            return Ok(false);
        }
        let nap = quantum.min(remaining);
        sleep(nap);
        remaining -= nap;
    }
}
