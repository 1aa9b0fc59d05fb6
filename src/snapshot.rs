// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transfer record for handing a lock to another process.
// On unix only the descriptor number travels; the receiving process must
// already have the descriptor open (inherited through fork, or exec after
// `RwLock::set_inheritable(true)`). On Windows the record carries the name
// tag of the lock's kernel objects, which any process can open.

use std::fmt;
#[cfg(unix)]
use std::os::fd::RawFd;
use std::str::FromStr;

use crate::error::Error;

/// `{descriptor, owner pid, held count}` of a lock at the time it was taken.
///
/// The text form is `fd:pid:held`, suitable for an argument or an
/// environment variable.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Snapshot {
    fd: RawFd,
    owner_pid: libc::pid_t,
    held_count: usize,
}

#[cfg(unix)]
impl Snapshot {
    /// Build a snapshot by hand, e.g. after receiving a descriptor over a
    /// unix socket.
    pub fn new(fd: RawFd, owner_pid: libc::pid_t, held_count: usize) -> Self {
        Self {
            fd,
            owner_pid,
            held_count,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Process that took the snapshot.
    pub fn owner_pid(&self) -> libc::pid_t {
        self.owner_pid
    }

    /// Locks the owner held through this instance when the snapshot was taken.
    pub fn held_count(&self) -> usize {
        self.held_count
    }
}

#[cfg(unix)]
impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.fd, self.owner_pid, self.held_count)
    }
}

/// Split `a:b:c` into its three fields.
fn fields(s: &str) -> Option<(&str, &str, &str)> {
    let mut parts = s.trim().split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), Some(c), None) => Some((a, b, c)),
        _ => None,
    }
}

#[cfg(unix)]
impl FromStr for Snapshot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidSnapshot(s.to_string());
        let (fd, pid, held) = fields(s).ok_or_else(invalid)?;

        let fd: RawFd = fd.parse().map_err(|_| invalid())?;
        let owner_pid: libc::pid_t = pid.parse().map_err(|_| invalid())?;
        let held_count: usize = held.parse().map_err(|_| invalid())?;
        if fd < 0 || owner_pid <= 0 {
            return Err(invalid());
        }
        Ok(Self::new(fd, owner_pid, held_count))
    }
}

/// `{name tag, owner pid, held count}` of a lock at the time it was taken.
///
/// The text form is `tag:pid:held`.
#[cfg(windows)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Snapshot {
    tag: String,
    owner_pid: u32,
    held_count: usize,
}

#[cfg(windows)]
impl Snapshot {
    pub fn new(tag: impl Into<String>, owner_pid: u32, held_count: usize) -> Self {
        Self {
            tag: tag.into(),
            owner_pid,
            held_count,
        }
    }

    /// Name shared by the lock page and its two mutexes.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn held_count(&self) -> usize {
        self.held_count
    }
}

#[cfg(windows)]
impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tag, self.owner_pid, self.held_count)
    }
}

#[cfg(windows)]
impl FromStr for Snapshot {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidSnapshot(s.to_string());
        let (tag, pid, held) = fields(s).ok_or_else(invalid)?;

        let owner_pid: u32 = pid.parse().map_err(|_| invalid())?;
        let held_count: usize = held.parse().map_err(|_| invalid())?;
        if tag.is_empty() || owner_pid == 0 {
            return Err(invalid());
        }
        Ok(Self::new(tag, owner_pid, held_count))
    }
}
