// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process read-write lock.
// On unix the host's process-shared pthread rwlock lives in one page of an
// unlinked, memory-mapped temporary file; any process holding the descriptor
// can attach to it. On Windows the lock is built from two named mutexes and
// a named page, which any process knowing the name tag can open.

pub mod config;
pub use config::LockConfig;

mod error;
pub use error::{Error, Result};

mod platform;
pub use platform::Access;
#[cfg(unix)]
pub use platform::{PlatformDescriptor, PreDestroyCheck};

#[cfg(unix)]
mod segment;
#[cfg(unix)]
pub use segment::SharedSegment;

mod snapshot;
pub use snapshot::Snapshot;

mod timeout;
pub use timeout::TimeoutStrategy;

#[cfg_attr(windows, path = "rw_lock_windows.rs")]
mod rw_lock;
pub use rw_lock::{RwLock, RwLockGuard};
