// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Platform switch. Unix hosts put a process-shared pthread rwlock in a shared
// page; Windows builds the lock from two named mutexes and a named page.

#[cfg(not(any(unix, windows)))]
compile_error!("prwlock needs a unix host or Windows");

#[cfg(unix)]
mod layout;
#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub use layout::{PlatformDescriptor, PreDestroyCheck};

/// Shared (read) or exclusive (write) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}
