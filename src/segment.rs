// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The lock page: one host page of a shared file mapping, carved into the
// native lock block at offset 0 and the attribute block right after it.
// Delegates mapping and descriptor handling to platform::posix::PlatformSegment.

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::NonNull;

use log::debug;

use crate::error::Result;
use crate::platform::posix::{NativeLock, PlatformSegment};
use crate::platform::PlatformDescriptor;

/// A mapped lock page.
///
/// The two blocks are opaque bytes owned by the native rwlock
/// implementation; this type only hands out their addresses.
pub struct SharedSegment {
    inner: PlatformSegment,
    platform: &'static PlatformDescriptor,
}

impl SharedSegment {
    /// Allocate a new zero-filled page backed by an unlinked temporary file.
    pub fn create(platform: &'static PlatformDescriptor) -> Result<Self> {
        let inner = PlatformSegment::create()?;
        debug!(
            "created lock page fd={} len={} (lock {} + attr {} bytes)",
            inner.raw_fd(),
            inner.len(),
            platform.lock_block_size(),
            platform.attr_block_size()
        );
        Ok(Self { inner, platform })
    }

    /// Map the page behind `fd` without touching its contents.
    ///
    /// The blocks land on the same byte ranges as in the creating process
    /// because both sides use the same platform descriptor. `fd` is
    /// duplicated; the caller keeps its own copy.
    pub fn attach(platform: &'static PlatformDescriptor, fd: RawFd) -> Result<Self> {
        let inner = PlatformSegment::attach(fd)?;
        debug!("attached lock page fd={fd} as fd={}", inner.raw_fd());
        Ok(Self { inner, platform })
    }

    /// Start of the page.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.base().as_ptr()
    }

    /// Page length in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// `false` once the owning lock has torn the page down.
    pub fn is_mapped(&self) -> bool {
        self.inner.is_mapped()
    }

    /// Address of the native lock block (offset 0).
    pub fn lock_block(&self) -> NonNull<u8> {
        self.inner.base()
    }

    /// Address of the native attribute block (offset `lock_block_size`).
    pub fn attr_block(&self) -> NonNull<u8> {
        let base = self.inner.base();
        unsafe { NonNull::new_unchecked(base.as_ptr().add(self.platform.lock_block_size())) }
    }

    pub(crate) fn native(&self) -> NativeLock<'_> {
        NativeLock::new(self.lock_block(), self.attr_block())
    }

    pub fn platform(&self) -> &'static PlatformDescriptor {
        self.platform
    }

    /// Clear or set `FD_CLOEXEC` on the backing descriptor.
    pub fn set_inheritable(&self, inheritable: bool) -> Result<()> {
        self.inner.set_inheritable(inheritable)
    }

    /// Unmap and close. Best effort and idempotent; also run on drop.
    /// Crate-private: the block accessors panic on an unmapped page.
    pub(crate) fn destroy(&mut self) {
        self.inner.destroy();
    }
}

impl AsRawFd for SharedSegment {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw_fd()
    }
}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment")
            .field("fd", &self.inner.raw_fd())
            .field("len", &self.inner.len())
            .field("os", &self.platform.os())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> &'static PlatformDescriptor {
        PlatformDescriptor::current().expect("host in table")
    }

    #[test]
    fn destroy_is_idempotent_and_leaves_the_other_side_alone() {
        let seg = SharedSegment::create(platform()).expect("create");
        let mut other = SharedSegment::attach(platform(), seg.as_raw_fd()).expect("attach");
        other.destroy();
        assert!(!other.is_mapped());
        assert_eq!(other.as_raw_fd(), -1);
        other.destroy();

        // The creator's mapping and descriptor are untouched.
        unsafe { *seg.as_ptr() = 1 };
        let flags = unsafe { libc::fcntl(seg.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags, -1);
    }

    #[test]
    fn debug_names_descriptor_and_host() {
        let seg = SharedSegment::create(platform()).expect("create");
        let shown = format!("{seg:?}");
        assert!(shown.contains(&format!("fd: {}", seg.as_raw_fd())), "{shown}");
        assert!(shown.contains(std::env::consts::OS), "{shown}");
    }
}
