// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host layout of the native read-write lock and its attribute object.
// The two blocks are carved out of a raw page at fixed offsets, so the sizes
// below must match the host's `pthread_rwlock_t` / `pthread_rwlockattr_t`
// byte for byte. A process that maps the page with a different layout
// corrupts the lock.

use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::timeout::TimeoutStrategy::{self, Emulated, Native};

/// Returns `false` when the lock block at the given address has already been
/// destroyed and must not be destroyed again.
pub type PreDestroyCheck = fn(NonNull<u8>) -> bool;

/// Per-host constants describing the native lock blocks.
#[derive(Debug)]
pub struct PlatformDescriptor {
    os: &'static str,
    lock_block_size: usize,
    attr_block_size: usize,
    process_shared_flag: i32,
    timeout_strategy: TimeoutStrategy,
    busy_codes: &'static [i32],
    pre_destroy_check: PreDestroyCheck,
}

impl PlatformDescriptor {
    /// Descriptor for the running host, resolved once per process.
    pub fn current() -> Result<&'static PlatformDescriptor> {
        static CURRENT: OnceLock<Option<&'static PlatformDescriptor>> = OnceLock::new();

        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let width = usize::BITS;
        let resolved = *CURRENT.get_or_init(|| lookup(os, arch, width));
        resolved.ok_or(Error::UnsupportedPlatform {
            os,
            arch,
            pointer_width: width,
        })
    }

    pub fn os(&self) -> &'static str {
        self.os
    }

    /// Size of the native lock block at offset 0 of the page.
    pub fn lock_block_size(&self) -> usize {
        self.lock_block_size
    }

    /// Size of the native attribute block that follows the lock block.
    pub fn attr_block_size(&self) -> usize {
        self.attr_block_size
    }

    /// Value passed to `pthread_rwlockattr_setpshared`.
    /// Zero means the host only has shared locks and the call is skipped.
    pub fn process_shared_flag(&self) -> i32 {
        self.process_shared_flag
    }

    /// How timed acquisitions are carried out by default on this host.
    pub fn timeout_strategy(&self) -> TimeoutStrategy {
        self.timeout_strategy
    }

    /// Error codes a try-acquire may return that only mean "held elsewhere".
    pub(crate) fn busy_codes(&self) -> &'static [i32] {
        self.busy_codes
    }

    pub(crate) fn pre_destroy_check(&self) -> PreDestroyCheck {
        self.pre_destroy_check
    }

    /// Bytes used at the start of the page by both blocks.
    pub fn blocks_len(&self) -> usize {
        self.lock_block_size + self.attr_block_size
    }

    /// Copy of this descriptor with a different process-shared flag, for
    /// driving the attribute setup into a failure.
    #[cfg(test)]
    pub(crate) fn with_process_shared_flag(&self, flag: i32) -> &'static PlatformDescriptor {
        Box::leak(Box::new(PlatformDescriptor {
            process_shared_flag: flag,
            ..*self
        }))
    }
}

// ---------------------------------------------------------------------------
// Layout table
// ---------------------------------------------------------------------------

/// `None` in `arch` matches every architecture of that OS and width.
struct Entry {
    os: &'static str,
    arch: Option<&'static str>,
    width: u32,
    descriptor: PlatformDescriptor,
}

const fn entry(
    os: &'static str,
    arch: Option<&'static str>,
    width: u32,
    lock: usize,
    attr: usize,
) -> Entry {
    Entry {
        os,
        arch,
        width,
        descriptor: PlatformDescriptor {
            os,
            lock_block_size: lock,
            attr_block_size: attr,
            process_shared_flag: 1,
            timeout_strategy: Native,
            busy_codes: &[],
            pre_destroy_check: always_live,
        },
    }
}

// Darwin lacks the timed rwlock calls and reports EDEADLK from a try-lock
// that loses against another process, so both quirks travel together.
const fn darwin(os: &'static str, width: u32, lock: usize, attr: usize) -> Entry {
    Entry {
        os,
        arch: None,
        width,
        descriptor: PlatformDescriptor {
            os,
            lock_block_size: lock,
            attr_block_size: attr,
            process_shared_flag: 1,
            timeout_strategy: Emulated,
            busy_codes: &[DARWIN_EDEADLK],
            pre_destroy_check: darwin_signature_live,
        },
    }
}

const DARWIN_EDEADLK: i32 = 11;

// Specific arch entries come before the catch-all of the same OS and width.
static TABLE: &[Entry] = &[
    // glibc/musl, x32 ABI
    entry("linux", Some("x86_64"), 32, 44, 8),
    entry("linux", None, 64, 56, 8),
    entry("linux", None, 32, 32, 8),
    entry("android", None, 64, 56, 8),
    entry("android", None, 32, 40, 4),
    darwin("macos", 64, 200, 24),
    darwin("macos", 32, 128, 16),
    darwin("ios", 64, 200, 24),
    darwin("ios", 32, 128, 16),
    // pointer-sized handles to an off-page object shared by mapping offset
    entry("freebsd", None, 64, 8, 8),
    entry("freebsd", None, 32, 4, 4),
    entry("dragonfly", None, 64, 8, 8),
];

fn lookup(os: &str, arch: &str, width: u32) -> Option<&'static PlatformDescriptor> {
    TABLE
        .iter()
        .find(|e| e.os == os && e.width == width && e.arch.map_or(true, |a| a == arch))
        .map(|e| &e.descriptor)
}

fn always_live(_lock: NonNull<u8>) -> bool {
    true
}

/// Darwin rwlocks start with a signature word that `pthread_rwlock_destroy`
/// clears. A zero word means some attachment already destroyed the block.
fn darwin_signature_live(lock: NonNull<u8>) -> bool {
    let sig = unsafe { std::ptr::read_volatile(lock.as_ptr() as *const std::os::raw::c_long) };
    sig != 0
}
