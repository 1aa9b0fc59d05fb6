// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The host descriptor as seen through the public API.

#![cfg(unix)]

use prwlock::{PlatformDescriptor, TimeoutStrategy};

#[test]
fn resolution_is_cached() {
    let a = PlatformDescriptor::current().unwrap();
    let b = PlatformDescriptor::current().unwrap();
    assert!(std::ptr::eq(a, b));
}

#[test]
fn both_blocks_fit_in_the_host_page() {
    let p = PlatformDescriptor::current().unwrap();
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert_eq!(p.blocks_len(), p.lock_block_size() + p.attr_block_size());
    assert!(p.blocks_len() <= page);
}

#[test]
fn process_shared_flag_is_the_native_constant() {
    let p = PlatformDescriptor::current().unwrap();
    assert_eq!(p.process_shared_flag(), libc::PTHREAD_PROCESS_SHARED);
}

#[cfg(target_os = "linux")]
#[test]
fn linux_waits_natively() {
    let p = PlatformDescriptor::current().unwrap();
    assert_eq!(p.timeout_strategy(), TimeoutStrategy::Native);
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
#[test]
fn darwin_polls() {
    let p = PlatformDescriptor::current().unwrap();
    assert_eq!(p.timeout_strategy(), TimeoutStrategy::Emulated);
}
