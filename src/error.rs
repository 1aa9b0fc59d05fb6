// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the cross-process lock.
// Timeouts are not errors: timed acquisitions report them as `Ok(false)`.

use std::io;

use thiserror::Error;

/// Errors returned by [`RwLock`](crate::RwLock) and its building blocks.
#[derive(Debug, Error)]
pub enum Error {
    /// The host is not in the platform table, so the native block layout is unknown.
    #[error("unsupported platform: {os}/{arch} ({pointer_width}-bit)")]
    UnsupportedPlatform {
        os: &'static str,
        arch: &'static str,
        pointer_width: u32,
    },

    /// The configuration asks for a capability this host does not have.
    #[error("unsupported on this host: {0}")]
    Unsupported(&'static str),

    /// A native lock call failed. `code` is the errno, or `GetLastError()` on Windows.
    /// Busy and timed-out try or timed calls are not errors.
    #[error("{op} failed: {}", strerror(.code))]
    Native { op: &'static str, code: i32 },

    /// `release` was called while this process holds nothing on the instance.
    #[error("release called without a held lock")]
    NotHeld,

    /// Creating, mapping or duplicating the backing segment failed.
    #[error("{op} failed: {source}")]
    Segment {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A snapshot string did not parse as `fd:pid:held` (`tag:pid:held` on Windows).
    #[error("invalid snapshot {0:?}")]
    InvalidSnapshot(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// OS error code carried by the error, if any.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Native { code, .. } => Some(*code),
            Error::Segment { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn segment(op: &'static str, source: io::Error) -> Self {
        Error::Segment { op, source }
    }
}

fn strerror(code: &i32) -> io::Error {
    io::Error::from_raw_os_error(*code)
}

pub type Result<T> = std::result::Result<T, Error>;
