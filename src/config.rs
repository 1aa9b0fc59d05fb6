// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-lock tunables. Defaults match the host; `from_env` lets a deployment
// force the poll interval or the timeout strategy without recompiling.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::timeout::TimeoutStrategy;

/// Sleep between try-lock attempts of the emulated timeout.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The emulated timeout never sleeps for less than this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Environment variable overriding the poll interval, in milliseconds.
pub const ENV_POLL_INTERVAL_MS: &str = "PRWLOCK_POLL_INTERVAL_MS";

/// Environment variable forcing the timeout strategy (`native` or `emulated`).
pub const ENV_TIMEOUT_STRATEGY: &str = "PRWLOCK_TIMEOUT_STRATEGY";

/// Options applied when a lock is created or attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    /// Sleep quantum of the emulated timeout.
    pub poll_interval: Duration,
    /// `None` uses the host default; `Some` forces a strategy.
    pub timeout_strategy: Option<TimeoutStrategy>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout_strategy: None,
        }
    }
}

impl LockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout_strategy(mut self, strategy: TimeoutStrategy) -> Self {
        self.timeout_strategy = Some(strategy);
        self
    }

    /// Defaults overridden by `PRWLOCK_POLL_INTERVAL_MS` and
    /// `PRWLOCK_TIMEOUT_STRATEGY` when they are set.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(ms) = lookup(ENV_POLL_INTERVAL_MS) {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("{ENV_POLL_INTERVAL_MS}={ms:?} is not a number"))
            })?;
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(strategy) = lookup(ENV_TIMEOUT_STRATEGY) {
            config.timeout_strategy = Some(strategy.parse()?);
        }
        Ok(config)
    }

    pub(crate) fn effective_poll_interval(&self) -> Duration {
        self.poll_interval.max(MIN_POLL_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = LockConfig::default();
        assert_eq!(c.poll_interval, Duration::from_millis(100));
        assert_eq!(c.timeout_strategy, None);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let c = LockConfig::new().poll_interval(Duration::ZERO);
        assert_eq!(c.effective_poll_interval(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let c = LockConfig::from_lookup(|key| match key {
            ENV_POLL_INTERVAL_MS => Some("25".into()),
            ENV_TIMEOUT_STRATEGY => Some("emulated".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(c.poll_interval, Duration::from_millis(25));
        assert_eq!(c.timeout_strategy, Some(TimeoutStrategy::Emulated));
    }

    #[test]
    fn lookup_rejects_garbage() {
        let err = LockConfig::from_lookup(|key| {
            (key == ENV_POLL_INTERVAL_MS).then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn empty_lookup_gives_defaults() {
        assert_eq!(LockConfig::from_lookup(|_| None).unwrap(), LockConfig::default());
    }
}
