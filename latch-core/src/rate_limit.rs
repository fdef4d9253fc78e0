// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY_SECS: u64 = 1;
const MAX_DELAY_SECS: u64 = 300;

#[derive(Default)]
struct AttemptRecord {
    failed_attempts: u32,
    last_failure: Option<Instant>,
}

impl AttemptRecord {
    fn delay_duration(&self) -> Duration {
        if self.failed_attempts < MAX_ATTEMPTS {
            return Duration::ZERO;
        }
        let excess = self.failed_attempts - MAX_ATTEMPTS;
        let delay_secs = BASE_DELAY_SECS.saturating_mul(1u64 << excess.min(9));
        Duration::from_secs(delay_secs.min(MAX_DELAY_SECS))
    }

    fn remaining_delay(&self) -> Duration {
        match self.last_failure {
            None => Duration::ZERO,
            Some(at) => self.delay_duration().saturating_sub(at.elapsed()),
        }
    }
}

/// Throttles password attempts against the vault.
#[derive(Default)]
pub struct AttemptLimiter {
    record: Mutex<AttemptRecord>,
}

impl AttemptLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seconds until the next attempt is allowed, or `Ok` if one may proceed.
    pub fn check(&self) -> Result<(), u64> {
        let remaining = self.record.lock().remaining_delay();
        if remaining.is_zero() {
            Ok(())
        } else {
            Err(remaining.as_secs().max(1))
        }
    }

    pub fn record_failure(&self) {
        let mut record = self.record.lock();
        record.failed_attempts = record.failed_attempts.saturating_add(1);
        record.last_failure = Some(Instant::now());
    }

    pub fn record_success(&self) {
        *self.record.lock() = AttemptRecord::default();
    }

    pub fn failed_attempts(&self) -> u32 {
        self.record.lock().failed_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_first_attempts() {
        let limiter = AttemptLimiter::new();
        for _ in 0..MAX_ATTEMPTS - 1 {
            limiter.record_failure();
            assert!(limiter.check().is_ok());
        }
    }

    #[test]
    fn test_blocks_after_max_attempts() {
        let limiter = AttemptLimiter::new();
        for _ in 0..MAX_ATTEMPTS {
            limiter.record_failure();
        }
        assert_eq!(limiter.check(), Err(1));
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let mut record = AttemptRecord {
            failed_attempts: MAX_ATTEMPTS + 3,
            last_failure: None,
        };
        assert_eq!(record.delay_duration(), Duration::from_secs(8));
        record.failed_attempts = MAX_ATTEMPTS + 30;
        assert_eq!(record.delay_duration(), Duration::from_secs(MAX_DELAY_SECS));
    }

    #[test]
    fn test_success_resets() {
        let limiter = AttemptLimiter::new();
        for _ in 0..MAX_ATTEMPTS + 2 {
            limiter.record_failure();
        }
        limiter.record_success();
        assert!(limiter.check().is_ok());
        assert_eq!(limiter.failed_attempts(), 0);
    }
}
