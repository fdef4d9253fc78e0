// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-origin request throttling over minute, hour and day windows.
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::types::Origin;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl RateLimitConfig {
    pub fn new(per_minute: u32, per_hour: u32, per_day: u32) -> Self {
        Self {
            per_minute,
            per_hour,
            per_day,
        }
    }

    pub fn permissive() -> Self {
        Self::new(120, 2_000, 20_000)
    }

    pub fn strict() -> Self {
        Self::new(5, 50, 500)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(30, 300, 3_000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    fn retry_after_secs(&self) -> u64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitStatus {
    Allowed { remaining_minute: u32 },
    Exceeded { window: Window, limit: u32 },
}

impl RateLimitStatus {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
struct Hits {
    hits: VecDeque<DateTime<Utc>>,
}

impl Hits {
    fn count_since(&self, since: DateTime<Utc>) -> u32 {
        self.hits.iter().filter(|t| **t > since).count() as u32
    }

    fn status_at(&self, config: &RateLimitConfig, now: DateTime<Utc>) -> RateLimitStatus {
        let minute = self.count_since(now - Duration::minutes(1));
        let hour = self.count_since(now - Duration::hours(1));
        let day = self.count_since(now - Duration::days(1));

        if minute >= config.per_minute {
            return RateLimitStatus::Exceeded {
                window: Window::Minute,
                limit: config.per_minute,
            };
        }
        if hour >= config.per_hour {
            return RateLimitStatus::Exceeded {
                window: Window::Hour,
                limit: config.per_hour,
            };
        }
        if day >= config.per_day {
            return RateLimitStatus::Exceeded {
                window: Window::Day,
                limit: config.per_day,
            };
        }
        RateLimitStatus::Allowed {
            remaining_minute: config.per_minute - minute,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(1);
        while self.hits.front().is_some_and(|t| *t <= cutoff) {
            self.hits.pop_front();
        }
    }

    fn last_used(&self) -> DateTime<Utc> {
        self.hits.back().copied().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Tracks request timestamps per origin. The number of tracked origins is
/// bounded; idle origins are pruned first, then the least recently used.
pub struct OriginRateLimiter {
    config: RateLimitConfig,
    origins: Mutex<HashMap<Origin, Hits>>,
}

impl OriginRateLimiter {
    pub const MAX_TRACKED: usize = 1_000;

    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            origins: Mutex::new(HashMap::new()),
        }
    }

    pub fn check_and_record(&self, origin: &Origin) -> Result<()> {
        self.check_and_record_at(origin, Utc::now())
    }

    pub fn check_and_record_at(&self, origin: &Origin, now: DateTime<Utc>) -> Result<()> {
        let mut origins = self.origins.lock();

        if origins.len() >= Self::MAX_TRACKED && !origins.contains_key(origin) {
            origins.retain(|_, w| {
                w.prune(now);
                !w.hits.is_empty()
            });
            if origins.len() >= Self::MAX_TRACKED {
                let oldest = origins
                    .iter()
                    .min_by_key(|(_, w)| w.last_used())
                    .map(|(o, _)| o.clone());
                if let Some(oldest) = oldest {
                    origins.remove(&oldest);
                }
            }
        }

        let window = origins.entry(origin.clone()).or_insert_with(|| Hits {
            hits: VecDeque::new(),
        });
        window.prune(now);
        match window.status_at(&self.config, now) {
            RateLimitStatus::Allowed { .. } => {
                window.hits.push_back(now);
                Ok(())
            }
            RateLimitStatus::Exceeded { window: w, limit } => {
                debug!(origin = %origin, ?w, limit, "origin rate limited");
                Err(BrokerError::RateLimited(w.retry_after_secs()))
            }
        }
    }

    pub fn status(&self, origin: &Origin) -> RateLimitStatus {
        let now = Utc::now();
        self.origins
            .lock()
            .get(origin)
            .map(|w| w.status_at(&self.config, now))
            .unwrap_or(RateLimitStatus::Allowed {
                remaining_minute: self.config.per_minute,
            })
    }

    pub fn tracked(&self) -> usize {
        self.origins.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(n: usize) -> Origin {
        Origin::parse(&format!("https://site{n}.example")).unwrap()
    }

    #[test]
    fn test_allows_within_limits() {
        let limiter = OriginRateLimiter::new(RateLimitConfig::default());
        assert!(limiter.check_and_record(&origin(1)).is_ok());
        assert!(limiter.status(&origin(1)).is_allowed());
    }

    #[test]
    fn test_minute_window_exceeded() {
        let limiter = OriginRateLimiter::new(RateLimitConfig::new(2, 100, 1000));
        let now = Utc::now();
        limiter.check_and_record_at(&origin(1), now).unwrap();
        limiter.check_and_record_at(&origin(1), now).unwrap();
        assert_eq!(
            limiter.check_and_record_at(&origin(1), now),
            Err(BrokerError::RateLimited(60))
        );
        // other origins are unaffected
        assert!(limiter.check_and_record_at(&origin(2), now).is_ok());
        // the window slides
        let later = now + Duration::seconds(61);
        assert!(limiter.check_and_record_at(&origin(1), later).is_ok());
    }

    #[test]
    fn test_hour_window_exceeded() {
        let limiter = OriginRateLimiter::new(RateLimitConfig::new(100, 3, 1000));
        let now = Utc::now();
        for i in 0..3 {
            limiter
                .check_and_record_at(&origin(1), now + Duration::minutes(i * 2))
                .unwrap();
        }
        assert_eq!(
            limiter.check_and_record_at(&origin(1), now + Duration::minutes(10)),
            Err(BrokerError::RateLimited(3_600))
        );
    }

    #[test]
    fn test_tracked_origins_bounded() {
        let limiter = OriginRateLimiter::new(RateLimitConfig::permissive());
        let now = Utc::now();
        for n in 0..OriginRateLimiter::MAX_TRACKED + 5 {
            limiter.check_and_record_at(&origin(n), now).unwrap();
        }
        assert!(limiter.tracked() <= OriginRateLimiter::MAX_TRACKED);
    }
}
