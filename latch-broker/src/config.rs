// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::rate_limit::RateLimitConfig;

fn deserialize_nonzero<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = u64::deserialize(deserializer)?;
    if value == 0 {
        return Err(serde::de::Error::custom("value must be greater than 0"));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    /// Delay between receipt lookups.
    #[serde(deserialize_with = "deserialize_nonzero")]
    pub poll_interval_secs: u64,
    /// Hard deadline after which a transaction is marked unknown.
    #[serde(deserialize_with = "deserialize_nonzero")]
    pub watch_timeout_secs: u64,
    /// `None` disables per-origin throttling.
    pub rate_limit: Option<RateLimitConfig>,
    pub audit_capacity: usize,
    pub audit_file: Option<PathBuf>,
    pub max_pending: usize,
    pub max_payload_bytes: usize,
    /// Refuse non-authorization requests from origins without a grant.
    pub require_authorization: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            watch_timeout_secs: 600,
            rate_limit: Some(RateLimitConfig::default()),
            audit_capacity: 1_000,
            audit_file: None,
            max_pending: 64,
            max_payload_bytes: 256 * 1024,
            require_authorization: true,
        }
    }
}

impl BrokerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }
}
