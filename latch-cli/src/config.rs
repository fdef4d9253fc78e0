// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use latch_broker::BrokerConfig;
use latch_core::Argon2Params;
use serde::{Deserialize, Deserializer};

const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Argon2Profile {
    Testing,
    #[default]
    Default,
    High,
}

impl Argon2Profile {
    pub fn params(self) -> Argon2Params {
        match self {
            Self::Testing => Argon2Params::TESTING,
            Self::Default => Argon2Params::DEFAULT,
            Self::High => Argon2Params::HIGH,
        }
    }
}

impl std::fmt::Display for Argon2Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Testing => "testing",
            Self::Default => "default",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

fn deserialize_path<'de, D>(deserializer: D) -> std::result::Result<Option<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
        .map(|opt| opt.map(|s| PathBuf::from(shellexpand::tilde(&s).as_ref())))
}

fn deserialize_auto_lock<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt = Option::<u64>::deserialize(deserializer)?;
    if opt == Some(0) {
        return Err(serde::de::Error::custom("auto_lock_secs must be greater than 0"));
    }
    Ok(opt)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default, deserialize_with = "deserialize_path")]
    pub vault_path: Option<PathBuf>,
    #[serde(default)]
    pub argon2_profile: Argon2Profile,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default, deserialize_with = "deserialize_path")]
    pub socket_path: Option<PathBuf>,
    /// Idle time after which the session locks itself.
    #[serde(default, deserialize_with = "deserialize_auto_lock")]
    pub auto_lock_secs: Option<u64>,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl Config {
    /// Loads `path`, or the default config file if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        if metadata.len() > MAX_CONFIG_SIZE {
            bail!("Config file too large");
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| anyhow!("Invalid config: {e}"))
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("latch").join("config.toml"))
    }

    pub fn vault_path(&self) -> Result<PathBuf> {
        match &self.vault_path {
            Some(p) => Ok(p.clone()),
            None => dirs::data_dir()
                .map(|p| p.join("latch").join("vault.redb"))
                .ok_or_else(|| anyhow!("Could not determine a data directory")),
        }
    }

    pub fn socket_path(&self, vault: &Path) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| vault.with_extension("sock"))
    }

    pub fn auto_lock(&self) -> Option<Duration> {
        self.auto_lock_secs.map(Duration::from_secs)
    }
}
