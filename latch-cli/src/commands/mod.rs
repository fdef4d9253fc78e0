// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

pub mod serve;
pub mod vault;

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm, Password};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use latch_core::{KeyValueStore, PasswordSession, RedbStore, Vault};

use crate::config::Config;
use crate::output::Output;

fn warn_env_password(var_name: &str) {
    tracing::warn!(
        "Using password from {} environment variable. \
         Environment variables may be visible to other processes via /proc on Linux.",
        var_name
    );
}

fn secret_from_env(var_name: &str) -> Option<SecretString> {
    std::env::var(var_name).ok().map(|value| {
        debug!("using secret from {} env var", var_name);
        warn_env_password(var_name);
        SecretString::from(value)
    })
}

fn read_hidden(prompt: &str) -> Result<SecretString> {
    let value = Password::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact()
        .context("Failed to read input")?;
    Ok(SecretString::from(value))
}

pub fn get_password(prompt: &str) -> Result<SecretString> {
    if let Some(pw) = secret_from_env("LATCH_PASSWORD") {
        return Ok(pw);
    }
    read_hidden(prompt)
}

pub fn get_new_password(prompt: &str, confirm: &str, env_var: &str) -> Result<SecretString> {
    let pw = match secret_from_env(env_var) {
        Some(pw) => pw,
        None => {
            let pw = Password::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .with_confirmation(confirm, "Passwords don't match")
                .interact()
                .context("Failed to read password")?;
            SecretString::from(pw)
        }
    };
    if pw.expose_secret().len() < 8 {
        bail!("Password must be at least 8 characters");
    }
    Ok(pw)
}

/// Secret input that is never echoed, taken from `env_var` when set.
pub fn get_secret(prompt: &str, env_var: &str) -> Result<SecretString> {
    if let Some(secret) = secret_from_env(env_var) {
        return Ok(secret);
    }
    read_hidden(prompt)
}

pub fn get_confirm(prompt: &str) -> Result<bool> {
    if std::env::var("LATCH_YES").is_ok() {
        return Ok(true);
    }
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to start tokio runtime")
}

fn open_store(path: &Path) -> Result<Arc<dyn KeyValueStore>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = RedbStore::create(path)
        .with_context(|| format!("Failed to open vault store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn session(cfg: &Config) -> Arc<PasswordSession> {
    Arc::new(match cfg.auto_lock() {
        Some(idle) => PasswordSession::with_auto_lock(idle),
        None => PasswordSession::new(),
    })
}

/// Opens the vault at `path` without unlocking it.
pub async fn open_vault(cfg: &Config, path: &Path) -> Result<Vault> {
    if !path.exists() {
        bail!(
            "No vault at {}. Run `latch init` first",
            path.display()
        );
    }
    let store = open_store(path)?;
    Vault::open(store, session(cfg))
        .await
        .context("Failed to open vault")
}

pub async fn unlock(out: &Output, vault: &Vault) -> Result<()> {
    let password = get_password("Enter password")?;
    let spinner = out.spinner("Unlocking vault...");
    let result = vault.authenticate(password.expose_secret()).await;
    spinner.finish();
    result.context("Failed to unlock vault")
}

pub async fn open_unlocked(out: &Output, cfg: &Config, path: &Path) -> Result<Vault> {
    let vault = open_vault(cfg, path).await?;
    unlock(out, &vault).await?;
    Ok(vault)
}

pub async fn create_vault(cfg: &Config, path: &Path, password: &str) -> Result<Vault> {
    if path.exists() {
        bail!("A vault already exists at {}", path.display());
    }
    let store = open_store(path)?;
    let params = if std::env::var("LATCH_TESTING_MODE").is_ok() {
        debug!("using lightweight Argon2 params (LATCH_TESTING_MODE set)");
        latch_core::Argon2Params::TESTING
    } else {
        cfg.argon2_profile.params()
    };
    Vault::create(store, session(cfg), password, params)
        .await
        .context("Failed to create vault")
}
