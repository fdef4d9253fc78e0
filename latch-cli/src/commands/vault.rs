// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::Path;

use anyhow::{bail, Context, Result};
use secrecy::ExposeSecret;
use tracing::{debug, info};
use zeroize::Zeroizing;

use latch_core::{AccountInfo, KeyOrigin, NetworkFamily};

use crate::config::Config;
use crate::output::Output;

use super::{
    create_vault, get_confirm, get_new_password, get_password, get_secret, open_unlocked,
    open_vault, runtime,
};

pub fn cmd_init(out: &Output, cfg: &Config, path: &Path) -> Result<()> {
    out.header("Creating new latch vault");
    out.field("Path", &path.display().to_string());
    out.field("Argon2 profile", &cfg.argon2_profile.to_string());
    out.newline();

    let password = get_new_password("Enter password", "Confirm password", "LATCH_PASSWORD")?;

    let spinner = out.spinner("Deriving keys and creating vault...");
    let result = runtime()?.block_on(create_vault(cfg, path, password.expose_secret()));
    spinner.finish();
    result?;

    info!(path = %path.display(), "vault created");
    out.newline();
    out.success("Vault created successfully!");
    out.init_notes();
    Ok(())
}

fn print_account(out: &Output, account: &AccountInfo) {
    out.field("Name", &account.name);
    out.field("Family", account.family.as_str());
    out.key_field("Address", &account.address);
}

pub fn cmd_generate(
    out: &Output,
    cfg: &Config,
    path: &Path,
    family: NetworkFamily,
    name: &str,
) -> Result<()> {
    debug!(%family, name, "generating account");
    let account = runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        let spinner = out.spinner("Generating key...");
        let account = vault.generate_account(family, name).await;
        spinner.finish();
        account.context("Failed to generate account")
    })?;

    info!(address = %account.address, "account generated");
    out.newline();
    out.success("Generated new account!");
    print_account(out, &account);
    Ok(())
}

pub fn cmd_import(
    out: &Output,
    cfg: &Config,
    path: &Path,
    family: NetworkFamily,
    name: &str,
) -> Result<()> {
    debug!(%family, name, "importing account");
    let account = runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        let secret = get_secret("Enter secret key (hex)", "LATCH_SECRET")?;
        let hex_part = secret.expose_secret().trim();
        let bytes = Zeroizing::new(
            hex::decode(hex_part.strip_prefix("0x").unwrap_or(hex_part))
                .context("Secret key is not valid hex")?,
        );
        vault
            .import_account(family, &bytes, name)
            .await
            .context("Failed to import account")
    })?;

    info!(address = %account.address, "account imported");
    out.newline();
    out.success("Imported account!");
    print_account(out, &account);
    Ok(())
}

pub fn cmd_watch_only(
    out: &Output,
    cfg: &Config,
    path: &Path,
    family: NetworkFamily,
    public_key: &str,
    name: &str,
    hardware: bool,
) -> Result<()> {
    let public_key = hex::decode(public_key.strip_prefix("0x").unwrap_or(public_key))
        .context("Public key is not valid hex")?;
    let account = runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        vault
            .add_external_account(family, &public_key, name, hardware)
            .await
            .context("Failed to add account")
    })?;

    info!(address = %account.address, hardware, "external account added");
    out.newline();
    out.success(if hardware {
        "Added hardware account!"
    } else {
        "Added watch-only account!"
    });
    print_account(out, &account);
    Ok(())
}

pub fn cmd_derive(
    out: &Output,
    cfg: &Config,
    path: &Path,
    mnemonic: &str,
    family: NetworkFamily,
    index: u32,
    name: &str,
) -> Result<()> {
    let account = runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        vault
            .derive_account(mnemonic, family, index, name)
            .await
            .context("Failed to derive account")
    })?;

    info!(address = %account.address, index, "account derived");
    out.newline();
    out.success("Derived account!");
    print_account(out, &account);
    Ok(())
}

pub fn cmd_remove(out: &Output, cfg: &Config, path: &Path, address: &str) -> Result<()> {
    if !get_confirm(&format!("Remove account {address}? This cannot be undone"))? {
        out.info("Aborted.");
        return Ok(());
    }
    runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        vault
            .remove_account(address)
            .await
            .context("Failed to remove account")
    })?;
    out.success("Account removed.");
    Ok(())
}

fn origin_label(origin: &KeyOrigin) -> String {
    match origin {
        KeyOrigin::Generated => "generated".into(),
        KeyOrigin::Imported => "imported".into(),
        KeyOrigin::Derived { index, .. } => format!("derived #{index}"),
        KeyOrigin::External => "external".into(),
    }
}

/// Lists accounts and phrases. Works without the password.
pub fn cmd_list(out: &Output, cfg: &Config, path: &Path) -> Result<()> {
    let (accounts, mnemonics) = runtime()?.block_on(async {
        let vault = open_vault(cfg, path).await?;
        let accounts = vault.accounts().await?;
        let mnemonics = vault.mnemonics().await?;
        Ok::<_, anyhow::Error>((accounts, mnemonics))
    })?;

    if accounts.is_empty() {
        out.info("No accounts found.");
    } else {
        out.table_header(&[("NAME", 16), ("FAMILY", 10), ("ORIGIN", 12), ("ADDRESS", 50)]);
        for account in &accounts {
            let origin = if account.hardware {
                "hardware".to_string()
            } else {
                origin_label(&account.origin)
            };
            out.table_row(&[
                (&account.name, 16, false),
                (account.family.as_str(), 10, false),
                (&origin, 12, false),
                (&account.address, 50, true),
            ]);
        }
    }

    if !mnemonics.is_empty() {
        out.table_header(&[("LABEL", 16), ("BACKUP", 12), ("ID", 50)]);
        for m in &mnemonics {
            let backup = if m.backup_confirmed { "confirmed" } else { "PENDING" };
            out.table_row(&[
                (&m.label, 16, false),
                (backup, 12, !m.backup_confirmed),
                (&m.id, 50, false),
            ]);
        }
    }
    out.newline();
    Ok(())
}

pub fn cmd_change_password(out: &Output, cfg: &Config, path: &Path) -> Result<()> {
    let changed = runtime()?.block_on(async {
        let vault = open_vault(cfg, path).await?;
        let current = get_password("Enter current password")?;
        let new = get_new_password(
            "Enter new password",
            "Confirm new password",
            "LATCH_NEW_PASSWORD",
        )?;
        if current.expose_secret() == new.expose_secret() {
            bail!("New password must differ from the current one");
        }
        let spinner = out.spinner("Re-encrypting secrets...");
        let result = vault
            .change_password(current.expose_secret(), new.expose_secret())
            .await;
        spinner.finish();
        result.context("Password change failed")
    })?;

    if changed {
        out.success("Password changed.");
    } else {
        out.info("Password unchanged.");
    }
    Ok(())
}

pub fn cmd_mnemonic_add(out: &Output, cfg: &Config, path: &Path, label: &str) -> Result<()> {
    let info = runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        let phrase = get_secret("Enter recovery phrase", "LATCH_MNEMONIC")?;
        vault
            .add_mnemonic(phrase.expose_secret(), label)
            .await
            .context("Failed to store recovery phrase")
    })?;
    out.success("Recovery phrase stored.");
    out.field("Label", &info.label);
    out.field("Id", &info.id);
    Ok(())
}

pub fn cmd_mnemonic_generate(
    out: &Output,
    cfg: &Config,
    path: &Path,
    label: &str,
    words: usize,
) -> Result<()> {
    runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        let info = vault
            .generate_mnemonic(label, words)
            .await
            .context("Failed to generate recovery phrase")?;

        out.success("Generated recovery phrase.");
        out.field("Label", &info.label);
        out.field("Id", &info.id);
        out.secret_warning();
        vault
            .with_decrypted_mnemonic(&info.id, |phrase| {
                out.key_field("Phrase", phrase);
                Ok(())
            })
            .await?;
        out.newline();
        out.warn(&format!(
            "Write it down, then run `latch mnemonic confirm {}`. \
             Password changes are refused until then.",
            info.id
        ));
        Ok(())
    })
}

pub fn cmd_mnemonic_confirm(out: &Output, cfg: &Config, path: &Path, id: &str) -> Result<()> {
    if !get_confirm("Have you written the phrase down somewhere safe?")? {
        out.info("Aborted.");
        return Ok(());
    }
    runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        vault
            .confirm_mnemonic_backup(id)
            .await
            .context("Failed to confirm backup")
    })?;
    out.success("Backup confirmed.");
    Ok(())
}

pub fn cmd_mnemonic_reveal(out: &Output, cfg: &Config, path: &Path, id: &str) -> Result<()> {
    if !get_confirm("Show the recovery phrase on screen?")? {
        out.info("Aborted.");
        return Ok(());
    }
    runtime()?.block_on(async {
        let vault = open_unlocked(out, cfg, path).await?;
        out.secret_warning();
        vault
            .with_decrypted_mnemonic(id, |phrase| {
                out.key_field("Phrase", phrase);
                Ok(())
            })
            .await
            .context("Failed to decrypt recovery phrase")
    })
}

pub fn cmd_mnemonic_list(out: &Output, cfg: &Config, path: &Path) -> Result<()> {
    let mnemonics = runtime()?.block_on(async {
        let vault = open_vault(cfg, path).await?;
        Ok::<_, anyhow::Error>(vault.mnemonics().await?)
    })?;
    if mnemonics.is_empty() {
        out.info("No recovery phrases stored.");
        return Ok(());
    }
    out.table_header(&[("LABEL", 16), ("BACKUP", 12), ("ID", 50)]);
    for m in &mnemonics {
        let backup = if m.backup_confirmed { "confirmed" } else { "PENDING" };
        out.table_row(&[
            (&m.label, 16, false),
            (backup, 12, !m.backup_confirmed),
            (&m.id, 50, false),
        ]);
    }
    Ok(())
}
