// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use tracing::{info, instrument, warn};

use crate::crypto::{self, EncryptedData, SecretKey, SALT_SIZE};
use crate::error::{LatchError, Result};
use crate::records::{
    self, backup_key, KeyPairRecord, MnemonicRecord, HEADER_KEY, BACKUP_PREFIX, KEYPAIR_PREFIX,
    MNEMONIC_PREFIX,
};
use crate::store::KeyValueStore;
use crate::vault::{
    decrypt_secret, derive_master, new_header, verify_check, Vault, MNEMONIC_CONTEXT,
    RECORD_CONTEXT,
};

/// Restores records left under `backup/` by a password change that never
/// finished, then removes the backup.
pub(crate) async fn recover_interrupted(store: &dyn KeyValueStore) -> Result<usize> {
    let backup = store.list(BACKUP_PREFIX).await?;
    if backup.is_empty() {
        return Ok(0);
    }
    warn!(
        records = backup.len(),
        "interrupted password change found, restoring backup"
    );
    for (key, value) in &backup {
        if let Some(original) = key.strip_prefix(BACKUP_PREFIX) {
            store.set(original, value).await?;
        }
    }
    for (key, _) in &backup {
        store.remove(key).await?;
    }
    info!(records = backup.len(), "backup restored");
    Ok(backup.len())
}

async fn restore(store: &dyn KeyValueStore, snapshot: &[(String, Vec<u8>)]) -> Result<()> {
    let mut first_error = None;
    for (key, value) in snapshot {
        if let Err(e) = store.set(key, value).await {
            warn!(key = %key, error = %e, "failed to restore record during rollback");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn discard_backup(store: &dyn KeyValueStore, snapshot: &[(String, Vec<u8>)]) {
    for (key, _) in snapshot {
        if let Err(e) = store.remove(&backup_key(key)).await {
            warn!(key = %key, error = %e, "failed to remove backup entry");
        }
    }
}

impl Vault {
    /// Re-encrypts every secret record under `new_password`.
    ///
    /// Either every record moves to the new password or every record is
    /// restored to its state under `current_password`. On failure the
    /// session is cleared and [`LatchError::RotationFailed`] returned.
    #[instrument(skip_all)]
    pub async fn change_password(
        &self,
        current_password: &str,
        new_password: &str,
    ) -> Result<bool> {
        let _guard = self.records_guard.write().await;

        let mnemonic_entries = self.store.list(MNEMONIC_PREFIX).await?;
        for (_, bytes) in &mnemonic_entries {
            let record: MnemonicRecord = records::decode(bytes)?;
            if !record.backup_confirmed {
                return Err(LatchError::BackupNotConfirmed(record.id));
            }
        }

        let header = self.header.read().clone();
        let old_master = derive_master(current_password, header.salt, header.argon2).await?;
        if !verify_check(&header, &old_master) {
            warn!("password change refused, current password does not match");
            return Err(LatchError::InvalidPassword);
        }

        let salt: [u8; SALT_SIZE] = crypto::random_bytes();
        let new_master = derive_master(new_password, salt, header.argon2).await?;
        let next_header = new_header(salt, header.argon2, &new_master)?;

        let keypair_entries = self.store.list(KEYPAIR_PREFIX).await?;
        let header_bytes = self
            .store
            .get(HEADER_KEY)
            .await?
            .ok_or(LatchError::NotInitialized)?;

        let mut snapshot = Vec::with_capacity(keypair_entries.len() + mnemonic_entries.len() + 1);
        snapshot.extend(keypair_entries.iter().cloned());
        snapshot.extend(mnemonic_entries.iter().cloned());
        snapshot.push((HEADER_KEY.to_string(), header_bytes));

        for (key, value) in &snapshot {
            if let Err(e) = self.store.set(&backup_key(key), value).await {
                discard_backup(self.store.as_ref(), &snapshot).await;
                return Err(LatchError::RotationFailed(format!("backup failed: {e}")));
            }
        }

        let mut rewritten = 0usize;
        let outcome = async {
            for (key, bytes) in &keypair_entries {
                let record = reencrypt_keypair(records::decode(bytes)?, &old_master, &new_master)?;
                self.store.set(key, &records::encode(&record)?).await?;
                rewritten += 1;
            }
            for (key, bytes) in &mnemonic_entries {
                let record = reencrypt_mnemonic(records::decode(bytes)?, &old_master, &new_master)?;
                self.store.set(key, &records::encode(&record)?).await?;
                rewritten += 1;
            }
            self.store
                .set(HEADER_KEY, &records::encode(&next_header)?)
                .await
        }
        .await;

        match outcome {
            Ok(()) => {
                *self.header.write() = next_header;
                self.session.establish(new_master);
                discard_backup(self.store.as_ref(), &snapshot).await;
                info!(records = rewritten, "password changed");
                Ok(true)
            }
            Err(e) => {
                warn!(
                    rewritten,
                    total = snapshot.len() - 1,
                    error = %e,
                    "password change failed, rolling back"
                );
                let restored = restore(self.store.as_ref(), &snapshot).await;
                if restored.is_ok() {
                    discard_backup(self.store.as_ref(), &snapshot).await;
                }
                self.session.clear();
                match restored {
                    Ok(()) => Err(LatchError::RotationFailed(e.to_string())),
                    Err(re) => Err(LatchError::RotationFailed(format!(
                        "{e}; rollback incomplete, backup kept for recovery: {re}"
                    ))),
                }
            }
        }
    }
}

fn reencrypt_keypair(
    mut record: KeyPairRecord,
    old_master: &SecretKey,
    new_master: &SecretKey,
) -> Result<KeyPairRecord> {
    if let Some(encrypted) = record.encrypted_secret.as_deref() {
        let material = decrypt_secret(old_master, record.family, encrypted)?;
        let key = crypto::derive_subkey(new_master, RECORD_CONTEXT);
        record.encrypted_secret = Some(crypto::encrypt(material.secret_bytes(), &key)?.to_bytes());
    }
    Ok(record)
}

fn reencrypt_mnemonic(
    mut record: MnemonicRecord,
    old_master: &SecretKey,
    new_master: &SecretKey,
) -> Result<MnemonicRecord> {
    let old_key = crypto::derive_subkey(old_master, MNEMONIC_CONTEXT);
    let phrase = crypto::decrypt(&EncryptedData::from_bytes(&record.encrypted_phrase)?, &old_key)?;
    let new_key = crypto::derive_subkey(new_master, MNEMONIC_CONTEXT);
    record.encrypted_phrase = crypto::encrypt(&phrase, &new_key)?.to_bytes();
    Ok(record)
}
