// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted secret records. Only ciphertext is ever stored here.
use serde::{Deserialize, Serialize};

use crate::crypto::Argon2Params;
use crate::error::Result;
use crate::keys::NetworkFamily;

pub const HEADER_KEY: &str = "vault/header";
pub const KEYPAIR_PREFIX: &str = "keypair/";
pub const MNEMONIC_PREFIX: &str = "mnemonic/";
pub const BACKUP_PREFIX: &str = "backup/";

pub fn keypair_key(address: &str) -> String {
    format!("{KEYPAIR_PREFIX}{address}")
}

pub fn mnemonic_key(id: &str) -> String {
    format!("{MNEMONIC_PREFIX}{id}")
}

pub fn backup_key(original: &str) -> String {
    format!("{BACKUP_PREFIX}{original}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyOrigin {
    Generated,
    Imported,
    Derived { mnemonic: String, index: u32 },
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPairRecord {
    pub address: String,
    pub family: NetworkFamily,
    pub public_key: Vec<u8>,
    /// `None` for watch-only and hardware accounts.
    pub encrypted_secret: Option<Vec<u8>>,
    pub name: String,
    pub origin: KeyOrigin,
    pub hardware: bool,
    pub created_at: i64,
}

impl KeyPairRecord {
    pub fn has_local_secret(&self) -> bool {
        self.encrypted_secret.is_some()
    }

    pub fn info(&self) -> AccountInfo {
        AccountInfo {
            address: self.address.clone(),
            family: self.family,
            public_key: hex::encode(&self.public_key),
            name: self.name.clone(),
            origin: self.origin.clone(),
            hardware: self.hardware,
            external: !self.has_local_secret(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MnemonicRecord {
    pub id: String,
    pub label: String,
    pub encrypted_phrase: Vec<u8>,
    pub backup_confirmed: bool,
    pub created_at: i64,
}

impl MnemonicRecord {
    pub fn info(&self) -> MnemonicInfo {
        MnemonicInfo {
            id: self.id.clone(),
            label: self.label.clone(),
            backup_confirmed: self.backup_confirmed,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SecretRecord {
    KeyPair(KeyPairRecord),
    Mnemonic(MnemonicRecord),
}

impl SecretRecord {
    pub fn storage_key(&self) -> String {
        match self {
            Self::KeyPair(r) => keypair_key(&r.address),
            Self::Mnemonic(r) => mnemonic_key(&r.id),
        }
    }
}

/// Public view of an account; never carries ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: String,
    pub family: NetworkFamily,
    pub public_key: String,
    pub name: String,
    pub origin: KeyOrigin,
    pub hardware: bool,
    pub external: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MnemonicInfo {
    pub id: String,
    pub label: String,
    pub backup_confirmed: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultHeader {
    pub version: u16,
    pub salt: [u8; 32],
    pub argon2: Argon2Params,
    /// A constant encrypted under the check subkey.
    pub check: Vec<u8>,
    pub created_at: i64,
}

impl VaultHeader {
    pub const VERSION: u16 = 1;
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
