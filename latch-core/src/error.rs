// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LatchError {
    #[error("Invalid password")]
    InvalidPassword,

    #[error("Vault is locked")]
    Locked,

    #[error("Too many failed attempts, retry in {0}s")]
    RateLimited(u64),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption failed - wrong password or corrupted data")]
    DecryptionFailed,

    #[error("Account not found: {0}")]
    KeyNotFound(String),

    #[error("Account already exists: {0}")]
    KeyAlreadyExists(String),

    #[error("Mnemonic not found: {0}")]
    MnemonicNotFound(String),

    #[error("Invalid mnemonic phrase")]
    InvalidMnemonic,

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Account {0} has no local secret (external or hardware)")]
    HardwareAccount(String),

    #[error("Mnemonic backup not confirmed: {0}")]
    BackupNotConfirmed(String),

    #[error("Password change failed: {0}")]
    RotationFailed(String),

    #[error("Vault already exists")]
    AlreadyExists,

    #[error("Vault not initialized")]
    NotInitialized,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("{0}")]
    Other(String),
}

impl LatchError {
    /// True for failures that leave secret material in an unverified state.
    pub fn is_secret_failure(&self) -> bool {
        matches!(
            self,
            LatchError::DecryptionFailed | LatchError::RotationFailed(_)
        )
    }
}

impl From<redb::DatabaseError> for LatchError {
    fn from(e: redb::DatabaseError) -> Self {
        LatchError::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for LatchError {
    fn from(e: redb::TransactionError) -> Self {
        LatchError::Storage(e.to_string())
    }
}

impl From<redb::TableError> for LatchError {
    fn from(e: redb::TableError) -> Self {
        LatchError::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for LatchError {
    fn from(e: redb::StorageError) -> Self {
        LatchError::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for LatchError {
    fn from(e: redb::CommitError) -> Self {
        LatchError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LatchError>;
