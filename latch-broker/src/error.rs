// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use latch_core::LatchError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Unauthorised")]
    Unauthorised,

    #[error("Duplicate pending request: {0}")]
    DuplicatePendingRequest(String),

    #[error("Channel disconnected")]
    ChannelDisconnected,

    #[error("Cancelled")]
    Cancelled,

    #[error("Secret operation failed")]
    SecretOperationFailed,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Origin not authorized: {0}")]
    OriginNotAuthorized(String),

    #[error("Rate limited, retry in {0}s")]
    RateLimited(u64),

    #[error("Too many pending requests")]
    CapacityExceeded,

    /// A recovery phrase must be confirmed as backed up first.
    #[error("Backup of recovery phrase {0} not confirmed")]
    BackupNotConfirmed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a rejection should be presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The user or caller walked away from the request.
    Cancelled,
    /// The operation itself failed.
    Failed,
    /// The password has to be entered again.
    Reauthenticate,
    /// Transient; the caller may retry later.
    Retry,
}

impl BrokerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unauthorised => ErrorCategory::Reauthenticate,
            Self::Cancelled | Self::ChannelDisconnected => ErrorCategory::Cancelled,
            Self::DuplicatePendingRequest(_) | Self::RateLimited(_) | Self::CapacityExceeded => {
                ErrorCategory::Retry
            }
            Self::SecretOperationFailed
            | Self::NotFound(_)
            | Self::InvalidRequest(_)
            | Self::OriginNotAuthorized(_)
            | Self::BackupNotConfirmed(_)
            | Self::Internal(_) => ErrorCategory::Failed,
        }
    }

    /// Reason safe to send to an untrusted caller.
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Unauthorised => "Password required",
            Self::DuplicatePendingRequest(_) => "A request from this site is already pending",
            Self::ChannelDisconnected => "Connection closed",
            Self::Cancelled => "Cancelled by user",
            Self::SecretOperationFailed => "Operation failed",
            Self::NotFound(_) => "Not found",
            Self::InvalidRequest(_) => "Invalid request",
            Self::OriginNotAuthorized(_) => "Site not authorized",
            Self::RateLimited(_) => "Rate limited",
            Self::CapacityExceeded => "Too many pending requests",
            Self::BackupNotConfirmed(_) => "Confirm your recovery phrase backup first",
            Self::Internal(_) => "Internal error",
        }
    }
}

impl From<LatchError> for BrokerError {
    fn from(e: LatchError) -> Self {
        match e {
            LatchError::Locked | LatchError::InvalidPassword => Self::Unauthorised,
            LatchError::RateLimited(secs) => Self::RateLimited(secs),
            LatchError::DecryptionFailed | LatchError::RotationFailed(_) => {
                Self::SecretOperationFailed
            }
            LatchError::KeyNotFound(what) | LatchError::MnemonicNotFound(what) => {
                Self::NotFound(what)
            }
            LatchError::HardwareAccount(_) => {
                Self::InvalidRequest("account requires an external signature".into())
            }
            LatchError::InvalidKey(reason) => Self::InvalidRequest(reason),
            LatchError::BackupNotConfirmed(id) => Self::BackupNotConfirmed(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
