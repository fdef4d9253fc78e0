// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Origin, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Connect,
    Disconnect,
    Authorize,
    Revoke,
    SignMessage,
    Broadcast,
    Encrypt,
    Decrypt,
    Accept,
    Reject,
    PermissionDenied,
    PasswordChange,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Authorize => "authorize",
            Self::Revoke => "revoke",
            Self::SignMessage => "sign_message",
            Self::Broadcast => "broadcast",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::PermissionDenied => "permission_denied",
            Self::PasswordChange => "password_change",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub origin: Option<String>,
    pub request_id: Option<String>,
    pub account: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            origin: None,
            request_id: None,
            account: None,
            success: true,
            reason: None,
        }
    }

    pub fn with_origin(mut self, origin: &Origin) -> Self {
        self.origin = Some(origin.to_string());
        self
    }

    pub fn with_request(mut self, id: &RequestId) -> Self {
        self.request_id = Some(id.to_string());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.reason = Some(reason.into());
        self
    }
}

impl std::fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "ok" } else { "failed" };
        write!(
            f,
            "[{}] {} {} {}",
            self.timestamp.format("%H:%M:%S"),
            status,
            self.origin.as_deref().unwrap_or("-"),
            self.action
        )?;
        if let Some(ref id) = self.request_id {
            write!(f, " {id}")?;
        }
        if let Some(ref reason) = self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

struct Inner {
    entries: VecDeque<AuditEntry>,
    file: Option<File>,
}

/// Bounded in-memory record of broker actions, optionally mirrored to a
/// JSON-lines file. Write failures on the file are logged and otherwise
/// ignored.
pub struct AuditLog {
    inner: Mutex<Inner>,
    max_entries: usize,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(max_entries.min(1024)),
                file: None,
            }),
            max_entries,
        }
    }

    pub fn open_file(&self, path: &Path) -> std::io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.inner.lock().file = Some(file);
        Ok(())
    }

    pub fn log(&self, entry: AuditEntry) {
        let mut inner = self.inner.lock();
        if let Some(ref mut file) = inner.file {
            let written = serde_json::to_string(&entry)
                .map_err(|e| e.to_string())
                .and_then(|json| writeln!(file, "{json}").map_err(|e| e.to_string()));
            if let Err(e) = written {
                warn!(error = %e, action = %entry.action, "failed to write audit entry");
            }
        }

        inner.entries.push_back(entry);
        while inner.entries.len() > self.max_entries {
            inner.entries.pop_front();
        }
    }

    /// Newest first.
    pub fn recent(&self, count: usize) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .rev()
            .take(count)
            .cloned()
            .collect()
    }

    pub fn by_origin(&self, origin: &Origin) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.origin.as_deref() == Some(origin.as_str()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
