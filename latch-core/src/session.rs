// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The process-wide password session.
//!
//! Anyone holding the session may ask whether it is unlocked. Only the
//! secret store in this crate can establish, read or clear the secret.
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::crypto::SecretKey;

enum SessionState {
    Locked,
    Unlocked {
        secret: SecretKey,
        unlocked_at: Instant,
    },
}

pub struct PasswordSession {
    state: RwLock<SessionState>,
    auto_lock: Option<Duration>,
}

impl Default for PasswordSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordSession {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Locked),
            auto_lock: None,
        }
    }

    /// A session older than `idle` reads as locked.
    pub fn with_auto_lock(idle: Duration) -> Self {
        Self {
            state: RwLock::new(SessionState::Locked),
            auto_lock: Some(idle),
        }
    }

    pub fn is_unlocked(&self) -> bool {
        match &*self.state.read() {
            SessionState::Locked => false,
            SessionState::Unlocked { unlocked_at, .. } => !self.expired(*unlocked_at),
        }
    }

    pub fn unlocked_since(&self) -> Option<Instant> {
        match &*self.state.read() {
            SessionState::Unlocked { unlocked_at, .. } if !self.expired(*unlocked_at) => {
                Some(*unlocked_at)
            }
            _ => None,
        }
    }

    pub(crate) fn establish(&self, secret: SecretKey) {
        *self.state.write() = SessionState::Unlocked {
            secret,
            unlocked_at: Instant::now(),
        };
        debug!("session unlocked");
    }

    pub(crate) fn clear(&self) {
        let mut state = self.state.write();
        if matches!(*state, SessionState::Unlocked { .. }) {
            debug!("session locked");
        }
        *state = SessionState::Locked;
    }

    /// Clone of the session secret, or `None` when locked or expired.
    pub(crate) fn secret(&self) -> Option<SecretKey> {
        let expired = {
            let state = self.state.read();
            match &*state {
                SessionState::Locked => return None,
                SessionState::Unlocked {
                    secret,
                    unlocked_at,
                } => {
                    if !self.expired(*unlocked_at) {
                        return Some(secret.clone());
                    }
                    true
                }
            }
        };
        if expired {
            debug!("session expired");
            self.clear();
        }
        None
    }

    fn expired(&self, unlocked_at: Instant) -> bool {
        self.auto_lock
            .map(|idle| unlocked_at.elapsed() >= idle)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let session = PasswordSession::new();
        assert!(!session.is_unlocked());
        assert!(session.secret().is_none());

        session.establish(SecretKey::generate());
        assert!(session.is_unlocked());
        assert!(session.unlocked_since().is_some());
        assert!(session.secret().is_some());

        session.clear();
        assert!(!session.is_unlocked());
        session.clear();
        assert!(session.secret().is_none());
    }

    #[test]
    fn test_auto_lock() {
        let session = PasswordSession::with_auto_lock(Duration::ZERO);
        session.establish(SecretKey::generate());
        assert!(!session.is_unlocked());
        assert!(session.secret().is_none());
    }

    #[test]
    fn test_isolated_instances() {
        let a = PasswordSession::new();
        let b = PasswordSession::new();
        a.establish(SecretKey::generate());
        assert!(a.is_unlocked());
        assert!(!b.is_unlocked());
    }
}
