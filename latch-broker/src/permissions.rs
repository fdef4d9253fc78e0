// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-origin authorization grants, persisted under `auth/`.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use latch_core::records;
use latch_core::KeyValueStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{BrokerError, Result};
use crate::types::{Origin, RequestKind};

pub const AUTH_PREFIX: &str = "auth/";

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Scope: u32 {
        const ACCOUNTS = 0b0000_0001;
        const SIGN     = 0b0000_0010;
        const SEND     = 0b0000_0100;
        const ENCRYPT  = 0b0000_1000;
        const DECRYPT  = 0b0001_0000;
        const METADATA = 0b0010_0000;
        const NETWORK  = 0b0100_0000;

        const DEFAULT = Self::ACCOUNTS.bits()
                      | Self::SIGN.bits()
                      | Self::SEND.bits()
                      | Self::METADATA.bits()
                      | Self::NETWORK.bits();

        const ALL = Self::DEFAULT.bits()
                  | Self::ENCRYPT.bits()
                  | Self::DECRYPT.bits();
    }
}

impl Scope {
    /// Scope a request kind needs. Authorization itself needs none.
    pub fn for_kind(kind: RequestKind) -> Scope {
        match kind {
            RequestKind::Authorize => Scope::empty(),
            RequestKind::SignMessage => Scope::SIGN,
            RequestKind::SignAndSend | RequestKind::SendSigned => Scope::SEND,
            RequestKind::Encrypt => Scope::ENCRYPT,
            RequestKind::Decrypt => Scope::DECRYPT,
            RequestKind::MetadataUpdate => Scope::METADATA,
            RequestKind::AddNetwork | RequestKind::WatchAsset => Scope::NETWORK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub origin: Origin,
    pub name: String,
    pub accounts: Vec<String>,
    pub scopes: Scope,
    pub granted_at: i64,
    pub last_used: i64,
    pub request_count: u64,
}

fn grant_key(origin: &Origin) -> String {
    format!("{AUTH_PREFIX}{origin}")
}

pub struct AuthorizationList {
    store: Arc<dyn KeyValueStore>,
    grants: RwLock<HashMap<Origin, Grant>>,
    changes: watch::Sender<u64>,
}

impl AuthorizationList {
    pub const MAX_GRANTS: usize = 1_000;

    pub async fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let mut grants = HashMap::new();
        for (key, bytes) in store.list(AUTH_PREFIX).await? {
            match records::decode::<Grant>(&bytes) {
                Ok(grant) => {
                    grants.insert(grant.origin.clone(), grant);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable grant"),
            }
        }
        let (changes, _) = watch::channel(0);
        Ok(Self {
            store,
            grants: RwLock::new(grants),
            changes,
        })
    }

    pub async fn grant(
        &self,
        origin: &Origin,
        name: &str,
        accounts: Vec<String>,
        scopes: Scope,
    ) -> Result<Grant> {
        let now = Utc::now().timestamp();
        let grant = {
            let grants = self.grants.read();
            if grants.len() >= Self::MAX_GRANTS && !grants.contains_key(origin) {
                return Err(BrokerError::Internal("too many authorized sites".into()));
            }
            match grants.get(origin) {
                Some(existing) => Grant {
                    name: name.to_string(),
                    accounts,
                    scopes: scopes & Scope::ALL,
                    last_used: now,
                    ..existing.clone()
                },
                None => Grant {
                    origin: origin.clone(),
                    name: name.to_string(),
                    accounts,
                    scopes: scopes & Scope::ALL,
                    granted_at: now,
                    last_used: now,
                    request_count: 0,
                },
            }
        };
        self.store
            .set(&grant_key(origin), &records::encode(&grant)?)
            .await?;
        self.grants.write().insert(origin.clone(), grant.clone());
        self.changes.send_modify(|v| *v += 1);
        info!(origin = %origin, accounts = grant.accounts.len(), "origin authorized");
        Ok(grant)
    }

    pub async fn revoke(&self, origin: &Origin) -> Result<bool> {
        let existed = self.store.remove(&grant_key(origin)).await?;
        let cached = self.grants.write().remove(origin).is_some();
        if existed || cached {
            self.changes.send_modify(|v| *v += 1);
            info!(origin = %origin, "authorization revoked");
        }
        Ok(existed || cached)
    }

    pub fn is_authorized(&self, origin: &Origin) -> bool {
        self.grants.read().contains_key(origin)
    }

    pub fn permits(&self, origin: &Origin, kind: RequestKind) -> bool {
        self.grants
            .read()
            .get(origin)
            .is_some_and(|grant| grant.scopes.contains(Scope::for_kind(kind)))
    }

    /// Accounts `origin` may see, in grant order.
    pub fn accounts_for(&self, origin: &Origin) -> Vec<String> {
        self.grants
            .read()
            .get(origin)
            .map(|grant| grant.accounts.clone())
            .unwrap_or_default()
    }

    pub fn exposes(&self, origin: &Origin, address: &str) -> bool {
        let address = latch_core::keys::normalize_address(address);
        self.grants
            .read()
            .get(origin)
            .is_some_and(|grant| grant.accounts.iter().any(|a| *a == address))
    }

    pub fn record_usage(&self, origin: &Origin) {
        if let Some(grant) = self.grants.write().get_mut(origin) {
            grant.last_used = Utc::now().timestamp();
            grant.request_count += 1;
        }
    }

    pub fn list(&self) -> Vec<Grant> {
        let mut grants: Vec<_> = self.grants.read().values().cloned().collect();
        grants.sort_by(|a, b| a.origin.cmp(&b.origin));
        grants
    }

    /// Bumps whenever a grant changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}
