// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Chain node collaborators.
//!
//! Node calls are assumed unreliable. Clients must not retry internally;
//! the transaction watcher owns retry policy.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use latch_core::NetworkFamily;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::BrokerError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Timeouts, connection resets and the like.
    #[error("node unavailable: {0}")]
    Unavailable(String),

    /// The node refused the payload.
    #[error("rejected by node: {0}")]
    Rejected(String),
}

impl From<NodeError> for BrokerError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Unavailable(msg) => BrokerError::Internal(msg),
            NodeError::Rejected(msg) => BrokerError::InvalidRequest(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub hash: String,
    pub success: bool,
}

#[async_trait]
pub trait NodeClient: Send + Sync {
    /// `Ok(None)` while the transaction is not yet included.
    async fn get_receipt(&self, hash: &str) -> Result<Option<Receipt>, NodeError>;

    async fn get_sequence_number(&self, address: &str) -> Result<u64, NodeError>;

    /// Submits a signed transaction and returns its hash.
    async fn broadcast(&self, signed: &[u8]) -> Result<String, NodeError>;
}

#[derive(Clone)]
pub struct Network {
    pub id: String,
    pub family: NetworkFamily,
    pub client: Arc<dyn NodeClient>,
}

/// Network id to family and client.
#[derive(Default)]
pub struct NodeRegistry {
    networks: RwLock<HashMap<String, Network>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        id: impl Into<String>,
        family: NetworkFamily,
        client: Arc<dyn NodeClient>,
    ) {
        let id = id.into();
        self.networks.write().insert(
            id.clone(),
            Network {
                id,
                family,
                client,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<Network> {
        self.networks.read().get(id).cloned()
    }

    pub fn resolve(&self, id: &str) -> crate::error::Result<Network> {
        self.get(id)
            .ok_or_else(|| BrokerError::NotFound(format!("network {id}")))
    }

    pub fn networks(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.networks.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.networks.read().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Scripted node: receipts are served from a queue per hash, broadcasts
    /// return `0x` + hex of the first 8 payload bytes.
    #[derive(Default)]
    pub(crate) struct MockNode {
        pub sequence: Mutex<u64>,
        pub receipts: Mutex<HashMap<String, VecDeque<Result<Option<Receipt>, NodeError>>>>,
        pub broadcasts: Mutex<Vec<Vec<u8>>>,
        pub fail_broadcast: Mutex<Option<NodeError>>,
    }

    impl MockNode {
        pub(crate) fn script(&self, hash: &str, replies: Vec<Result<Option<Receipt>, NodeError>>) {
            self.receipts.lock().insert(hash.to_string(), replies.into());
        }
    }

    #[async_trait]
    impl NodeClient for MockNode {
        async fn get_receipt(&self, hash: &str) -> Result<Option<Receipt>, NodeError> {
            self.receipts
                .lock()
                .get_mut(hash)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(None))
        }

        async fn get_sequence_number(&self, _address: &str) -> Result<u64, NodeError> {
            Ok(*self.sequence.lock())
        }

        async fn broadcast(&self, signed: &[u8]) -> Result<String, NodeError> {
            if let Some(e) = self.fail_broadcast.lock().clone() {
                return Err(e);
            }
            self.broadcasts.lock().push(signed.to_vec());
            let n = self.broadcasts.lock().len();
            Ok(format!("0x{:04x}{}", n, hex::encode(&signed[..signed.len().min(8)])))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = NodeRegistry::new();
        assert!(registry.is_empty());
        registry.register("eth-main", NetworkFamily::Evm, Arc::new(MockNode::default()));
        assert_eq!(registry.resolve("eth-main").unwrap().family, NetworkFamily::Evm);
        assert!(matches!(
            registry.resolve("dot"),
            Err(BrokerError::NotFound(_))
        ));
        assert_eq!(registry.networks(), vec!["eth-main".to_string()]);
    }

    #[test]
    fn test_node_error_mapping() {
        assert!(matches!(
            BrokerError::from(NodeError::Unavailable("timeout".into())),
            BrokerError::Internal(_)
        ));
        assert!(matches!(
            BrokerError::from(NodeError::Rejected("nonce too low".into())),
            BrokerError::InvalidRequest(_)
        ));
    }
}
