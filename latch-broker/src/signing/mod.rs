// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Signing executors, one per network family.
//!
//! Executors only ever see key material inside [`Vault::with_decrypted`]
//! closures.
//!
//! [`Vault::with_decrypted`]: latch_core::Vault::with_decrypted
mod evm;
mod nonce;
mod substrate;

use async_trait::async_trait;
use latch_core::{NetworkFamily, Vault};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};
use crate::node::Network;

pub use evm::EvmExecutor;
pub use nonce::{NonceLease, NonceTracker};
pub use substrate::SubstrateExecutor;

/// What gets handed to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTransaction {
    pub nonce: Option<u64>,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedTransaction {
    /// Bytes covered by the signature.
    pub fn signing_bytes(payload: &[u8], nonce: Option<u64>) -> Vec<u8> {
        let mut bytes = payload.to_vec();
        if let Some(nonce) = nonce {
            bytes.extend_from_slice(&nonce.to_be_bytes());
        }
        bytes
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| BrokerError::Internal(format!("encode transaction: {e}")))
    }
}

/// A broadcast transaction as reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub network: String,
    pub hash: String,
    pub from: String,
    pub nonce: Option<u64>,
}

#[async_trait]
pub trait SigningExecutor: Send + Sync {
    fn family(&self) -> NetworkFamily;

    async fn sign_message(&self, address: &str, message: &[u8]) -> Result<Vec<u8>>;

    async fn sign_and_broadcast(
        &self,
        network: &Network,
        from: &str,
        payload: &[u8],
    ) -> Result<Submitted>;

    /// Broadcasts a transaction signed outside the vault.
    async fn broadcast_external(
        &self,
        _network: &Network,
        _from: &str,
        _payload: &[u8],
        _signature: &[u8],
    ) -> Result<Submitted> {
        Err(BrokerError::InvalidRequest(format!(
            "external signing is not supported for {} accounts",
            self.family()
        )))
    }
}

/// Fails unless `address` is a vault account of `family`.
pub(crate) async fn require_family(
    vault: &Vault,
    address: &str,
    family: NetworkFamily,
) -> Result<()> {
    let account = vault.account(address).await?;
    if account.family != family {
        return Err(BrokerError::InvalidRequest(format!(
            "{} is not a {family} account",
            account.address
        )));
    }
    Ok(())
}

pub(crate) fn require_network(network: &Network, family: NetworkFamily) -> Result<()> {
    if network.family != family {
        return Err(BrokerError::InvalidRequest(format!(
            "network {} is not a {family} network",
            network.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signing_bytes_append_nonce() {
        assert_eq!(SignedTransaction::signing_bytes(&[1, 2], None), vec![1, 2]);
        assert_eq!(
            SignedTransaction::signing_bytes(&[1], Some(258)),
            vec![1, 0, 0, 0, 0, 0, 0, 1, 2]
        );
    }
}
