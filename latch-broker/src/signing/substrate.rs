// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use async_trait::async_trait;
use latch_core::{NetworkFamily, Vault};
use tracing::{info, instrument};

use super::{require_family, require_network, SignedTransaction, SigningExecutor, Submitted};
use crate::error::Result;
use crate::node::Network;

/// Substrate payloads carry their own nonce and era, so no local sequence
/// tracking is done here.
pub struct SubstrateExecutor {
    vault: Arc<Vault>,
}

impl SubstrateExecutor {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    async fn submit(
        &self,
        network: &Network,
        from: String,
        payload: &[u8],
        signature: Vec<u8>,
    ) -> Result<Submitted> {
        let signed = SignedTransaction {
            nonce: None,
            payload: payload.to_vec(),
            signature,
        }
        .encode()?;
        let hash = network.client.broadcast(&signed).await?;
        info!(network = %network.id, hash = %hash, "extrinsic broadcast");
        Ok(Submitted {
            network: network.id.clone(),
            hash,
            from,
            nonce: None,
        })
    }
}

#[async_trait]
impl SigningExecutor for SubstrateExecutor {
    fn family(&self) -> NetworkFamily {
        NetworkFamily::Substrate
    }

    async fn sign_message(&self, address: &str, message: &[u8]) -> Result<Vec<u8>> {
        require_family(&self.vault, address, NetworkFamily::Substrate).await?;
        Ok(self
            .vault
            .with_decrypted(address, |key| key.sign_message(message))
            .await?)
    }

    #[instrument(skip(self, network, payload), fields(network = %network.id))]
    async fn sign_and_broadcast(
        &self,
        network: &Network,
        from: &str,
        payload: &[u8],
    ) -> Result<Submitted> {
        require_network(network, NetworkFamily::Substrate)?;
        require_family(&self.vault, from, NetworkFamily::Substrate).await?;
        let signature = self
            .vault
            .with_decrypted(from, |key| key.sign_payload(payload))
            .await?;
        self.submit(network, from.to_string(), payload, signature).await
    }

    /// Checks a hardware or QR signature against the account's public key
    /// before anything reaches the node.
    #[instrument(skip(self, network, payload, signature), fields(network = %network.id))]
    async fn broadcast_external(
        &self,
        network: &Network,
        from: &str,
        payload: &[u8],
        signature: &[u8],
    ) -> Result<Submitted> {
        require_network(network, NetworkFamily::Substrate)?;
        let account = self.vault.public_account(from).await?;
        if account.family != NetworkFamily::Substrate {
            return Err(crate::error::BrokerError::InvalidRequest(format!(
                "{} is not a substrate account",
                account.address
            )));
        }
        account.verify(payload, signature)?;
        self.submit(network, account.address, payload, signature.to_vec())
            .await
    }
}
