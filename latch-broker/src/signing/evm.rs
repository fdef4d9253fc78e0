// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use async_trait::async_trait;
use latch_core::keys::normalize_address;
use latch_core::{NetworkFamily, Vault};
use tracing::{info, instrument, warn};

use super::{
    require_family, require_network, NonceTracker, SignedTransaction, SigningExecutor, Submitted,
};
use crate::error::Result;
use crate::node::Network;

pub struct EvmExecutor {
    vault: Arc<Vault>,
    nonces: Arc<NonceTracker>,
}

impl EvmExecutor {
    pub fn new(vault: Arc<Vault>, nonces: Arc<NonceTracker>) -> Self {
        Self { vault, nonces }
    }
}

#[async_trait]
impl SigningExecutor for EvmExecutor {
    fn family(&self) -> NetworkFamily {
        NetworkFamily::Evm
    }

    async fn sign_message(&self, address: &str, message: &[u8]) -> Result<Vec<u8>> {
        require_family(&self.vault, address, NetworkFamily::Evm).await?;
        Ok(self
            .vault
            .with_decrypted(address, |key| key.sign_message(message))
            .await?)
    }

    /// The nonce lease is held across sign and broadcast and only committed
    /// once the node accepted the transaction.
    #[instrument(skip(self, network, payload), fields(network = %network.id))]
    async fn sign_and_broadcast(
        &self,
        network: &Network,
        from: &str,
        payload: &[u8],
    ) -> Result<Submitted> {
        require_network(network, NetworkFamily::Evm)?;
        require_family(&self.vault, from, NetworkFamily::Evm).await?;
        let from = normalize_address(from);

        let lease = self
            .nonces
            .lease(&from, &network.id, network.client.as_ref())
            .await?;
        let nonce = lease.nonce();
        let signing_bytes = SignedTransaction::signing_bytes(payload, Some(nonce));
        let signature = self
            .vault
            .with_decrypted(&from, |key| key.sign_payload(&signing_bytes))
            .await?;

        let signed = SignedTransaction {
            nonce: Some(nonce),
            payload: payload.to_vec(),
            signature,
        }
        .encode()?;
        let hash = match network.client.broadcast(&signed).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(nonce, error = %e, "broadcast failed, nonce not consumed");
                return Err(e.into());
            }
        };
        lease.commit();
        info!(nonce, hash = %hash, "transaction broadcast");

        Ok(Submitted {
            network: network.id.clone(),
            hash,
            from,
            nonce: Some(nonce),
        })
    }
}
