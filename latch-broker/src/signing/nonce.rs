// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sequence numbers per (address, network).
//!
//! A lease holds the pair's slot for the whole allocate, sign, broadcast
//! sequence. The local counter only advances when the lease is committed
//! after a successful broadcast.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::Result;
use crate::node::NodeClient;

type Slot = Arc<AsyncMutex<Option<u64>>>;

#[derive(Default)]
pub struct NonceTracker {
    slots: Mutex<HashMap<(String, String), Slot>>,
}

pub struct NonceLease {
    guard: OwnedMutexGuard<Option<u64>>,
    nonce: u64,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Marks the nonce as used on chain.
    pub fn commit(mut self) {
        *self.guard = Some(self.nonce + 1);
    }
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, address: &str, network: &str) -> Slot {
        self.slots
            .lock()
            .entry((address.to_string(), network.to_string()))
            .or_default()
            .clone()
    }

    /// Waits for the pair's slot and allocates `max(local next, node sequence)`.
    pub async fn lease(
        &self,
        address: &str,
        network: &str,
        node: &dyn NodeClient,
    ) -> Result<NonceLease> {
        let guard = self.slot(address, network).lock_owned().await;
        let on_chain = node.get_sequence_number(address).await?;
        let nonce = match *guard {
            Some(local) => local.max(on_chain),
            None => on_chain,
        };
        debug!(address, network, nonce, on_chain, "nonce leased");
        Ok(NonceLease { guard, nonce })
    }

    /// Forgets the local counter so the next lease asks the node.
    pub async fn reset(&self, address: &str, network: &str) {
        let mut guard = self.slot(address, network).lock_owned().await;
        if guard.take().is_some() {
            info!(address, network, "nonce counter reset");
        }
    }

    /// The next nonce the tracker would hand out without asking the node.
    pub async fn local_next(&self, address: &str, network: &str) -> Option<u64> {
        let slot = self.slot(address, network);
        let next = *slot.lock().await;
        next
    }
}
