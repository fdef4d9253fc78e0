// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Connected caller contexts.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::error::{BrokerError, Result};
use crate::requests::{PendingResponse, RequestStore};
use crate::types::{ChannelId, Origin, RequestId, RequestPayload};

struct ChannelState {
    origin: Origin,
    live: bool,
    requests: Vec<RequestId>,
    subscriptions: Vec<AbortHandle>,
}

pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, ChannelState>>,
    next_id: AtomicU64,
    requests: Arc<RequestStore>,
}

impl ChannelRegistry {
    pub fn new(requests: Arc<RequestStore>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            requests,
        }
    }

    pub fn register(&self, origin: Origin) -> ChannelId {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.channels.lock().insert(
            id,
            ChannelState {
                origin: origin.clone(),
                live: true,
                requests: Vec::new(),
                subscriptions: Vec::new(),
            },
        );
        info!(channel = %id, origin = %origin, "channel connected");
        id
    }

    pub fn origin(&self, channel: ChannelId) -> Option<Origin> {
        self.channels
            .lock()
            .get(&channel)
            .filter(|state| state.live)
            .map(|state| state.origin.clone())
    }

    pub fn is_live(&self, channel: ChannelId) -> bool {
        self.channels
            .lock()
            .get(&channel)
            .is_some_and(|state| state.live)
    }

    pub fn live_channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, state)| state.live)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Creates a request on behalf of `channel`.
    ///
    /// The insert happens under the registry lock, so a request can never be
    /// created for a channel whose disconnect has already started.
    pub fn submit(&self, channel: ChannelId, payload: RequestPayload) -> Result<PendingResponse> {
        let pending = {
            let mut channels = self.channels.lock();
            let state = channels
                .get_mut(&channel)
                .filter(|state| state.live)
                .ok_or(BrokerError::ChannelDisconnected)?;
            let pending = self
                .requests
                .insert(channel, state.origin.clone(), payload)?;
            state
                .requests
                .retain(|id| self.requests.get(id).is_some());
            state.requests.push(pending.id().clone());
            pending
        };
        self.requests.present(pending.id());
        Ok(pending)
    }

    /// Pending requests originated by `channel`, in creation order.
    pub fn requests_of(&self, channel: ChannelId) -> Vec<RequestId> {
        self.channels
            .lock()
            .get(&channel)
            .map(|state| {
                state
                    .requests
                    .iter()
                    .filter(|id| self.requests.get(id).is_some())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ties a subscription task to the channel's lifetime.
    pub fn bind_subscription(&self, channel: ChannelId, handle: AbortHandle) -> Result<()> {
        let mut channels = self.channels.lock();
        match channels.get_mut(&channel).filter(|state| state.live) {
            Some(state) => {
                state.subscriptions.push(handle);
                Ok(())
            }
            None => {
                handle.abort();
                Err(BrokerError::ChannelDisconnected)
            }
        }
    }

    /// Tears the channel down: rejects its pending requests, stops its
    /// subscriptions, then forgets it. Safe to call repeatedly.
    pub fn disconnect(&self, channel: ChannelId) -> bool {
        let subscriptions = {
            let mut channels = self.channels.lock();
            match channels.get_mut(&channel) {
                Some(state) if state.live => {
                    state.live = false;
                    std::mem::take(&mut state.subscriptions)
                }
                _ => {
                    debug!(channel = %channel, "disconnect for unknown channel ignored");
                    return false;
                }
            }
        };

        let rejected = self
            .requests
            .reject_channel(channel, BrokerError::ChannelDisconnected);
        for handle in &subscriptions {
            handle.abort();
        }
        self.channels.lock().remove(&channel);

        info!(
            channel = %channel,
            rejected,
            subscriptions = subscriptions.len(),
            "channel disconnected"
        );
        true
    }
}
