// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The pending request table.
//!
//! A request lives here from creation until it is resolved or rejected,
//! exactly once. Its completion sender never leaves this module. The live
//! feed is republished inside the same critical section that mutates the
//! table and before the caller's future is completed.
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result};
use crate::surface::SurfaceManager;
use crate::types::{
    ChannelId, Origin, RequestId, RequestKind, RequestPayload, RequestView, Response, SurfaceId,
};

type Completion = oneshot::Sender<Result<Response>>;

struct PendingRequest {
    view: RequestView,
    channel: ChannelId,
    surface: Option<SurfaceId>,
    completion: Completion,
}

/// Resolves once the request settles.
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|settled| {
            settled.unwrap_or_else(|_| Err(BrokerError::Internal("request dropped".into())))
        })
    }
}

pub struct RequestStore {
    table: Mutex<Vec<PendingRequest>>,
    next_sequence: AtomicU64,
    feed: watch::Sender<Vec<RequestView>>,
    surfaces: Arc<SurfaceManager>,
    max_pending: usize,
}

impl RequestStore {
    pub fn new(surfaces: Arc<SurfaceManager>, max_pending: usize) -> Self {
        let (feed, _) = watch::channel(Vec::new());
        Self {
            table: Mutex::new(Vec::new()),
            next_sequence: AtomicU64::new(0),
            feed,
            surfaces,
            max_pending,
        }
    }

    /// Creates a request, presents it and waits for the decision.
    pub async fn create(
        &self,
        channel: ChannelId,
        origin: Origin,
        payload: RequestPayload,
    ) -> Result<Response> {
        let pending = self.submit(channel, origin, payload)?;
        pending.await
    }

    /// Creates and presents a request without waiting for it.
    pub fn submit(
        &self,
        channel: ChannelId,
        origin: Origin,
        payload: RequestPayload,
    ) -> Result<PendingResponse> {
        let pending = self.insert(channel, origin, payload)?;
        self.present(&pending.id);
        Ok(pending)
    }

    /// Table half of [`submit`](Self::submit). The request must be presented
    /// afterwards with [`present`](Self::present).
    pub(crate) fn insert(
        &self,
        channel: ChannelId,
        origin: Origin,
        payload: RequestPayload,
    ) -> Result<PendingResponse> {
        let kind = payload.kind();
        let mut table = self.table.lock();

        if table.len() >= self.max_pending {
            warn!(origin = %origin, pending = table.len(), "pending request limit reached");
            return Err(BrokerError::CapacityExceeded);
        }
        if kind.unique_per_origin()
            && table
                .iter()
                .any(|p| p.view.kind == kind && p.view.origin == origin)
        {
            debug!(origin = %origin, %kind, "duplicate pending request refused");
            return Err(BrokerError::DuplicatePendingRequest(origin.to_string()));
        }

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let id = RequestId::new(kind, sequence);
        let (completion, rx) = oneshot::channel();
        table.push(PendingRequest {
            view: RequestView {
                id: id.clone(),
                kind,
                origin: origin.clone(),
                payload,
                created_at: Utc::now(),
            },
            channel,
            surface: None,
            completion,
        });
        self.publish(&table);
        info!(request_id = %id, origin = %origin, channel = %channel, "request created");

        Ok(PendingResponse { id, rx })
    }

    pub(crate) fn present(&self, id: &RequestId) {
        let Some(kind) = self.get(id).map(|view| view.kind) else {
            return;
        };
        match self.surfaces.present(id, kind.flow()) {
            Ok(surface) => {
                let attached = {
                    let mut table = self.table.lock();
                    match table.iter_mut().find(|p| &p.view.id == id) {
                        Some(pending) => {
                            pending.surface = Some(surface);
                            true
                        }
                        None => false,
                    }
                };
                if !attached {
                    self.surfaces.release(id, surface);
                }
            }
            Err(e) => {
                self.reject(id, e);
            }
        }
    }

    /// Returns false if `id` already settled.
    pub fn resolve(&self, id: &RequestId, response: Response) -> bool {
        self.settle(id, Ok(response))
    }

    /// Returns false if `id` already settled.
    pub fn reject(&self, id: &RequestId, error: BrokerError) -> bool {
        self.settle(id, Err(error))
    }

    fn settle(&self, id: &RequestId, outcome: Result<Response>) -> bool {
        let pending = {
            let mut table = self.table.lock();
            let Some(pos) = table.iter().position(|p| &p.view.id == id) else {
                debug!(request_id = %id, "settle on unknown request ignored");
                return false;
            };
            let pending = table.remove(pos);
            self.publish(&table);
            pending
        };
        match &outcome {
            Ok(_) => info!(request_id = %id, "request resolved"),
            Err(e) => info!(request_id = %id, reason = %e, "request rejected"),
        }
        self.finish(pending, outcome);
        true
    }

    fn finish(&self, pending: PendingRequest, outcome: Result<Response>) {
        let _ = pending.completion.send(outcome);
        if let Some(surface) = pending.surface {
            self.surfaces.release(&pending.view.id, surface);
        }
    }

    /// Rejects every request that `channel` originated.
    pub fn reject_channel(&self, channel: ChannelId, error: BrokerError) -> usize {
        self.reject_where(|p| p.channel == channel, error)
    }

    /// Rejects every request from `origin`, whichever channel it came in on.
    pub fn reject_origin(&self, origin: &Origin, error: BrokerError) -> usize {
        self.reject_where(|p| &p.view.origin == origin, error)
    }

    /// The host closed `surface` without a decision.
    pub fn surface_closed(&self, surface: SurfaceId) -> usize {
        let attached = self.surfaces.forget(surface);
        let rejected = self.reject_where(
            |p| p.surface == Some(surface) || attached.contains(&p.view.id),
            BrokerError::Cancelled,
        );
        if rejected > 0 {
            info!(surface = %surface, rejected, "surface closed without a decision");
        }
        rejected
    }

    fn reject_where<F>(&self, matches: F, error: BrokerError) -> usize
    where
        F: Fn(&PendingRequest) -> bool,
    {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table.lock();
            let (drained, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *table).into_iter().partition(|p| matches(p));
            *table = kept;
            if !drained.is_empty() {
                self.publish(&table);
            }
            drained
        };
        let count = drained.len();
        for pending in drained {
            debug!(request_id = %pending.view.id, reason = %error, "request rejected");
            self.finish(pending, Err(error.clone()));
        }
        count
    }

    pub fn get(&self, id: &RequestId) -> Option<RequestView> {
        self.table
            .lock()
            .iter()
            .find(|p| &p.view.id == id)
            .map(|p| p.view.clone())
    }

    pub fn list(&self, kind: Option<RequestKind>) -> Vec<RequestView> {
        self.table
            .lock()
            .iter()
            .filter(|p| kind.map_or(true, |k| p.view.kind == k))
            .map(|p| p.view.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Live feed of pending requests; the current snapshot is readable
    /// immediately. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<Vec<RequestView>> {
        self.feed.subscribe()
    }

    fn publish(&self, table: &[PendingRequest]) {
        self.feed
            .send_replace(table.iter().map(|p| p.view.clone()).collect());
    }
}
