// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Approval surfaces.
//!
//! One surface is kept per [`Flow`]. A request whose flow already has an
//! open surface joins it and the surface is focused instead of opening a
//! second prompt. The surface closes once its last request settles.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};
use crate::types::{Flow, RequestId, SurfaceId};

/// The environment that actually shows prompts to the user.
///
/// Calls are made while the surface table is locked, so implementations
/// must not call back into the broker synchronously.
pub trait SurfaceHost: Send + Sync {
    fn open(&self, surface: SurfaceId, flow: Flow) -> std::result::Result<(), String>;
    fn focus(&self, surface: SurfaceId);
    fn close(&self, surface: SurfaceId);
}

struct OpenSurface {
    id: SurfaceId,
    requests: BTreeSet<RequestId>,
}

#[derive(Default)]
struct SurfaceTable {
    next_id: u64,
    by_flow: HashMap<Flow, OpenSurface>,
}

pub struct SurfaceManager {
    host: Arc<dyn SurfaceHost>,
    table: Mutex<SurfaceTable>,
}

impl SurfaceManager {
    pub fn new(host: Arc<dyn SurfaceHost>) -> Self {
        Self {
            host,
            table: Mutex::new(SurfaceTable::default()),
        }
    }

    /// Shows `request` to the user, opening or focusing the flow's surface.
    pub fn present(&self, request: &RequestId, flow: Flow) -> Result<SurfaceId> {
        let mut table = self.table.lock();
        if let Some(open) = table.by_flow.get_mut(&flow) {
            open.requests.insert(request.clone());
            let id = open.id;
            self.host.focus(id);
            debug!(request_id = %request, surface = %id, "request attached to open surface");
            return Ok(id);
        }

        table.next_id += 1;
        let id = SurfaceId(table.next_id);
        if let Err(e) = self.host.open(id, flow) {
            warn!(request_id = %request, error = %e, "approval surface could not be opened");
            return Err(BrokerError::Internal(format!("approval surface unavailable: {e}")));
        }
        table.by_flow.insert(
            flow,
            OpenSurface {
                id,
                requests: BTreeSet::from([request.clone()]),
            },
        );
        debug!(request_id = %request, surface = %id, ?flow, "approval surface opened");
        Ok(id)
    }

    /// Detaches a settled request; closes the surface when it was the last.
    pub fn release(&self, request: &RequestId, surface: SurfaceId) {
        let mut table = self.table.lock();
        let flow = table
            .by_flow
            .iter()
            .find(|(_, open)| open.id == surface)
            .map(|(flow, _)| *flow);
        let Some(flow) = flow else {
            return;
        };
        let now_empty = table
            .by_flow
            .get_mut(&flow)
            .map(|open| {
                open.requests.remove(request);
                open.requests.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            table.by_flow.remove(&flow);
            self.host.close(surface);
            debug!(surface = %surface, "approval surface closed");
        }
    }

    /// Drops a surface the host already closed. Returns the requests that
    /// were attached to it.
    pub fn forget(&self, surface: SurfaceId) -> Vec<RequestId> {
        let mut table = self.table.lock();
        let flow = table
            .by_flow
            .iter()
            .find(|(_, open)| open.id == surface)
            .map(|(flow, _)| *flow);
        flow.and_then(|flow| table.by_flow.remove(&flow))
            .map(|open| open.requests.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn open_surfaces(&self) -> Vec<SurfaceId> {
        self.table.lock().by_flow.values().map(|open| open.id).collect()
    }
}
