// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Latch Broker - mediates between untrusted callers and the secret store
//!
//! Callers attach a channel, submit requests and wait. Every request is
//! parked until the user approves or rejects it on an approval surface;
//! signed transactions are then broadcast and watched to completion.

#![forbid(unsafe_code)]

pub mod audit;
pub mod channels;
pub mod config;
pub mod error;
pub mod handler;
pub mod node;
pub mod permissions;
pub mod rate_limit;
pub mod requests;
pub mod signing;
pub mod surface;
pub mod types;
pub mod watcher;

pub use audit::{AuditAction, AuditEntry, AuditLog};
pub use config::BrokerConfig;
pub use error::{BrokerError, ErrorCategory, Result};
pub use handler::Broker;
pub use node::{Network, NodeClient, NodeError, NodeRegistry, Receipt};
pub use permissions::{Grant, Scope};
pub use rate_limit::{RateLimitConfig, RateLimitStatus};
pub use surface::SurfaceHost;
pub use types::{
    Approval, BrokerMessage, CallerMessage, ChannelId, ExposedAccount, Flow, Operation, Origin,
    RequestId, RequestKind, RequestPayload, RequestView, Response, SurfaceId,
};
pub use watcher::{Notifier, TracingNotifier, TransactionRecord, TxStatus};
