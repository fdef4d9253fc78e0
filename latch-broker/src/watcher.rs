// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Follows broadcast transactions to a final status.
//!
//! `Submitted` moves to exactly one of `Success`, `Error` or `Unknown`.
//! Lookups that fail are retried at a fixed interval until a hard deadline.
//! `Unknown` is not a failure: the transaction may still land later, but the
//! sender's nonce counter is reset so later transactions are not blocked.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use latch_core::records;
use latch_core::KeyValueStore;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::node::NodeClient;
use crate::signing::NonceTracker;

pub const TX_PREFIX: &str = "tx/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Submitted,
    Success,
    Error,
    Unknown,
}

impl TxStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Submitted)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Success => "success",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub network: String,
    pub hash: String,
    pub from: String,
    /// Hex of the unsigned payload.
    pub payload: String,
    pub status: TxStatus,
    pub notified: bool,
    pub submitted_at: i64,
    pub updated_at: i64,
}

impl TransactionRecord {
    pub fn submitted(network: &str, hash: &str, from: &str, payload: &[u8]) -> Self {
        let now = Utc::now().timestamp();
        Self {
            network: network.to_string(),
            hash: hash.to_string(),
            from: from.to_string(),
            payload: hex::encode(payload),
            status: TxStatus::Submitted,
            notified: false,
            submitted_at: now,
            updated_at: now,
        }
    }

    pub fn storage_key(&self) -> String {
        tx_key(&self.network, &self.hash)
    }
}

fn tx_key(network: &str, hash: &str) -> String {
    format!("{TX_PREFIX}{network}/{hash}")
}

/// Durable transaction history. Retention is the log's business.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn put(&self, record: &TransactionRecord) -> Result<()>;
    async fn get(&self, network: &str, hash: &str) -> Result<Option<TransactionRecord>>;
    async fn list(&self) -> Result<Vec<TransactionRecord>>;
}

pub struct StoreTransactionLog {
    store: Arc<dyn KeyValueStore>,
}

impl StoreTransactionLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TransactionLog for StoreTransactionLog {
    async fn put(&self, record: &TransactionRecord) -> Result<()> {
        self.store
            .set(&record.storage_key(), &records::encode(record)?)
            .await?;
        Ok(())
    }

    async fn get(&self, network: &str, hash: &str) -> Result<Option<TransactionRecord>> {
        match self.store.get(&tx_key(network, hash)).await? {
            Some(bytes) => Ok(Some(records::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<TransactionRecord>> {
        let mut txs = self
            .store
            .list(TX_PREFIX)
            .await?
            .iter()
            .map(|(_, bytes)| records::decode::<TransactionRecord>(bytes))
            .collect::<latch_core::Result<Vec<_>>>()?;
        txs.sort_by_key(|tx| tx.submitted_at);
        Ok(txs)
    }
}

/// User-facing notification of a status change.
pub trait Notifier: Send + Sync {
    fn notify(&self, record: &TransactionRecord) -> std::result::Result<(), String>;
}

pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, record: &TransactionRecord) -> std::result::Result<(), String> {
        info!(
            network = %record.network,
            hash = %record.hash,
            status = %record.status,
            "transaction status"
        );
        Ok(())
    }
}

pub struct TransactionWatcher {
    log: Arc<dyn TransactionLog>,
    notifier: Arc<dyn Notifier>,
    nonces: Arc<NonceTracker>,
    poll_interval: Duration,
    timeout: Duration,
}

impl TransactionWatcher {
    pub fn new(
        log: Arc<dyn TransactionLog>,
        notifier: Arc<dyn Notifier>,
        nonces: Arc<NonceTracker>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            log,
            notifier,
            nonces,
            poll_interval,
            timeout,
        }
    }

    /// Follows `record` in the background, detached from the request that
    /// produced it.
    pub fn watch(
        self: &Arc<Self>,
        record: TransactionRecord,
        client: Arc<dyn NodeClient>,
    ) -> JoinHandle<TransactionRecord> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.run(record, client).await })
    }

    #[instrument(skip_all, fields(network = %record.network, hash = %record.hash))]
    pub async fn run(
        &self,
        mut record: TransactionRecord,
        client: Arc<dyn NodeClient>,
    ) -> TransactionRecord {
        record.status = TxStatus::Submitted;
        self.persist_and_notify(&mut record).await;

        let deadline = Instant::now() + self.timeout;
        let mut attempts: u64 = 0;
        let status = loop {
            attempts += 1;
            match client.get_receipt(&record.hash).await {
                Ok(Some(receipt)) if receipt.hash == record.hash => {
                    break if receipt.success {
                        TxStatus::Success
                    } else {
                        TxStatus::Error
                    };
                }
                Ok(Some(receipt)) => {
                    warn!(got = %receipt.hash, "receipt for a different transaction ignored");
                }
                Ok(None) => debug!(attempts, "transaction not yet included"),
                Err(e) => debug!(attempts, error = %e, "receipt lookup failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                break TxStatus::Unknown;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            if Instant::now() >= deadline {
                break TxStatus::Unknown;
            }
        };

        if status == TxStatus::Unknown {
            warn!(attempts, "no receipt before deadline");
            self.nonces.reset(&record.from, &record.network).await;
        } else {
            info!(attempts, %status, "transaction final");
        }

        record.status = status;
        self.persist_and_notify(&mut record).await;
        record
    }

    async fn persist_and_notify(&self, record: &mut TransactionRecord) {
        record.updated_at = Utc::now().timestamp();
        record.notified = false;
        if let Err(e) = self.log.put(record).await {
            warn!(error = %e, "failed to record transaction status");
        }
        match self.notifier.notify(record) {
            Ok(()) => {
                record.notified = true;
                if let Err(e) = self.log.put(record).await {
                    warn!(error = %e, "failed to record notification state");
                }
            }
            Err(e) => warn!(error = %e, "notification failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::MockNode;
    use crate::node::{NodeError, Receipt};
    use latch_core::MemoryStore;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<TxStatus>>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, record: &TransactionRecord) -> std::result::Result<(), String> {
            self.seen.lock().push(record.status);
            if self.fail {
                Err("notification daemon gone".into())
            } else {
                Ok(())
            }
        }
    }

    fn watcher(
        notifier: Arc<RecordingNotifier>,
        nonces: Arc<NonceTracker>,
    ) -> (Arc<StoreTransactionLog>, Arc<TransactionWatcher>) {
        let log = Arc::new(StoreTransactionLog::new(Arc::new(MemoryStore::new())));
        let watcher = Arc::new(TransactionWatcher::new(
            log.clone(),
            notifier,
            nonces,
            Duration::from_secs(5),
            Duration::from_secs(60),
        ));
        (log, watcher)
    }

    fn receipt(hash: &str, success: bool) -> std::result::Result<Option<Receipt>, NodeError> {
        Ok(Some(Receipt {
            hash: hash.into(),
            success,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (log, watcher) = watcher(notifier.clone(), Arc::new(NonceTracker::new()));
        let node = Arc::new(MockNode::default());
        node.script(
            "0xaa",
            vec![
                Err(NodeError::Unavailable("reset".into())),
                Ok(None),
                Err(NodeError::Unavailable("timeout".into())),
                receipt("0xaa", true),
            ],
        );

        let record = TransactionRecord::submitted("eth", "0xaa", "0xfrom", b"tx");
        let done = watcher.watch(record, node).await.unwrap();
        assert_eq!(done.status, TxStatus::Success);
        assert!(done.notified);
        assert_eq!(
            *notifier.seen.lock(),
            vec![TxStatus::Submitted, TxStatus::Success]
        );
        let stored = log.get("eth", "0xaa").await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_receipt_is_error() {
        let (_, watcher) = watcher(Arc::default(), Arc::new(NonceTracker::new()));
        let node = Arc::new(MockNode::default());
        node.script("0xbb", vec![receipt("0xbb", false)]);
        let record = TransactionRecord::submitted("eth", "0xbb", "0xfrom", b"tx");
        assert_eq!(watcher.run(record, node).await.status, TxStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unknown_and_resets_nonce() {
        let nonces = Arc::new(NonceTracker::new());
        let (_, watcher) = watcher(Arc::default(), nonces.clone());
        let node = Arc::new(MockNode::default());
        nonces.lease("0xfrom", "eth", node.as_ref()).await.unwrap().commit();
        assert_eq!(nonces.local_next("0xfrom", "eth").await, Some(1));

        let started = Instant::now();
        let record = TransactionRecord::submitted("eth", "0xcc", "0xfrom", b"tx");
        let done = watcher.run(record, node).await;
        assert_eq!(done.status, TxStatus::Unknown);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(started.elapsed() < Duration::from_secs(70));
        assert_eq!(nonces.local_next("0xfrom", "eth").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_receipt_ignored() {
        let (_, watcher) = watcher(Arc::default(), Arc::new(NonceTracker::new()));
        let node = Arc::new(MockNode::default());
        node.script("0xdd", vec![receipt("0xother", true), receipt("0xdd", true)]);
        let record = TransactionRecord::submitted("eth", "0xdd", "0xfrom", b"tx");
        assert_eq!(watcher.run(record, node).await.status, TxStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_failure_does_not_block_transition() {
        let notifier = Arc::new(RecordingNotifier {
            seen: Mutex::new(Vec::new()),
            fail: true,
        });
        let (log, watcher) = watcher(notifier, Arc::new(NonceTracker::new()));
        let node = Arc::new(MockNode::default());
        node.script("0xee", vec![receipt("0xee", true)]);
        let record = TransactionRecord::submitted("eth", "0xee", "0xfrom", b"tx");
        let done = watcher.run(record, node).await;
        assert_eq!(done.status, TxStatus::Success);
        assert!(!done.notified);
        assert_eq!(
            log.get("eth", "0xee").await.unwrap().unwrap().status,
            TxStatus::Success
        );
    }

    #[tokio::test]
    async fn test_store_log_lists_in_submission_order() {
        let log = StoreTransactionLog::new(Arc::new(MemoryStore::new()));
        let mut a = TransactionRecord::submitted("eth", "0x02", "0xf", b"a");
        a.submitted_at = 10;
        let mut b = TransactionRecord::submitted("dot", "0x01", "5F", b"b");
        b.submitted_at = 20;
        log.put(&b).await.unwrap();
        log.put(&a).await.unwrap();
        let all = log.list().await.unwrap();
        assert_eq!(all, vec![a, b]);
    }
}
