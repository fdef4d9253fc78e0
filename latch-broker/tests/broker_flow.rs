// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::sync::mpsc;

use latch_broker::channels::ChannelRegistry;
use latch_broker::requests::RequestStore;
use latch_broker::signing::SignedTransaction;
use latch_broker::surface::SurfaceManager;
use latch_broker::types::Flow;
use latch_broker::{
    Approval, Broker, BrokerConfig, BrokerError, BrokerMessage, CallerMessage, ChannelId,
    ErrorCategory, NodeClient, NodeError, NodeRegistry, Notifier, Operation, Origin, Receipt,
    RequestKind, RequestPayload, RequestView, Response, Scope, SurfaceHost, SurfaceId,
    TransactionRecord, TxStatus,
};
use latch_core::keys::verify_payload_signature;
use latch_core::{Argon2Params, MemoryStore, NetworkFamily, PasswordSession, Vault};

const DAPP: &str = "https://dapp.example";

#[derive(Default)]
struct Host {
    opened: Mutex<Vec<(SurfaceId, Flow)>>,
    closed: Mutex<Vec<SurfaceId>>,
}

impl SurfaceHost for Host {
    fn open(&self, surface: SurfaceId, flow: Flow) -> Result<(), String> {
        self.opened.lock().push((surface, flow));
        Ok(())
    }

    fn focus(&self, _surface: SurfaceId) {}

    fn close(&self, surface: SurfaceId) {
        self.closed.lock().push(surface);
    }
}

/// Confirms every broadcast immediately unless `silent` is set.
#[derive(Default)]
struct Node {
    sequence: Mutex<u64>,
    silent: Mutex<bool>,
    confirmed: Mutex<HashSet<String>>,
    broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl Node {
    fn nonces(&self) -> Vec<u64> {
        self.broadcasts
            .lock()
            .iter()
            .map(|raw| {
                let tx: SignedTransaction = bincode::deserialize(raw).unwrap();
                tx.nonce.unwrap()
            })
            .collect()
    }
}

#[async_trait]
impl NodeClient for Node {
    async fn get_receipt(&self, hash: &str) -> Result<Option<Receipt>, NodeError> {
        if self.confirmed.lock().contains(hash) {
            Ok(Some(Receipt {
                hash: hash.to_string(),
                success: true,
            }))
        } else {
            Ok(None)
        }
    }

    async fn get_sequence_number(&self, _address: &str) -> Result<u64, NodeError> {
        Ok(*self.sequence.lock())
    }

    async fn broadcast(&self, signed: &[u8]) -> Result<String, NodeError> {
        let mut broadcasts = self.broadcasts.lock();
        broadcasts.push(signed.to_vec());
        let hash = format!("0x{:064x}", broadcasts.len());
        if !*self.silent.lock() {
            self.confirmed.lock().insert(hash.clone());
        }
        Ok(hash)
    }
}

struct ChannelNotifier(mpsc::UnboundedSender<TransactionRecord>);

impl Notifier for ChannelNotifier {
    fn notify(&self, record: &TransactionRecord) -> Result<(), String> {
        self.0.send(record.clone()).map_err(|e| e.to_string())
    }
}

struct Harness {
    broker: Arc<Broker>,
    vault: Arc<Vault>,
    host: Arc<Host>,
    node: Arc<Node>,
    statuses: mpsc::UnboundedReceiver<TransactionRecord>,
    address: String,
}

async fn harness() -> Harness {
    let vault = Arc::new(
        Vault::create(
            Arc::new(MemoryStore::new()),
            Arc::new(PasswordSession::new()),
            "correct horse",
            Argon2Params::TESTING,
        )
        .await
        .unwrap(),
    );
    let address = vault
        .generate_account(NetworkFamily::Evm, "main")
        .await
        .unwrap()
        .address;

    let host = Arc::new(Host::default());
    let node = Arc::new(Node::default());
    let nodes = Arc::new(NodeRegistry::new());
    nodes.register("eth", NetworkFamily::Evm, node.clone());

    let (tx, statuses) = mpsc::unbounded_channel();
    let config = BrokerConfig {
        poll_interval_secs: 1,
        watch_timeout_secs: 1,
        rate_limit: None,
        ..Default::default()
    };
    let broker = Broker::new(
        vault.clone(),
        host.clone(),
        nodes,
        Arc::new(ChannelNotifier(tx)),
        config,
    )
    .await
    .unwrap();

    Harness {
        broker,
        vault,
        host,
        node,
        statuses,
        address,
    }
}

fn request(id: &str, payload: RequestPayload) -> CallerMessage {
    CallerMessage {
        id: id.to_string(),
        operation: Operation::Request(payload),
    }
}

fn sign_and_send(from: &str, payload: &str) -> RequestPayload {
    RequestPayload::SignAndSend {
        network: "eth".into(),
        from: from.to_string(),
        payload: hex::encode(payload),
    }
}

async fn wait_for(broker: &Broker, kind: RequestKind) -> RequestView {
    let mut feed = broker.subscribe_pending();
    loop {
        let found = feed
            .borrow_and_update()
            .iter()
            .find(|view| view.kind == kind)
            .cloned();
        if let Some(view) = found {
            return view;
        }
        feed.changed().await.unwrap();
    }
}

async fn final_status(
    statuses: &mut mpsc::UnboundedReceiver<TransactionRecord>,
) -> TransactionRecord {
    loop {
        let record = tokio::time::timeout(Duration::from_secs(10), statuses.recv())
            .await
            .unwrap()
            .unwrap();
        if record.status.is_final() {
            return record;
        }
    }
}

fn share(h: &Harness, scopes: Scope) -> Approval {
    Approval::Accounts {
        accounts: vec![h.address.clone()],
        scopes,
    }
}

/// Authorizes `DAPP` for the harness account on a fresh channel.
async fn connect(h: &Harness) -> (ChannelId, mpsc::UnboundedReceiver<BrokerMessage>) {
    connect_with(h, Scope::DEFAULT).await
}

async fn connect_with(
    h: &Harness,
    scopes: Scope,
) -> (ChannelId, mpsc::UnboundedReceiver<BrokerMessage>) {
    let (channel, mut rx) = h.broker.attach(DAPP).unwrap();
    let task = h.broker.handle(
        channel,
        request("auth", RequestPayload::Authorize { name: "Dapp".into() }),
    );
    let view = wait_for(&h.broker, RequestKind::Authorize).await;
    h.broker.approve(&view.id, share(h, scopes)).await.unwrap();
    task.await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), BrokerMessage::Result { .. }));
    (channel, rx)
}

#[tokio::test]
async fn test_sign_and_send_is_watched_to_success() {
    let mut h = harness().await;
    let (channel, mut rx) = connect(&h).await;

    let task = h
        .broker
        .handle(channel, request("tx", sign_and_send(&h.address, "transfer")));
    let view = wait_for(&h.broker, RequestKind::SignAndSend).await;
    assert_eq!(view.origin, Origin::parse(DAPP).unwrap());
    assert!(h
        .host
        .opened
        .lock()
        .iter()
        .any(|(_, flow)| *flow == Flow::Signing));

    h.broker
        .approve(&view.id, Approval::Sign { password: None })
        .await
        .unwrap();
    task.await.unwrap();

    let hash = match rx.recv().await.unwrap() {
        BrokerMessage::Result { id, result } => {
            assert_eq!(id, "tx");
            assert_eq!(result["network"], "eth");
            result["hash"].as_str().unwrap().to_string()
        }
        other => panic!("unexpected {other:?}"),
    };

    let raw = h.node.broadcasts.lock()[0].clone();
    let signed: SignedTransaction = bincode::deserialize(&raw).unwrap();
    let account = h.vault.public_account(&h.address).await.unwrap();
    verify_payload_signature(
        NetworkFamily::Evm,
        &account.public_key,
        &SignedTransaction::signing_bytes(b"transfer", signed.nonce),
        &signed.signature,
    )
    .unwrap();

    let record = final_status(&mut h.statuses).await;
    assert_eq!(record.hash, hash);
    assert_eq!(record.status, TxStatus::Success);
    assert!(record.notified);

    let stored = h.broker.transactions().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, TxStatus::Success);
    assert!(h.broker.pending().is_empty());
}

#[tokio::test]
async fn test_disconnect_rejects_pending_and_empties_list() {
    let host = Arc::new(Host::default());
    let surfaces = Arc::new(SurfaceManager::new(host.clone()));
    let requests = Arc::new(RequestStore::new(surfaces, 16));
    let channels = ChannelRegistry::new(requests.clone());

    let channel = channels.register(Origin::parse(DAPP).unwrap());
    let pending = channels
        .submit(
            channel,
            RequestPayload::SignMessage {
                address: format!("0x{}", "11".repeat(20)),
                message: "hello".into(),
            },
        )
        .unwrap();
    assert_eq!(requests.pending_count(), 1);

    assert!(channels.disconnect(channel));
    assert!(requests.list(None).is_empty());
    assert!(requests.subscribe().borrow().is_empty());
    assert_eq!(pending.await, Err(BrokerError::ChannelDisconnected));
    assert_eq!(host.closed.lock().len(), 1);

    assert!(!channels.disconnect(channel));
    assert!(channels
        .submit(channel, RequestPayload::Authorize { name: "x".into() })
        .is_err());
}

#[tokio::test]
async fn test_duplicate_authorization_refused() {
    let h = harness().await;
    let (first, _first_rx) = h.broker.attach(DAPP).unwrap();
    let (second, mut second_rx) = h.broker.attach(DAPP).unwrap();

    let _pending = h.broker.handle(
        first,
        request("a", RequestPayload::Authorize { name: "Dapp".into() }),
    );
    wait_for(&h.broker, RequestKind::Authorize).await;

    h.broker
        .handle(
            second,
            request("b", RequestPayload::Authorize { name: "Dapp".into() }),
        )
        .await
        .unwrap();
    match second_rx.recv().await.unwrap() {
        BrokerMessage::Error {
            id,
            error,
            category,
        } => {
            assert_eq!(id, "b");
            assert_eq!(error, "A request from this site is already pending");
            assert_eq!(category, ErrorCategory::Retry);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.broker.pending().len(), 1);
    assert_eq!(h.host.opened.lock().len(), 1);
}

#[tokio::test]
async fn test_settling_twice_is_a_no_op() {
    let h = harness().await;
    let (channel, mut rx) = h.broker.attach(DAPP).unwrap();
    let task = h.broker.handle(
        channel,
        request("a", RequestPayload::Authorize { name: "Dapp".into() }),
    );
    let view = wait_for(&h.broker, RequestKind::Authorize).await;

    h.broker
        .approve(&view.id, share(&h, Scope::DEFAULT))
        .await
        .unwrap();
    assert!(matches!(
        h.broker.approve(&view.id, share(&h, Scope::DEFAULT)).await,
        Err(BrokerError::NotFound(_))
    ));
    assert!(!h.broker.reject(&view.id, "too late"));

    task.await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), BrokerMessage::Result { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_surface_close_cancels_its_requests() {
    let h = harness().await;
    let (channel, mut rx) = connect(&h).await;

    let first = h.broker.handle(
        channel,
        request(
            "s1",
            RequestPayload::SignMessage {
                address: h.address.clone(),
                message: "one".into(),
            },
        ),
    );
    let second = h.broker.handle(
        channel,
        request(
            "s2",
            RequestPayload::SignMessage {
                address: h.address.clone(),
                message: "two".into(),
            },
        ),
    );
    let mut feed = h.broker.subscribe_pending();
    while feed.borrow_and_update().len() < 2 {
        feed.changed().await.unwrap();
    }

    let surface = h
        .host
        .opened
        .lock()
        .iter()
        .find(|(_, flow)| *flow == Flow::Signing)
        .map(|(id, _)| *id)
        .unwrap();
    assert_eq!(h.broker.surface_closed(surface), 2);
    first.await.unwrap();
    second.await.unwrap();

    for _ in 0..2 {
        match rx.recv().await.unwrap() {
            BrokerMessage::Error { category, .. } => {
                assert_eq!(category, ErrorCategory::Cancelled)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
    assert!(h.broker.pending().is_empty());
}

#[tokio::test]
async fn test_nonces_increase_and_reset_after_lost_transaction() {
    let mut h = harness().await;
    let (channel, mut rx) = connect(&h).await;

    for (i, body) in ["one", "two"].iter().enumerate() {
        let id = format!("tx{i}");
        let task = h
            .broker
            .handle(channel, request(&id, sign_and_send(&h.address, body)));
        let view = wait_for(&h.broker, RequestKind::SignAndSend).await;
        h.broker
            .approve(&view.id, Approval::Sign { password: None })
            .await
            .unwrap();
        task.await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(final_status(&mut h.statuses).await.status, TxStatus::Success);
    }
    assert_eq!(h.node.nonces(), vec![0, 1]);

    // The node drops the next one on the floor and never moves its sequence.
    *h.node.sequence.lock() = 2;
    *h.node.silent.lock() = true;
    let task = h
        .broker
        .handle(channel, request("lost", sign_and_send(&h.address, "three")));
    let view = wait_for(&h.broker, RequestKind::SignAndSend).await;
    h.broker
        .approve(&view.id, Approval::Sign { password: None })
        .await
        .unwrap();
    task.await.unwrap();
    rx.recv().await.unwrap();
    assert_eq!(final_status(&mut h.statuses).await.status, TxStatus::Unknown);

    *h.node.silent.lock() = false;
    let task = h
        .broker
        .handle(channel, request("retry", sign_and_send(&h.address, "three")));
    let view = wait_for(&h.broker, RequestKind::SignAndSend).await;
    h.broker
        .approve(&view.id, Approval::Sign { password: None })
        .await
        .unwrap();
    task.await.unwrap();
    rx.recv().await.unwrap();
    assert_eq!(final_status(&mut h.statuses).await.status, TxStatus::Success);

    assert_eq!(h.node.nonces(), vec![0, 1, 2, 2]);
}

#[tokio::test]
async fn test_locked_session_keeps_request_pending() {
    let h = harness().await;
    let (channel, mut rx) = connect(&h).await;

    let task = h.broker.handle(
        channel,
        request(
            "s",
            RequestPayload::SignMessage {
                address: h.address.clone(),
                message: "hello".into(),
            },
        ),
    );
    let view = wait_for(&h.broker, RequestKind::SignMessage).await;

    h.broker.lock();
    assert_eq!(
        h.broker
            .approve(&view.id, Approval::Sign { password: None })
            .await,
        Err(BrokerError::Unauthorised)
    );
    assert_eq!(h.vault.decrypted_in_use(), 0);
    assert_eq!(h.broker.pending().len(), 1);
    assert!(rx.try_recv().is_err());

    h.broker
        .approve(
            &view.id,
            Approval::Sign {
                password: Some(SecretString::from("correct horse")),
            },
        )
        .await
        .unwrap();
    task.await.unwrap();
    assert!(matches!(rx.recv().await.unwrap(), BrokerMessage::Result { .. }));
    assert_eq!(h.vault.decrypted_in_use(), 0);
    assert!(h.broker.is_unlocked());
}

#[tokio::test]
async fn test_change_password_through_broker() {
    let h = harness().await;
    assert!(h
        .broker
        .change_password("correct horse", "battery staple")
        .await
        .unwrap());
    h.broker.lock();
    assert_eq!(
        h.broker.authenticate("correct horse").await,
        Err(BrokerError::Unauthorised)
    );
    h.broker.authenticate("battery staple").await.unwrap();

    let entries = h.broker.audit().recent(1);
    assert_eq!(entries[0].action, latch_broker::AuditAction::PasswordChange);
}

async fn answer(
    h: &Harness,
    rx: &mut mpsc::UnboundedReceiver<BrokerMessage>,
    channel: ChannelId,
    id: &str,
    payload: RequestPayload,
    approval: Approval,
) -> Response {
    let kind = payload.kind();
    let task = h.broker.handle(channel, request(id, payload));
    let view = wait_for(&h.broker, kind).await;
    h.broker.approve(&view.id, approval).await.unwrap();
    task.await.unwrap();
    match rx.recv().await.unwrap() {
        BrokerMessage::Result { result, .. } => serde_json::from_value(result).unwrap(),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_encrypt_then_decrypt_with_granted_scopes() {
    let h = harness().await;
    let (channel, mut rx) = connect_with(&h, Scope::ALL).await;

    let envelope = match answer(
        &h,
        &mut rx,
        channel,
        "enc",
        RequestPayload::Encrypt {
            address: h.address.clone(),
            recipient: None,
            message: "meet at noon".into(),
        },
        Approval::Confirm,
    )
    .await
    {
        Response::Ciphertext { envelope } => envelope,
        other => panic!("unexpected {other:?}"),
    };
    assert!(!envelope.contains("meet at noon"));

    h.broker.lock();
    let plaintext = answer(
        &h,
        &mut rx,
        channel,
        "dec",
        RequestPayload::Decrypt {
            address: h.address.clone(),
            envelope,
        },
        Approval::Sign {
            password: Some(SecretString::from("correct horse")),
        },
    )
    .await;
    assert_eq!(
        plaintext,
        Response::Plaintext {
            message: "meet at noon".into()
        }
    );
    assert_eq!(h.vault.decrypted_in_use(), 0);
    assert!(h.broker.pending().is_empty());
}

#[tokio::test]
async fn test_default_grant_refuses_decrypt() {
    let h = harness().await;
    let (channel, mut rx) = connect(&h).await;

    h.broker
        .handle(
            channel,
            request(
                "dec",
                RequestPayload::Decrypt {
                    address: h.address.clone(),
                    envelope: "{}".into(),
                },
            ),
        )
        .await
        .unwrap();
    match rx.recv().await.unwrap() {
        BrokerMessage::Error { id, error, .. } => {
            assert_eq!(id, "dec");
            assert_eq!(error, "Site not authorized");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.broker.pending().is_empty());
}

#[tokio::test]
async fn test_change_password_needs_confirmed_backup() {
    let h = harness().await;
    h.vault.generate_mnemonic("fresh", 12).await.unwrap();
    let err = h
        .broker
        .change_password("correct horse", "battery staple")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::BackupNotConfirmed(_)));
    assert_eq!(
        BrokerMessage::error("pw", &err),
        BrokerMessage::Error {
            id: "pw".into(),
            error: "Confirm your recovery phrase backup first".into(),
            category: ErrorCategory::Failed,
        }
    );
}
