// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The broker: caller channels on one side, the approval surface on the
//! other.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use latch_core::keys::{normalize_address, seal_for};
use latch_core::{NetworkFamily, Vault};
use parking_lot::Mutex;
use secrecy::ExposeSecret;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::audit::{AuditAction, AuditEntry, AuditLog};
use crate::channels::ChannelRegistry;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::node::NodeRegistry;
use crate::permissions::{AuthorizationList, Grant};
use crate::rate_limit::OriginRateLimiter;
use crate::requests::RequestStore;
use crate::signing::{EvmExecutor, NonceTracker, SigningExecutor, Submitted, SubstrateExecutor};
use crate::surface::{SurfaceHost, SurfaceManager};
use crate::types::{
    decode_hex, message_bytes, Approval, BrokerMessage, CallerMessage, ChannelId, ExposedAccount,
    Operation, Origin, RequestId, RequestKind, RequestPayload, RequestView, Response, SurfaceId,
};
use crate::watcher::{
    Notifier, StoreTransactionLog, TransactionLog, TransactionRecord, TransactionWatcher,
};

pub const METADATA_PREFIX: &str = "meta/";
pub const NETWORK_PREFIX: &str = "network/";
pub const ASSET_PREFIX: &str = "asset/";

type Outbox = mpsc::UnboundedSender<BrokerMessage>;

pub struct Broker {
    config: BrokerConfig,
    vault: Arc<Vault>,
    requests: Arc<RequestStore>,
    channels: ChannelRegistry,
    authorizations: AuthorizationList,
    limiter: Option<OriginRateLimiter>,
    audit: AuditLog,
    nodes: Arc<NodeRegistry>,
    evm: EvmExecutor,
    substrate: SubstrateExecutor,
    watcher: Arc<TransactionWatcher>,
    tx_log: Arc<dyn TransactionLog>,
    outboxes: Mutex<HashMap<ChannelId, Outbox>>,
    executing: Mutex<HashSet<RequestId>>,
}

/// Removes a request from the in-flight set when approval finishes.
struct Executing<'a> {
    set: &'a Mutex<HashSet<RequestId>>,
    id: RequestId,
}

impl Drop for Executing<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

impl Broker {
    pub async fn new(
        vault: Arc<Vault>,
        host: Arc<dyn SurfaceHost>,
        nodes: Arc<NodeRegistry>,
        notifier: Arc<dyn Notifier>,
        config: BrokerConfig,
    ) -> Result<Arc<Self>> {
        let store = vault.store();
        let surfaces = Arc::new(SurfaceManager::new(host));
        let requests = Arc::new(RequestStore::new(surfaces, config.max_pending));
        let channels = ChannelRegistry::new(requests.clone());
        let authorizations = AuthorizationList::load(store.clone()).await?;

        let audit = AuditLog::new(config.audit_capacity);
        if let Some(ref path) = config.audit_file {
            audit
                .open_file(path)
                .map_err(|e| BrokerError::Internal(format!("open audit file: {e}")))?;
        }

        let nonces = Arc::new(NonceTracker::new());
        let tx_log: Arc<dyn TransactionLog> = Arc::new(StoreTransactionLog::new(store));
        let watcher = Arc::new(TransactionWatcher::new(
            tx_log.clone(),
            notifier,
            nonces.clone(),
            config.poll_interval(),
            config.watch_timeout(),
        ));

        Ok(Arc::new(Self {
            limiter: config.rate_limit.clone().map(OriginRateLimiter::new),
            evm: EvmExecutor::new(vault.clone(), nonces),
            substrate: SubstrateExecutor::new(vault.clone()),
            config,
            vault,
            requests,
            channels,
            authorizations,
            audit,
            nodes,
            watcher,
            tx_log,
            outboxes: Mutex::new(HashMap::new()),
            executing: Mutex::new(HashSet::new()),
        }))
    }

    // Caller side

    /// Connects a caller context. Messages for it arrive on the receiver.
    pub fn attach(
        &self,
        origin: &str,
    ) -> Result<(ChannelId, mpsc::UnboundedReceiver<BrokerMessage>)> {
        let origin = Origin::parse(origin)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = self.channels.register(origin.clone());
        self.outboxes.lock().insert(channel, tx);
        self.audit
            .log(AuditEntry::new(AuditAction::Connect).with_origin(&origin));
        Ok((channel, rx))
    }

    /// Answers `message` in the background. Exactly one `Result` or `Error`
    /// is sent for its id.
    pub fn handle(self: &Arc<Self>, channel: ChannelId, message: CallerMessage) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let id = message.id.clone();
            let reply = match broker.dispatch(channel, message).await {
                Ok(result) => BrokerMessage::Result { id, result },
                Err(e) => {
                    debug!(channel = %channel, error = %e, "caller message failed");
                    BrokerMessage::error(id, &e)
                }
            };
            broker.send(channel, reply);
        })
    }

    /// Disconnect hook. Safe to call more than once.
    pub fn detach(&self, channel: ChannelId) {
        let origin = self.channels.origin(channel);
        if self.channels.disconnect(channel) {
            let mut entry = AuditEntry::new(AuditAction::Disconnect);
            if let Some(ref origin) = origin {
                entry = entry.with_origin(origin);
            }
            self.audit.log(entry);
        }
        self.outboxes.lock().remove(&channel);
    }

    fn send(&self, channel: ChannelId, message: BrokerMessage) {
        let outbox = self.outboxes.lock().get(&channel).cloned();
        match outbox {
            Some(outbox) => {
                if outbox.send(message).is_err() {
                    debug!(channel = %channel, "caller went away before reply");
                }
            }
            None => debug!(channel = %channel, "reply for detached channel dropped"),
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        channel: ChannelId,
        message: CallerMessage,
    ) -> Result<Value> {
        let origin = self
            .channels
            .origin(channel)
            .ok_or(BrokerError::ChannelDisconnected)?;
        match message.operation {
            Operation::Accounts => {
                self.require_grant(&origin)?;
                Ok(serde_json::to_value(self.exposed_accounts(&origin).await)?)
            }
            Operation::SubscribeAccounts => {
                self.require_grant(&origin)?;
                self.subscribe_accounts(channel, origin.clone(), message.id)?;
                Ok(serde_json::to_value(self.exposed_accounts(&origin).await)?)
            }
            Operation::Request(payload) => {
                let response = self.request(channel, &origin, payload).await?;
                Ok(serde_json::to_value(response)?)
            }
        }
    }

    fn require_grant(&self, origin: &Origin) -> Result<()> {
        if self.config.require_authorization && !self.authorizations.is_authorized(origin) {
            return Err(BrokerError::OriginNotAuthorized(origin.to_string()));
        }
        Ok(())
    }

    fn subscribe_accounts(
        self: &Arc<Self>,
        channel: ChannelId,
        origin: Origin,
        id: String,
    ) -> Result<()> {
        let mut changes = self.authorizations.subscribe();
        changes.borrow_and_update();
        let broker = Arc::clone(self);
        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let accounts = broker.exposed_accounts(&origin).await;
                match serde_json::to_value(accounts) {
                    Ok(subscription) => broker.send(
                        channel,
                        BrokerMessage::Subscription {
                            id: id.clone(),
                            subscription,
                        },
                    ),
                    Err(e) => warn!(error = %e, "failed to encode account update"),
                }
            }
        });
        self.channels.bind_subscription(channel, task.abort_handle())
    }

    async fn exposed_accounts(&self, origin: &Origin) -> Vec<ExposedAccount> {
        let mut exposed = Vec::new();
        for address in self.authorizations.accounts_for(origin) {
            match self.vault.account(&address).await {
                Ok(info) => exposed.push(ExposedAccount {
                    address: info.address,
                    name: info.name,
                    family: info.family,
                }),
                Err(_) => debug!(address = %address, "granted account no longer in vault"),
            }
        }
        exposed
    }

    async fn request(
        &self,
        channel: ChannelId,
        origin: &Origin,
        payload: RequestPayload,
    ) -> Result<Response> {
        payload.validate(self.config.max_payload_bytes)?;
        if let Some(ref limiter) = self.limiter {
            limiter.check_and_record(origin)?;
        }

        let kind = payload.kind();
        if kind == RequestKind::Authorize {
            if self.authorizations.is_authorized(origin) {
                return Ok(Response::Accounts {
                    accounts: self.exposed_accounts(origin).await,
                });
            }
        } else if self.config.require_authorization {
            let exposed = payload
                .account()
                .map_or(true, |account| self.authorizations.exposes(origin, account));
            if !self.authorizations.permits(origin, kind) || !exposed {
                self.audit.log(
                    AuditEntry::new(AuditAction::PermissionDenied)
                        .with_origin(origin)
                        .failed(kind.to_string()),
                );
                return Err(BrokerError::OriginNotAuthorized(origin.to_string()));
            }
        }

        let pending = self.channels.submit(channel, payload)?;
        let response = pending.await?;
        self.authorizations.record_usage(origin);
        Ok(response)
    }

    // Surface side

    pub fn pending(&self) -> Vec<RequestView> {
        self.requests.list(None)
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<Vec<RequestView>> {
        self.requests.subscribe()
    }

    /// Executes `id` with the user's decision and settles it.
    ///
    /// `Unauthorised` and `RateLimited` failures leave the request pending so
    /// the password can be entered again. Any other failure rejects it.
    #[instrument(skip(self, approval), fields(request_id = %id))]
    pub async fn approve(&self, id: &RequestId, approval: Approval) -> Result<()> {
        let view = self
            .requests
            .get(id)
            .ok_or_else(|| BrokerError::NotFound(id.to_string()))?;

        if !self.executing.lock().insert(id.clone()) {
            return Err(BrokerError::InvalidRequest("request is already being approved".into()));
        }
        let _executing = Executing {
            set: &self.executing,
            id: id.clone(),
        };

        let outcome = self.execute(&view, approval).await;
        let action = audit_action(view.kind);
        match outcome {
            Ok(response) => {
                if !self.requests.resolve(id, response) {
                    debug!("request settled elsewhere while executing");
                }
                self.audit
                    .log(AuditEntry::new(action).with_origin(&view.origin).with_request(id));
                Ok(())
            }
            Err(e @ (BrokerError::Unauthorised | BrokerError::RateLimited(_))) => {
                info!(reason = %e, "approval needs the password again");
                Err(e)
            }
            Err(e) => {
                self.requests.reject(id, e.clone());
                self.audit.log(
                    AuditEntry::new(action)
                        .with_origin(&view.origin)
                        .with_request(id)
                        .failed(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// The user declined `id`. The caller sees `Cancelled`; `reason` only
    /// goes to the audit log. Returns false if it had already settled.
    pub fn reject(&self, id: &RequestId, reason: &str) -> bool {
        let Some(view) = self.requests.get(id) else {
            return false;
        };
        let rejected = self.requests.reject(id, BrokerError::Cancelled);
        if rejected {
            self.audit.log(
                AuditEntry::new(AuditAction::Reject)
                    .with_origin(&view.origin)
                    .with_request(id)
                    .failed(reason),
            );
        }
        rejected
    }

    pub fn surface_closed(&self, surface: SurfaceId) -> usize {
        self.requests.surface_closed(surface)
    }

    pub async fn authenticate(&self, password: &str) -> Result<()> {
        Ok(self.vault.authenticate(password).await?)
    }

    pub fn lock(&self) {
        self.vault.lock();
        info!("vault locked");
    }

    pub fn is_unlocked(&self) -> bool {
        self.vault.is_unlocked()
    }

    pub async fn change_password(&self, current: &str, new: &str) -> Result<bool> {
        let result = self.vault.change_password(current, new).await;
        let entry = AuditEntry::new(AuditAction::PasswordChange);
        match result {
            Ok(changed) => {
                self.audit.log(entry);
                Ok(changed)
            }
            Err(e) => {
                let e = BrokerError::from(e);
                self.audit.log(entry.failed(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn revoke(&self, origin: &Origin) -> Result<bool> {
        let revoked = self.authorizations.revoke(origin).await?;
        if revoked {
            self.requests
                .reject_origin(origin, BrokerError::OriginNotAuthorized(origin.to_string()));
            self.audit
                .log(AuditEntry::new(AuditAction::Revoke).with_origin(origin));
        }
        Ok(revoked)
    }

    pub fn authorizations(&self) -> Vec<Grant> {
        self.authorizations.list()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub async fn transactions(&self) -> Result<Vec<TransactionRecord>> {
        self.tx_log.list().await
    }

    pub fn live_channels(&self) -> Vec<ChannelId> {
        self.channels.live_channels()
    }

    // Execution

    fn executor(&self, family: NetworkFamily) -> &dyn SigningExecutor {
        match family {
            NetworkFamily::Evm => &self.evm,
            NetworkFamily::Substrate => &self.substrate,
        }
    }

    async fn unlock_with(&self, approval: &Approval) -> Result<()> {
        if let Approval::Sign {
            password: Some(password),
        } = approval
        {
            if !self.vault.is_unlocked() {
                self.vault.authenticate(password.expose_secret()).await?;
            }
        }
        Ok(())
    }

    async fn execute(&self, view: &RequestView, approval: Approval) -> Result<Response> {
        match (&view.payload, approval) {
            (RequestPayload::Authorize { name }, Approval::Accounts { accounts, scopes }) => {
                let mut granted = Vec::with_capacity(accounts.len());
                for address in accounts {
                    granted.push(self.vault.account(&address).await?.address);
                }
                self.authorizations
                    .grant(&view.origin, name, granted, scopes)
                    .await?;
                Ok(Response::Accounts {
                    accounts: self.exposed_accounts(&view.origin).await,
                })
            }

            (
                RequestPayload::SignMessage { address, message },
                approval @ Approval::Sign { .. },
            ) => {
                self.unlock_with(&approval).await?;
                let family = self.vault.account(address).await?.family;
                let signature = self
                    .executor(family)
                    .sign_message(address, &message_bytes(message)?)
                    .await?;
                Ok(Response::Signature {
                    signature: format!("0x{}", hex::encode(signature)),
                })
            }

            (
                RequestPayload::SignAndSend {
                    network,
                    from,
                    payload,
                },
                approval @ Approval::Sign { .. },
            ) => {
                self.unlock_with(&approval).await?;
                let network = self.nodes.resolve(network)?;
                let unsigned = decode_hex("payload", payload)?;
                let submitted = self
                    .executor(network.family)
                    .sign_and_broadcast(&network, from, &unsigned)
                    .await?;
                Ok(self.hand_off(submitted, &unsigned, network.client.clone()))
            }

            (
                RequestPayload::SendSigned {
                    network,
                    from,
                    payload,
                },
                Approval::ExternalSignature(signature),
            ) => {
                let network = self.nodes.resolve(network)?;
                let unsigned = decode_hex("payload", payload)?;
                let signature = decode_hex("signature", &signature)?;
                let submitted = self
                    .executor(network.family)
                    .broadcast_external(&network, from, &unsigned, &signature)
                    .await?;
                Ok(self.hand_off(submitted, &unsigned, network.client.clone()))
            }

            (
                RequestPayload::Encrypt {
                    address,
                    recipient,
                    message,
                },
                Approval::Confirm | Approval::Sign { .. },
            ) => {
                let plaintext = message.as_bytes();
                let envelope = match recipient {
                    Some(recipient) => seal_for(&decode_hex("recipient", recipient)?, plaintext)?,
                    None => self.vault.public_account(address).await?.seal(plaintext)?,
                };
                Ok(Response::Ciphertext { envelope })
            }

            (RequestPayload::Decrypt { address, envelope }, approval @ Approval::Sign { .. }) => {
                self.unlock_with(&approval).await?;
                let message = self
                    .vault
                    .with_decrypted(address, |key| {
                        let plaintext = key.open(envelope)?;
                        Ok(match std::str::from_utf8(&plaintext) {
                            Ok(text) => text.to_string(),
                            Err(_) => format!("0x{}", hex::encode(&*plaintext)),
                        })
                    })
                    .await?;
                Ok(Response::Plaintext { message })
            }

            (
                RequestPayload::MetadataUpdate {
                    genesis_hash,
                    spec_version,
                    metadata,
                },
                Approval::Confirm,
            ) => {
                let key = format!("{METADATA_PREFIX}{}", genesis_hash.to_lowercase());
                let value = serde_json::json!({
                    "spec_version": spec_version,
                    "metadata": metadata,
                    "origin": view.origin,
                });
                self.put_json(&key, &value).await?;
                Ok(Response::Accepted)
            }

            (
                RequestPayload::AddNetwork {
                    network_id,
                    name,
                    family,
                    rpc_urls,
                },
                Approval::Confirm,
            ) => {
                let value = serde_json::json!({
                    "name": name,
                    "family": family,
                    "rpc_urls": rpc_urls,
                    "origin": view.origin,
                });
                self.put_json(&format!("{NETWORK_PREFIX}{network_id}"), &value)
                    .await?;
                Ok(Response::Accepted)
            }

            (
                RequestPayload::WatchAsset {
                    network,
                    contract,
                    symbol,
                    decimals,
                },
                Approval::Confirm,
            ) => {
                let contract = normalize_address(contract);
                let value = serde_json::json!({
                    "symbol": symbol,
                    "decimals": decimals,
                    "origin": view.origin,
                });
                self.put_json(&format!("{ASSET_PREFIX}{network}/{contract}"), &value)
                    .await?;
                Ok(Response::Accepted)
            }

            (_, approval) => Err(BrokerError::InvalidRequest(format!(
                "{} cannot be approved with {}",
                view.kind,
                approval_name(&approval)
            ))),
        }
    }

    fn hand_off(
        &self,
        submitted: Submitted,
        unsigned: &[u8],
        client: Arc<dyn crate::node::NodeClient>,
    ) -> Response {
        let record = TransactionRecord::submitted(
            &submitted.network,
            &submitted.hash,
            &submitted.from,
            unsigned,
        );
        self.watcher.watch(record, client);
        Response::Broadcast {
            network: submitted.network,
            hash: submitted.hash,
        }
    }

    async fn put_json(&self, key: &str, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| BrokerError::Internal(format!("encode {key}: {e}")))?;
        self.vault.store().set(key, &bytes).await?;
        Ok(())
    }
}

fn audit_action(kind: RequestKind) -> AuditAction {
    match kind {
        RequestKind::Authorize => AuditAction::Authorize,
        RequestKind::SignMessage => AuditAction::SignMessage,
        RequestKind::SignAndSend | RequestKind::SendSigned => AuditAction::Broadcast,
        RequestKind::Encrypt => AuditAction::Encrypt,
        RequestKind::Decrypt => AuditAction::Decrypt,
        RequestKind::MetadataUpdate | RequestKind::AddNetwork | RequestKind::WatchAsset => {
            AuditAction::Accept
        }
    }
}

fn approval_name(approval: &Approval) -> &'static str {
    match approval {
        Approval::Accounts { .. } => "an account selection",
        Approval::Sign { .. } => "a signature approval",
        Approval::ExternalSignature(_) => "an external signature",
        Approval::Confirm => "a confirmation",
    }
}
