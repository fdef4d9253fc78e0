// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! `latch serve`: the broker behind a Unix socket, approvals on the terminal.
//!
//! Each connection is one channel. The first line a caller writes is a hello
//! naming its origin, every following line is a [`CallerMessage`] and every
//! line written back is a [`BrokerMessage`].

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use dialoguer::{theme::ColorfulTheme, Confirm, Input, MultiSelect, Password};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, instrument, warn};

use latch_broker::{
    Approval, Broker, BrokerError, BrokerMessage, CallerMessage, Flow, NodeRegistry,
    RequestKind, RequestPayload, RequestView, Scope, SurfaceHost, SurfaceId, TracingNotifier,
};
use latch_core::{AccountInfo, Vault};

use crate::config::Config;
use crate::output::Output;

use super::{open_unlocked, runtime};

const DECLINED: &str = "declined at terminal";
const NO_NODE: &str = "no node configured";

/// Tracks which approval surfaces the broker considers open. Prompts are
/// driven from the pending list, so nothing here calls back into the broker.
#[derive(Default)]
struct TerminalHost {
    open: Mutex<BTreeSet<SurfaceId>>,
}

impl TerminalHost {
    fn open_surfaces(&self) -> Vec<SurfaceId> {
        self.open.lock().iter().copied().collect()
    }
}

impl SurfaceHost for TerminalHost {
    fn open(&self, surface: SurfaceId, flow: Flow) -> std::result::Result<(), String> {
        debug!(%surface, ?flow, "terminal surface opened");
        self.open.lock().insert(surface);
        Ok(())
    }

    fn focus(&self, surface: SurfaceId) {
        debug!(%surface, "terminal surface focused");
    }

    fn close(&self, surface: SurfaceId) {
        debug!(%surface, "terminal surface closed");
        self.open.lock().remove(&surface);
    }
}

#[derive(Deserialize)]
struct Hello {
    origin: String,
}

pub fn cmd_serve(out: &Output, cfg: &Config, path: &Path, socket: &Path) -> Result<()> {
    runtime()?.block_on(async {
        let vault = Arc::new(open_unlocked(out, cfg, path).await?);
        let host = Arc::new(TerminalHost::default());
        let nodes = Arc::new(NodeRegistry::new());
        let broker = Broker::new(
            vault.clone(),
            host.clone(),
            nodes.clone(),
            Arc::new(TracingNotifier),
            cfg.broker.clone(),
        )
        .await
        .context("Failed to start broker")?;

        if socket.exists() {
            std::fs::remove_file(socket)
                .with_context(|| format!("Failed to remove stale socket {}", socket.display()))?;
        }
        let listener = UnixListener::bind(socket)
            .with_context(|| format!("Failed to bind {}", socket.display()))?;

        out.success("Broker running.");
        out.field("Socket", &socket.display().to_string());
        out.info("Press Ctrl-C to stop.");
        info!(socket = %socket.display(), "broker listening");

        let approvals = tokio::spawn(approval_loop(broker.clone(), vault, nodes));
        let result = tokio::select! {
            result = accept_loop(broker.clone(), listener) => result,
            signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl-C"),
        };

        approvals.abort();
        let mut cancelled = 0;
        for surface in host.open_surfaces() {
            cancelled += broker.surface_closed(surface);
        }
        for channel in broker.live_channels() {
            broker.detach(channel);
        }
        broker.lock();
        let _ = std::fs::remove_file(socket);
        info!(cancelled, "broker stopped");
        out.newline();
        out.info("Broker stopped.");
        result
    })
}

#[instrument(skip_all)]
async fn accept_loop(broker: Arc<Broker>, listener: UnixListener) -> Result<()> {
    loop {
        let (stream, _) = listener.accept().await.context("Failed to accept connection")?;
        let broker = broker.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(broker, stream).await {
                warn!(error = %e, "connection ended with error");
            }
        });
    }
}

async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &BrokerMessage,
) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    Ok(())
}

async fn serve_connection(broker: Arc<Broker>, stream: UnixStream) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };
    let hello = match serde_json::from_str::<Hello>(&first) {
        Ok(hello) => hello,
        Err(e) => {
            let err = BrokerError::InvalidRequest(format!("invalid hello: {e}"));
            write_message(&mut write, &BrokerMessage::error("hello", &err)).await?;
            return Ok(());
        }
    };
    let (channel, mut outbox) = match broker.attach(&hello.origin) {
        Ok(attached) => attached,
        Err(e) => {
            write_message(&mut write, &BrokerMessage::error("hello", &e)).await?;
            return Ok(());
        }
    };
    debug!(%channel, origin = %hello.origin, "caller connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            write_message(&mut write, &message).await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let read_result = async {
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CallerMessage>(&line) {
                Ok(message) => {
                    broker.handle(channel, message);
                }
                Err(e) => warn!(%channel, error = %e, "unparseable caller message dropped"),
            }
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    broker.detach(channel);
    debug!(%channel, "caller disconnected");
    match writer.await {
        Ok(Err(e)) => debug!(%channel, error = %e, "writer stopped"),
        Err(e) => debug!(%channel, error = %e, "writer task failed"),
        Ok(Ok(())) => {}
    }
    read_result
}

/// Prompts for pending requests one at a time, oldest first.
async fn approval_loop(broker: Arc<Broker>, vault: Arc<Vault>, nodes: Arc<NodeRegistry>) {
    let mut pending = broker.subscribe_pending();
    loop {
        let next = pending
            .borrow_and_update()
            .iter()
            .min_by_key(|view| view.created_at)
            .cloned();
        let Some(view) = next else {
            if pending.changed().await.is_err() {
                return;
            }
            continue;
        };

        let needs_node = matches!(view.kind, RequestKind::SignAndSend | RequestKind::SendSigned);
        if needs_node && nodes.is_empty() {
            broker.reject(&view.id, NO_NODE);
            continue;
        }

        let accounts = match view.kind {
            RequestKind::Authorize => match vault.accounts().await {
                Ok(accounts) => accounts,
                Err(e) => {
                    warn!(error = %e, "could not list accounts for authorization");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        };
        let locked = !broker.is_unlocked();

        let prompt = {
            let view = view.clone();
            tokio::task::spawn_blocking(move || prompt(&view, &accounts, locked))
        };
        let decision = match prompt.await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                warn!(request_id = %view.id, error = %e, "prompt failed");
                None
            }
            Err(e) => {
                warn!(request_id = %view.id, error = %e, "prompt task failed");
                None
            }
        };

        match decision {
            Some(approval) => {
                if let Err(e) = broker.approve(&view.id, approval).await {
                    eprintln!("Approval failed: {e}");
                }
            }
            None => {
                broker.reject(&view.id, DECLINED);
            }
        }
    }
}

fn describe(view: &RequestView) -> String {
    match &view.payload {
        RequestPayload::Authorize { name } => format!("{name} wants to see your accounts"),
        RequestPayload::SignMessage { address, message } => {
            format!("Sign message for {address}:\n  {message}")
        }
        RequestPayload::SignAndSend { network, from, .. } => {
            format!("Sign and send a transaction on {network} from {from}")
        }
        RequestPayload::SendSigned { network, from, payload } => {
            format!(
                "Sign with your external signer and send on {network} from {from}:\n  {payload}"
            )
        }
        RequestPayload::Encrypt { address, .. } => format!("Encrypt a message with {address}"),
        RequestPayload::Decrypt { address, .. } => format!("Decrypt a message for {address}"),
        RequestPayload::MetadataUpdate {
            genesis_hash,
            spec_version,
            ..
        } => format!("Update chain metadata {genesis_hash} to version {spec_version}"),
        RequestPayload::AddNetwork { name, network_id, .. } => {
            format!("Add network {name} ({network_id})")
        }
        RequestPayload::WatchAsset {
            network, symbol, contract, ..
        } => format!("Watch {symbol} ({contract}) on {network}"),
    }
}

fn grant_scopes(allow_encryption: bool) -> Scope {
    if allow_encryption {
        Scope::ALL
    } else {
        Scope::DEFAULT
    }
}

/// Blocking terminal prompt. `None` means the user declined.
fn prompt(view: &RequestView, accounts: &[AccountInfo], locked: bool) -> Result<Option<Approval>> {
    let theme = ColorfulTheme::default();
    eprintln!("\n[{}] {} from {}", view.id, view.kind, view.origin);
    eprintln!("{}", describe(view));

    match view.kind {
        RequestKind::Authorize => {
            if accounts.is_empty() {
                eprintln!("No accounts to share.");
                return Ok(None);
            }
            let items: Vec<String> = accounts
                .iter()
                .map(|a| format!("{} ({})", a.name, a.address))
                .collect();
            let chosen = MultiSelect::with_theme(&theme)
                .with_prompt("Accounts to expose (space selects, enter confirms)")
                .items(&items)
                .interact()?;
            if chosen.is_empty() {
                return Ok(None);
            }
            let allow_encryption = Confirm::with_theme(&theme)
                .with_prompt("Also allow encryption and decryption requests?")
                .default(false)
                .interact()?;
            Ok(Some(Approval::Accounts {
                accounts: chosen
                    .into_iter()
                    .map(|i| accounts[i].address.clone())
                    .collect(),
                scopes: grant_scopes(allow_encryption),
            }))
        }
        RequestKind::SendSigned => {
            let signature: String = Input::with_theme(&theme)
                .with_prompt("Signature hex (empty to decline)")
                .allow_empty(true)
                .interact_text()?;
            if signature.trim().is_empty() {
                return Ok(None);
            }
            Ok(Some(Approval::ExternalSignature(signature.trim().to_string())))
        }
        RequestKind::SignMessage | RequestKind::SignAndSend | RequestKind::Decrypt => {
            if !Confirm::with_theme(&theme).with_prompt("Approve?").default(false).interact()? {
                return Ok(None);
            }
            let password = if locked {
                let pw = Password::with_theme(&theme)
                    .with_prompt("Vault is locked, enter password")
                    .interact()?;
                Some(SecretString::from(pw))
            } else {
                None
            };
            Ok(Some(Approval::Sign { password }))
        }
        RequestKind::Encrypt
        | RequestKind::MetadataUpdate
        | RequestKind::AddNetwork
        | RequestKind::WatchAsset => {
            if Confirm::with_theme(&theme).with_prompt("Approve?").default(false).interact()? {
                Ok(Some(Approval::Confirm))
            } else {
                Ok(None)
            }
        }
    }
}
