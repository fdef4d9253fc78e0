// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use chrono::{DateTime, Utc};
use latch_core::keys::ss58_decode;
use latch_core::NetworkFamily;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BrokerError, ErrorCategory, Result};
use crate::permissions::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface-{}", self.0)
    }
}

/// `<kind prefix>.<sequence>`, unique per broker instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(kind: RequestKind, sequence: u64) -> Self {
        Self(format!("{}.{}", kind.prefix(), sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Site origin, compared by scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Origin(String);

impl Origin {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| BrokerError::InvalidRequest(format!("invalid origin: {e}")))?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(BrokerError::InvalidRequest("opaque origin".into()));
        }
        Ok(Self(origin.ascii_serialization()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Origin {
    type Error = BrokerError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Authorize,
    SignMessage,
    SignAndSend,
    SendSigned,
    Encrypt,
    Decrypt,
    MetadataUpdate,
    AddNetwork,
    WatchAsset,
}

/// Requests of one flow share an approval surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Authorization,
    Signing,
    Encryption,
    Metadata,
    Network,
}

impl RequestKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Authorize => "auth",
            Self::SignMessage => "sign",
            Self::SignAndSend => "tx",
            Self::SendSigned => "txsigned",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::MetadataUpdate => "metadata",
            Self::AddNetwork => "network",
            Self::WatchAsset => "asset",
        }
    }

    pub fn flow(&self) -> Flow {
        match self {
            Self::Authorize => Flow::Authorization,
            Self::SignMessage | Self::SignAndSend | Self::SendSigned => Flow::Signing,
            Self::Encrypt | Self::Decrypt => Flow::Encryption,
            Self::MetadataUpdate => Flow::Metadata,
            Self::AddNetwork | Self::WatchAsset => Flow::Network,
        }
    }

    /// At most one pending request of this kind per origin.
    pub fn unique_per_origin(&self) -> bool {
        matches!(self, Self::Authorize | Self::AddNetwork)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestPayload {
    Authorize {
        name: String,
    },
    SignMessage {
        address: String,
        /// `0x`-prefixed hex, or UTF-8 text.
        message: String,
    },
    SignAndSend {
        network: String,
        from: String,
        /// Hex-encoded unsigned transaction.
        payload: String,
    },
    SendSigned {
        network: String,
        from: String,
        payload: String,
    },
    Encrypt {
        address: String,
        /// Hex public key; defaults to the account itself.
        #[serde(default)]
        recipient: Option<String>,
        message: String,
    },
    Decrypt {
        address: String,
        envelope: String,
    },
    MetadataUpdate {
        genesis_hash: String,
        spec_version: u32,
        metadata: serde_json::Value,
    },
    AddNetwork {
        network_id: String,
        name: String,
        family: NetworkFamily,
        rpc_urls: Vec<String>,
    },
    WatchAsset {
        network: String,
        contract: String,
        symbol: String,
        decimals: u8,
    },
}

const MAX_NAME_LEN: usize = 128;
const MAX_DECIMALS: u8 = 36;

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BrokerError::InvalidRequest(format!("{field} is empty")));
    }
    Ok(())
}

fn require_address(value: &str) -> Result<()> {
    if let Some(hex_part) = value.strip_prefix("0x") {
        if hex_part.len() == 40 && hex::decode(hex_part).is_ok() {
            return Ok(());
        }
        return Err(BrokerError::InvalidRequest("malformed evm address".into()));
    }
    ss58_decode(value)
        .map(|_| ())
        .map_err(|_| BrokerError::InvalidRequest("malformed address".into()))
}

pub(crate) fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    hex::decode(value.strip_prefix("0x").unwrap_or(value))
        .map_err(|_| BrokerError::InvalidRequest(format!("{field} is not hex")))
}

/// Raw bytes of a message given as `0x` hex or plain text.
pub(crate) fn message_bytes(message: &str) -> Result<Vec<u8>> {
    if message.starts_with("0x") {
        decode_hex("message", message)
    } else {
        Ok(message.as_bytes().to_vec())
    }
}

impl RequestPayload {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Authorize { .. } => RequestKind::Authorize,
            Self::SignMessage { .. } => RequestKind::SignMessage,
            Self::SignAndSend { .. } => RequestKind::SignAndSend,
            Self::SendSigned { .. } => RequestKind::SendSigned,
            Self::Encrypt { .. } => RequestKind::Encrypt,
            Self::Decrypt { .. } => RequestKind::Decrypt,
            Self::MetadataUpdate { .. } => RequestKind::MetadataUpdate,
            Self::AddNetwork { .. } => RequestKind::AddNetwork,
            Self::WatchAsset { .. } => RequestKind::WatchAsset,
        }
    }

    /// The vault account the request acts for, if any.
    pub fn account(&self) -> Option<&str> {
        match self {
            Self::SignMessage { address, .. }
            | Self::Encrypt { address, .. }
            | Self::Decrypt { address, .. } => Some(address),
            Self::SignAndSend { from, .. } | Self::SendSigned { from, .. } => Some(from),
            _ => None,
        }
    }

    /// Checks the payload shape at the boundary.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<()> {
        let size = serde_json::to_vec(self)?.len();
        if size > max_payload_bytes {
            return Err(BrokerError::InvalidRequest(format!(
                "payload of {size} bytes exceeds limit"
            )));
        }

        match self {
            Self::Authorize { name } => {
                require_non_empty("name", name)?;
                if name.len() > MAX_NAME_LEN {
                    return Err(BrokerError::InvalidRequest("name too long".into()));
                }
            }
            Self::SignMessage { address, message } => {
                require_address(address)?;
                message_bytes(message)?;
            }
            Self::SignAndSend {
                network,
                from,
                payload,
            }
            | Self::SendSigned {
                network,
                from,
                payload,
            } => {
                require_non_empty("network", network)?;
                require_address(from)?;
                if decode_hex("payload", payload)?.is_empty() {
                    return Err(BrokerError::InvalidRequest("payload is empty".into()));
                }
            }
            Self::Encrypt {
                address,
                recipient,
                message,
            } => {
                require_address(address)?;
                if let Some(recipient) = recipient {
                    decode_hex("recipient", recipient)?;
                }
                require_non_empty("message", message)?;
            }
            Self::Decrypt { address, envelope } => {
                require_address(address)?;
                require_non_empty("envelope", envelope)?;
            }
            Self::MetadataUpdate {
                genesis_hash,
                metadata,
                ..
            } => {
                if decode_hex("genesis_hash", genesis_hash)?.len() != 32 {
                    return Err(BrokerError::InvalidRequest(
                        "genesis_hash must be 32 bytes".into(),
                    ));
                }
                if !metadata.is_object() {
                    return Err(BrokerError::InvalidRequest(
                        "metadata must be an object".into(),
                    ));
                }
            }
            Self::AddNetwork {
                network_id,
                name,
                rpc_urls,
                ..
            } => {
                require_non_empty("network_id", network_id)?;
                require_non_empty("name", name)?;
                if rpc_urls.is_empty() {
                    return Err(BrokerError::InvalidRequest("no rpc urls".into()));
                }
                for raw in rpc_urls {
                    let url = Url::parse(raw)
                        .map_err(|_| BrokerError::InvalidRequest("invalid rpc url".into()))?;
                    if !matches!(url.scheme(), "https" | "wss" | "http" | "ws") {
                        return Err(BrokerError::InvalidRequest(
                            "unsupported rpc url scheme".into(),
                        ));
                    }
                }
            }
            Self::WatchAsset {
                network,
                contract,
                symbol,
                decimals,
            } => {
                require_non_empty("network", network)?;
                require_address(contract)?;
                require_non_empty("symbol", symbol)?;
                if symbol.len() > 16 || *decimals > MAX_DECIMALS {
                    return Err(BrokerError::InvalidRequest("invalid asset".into()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedAccount {
    pub address: String,
    pub name: String,
    pub family: NetworkFamily,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Accounts { accounts: Vec<ExposedAccount> },
    Signature { signature: String },
    Broadcast { network: String, hash: String },
    Ciphertext { envelope: String },
    Plaintext { message: String },
    Accepted,
}

/// The user's decision payload for a pending request.
#[derive(Debug)]
pub enum Approval {
    /// Accounts to expose to an authorizing origin and the request kinds it
    /// may submit afterwards.
    Accounts { accounts: Vec<String>, scopes: Scope },
    /// Approve a signing or decryption request, re-entering the password if
    /// the session is locked.
    Sign { password: Option<SecretString> },
    /// Hex signature produced by a hardware or QR signer.
    ExternalSignature(String),
    Confirm,
}

/// Serializable view of a pending request. Never carries its completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestView {
    pub id: RequestId,
    pub kind: RequestKind,
    pub origin: Origin,
    pub payload: RequestPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "params", rename_all = "snake_case")]
pub enum Operation {
    Request(RequestPayload),
    Accounts,
    SubscribeAccounts,
}

/// A caller-to-broker message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerMessage {
    pub id: String,
    #[serde(flatten)]
    pub operation: Operation,
}

/// A broker-to-caller message. Exactly one `Result` or `Error` answers each
/// caller message; subscriptions stream `Subscription` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrokerMessage {
    Result {
        id: String,
        result: serde_json::Value,
    },
    Error {
        id: String,
        error: String,
        category: ErrorCategory,
    },
    Subscription {
        id: String,
        subscription: serde_json::Value,
    },
}

impl BrokerMessage {
    pub fn error(id: impl Into<String>, error: &BrokerError) -> Self {
        Self::Error {
            id: id.into(),
            error: error.client_message().to_string(),
            category: error.category(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Result { id, .. } | Self::Error { id, .. } | Self::Subscription { id, .. } => id,
        }
    }
}
