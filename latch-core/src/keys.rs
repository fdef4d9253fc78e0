// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Key material for the two supported network families.
//!
//! EVM-like accounts are secp256k1 keys addressed by the last 20 bytes of the
//! keccak hash of the uncompressed public key. Substrate-like accounts are
//! ed25519 keys addressed with SS58.
use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{self, EncryptedData, SecretKey, NONCE_SIZE};
use crate::error::{LatchError, Result};

/// SS58 address format used for generic substrate accounts.
pub const SS58_GENERIC_PREFIX: u8 = 42;

const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkFamily {
    Evm,
    Substrate,
}

impl NetworkFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evm => "evm",
            Self::Substrate => "substrate",
        }
    }

    /// Public key length in bytes as stored in account records.
    pub fn public_key_len(&self) -> usize {
        match self {
            Self::Evm => 33,
            Self::Substrate => 32,
        }
    }
}

impl fmt::Display for NetworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkFamily {
    type Err = LatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "evm" | "ethereum" => Ok(Self::Evm),
            "substrate" | "polkadot" => Ok(Self::Substrate),
            other => Err(LatchError::Other(format!("unknown network family: {other}"))),
        }
    }
}

/// Public half of an account. Safe to hold without an unlocked session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicAccount {
    pub family: NetworkFamily,
    pub public_key: Vec<u8>,
    pub address: String,
}

impl PublicAccount {
    pub fn from_public_key(family: NetworkFamily, public_key: Vec<u8>) -> Result<Self> {
        if public_key.len() != family.public_key_len() {
            return Err(LatchError::InvalidKey(format!(
                "{family} public key must be {} bytes",
                family.public_key_len()
            )));
        }
        let address = address_from_public_key(family, &public_key)?;
        Ok(Self {
            family,
            public_key,
            address,
        })
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<()> {
        verify_payload_signature(self.family, &self.public_key, payload, signature)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        if self.family != NetworkFamily::Evm {
            return Err(LatchError::InvalidKey(
                "message encryption requires an evm account".into(),
            ));
        }
        seal_for(&self.public_key, plaintext)
    }
}

/// Decrypted private key bytes, only ever handed out by reference inside a
/// scoped vault operation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    #[zeroize(skip)]
    family: NetworkFamily,
    secret: [u8; 32],
}

impl KeyMaterial {
    /// Validates `secret` for the family. Zeroes the source.
    pub fn from_secret_bytes(family: NetworkFamily, secret: &mut [u8; 32]) -> Result<Self> {
        if family == NetworkFamily::Evm && k256::ecdsa::SigningKey::from_slice(secret).is_err() {
            secret.zeroize();
            return Err(LatchError::InvalidKey("invalid secp256k1 scalar".into()));
        }
        let material = Self {
            family,
            secret: *secret,
        };
        secret.zeroize();
        Ok(material)
    }

    pub fn generate(family: NetworkFamily) -> Result<Self> {
        const MAX_RETRIES: usize = 64;
        for _ in 0..MAX_RETRIES {
            let mut bytes: [u8; 32] = crypto::random_bytes();
            if let Ok(material) = Self::from_secret_bytes(family, &mut bytes) {
                return Ok(material);
            }
        }
        Err(LatchError::InvalidKey(
            "failed to generate valid key after 64 attempts".into(),
        ))
    }

    /// Deterministic account `index` of a recovery seed.
    pub fn derive_from_seed(seed: &[u8], family: NetworkFamily, index: u32) -> Result<Self> {
        const MAX_RETRIES: u32 = 64;
        for counter in 0..MAX_RETRIES {
            let mut input = Zeroizing::new(Vec::with_capacity(seed.len() + 32));
            input.extend_from_slice(b"latch-derive-v1/");
            input.extend_from_slice(family.as_str().as_bytes());
            input.extend_from_slice(&index.to_be_bytes());
            input.extend_from_slice(&counter.to_be_bytes());
            input.extend_from_slice(seed);
            let mut bytes = crypto::blake2b_256(&input);
            if let Ok(material) = Self::from_secret_bytes(family, &mut bytes) {
                return Ok(material);
            }
        }
        Err(LatchError::InvalidKey("seed derivation exhausted".into()))
    }

    pub fn family(&self) -> NetworkFamily {
        self.family
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn public_key(&self) -> Result<Vec<u8>> {
        match self.family {
            NetworkFamily::Evm => {
                let key = self.evm_signing_key()?;
                Ok(key.verifying_key().to_encoded_point(true).as_bytes().to_vec())
            }
            NetworkFamily::Substrate => Ok(self
                .ed25519_signing_key()
                .verifying_key()
                .to_bytes()
                .to_vec()),
        }
    }

    pub fn address(&self) -> Result<String> {
        address_from_public_key(self.family, &self.public_key()?)
    }

    pub fn public_account(&self) -> Result<PublicAccount> {
        PublicAccount::from_public_key(self.family, self.public_key()?)
    }

    /// Signs a user-facing message using the family's message convention.
    pub fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self.family {
            NetworkFamily::Evm => self.sign_prehash(&evm_message_hash(message)),
            NetworkFamily::Substrate => {
                let wrapped = substrate_wrap_bytes(message);
                Ok(self.ed25519_signing_key().sign(&wrapped).to_bytes().to_vec())
            }
        }
    }

    /// Signs a transaction payload.
    ///
    /// EVM payloads are hashed with keccak256 and signed recoverably; substrate
    /// payloads are signed directly.
    pub fn sign_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.family {
            NetworkFamily::Evm => self.sign_prehash(&crypto::keccak256(payload)),
            NetworkFamily::Substrate => {
                Ok(self.ed25519_signing_key().sign(payload).to_bytes().to_vec())
            }
        }
    }

    /// Decrypts an envelope produced by [`seal_for`] with this account's key.
    pub fn open(&self, envelope: &str) -> Result<Zeroizing<Vec<u8>>> {
        if self.family != NetworkFamily::Evm {
            return Err(LatchError::InvalidKey(
                "message decryption requires an evm account".into(),
            ));
        }
        let envelope: SealedEnvelope =
            serde_json::from_str(envelope).map_err(|_| LatchError::DecryptionFailed)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(LatchError::DecryptionFailed);
        }
        let ephemeral = hex::decode(&envelope.ephemeral_public_key)
            .map_err(|_| LatchError::DecryptionFailed)?;
        let secret = k256::SecretKey::from_slice(&self.secret)
            .map_err(|_| LatchError::InvalidKey("invalid secp256k1 scalar".into()))?;
        let key = ecdh_key(&secret, &ephemeral)?;

        let nonce_bytes = hex::decode(&envelope.nonce).map_err(|_| LatchError::DecryptionFailed)?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(LatchError::DecryptionFailed);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&nonce_bytes);
        let encrypted = EncryptedData {
            nonce,
            ciphertext: hex::decode(&envelope.ciphertext)
                .map_err(|_| LatchError::DecryptionFailed)?,
        };
        crypto::decrypt(&encrypted, &key)
    }

    fn sign_prehash(&self, prehash: &[u8; 32]) -> Result<Vec<u8>> {
        let key = self.evm_signing_key()?;
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(prehash)
            .map_err(|e| LatchError::Other(format!("ecdsa signing failed: {e}")))?;
        let mut out = signature.to_bytes().to_vec();
        out.push(27 + recovery_id.to_byte());
        Ok(out)
    }

    fn evm_signing_key(&self) -> Result<k256::ecdsa::SigningKey> {
        k256::ecdsa::SigningKey::from_slice(&self.secret)
            .map_err(|_| LatchError::InvalidKey("invalid secp256k1 scalar".into()))
    }

    fn ed25519_signing_key(&self) -> ed25519_dalek::SigningKey {
        ed25519_dalek::SigningKey::from_bytes(&self.secret)
    }
}

/// Derives the display address for a public key.
pub fn address_from_public_key(family: NetworkFamily, public_key: &[u8]) -> Result<String> {
    match family {
        NetworkFamily::Evm => {
            let key = k256::PublicKey::from_sec1_bytes(public_key)
                .map_err(|_| LatchError::InvalidKey("invalid secp256k1 public key".into()))?;
            let uncompressed =
                k256::elliptic_curve::sec1::ToEncodedPoint::to_encoded_point(&key, false);
            let hash = crypto::keccak256(&uncompressed.as_bytes()[1..]);
            Ok(format!("0x{}", hex::encode(&hash[12..])))
        }
        NetworkFamily::Substrate => {
            if public_key.len() != 32 {
                return Err(LatchError::InvalidKey("ed25519 public key must be 32 bytes".into()));
            }
            Ok(ss58_encode(SS58_GENERIC_PREFIX, public_key))
        }
    }
}

/// Canonical form used as the account key in storage.
pub fn normalize_address(address: &str) -> String {
    if address.starts_with("0x") || address.starts_with("0X") {
        format!("0x{}", address[2..].to_ascii_lowercase())
    } else {
        address.to_string()
    }
}

pub fn ss58_encode(prefix: u8, public_key: &[u8]) -> String {
    let mut data = Vec::with_capacity(35);
    data.push(prefix);
    data.extend_from_slice(public_key);
    let checksum = ss58_checksum(&data);
    data.extend_from_slice(&checksum[..2]);
    bs58::encode(data).into_string()
}

pub fn ss58_decode(address: &str) -> Result<(u8, [u8; 32])> {
    let data = bs58::decode(address)
        .into_vec()
        .map_err(|_| LatchError::InvalidKey("invalid base58 address".into()))?;
    if data.len() != 35 {
        return Err(LatchError::InvalidKey("unsupported ss58 address length".into()));
    }
    let checksum = ss58_checksum(&data[..33]);
    if checksum[..2] != data[33..] {
        return Err(LatchError::InvalidKey("ss58 checksum mismatch".into()));
    }
    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&data[1..33]);
    Ok((data[0], public_key))
}

fn ss58_checksum(data: &[u8]) -> [u8; 64] {
    use blake2::{Blake2b512, Digest};
    let mut hasher = Blake2b512::new();
    hasher.update(b"SS58PRE");
    hasher.update(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn evm_message_hash(message: &[u8]) -> [u8; 32] {
    let mut prefixed = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    prefixed.extend_from_slice(message);
    crypto::keccak256(&prefixed)
}

fn substrate_wrap_bytes(message: &[u8]) -> Vec<u8> {
    const PREFIX: &[u8] = b"<Bytes>";
    const POSTFIX: &[u8] = b"</Bytes>";
    if message.starts_with(PREFIX) && message.ends_with(POSTFIX) {
        return message.to_vec();
    }
    let mut wrapped = Vec::with_capacity(message.len() + PREFIX.len() + POSTFIX.len());
    wrapped.extend_from_slice(PREFIX);
    wrapped.extend_from_slice(message);
    wrapped.extend_from_slice(POSTFIX);
    wrapped
}

/// Checks a signature produced outside the vault (hardware or QR signer).
pub fn verify_payload_signature(
    family: NetworkFamily,
    public_key: &[u8],
    payload: &[u8],
    signature: &[u8],
) -> Result<()> {
    match family {
        NetworkFamily::Substrate => {
            let key_bytes: [u8; 32] = public_key
                .try_into()
                .map_err(|_| LatchError::InvalidKey("ed25519 public key must be 32 bytes".into()))?;
            let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| LatchError::InvalidKey("invalid ed25519 public key".into()))?;
            let signature = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|_| LatchError::InvalidKey("malformed signature".into()))?;
            key.verify(payload, &signature)
                .map_err(|_| LatchError::InvalidKey("signature does not match account".into()))
        }
        NetworkFamily::Evm => {
            if signature.len() != 65 {
                return Err(LatchError::InvalidKey("malformed signature".into()));
            }
            let sig = k256::ecdsa::Signature::from_slice(&signature[..64])
                .map_err(|_| LatchError::InvalidKey("malformed signature".into()))?;
            let recovery_id = k256::ecdsa::RecoveryId::from_byte(signature[64].wrapping_sub(27))
                .ok_or_else(|| LatchError::InvalidKey("invalid recovery id".into()))?;
            let recovered = k256::ecdsa::VerifyingKey::recover_from_prehash(
                &crypto::keccak256(payload),
                &sig,
                recovery_id,
            )
            .map_err(|_| LatchError::InvalidKey("signature does not match account".into()))?;
            if recovered.to_encoded_point(true).as_bytes() != public_key {
                return Err(LatchError::InvalidKey("signature does not match account".into()));
            }
            Ok(())
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    ephemeral_public_key: String,
    nonce: String,
    ciphertext: String,
}

/// Encrypts `plaintext` to an EVM-family public key.
///
/// Uses an ephemeral secp256k1 key, so sealing needs no secret material.
pub fn seal_for(recipient_public_key: &[u8], plaintext: &[u8]) -> Result<String> {
    let ephemeral = k256::SecretKey::from_slice(&crypto::random_bytes::<32>())
        .map_err(|_| LatchError::Encryption("ephemeral key generation failed".into()))?;
    let key = ecdh_key(&ephemeral, recipient_public_key)?;
    let encrypted = crypto::encrypt(plaintext, &key)?;
    let ephemeral_public = k256::elliptic_curve::sec1::ToEncodedPoint::to_encoded_point(
        &ephemeral.public_key(),
        true,
    );

    let envelope = SealedEnvelope {
        version: ENVELOPE_VERSION,
        ephemeral_public_key: hex::encode(ephemeral_public.as_bytes()),
        nonce: hex::encode(encrypted.nonce),
        ciphertext: hex::encode(&encrypted.ciphertext),
    };
    serde_json::to_string(&envelope).map_err(|e| LatchError::Encryption(e.to_string()))
}

fn ecdh_key(secret: &k256::SecretKey, peer_public_key: &[u8]) -> Result<SecretKey> {
    let peer = k256::PublicKey::from_sec1_bytes(peer_public_key)
        .map_err(|_| LatchError::InvalidKey("invalid secp256k1 public key".into()))?;
    let shared = k256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
    let mut input = Zeroizing::new(Vec::with_capacity(48));
    input.extend_from_slice(b"latch-ecdh-v1");
    input.extend_from_slice(shared.raw_secret_bytes());
    Ok(SecretKey::new(crypto::blake2b_256(&input)))
}
