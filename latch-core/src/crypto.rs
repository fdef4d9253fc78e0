// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

#![forbid(unsafe_code)]

use argon2::{Algorithm, Argon2, Params, Version};
use blake2::{Blake2b512, Digest};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    XChaCha20Poly1305,
};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use sha3::Keccak256;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{LatchError, Result};

pub const SALT_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Params {
    pub const TESTING: Self = Self {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    pub const DEFAULT: Self = Self {
        memory_kib: 256 * 1024,
        iterations: 4,
        parallelism: 4,
    };

    pub const HIGH: Self = Self {
        memory_kib: 512 * 1024,
        iterations: 6,
        parallelism: 4,
    };
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A 32-byte symmetric key that is zeroized when dropped.
pub struct SecretKey(SecretBox<[u8; KEY_SIZE]>);

impl SecretKey {
    /// Takes ownership of `bytes` and zeroes the caller's copy.
    pub fn new(mut bytes: [u8; KEY_SIZE]) -> Self {
        let key = Self(SecretBox::new(Box::new(bytes)));
        bytes.zeroize();
        key
    }

    pub fn generate() -> Self {
        Self::new(random_bytes())
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(LatchError::InvalidKey("invalid key length".into()));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self::new(bytes))
    }

    pub fn expose(&self) -> &[u8; KEY_SIZE] {
        self.0.expose_secret()
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self::new(*self.expose())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

pub fn derive_key(
    password: &[u8],
    salt: &[u8; SALT_SIZE],
    params: Argon2Params,
) -> Result<SecretKey> {
    let argon2_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| LatchError::Other(format!("Argon2 params error: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut output = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| LatchError::Other(format!("Argon2 error: {}", e)))?;

    Ok(SecretKey::new(output))
}

pub fn derive_subkey(master_key: &SecretKey, context: &[u8]) -> SecretKey {
    let mut hasher = Blake2b512::new();
    hasher.update(master_key.expose());
    hasher.update(context);
    let mut result = hasher.finalize();

    let mut output = [0u8; KEY_SIZE];
    output.copy_from_slice(&result[..KEY_SIZE]);
    result.as_mut_slice().zeroize();
    SecretKey::new(output)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedData {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
}

impl EncryptedData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        result.extend_from_slice(&self.nonce);
        result.extend_from_slice(&self.ciphertext);
        result
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(LatchError::DecryptionFailed);
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[..NONCE_SIZE]);

        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_SIZE..].to_vec(),
        })
    }
}

pub fn encrypt(plaintext: &[u8], key: &SecretKey) -> Result<EncryptedData> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.expose()));

    let nonce: [u8; NONCE_SIZE] = random_bytes();
    let nonce_ga = GenericArray::from_slice(&nonce);

    let ciphertext = cipher
        .encrypt(nonce_ga, plaintext)
        .map_err(|_| LatchError::Encryption("Encryption failed".into()))?;

    Ok(EncryptedData { ciphertext, nonce })
}

pub fn decrypt(encrypted: &EncryptedData, key: &SecretKey) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(key.expose()));
    let nonce = GenericArray::from_slice(&encrypted.nonce);

    cipher
        .decrypt(nonce, encrypted.ciphertext.as_ref())
        .map(Zeroizing::new)
        .map_err(|_| LatchError::DecryptionFailed)
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b512::new();
    hasher.update(data);
    let result = hasher.finalize();

    let mut output = [0u8; 32];
    output.copy_from_slice(&result[..32]);
    output
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut output = [0u8; 32];
    output.copy_from_slice(&Keccak256::digest(data));
    output
}

pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation() {
        let password = b"test password";
        let salt: [u8; SALT_SIZE] = random_bytes();

        let key1 = derive_key(password, &salt, Argon2Params::TESTING).unwrap();
        let key2 = derive_key(password, &salt, Argon2Params::TESTING).unwrap();
        assert_eq!(key1.expose(), key2.expose());

        let key3 = derive_key(b"different", &salt, Argon2Params::TESTING).unwrap();
        assert_ne!(key1.expose(), key3.expose());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SecretKey::generate();
        let plaintext = b"Hello, latch!";

        let encrypted = encrypt(plaintext, &key).unwrap();
        let decrypted = decrypt(&encrypted, &key).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let key = SecretKey::generate();
        let wrong_key = SecretKey::generate();

        let encrypted = encrypt(b"Secret data", &key).unwrap();
        assert!(matches!(
            decrypt(&encrypted, &wrong_key),
            Err(LatchError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_subkey_derivation() {
        let master = SecretKey::generate();

        let subkey1 = derive_subkey(&master, b"header");
        let subkey2 = derive_subkey(&master, b"data");
        assert_ne!(subkey1.expose(), subkey2.expose());

        let subkey1_again = derive_subkey(&master, b"header");
        assert_eq!(subkey1.expose(), subkey1_again.expose());
    }

    #[test]
    fn test_encrypted_data_rejects_truncated() {
        assert!(EncryptedData::from_bytes(&[0u8; NONCE_SIZE]).is_err());
    }

    #[test]
    fn test_keccak_known_vector() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_secret_key_debug_redacted() {
        let key = SecretKey::generate();
        assert_eq!(format!("{key:?}"), "SecretKey([REDACTED])");
    }
}
