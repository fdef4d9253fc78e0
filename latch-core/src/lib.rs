// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Latch Core - encrypted secret store for the latch wallet backend
//!
//! This crate provides:
//! - Argon2id key derivation and XChaCha20-Poly1305 record encryption
//! - EVM (secp256k1) and substrate (ed25519) key material
//! - A password session with scoped, zeroize-on-exit key access
//! - Atomic password change with backup and rollback

#![forbid(unsafe_code)]

pub mod crypto;
pub mod error;
pub mod keys;
pub mod rate_limit;
pub mod records;
mod rotation;
pub mod session;
pub mod store;
pub mod vault;

pub use crypto::Argon2Params;
pub use error::{LatchError, Result};
pub use keys::{KeyMaterial, NetworkFamily, PublicAccount};
pub use records::{AccountInfo, KeyOrigin, MnemonicInfo};
pub use session::PasswordSession;
pub use store::{KeyValueStore, MemoryStore, RedbStore};
pub use vault::Vault;
