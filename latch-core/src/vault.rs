// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The secret store.
//!
//! Every secret record is encrypted under a subkey of the password-derived
//! master key held by the [`PasswordSession`]. Plaintext keys only exist
//! inside [`Vault::with_decrypted`] and [`Vault::with_decrypted_mnemonic`].
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bip39::{Language, Mnemonic};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, Argon2Params, EncryptedData, SecretKey, SALT_SIZE};
use crate::error::{LatchError, Result};
use crate::keys::{normalize_address, KeyMaterial, NetworkFamily, PublicAccount};
use crate::rate_limit::AttemptLimiter;
use crate::records::{
    self, keypair_key, mnemonic_key, AccountInfo, KeyOrigin, KeyPairRecord, MnemonicInfo,
    MnemonicRecord, VaultHeader, HEADER_KEY, KEYPAIR_PREFIX, MNEMONIC_PREFIX,
};
use crate::session::PasswordSession;
use crate::store::KeyValueStore;

pub(crate) const CHECK_CONTEXT: &[u8] = b"latch-check";
pub(crate) const RECORD_CONTEXT: &[u8] = b"latch-record-key";
pub(crate) const MNEMONIC_CONTEXT: &[u8] = b"latch-mnemonic-key";
const CHECK_PLAINTEXT: &[u8] = b"latch vault check v1";

pub struct Vault {
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) session: Arc<PasswordSession>,
    pub(crate) header: parking_lot::RwLock<VaultHeader>,
    limiter: AttemptLimiter,
    /// Shared by record operations, exclusive for password change.
    pub(crate) records_guard: AsyncRwLock<()>,
    live_plaintext: AtomicUsize,
}

/// Decrypted key material that counts itself while alive.
struct Scoped<'a> {
    material: KeyMaterial,
    counter: &'a AtomicUsize,
}

impl<'a> Scoped<'a> {
    fn new(material: KeyMaterial, counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { material, counter }
    }
}

impl Drop for Scoped<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Vault {
    /// Initialises a new vault in `store` and unlocks `session`.
    pub async fn create(
        store: Arc<dyn KeyValueStore>,
        session: Arc<PasswordSession>,
        password: &str,
        params: Argon2Params,
    ) -> Result<Self> {
        if store.get(HEADER_KEY).await?.is_some() {
            return Err(LatchError::AlreadyExists);
        }

        let salt: [u8; SALT_SIZE] = crypto::random_bytes();
        let master = derive_master(password, salt, params).await?;
        let header = new_header(salt, params, &master)?;
        store.set(HEADER_KEY, &records::encode(&header)?).await?;
        session.establish(master);
        info!("vault created");

        Ok(Self::from_parts(store, session, header))
    }

    /// Opens an existing vault, finishing any interrupted password change.
    pub async fn open(
        store: Arc<dyn KeyValueStore>,
        session: Arc<PasswordSession>,
    ) -> Result<Self> {
        crate::rotation::recover_interrupted(store.as_ref()).await?;

        let header_bytes = store
            .get(HEADER_KEY)
            .await?
            .ok_or(LatchError::NotInitialized)?;
        let header: VaultHeader = records::decode(&header_bytes)?;
        if header.version != VaultHeader::VERSION {
            return Err(LatchError::Other(format!(
                "unsupported vault version {}",
                header.version
            )));
        }
        debug!("vault opened");
        Ok(Self::from_parts(store, session, header))
    }

    fn from_parts(
        store: Arc<dyn KeyValueStore>,
        session: Arc<PasswordSession>,
        header: VaultHeader,
    ) -> Self {
        Self {
            store,
            session,
            header: parking_lot::RwLock::new(header),
            limiter: AttemptLimiter::new(),
            records_guard: AsyncRwLock::new(()),
            live_plaintext: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    pub fn session(&self) -> &Arc<PasswordSession> {
        &self.session
    }

    pub fn is_unlocked(&self) -> bool {
        self.session.is_unlocked()
    }

    pub fn lock(&self) {
        self.session.clear();
    }

    /// Number of decrypted keys currently alive inside scoped operations.
    pub fn decrypted_in_use(&self) -> usize {
        self.live_plaintext.load(Ordering::SeqCst)
    }

    pub async fn authenticate(&self, password: &str) -> Result<()> {
        if let Err(secs) = self.limiter.check() {
            warn!(retry_after = secs, "authentication rate limited");
            return Err(LatchError::RateLimited(secs));
        }

        let _guard = self.records_guard.read().await;
        let header = self.header.read().clone();
        let master = derive_master(password, header.salt, header.argon2).await?;
        if verify_check(&header, &master) {
            self.session.establish(master);
            self.limiter.record_success();
            info!("vault unlocked");
            Ok(())
        } else {
            self.session.clear();
            self.limiter.record_failure();
            warn!(
                failed_attempts = self.limiter.failed_attempts(),
                "authentication failed"
            );
            Err(LatchError::InvalidPassword)
        }
    }

    fn master(&self) -> Result<SecretKey> {
        self.session.secret().ok_or(LatchError::Locked)
    }

    /// Runs `f` with the decrypted key for `address`.
    ///
    /// The key is zeroized when `f` returns, errors or panics. A record that
    /// fails to decrypt locks the session.
    pub async fn with_decrypted<T, F>(&self, address: &str, f: F) -> Result<T>
    where
        F: FnOnce(&KeyMaterial) -> Result<T>,
    {
        let _guard = self.records_guard.read().await;
        let record = self.load_keypair(address).await?;
        let encrypted = record
            .encrypted_secret
            .as_deref()
            .ok_or_else(|| LatchError::HardwareAccount(record.address.clone()))?;
        let master = self.master()?;

        let material = match decrypt_secret(&master, record.family, encrypted) {
            Ok(material) => material,
            Err(e) => {
                self.session.clear();
                warn!(address = %record.address, "key decryption failed, session cleared");
                return Err(e);
            }
        };

        let scoped = Scoped::new(material, &self.live_plaintext);
        f(&scoped.material)
    }

    /// Runs `f` with the decrypted phrase of mnemonic `id`.
    pub async fn with_decrypted_mnemonic<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&str) -> Result<T>,
    {
        let _guard = self.records_guard.read().await;
        self.mnemonic_scoped(id, f).await
    }

    async fn mnemonic_scoped<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&str) -> Result<T>,
    {
        let record = self.load_mnemonic(id).await?;
        let master = self.master()?;
        let key = crypto::derive_subkey(&master, MNEMONIC_CONTEXT);
        let phrase = EncryptedData::from_bytes(&record.encrypted_phrase)
            .and_then(|e| crypto::decrypt(&e, &key))
            .and_then(|p| {
                String::from_utf8(p.to_vec())
                    .map(Zeroizing::new)
                    .map_err(|_| LatchError::DecryptionFailed)
            });
        let phrase = match phrase {
            Ok(phrase) => phrase,
            Err(e) => {
                self.session.clear();
                warn!(mnemonic = %id, "mnemonic decryption failed, session cleared");
                return Err(e);
            }
        };
        f(&phrase)
    }

    pub async fn generate_account(&self, family: NetworkFamily, name: &str) -> Result<AccountInfo> {
        let _guard = self.records_guard.read().await;
        let master = self.master()?;
        let material = KeyMaterial::generate(family)?;
        self.insert_keypair(&master, &material, name, KeyOrigin::Generated)
            .await
    }

    /// Imports a raw 32-byte secret.
    pub async fn import_account(
        &self,
        family: NetworkFamily,
        secret: &[u8],
        name: &str,
    ) -> Result<AccountInfo> {
        let _guard = self.records_guard.read().await;
        let master = self.master()?;
        if secret.len() != 32 {
            return Err(LatchError::InvalidKey("secret key must be 32 bytes".into()));
        }
        let mut bytes = Zeroizing::new([0u8; 32]);
        bytes.copy_from_slice(secret);
        let material = KeyMaterial::from_secret_bytes(family, &mut bytes)?;
        self.insert_keypair(&master, &material, name, KeyOrigin::Imported)
            .await
    }

    /// Adds an account whose secret lives elsewhere (hardware or QR signer).
    pub async fn add_external_account(
        &self,
        family: NetworkFamily,
        public_key: &[u8],
        name: &str,
        hardware: bool,
    ) -> Result<AccountInfo> {
        let _guard = self.records_guard.read().await;
        self.master()?;
        let account = PublicAccount::from_public_key(family, public_key.to_vec())?;
        let record = KeyPairRecord {
            address: account.address,
            family,
            public_key: account.public_key,
            encrypted_secret: None,
            name: name.to_string(),
            origin: KeyOrigin::External,
            hardware,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.put_new_keypair(record).await
    }

    pub async fn derive_account(
        &self,
        mnemonic_id: &str,
        family: NetworkFamily,
        index: u32,
        name: &str,
    ) -> Result<AccountInfo> {
        let _guard = self.records_guard.read().await;
        let material = self
            .mnemonic_scoped(mnemonic_id, |phrase| {
                let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
                    .map_err(|_| LatchError::InvalidMnemonic)?;
                let seed = Zeroizing::new(mnemonic.to_seed(""));
                KeyMaterial::derive_from_seed(seed.as_slice(), family, index)
            })
            .await?;
        let master = self.master()?;
        let origin = KeyOrigin::Derived {
            mnemonic: mnemonic_id.to_string(),
            index,
        };
        self.insert_keypair(&master, &material, name, origin).await
    }

    pub async fn remove_account(&self, address: &str) -> Result<()> {
        let _guard = self.records_guard.read().await;
        self.master()?;
        let address = normalize_address(address);
        if !self.store.remove(&keypair_key(&address)).await? {
            return Err(LatchError::KeyNotFound(address));
        }
        info!(address = %address, "account removed");
        Ok(())
    }

    pub async fn accounts(&self) -> Result<Vec<AccountInfo>> {
        let mut accounts = self
            .store
            .list(KEYPAIR_PREFIX)
            .await?
            .iter()
            .map(|(_, v)| records::decode::<KeyPairRecord>(v).map(|r| r.info()))
            .collect::<Result<Vec<_>>>()?;
        accounts.sort_by_key(|a| a.created_at);
        Ok(accounts)
    }

    pub async fn account(&self, address: &str) -> Result<AccountInfo> {
        Ok(self.load_keypair(address).await?.info())
    }

    pub async fn public_account(&self, address: &str) -> Result<PublicAccount> {
        let record = self.load_keypair(address).await?;
        Ok(PublicAccount {
            family: record.family,
            public_key: record.public_key,
            address: record.address,
        })
    }

    /// Stores a user-supplied phrase. The user already holds it, so its
    /// backup counts as confirmed.
    pub async fn add_mnemonic(&self, phrase: &str, label: &str) -> Result<MnemonicInfo> {
        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase.trim())
            .map_err(|_| LatchError::InvalidMnemonic)?;
        let _guard = self.records_guard.read().await;
        self.insert_mnemonic(&mnemonic, label, true).await
    }

    /// Creates a fresh phrase of `words` words. Its backup starts unconfirmed.
    pub async fn generate_mnemonic(&self, label: &str, words: usize) -> Result<MnemonicInfo> {
        let entropy_len = match words {
            12 => 16,
            15 => 20,
            18 => 24,
            21 => 28,
            24 => 32,
            _ => {
                return Err(LatchError::Other(format!(
                    "unsupported mnemonic length {words}"
                )))
            }
        };
        let entropy: Zeroizing<[u8; 32]> = Zeroizing::new(crypto::random_bytes());
        let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy[..entropy_len])
            .map_err(|_| LatchError::InvalidMnemonic)?;
        let _guard = self.records_guard.read().await;
        self.insert_mnemonic(&mnemonic, label, false).await
    }

    pub async fn confirm_mnemonic_backup(&self, id: &str) -> Result<()> {
        let _guard = self.records_guard.read().await;
        let mut record = self.load_mnemonic(id).await?;
        if !record.backup_confirmed {
            record.backup_confirmed = true;
            self.store
                .set(&mnemonic_key(id), &records::encode(&record)?)
                .await?;
            info!(mnemonic = %id, "mnemonic backup confirmed");
        }
        Ok(())
    }

    pub async fn mnemonics(&self) -> Result<Vec<MnemonicInfo>> {
        let mut list = self
            .store
            .list(MNEMONIC_PREFIX)
            .await?
            .iter()
            .map(|(_, v)| records::decode::<MnemonicRecord>(v).map(|r| r.info()))
            .collect::<Result<Vec<_>>>()?;
        list.sort_by_key(|m| m.created_at);
        Ok(list)
    }

    async fn insert_mnemonic(
        &self,
        mnemonic: &Mnemonic,
        label: &str,
        backup_confirmed: bool,
    ) -> Result<MnemonicInfo> {
        let master = self.master()?;
        let key = crypto::derive_subkey(&master, MNEMONIC_CONTEXT);
        let phrase = Zeroizing::new(mnemonic.to_string());
        let encrypted = crypto::encrypt(phrase.as_bytes(), &key)?;

        let id = hex::encode(crypto::random_bytes::<8>());
        let record = MnemonicRecord {
            id: id.clone(),
            label: label.to_string(),
            encrypted_phrase: encrypted.to_bytes(),
            backup_confirmed,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store
            .set(&mnemonic_key(&id), &records::encode(&record)?)
            .await?;
        info!(mnemonic = %id, backup_confirmed, "mnemonic stored");
        Ok(record.info())
    }

    async fn insert_keypair(
        &self,
        master: &SecretKey,
        material: &KeyMaterial,
        name: &str,
        origin: KeyOrigin,
    ) -> Result<AccountInfo> {
        let key = crypto::derive_subkey(master, RECORD_CONTEXT);
        let encrypted = crypto::encrypt(material.secret_bytes(), &key)?;
        let record = KeyPairRecord {
            address: material.address()?,
            family: material.family(),
            public_key: material.public_key()?,
            encrypted_secret: Some(encrypted.to_bytes()),
            name: name.to_string(),
            origin,
            hardware: false,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.put_new_keypair(record).await
    }

    async fn put_new_keypair(&self, record: KeyPairRecord) -> Result<AccountInfo> {
        let key = keypair_key(&record.address);
        if self.store.get(&key).await?.is_some() {
            return Err(LatchError::KeyAlreadyExists(record.address));
        }
        self.store.set(&key, &records::encode(&record)?).await?;
        info!(address = %record.address, family = %record.family, "account stored");
        Ok(record.info())
    }

    pub(crate) async fn load_keypair(&self, address: &str) -> Result<KeyPairRecord> {
        let address = normalize_address(address);
        let bytes = self
            .store
            .get(&keypair_key(&address))
            .await?
            .ok_or(LatchError::KeyNotFound(address))?;
        records::decode(&bytes)
    }

    async fn load_mnemonic(&self, id: &str) -> Result<MnemonicRecord> {
        let bytes = self
            .store
            .get(&mnemonic_key(id))
            .await?
            .ok_or_else(|| LatchError::MnemonicNotFound(id.to_string()))?;
        records::decode(&bytes)
    }
}

/// Runs Argon2 on the blocking pool.
pub(crate) async fn derive_master(
    password: &str,
    salt: [u8; SALT_SIZE],
    params: Argon2Params,
) -> Result<SecretKey> {
    let password = Zeroizing::new(password.as_bytes().to_vec());
    tokio::task::spawn_blocking(move || crypto::derive_key(&password, &salt, params))
        .await
        .map_err(|e| LatchError::Other(format!("key derivation task failed: {e}")))?
}

pub(crate) fn new_header(
    salt: [u8; SALT_SIZE],
    params: Argon2Params,
    master: &SecretKey,
) -> Result<VaultHeader> {
    let check_key = crypto::derive_subkey(master, CHECK_CONTEXT);
    let check = crypto::encrypt(CHECK_PLAINTEXT, &check_key)?;
    Ok(VaultHeader {
        version: VaultHeader::VERSION,
        salt,
        argon2: params,
        check: check.to_bytes(),
        created_at: chrono::Utc::now().timestamp(),
    })
}

pub(crate) fn verify_check(header: &VaultHeader, master: &SecretKey) -> bool {
    let check_key = crypto::derive_subkey(master, CHECK_CONTEXT);
    EncryptedData::from_bytes(&header.check)
        .and_then(|e| crypto::decrypt(&e, &check_key))
        .map(|plain| bool::from(plain.as_slice().ct_eq(CHECK_PLAINTEXT)))
        .unwrap_or(false)
}

pub(crate) fn decrypt_secret(
    master: &SecretKey,
    family: NetworkFamily,
    encrypted: &[u8],
) -> Result<KeyMaterial> {
    let key = crypto::derive_subkey(master, RECORD_CONTEXT);
    let plaintext = crypto::decrypt(&EncryptedData::from_bytes(encrypted)?, &key)?;
    if plaintext.len() != 32 {
        return Err(LatchError::DecryptionFailed);
    }
    let mut bytes = Zeroizing::new([0u8; 32]);
    bytes.copy_from_slice(&plaintext);
    KeyMaterial::from_secret_bytes(family, &mut bytes).map_err(|_| LatchError::DecryptionFailed)
}
