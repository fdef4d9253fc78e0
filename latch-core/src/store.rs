// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Key-value persistence for encrypted blobs.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableDatabase, TableDefinition};
use tracing::debug;

use crate::error::{LatchError, Result};

/// Namespaced blob store.
///
/// Implementations must be thread-safe (`Send + Sync`). Writes to different
/// keys are independent; callers needing multi-key atomicity build it
/// themselves.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns true if the key existed.
    async fn remove(&self, key: &str) -> Result<bool>;
    /// All entries whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
}

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Redb-backed store (default on disk).
///
/// Transactions run on the blocking pool so commits never stall the runtime.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn create(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;
        let wtxn = db.begin_write()?;
        wtxn.open_table(ENTRIES)?;
        wtxn.commit()?;
        debug!(path = %path.display(), "store opened");
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| LatchError::Storage(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl KeyValueStore for RedbStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        self.blocking(move |db| {
            let rtxn = db.begin_read()?;
            let table = rtxn.open_table(ENTRIES)?;
            Ok(table.get(key.as_str())?.map(|v| v.value().to_vec()))
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = key.to_string();
        let value = value.to_vec();
        self.blocking(move |db| {
            let wtxn = db.begin_write()?;
            wtxn.open_table(ENTRIES)?.insert(key.as_str(), value.as_slice())?;
            wtxn.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.blocking(move |db| {
            let wtxn = db.begin_write()?;
            let existed = wtxn.open_table(ENTRIES)?.remove(key.as_str())?.is_some();
            wtxn.commit()?;
            Ok(existed)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = prefix.to_string();
        self.blocking(move |db| {
            let rtxn = db.begin_read()?;
            let table = rtxn.open_table(ENTRIES)?;
            let mut out = Vec::new();
            for entry in table.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                let key = k.value();
                if !key.starts_with(prefix.as_str()) {
                    break;
                }
                out.push((key.to_string(), v.value().to_vec()));
            }
            Ok(out)
        })
        .await
    }
}

/// In-memory store for tests and ephemeral vaults.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn exercise(store: &dyn KeyValueStore) {
        assert!(store.get("keypair/a").await.unwrap().is_none());

        store.set("keypair/a", b"one").await.unwrap();
        store.set("keypair/b", b"two").await.unwrap();
        store.set("mnemonic/x", b"three").await.unwrap();
        assert_eq!(store.get("keypair/a").await.unwrap(), Some(b"one".to_vec()));

        let keypairs = store.list("keypair/").await.unwrap();
        assert_eq!(keypairs.len(), 2);
        assert_eq!(keypairs[0].0, "keypair/a");

        assert!(store.remove("keypair/a").await.unwrap());
        assert!(!store.remove("keypair/a").await.unwrap());
        assert_eq!(store.list("keypair/").await.unwrap().len(), 1);
        assert!(store.list("tx/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_redb_store() {
        let dir = tempdir().unwrap();
        let store = RedbStore::create(&dir.path().join("latch.db")).unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_redb_store_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latch.db");
        {
            let store = RedbStore::create(&path).unwrap();
            store.set("vault/header", b"h").await.unwrap();
        }
        let store = RedbStore::create(&path).unwrap();
        assert_eq!(store.get("vault/header").await.unwrap(), Some(b"h".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_redb_store_concurrent_writers() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RedbStore::create(&dir.path().join("latch.db")).unwrap());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .set(&format!("tx/eth/{i:02}"), &[i as u8])
                        .await
                        .unwrap()
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }
        let all = store.list("tx/").await.unwrap();
        assert_eq!(all.len(), 8);
        assert_eq!(all[3], ("tx/eth/03".to_string(), vec![3]));
    }
}
