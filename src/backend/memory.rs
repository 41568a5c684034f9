use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FieldMap, HashWrite, KeyValueStore, Transaction};
use crate::error::{Result, StoreError};

#[derive(Debug, Default)]
struct Entry {
    fields: FieldMap,
    version: u64,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: BTreeMap<String, Entry>,
    last_version: u64,
}

impl Keyspace {
    fn version_of(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.version)
    }

    fn entry_mut(&mut self, key: &str) -> &mut Entry {
        self.last_version += 1;
        let version = self.last_version;
        let entry = self.entries.entry(key.to_string()).or_default();
        entry.version = version;
        entry
    }

    fn set(&mut self, key: &str, fields: impl IntoIterator<Item = (String, Vec<u8>)>) {
        self.entry_mut(key).fields.extend(fields);
    }
}

/// In-process store with Redis hash semantics.
///
/// Every write stamps the key with a new version; a transaction commits only if the
/// versions it saw at watch time are still current. Keys iterate in sorted order.
#[derive(Clone, Default)]
pub struct MemoryStore {
    keyspace: Arc<RwLock<Keyspace>>,
    disconnected: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> Result<()> {
        ensure_connected(&self.disconnected)
    }
}

fn ensure_connected(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::SeqCst) {
        Err(StoreError::Disconnected)
    } else {
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let keyspace = self.keyspace.read().await;
        Ok(keyspace
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<Option<FieldMap>> {
        self.ensure_connected()?;
        let keyspace = self.keyspace.read().await;
        Ok(keyspace.entries.get(key).map(|e| e.fields.clone()))
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        self.ensure_connected()?;
        let keyspace = self.keyspace.read().await;
        Ok(read_fields(&keyspace, key, fields))
    }

    async fn hset(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<()> {
        self.ensure_connected()?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut keyspace = self.keyspace.write().await;
        keyspace.set(
            key,
            fields.iter().map(|(f, v)| (f.to_string(), v.clone())),
        );
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        self.ensure_connected()?;
        let mut keyspace = self.keyspace.write().await;
        if !keyspace.entries.contains_key(key) {
            return Ok(());
        }
        let entry = keyspace.entry_mut(key);
        for field in fields {
            entry.fields.remove(*field);
        }
        if entry.fields.is_empty() {
            keyspace.entries.remove(key);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut keyspace = self.keyspace.write().await;
        keyspace.entries.remove(key);
        Ok(())
    }

    async fn watch(&self, keys: &[String]) -> Result<MemoryTransaction> {
        self.ensure_connected()?;
        let keyspace = self.keyspace.read().await;
        let watched = keys
            .iter()
            .map(|k| (k.clone(), keyspace.version_of(k)))
            .collect();
        Ok(MemoryTransaction {
            keyspace: Arc::clone(&self.keyspace),
            disconnected: Arc::clone(&self.disconnected),
            watched,
        })
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    async fn connect(&self) -> Result<()> {
        self.disconnected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn read_fields(keyspace: &Keyspace, key: &str, fields: &[&str]) -> Vec<Option<Vec<u8>>> {
    let entry = keyspace.entries.get(key);
    fields
        .iter()
        .map(|f| entry.and_then(|e| e.fields.get(*f).cloned()))
        .collect()
}

pub struct MemoryTransaction {
    keyspace: Arc<RwLock<Keyspace>>,
    disconnected: Arc<AtomicBool>,
    watched: Vec<(String, Option<u64>)>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn hmget(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        ensure_connected(&self.disconnected)?;
        let keyspace = self.keyspace.read().await;
        Ok(read_fields(&keyspace, key, fields))
    }

    async fn commit(self, writes: Vec<HashWrite>) -> Result<bool> {
        ensure_connected(&self.disconnected)?;
        let mut keyspace = self.keyspace.write().await;

        let unchanged = self
            .watched
            .iter()
            .all(|(key, version)| keyspace.version_of(key) == *version);
        if !unchanged {
            return Ok(false);
        }

        for write in writes {
            keyspace.set(
                &write.key,
                write.fields.into_iter().map(|(f, v)| (f.to_string(), v)),
            );
            if write.removed.is_empty() {
                continue;
            }
            let entry = keyspace.entry_mut(&write.key);
            for field in write.removed {
                entry.fields.remove(field);
            }
            if entry.fields.is_empty() {
                keyspace.entries.remove(&write.key);
            }
        }
        Ok(true)
    }

    async fn discard(self) -> Result<()> {
        Ok(())
    }
}
