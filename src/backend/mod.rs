//! Key-value storage the job store runs on.
//!
//! Jobs live as one hash per key. Besides plain hash reads and writes the store has to
//! offer an optimistic transaction: watch some keys, read, then commit a batch of writes
//! that is dropped whole if any watched key changed in between.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Every field of one hash.
pub type FieldMap = HashMap<String, Vec<u8>>;

/// Fields to set and delete on one key as part of a transaction. Sets apply first.
#[derive(Debug, Clone)]
pub struct HashWrite {
    pub key: String,
    pub fields: Vec<(&'static str, Vec<u8>)>,
    pub removed: Vec<&'static str>,
}

impl HashWrite {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            fields: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn set(mut self, field: &'static str, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push((field, value.into()));
        self
    }

    pub fn set_all(mut self, fields: Vec<(&'static str, Vec<u8>)>) -> Self {
        self.fields.extend(fields);
        self
    }

    pub fn remove(mut self, field: &'static str) -> Self {
        self.removed.push(field);
        self
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    type Transaction: Transaction;

    /// Every key starting with `prefix`. No ordering or snapshot guarantee.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// All fields of `key`, or `None` if the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<Option<FieldMap>>;

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn hset(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<()>;

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    /// Starts an optimistic transaction watching `keys`.
    async fn watch(&self, keys: &[String]) -> Result<Self::Transaction>;

    /// Drops the live connection. Must be called before forking.
    async fn disconnect(&self);

    /// Re-establishes the connection dropped by `disconnect`.
    async fn connect(&self) -> Result<()>;
}

#[async_trait]
pub trait Transaction: Send {
    /// Reads through the watching connection.
    async fn hmget(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Applies `writes` atomically. Returns `false`, with nothing applied, when a
    /// watched key was modified after the watch started.
    async fn commit(self, writes: Vec<HashWrite>) -> Result<bool>;

    async fn discard(self) -> Result<()>;
}
