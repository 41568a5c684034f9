use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use super::{FieldMap, HashWrite, KeyValueStore, Transaction};
use crate::error::{Result, StoreError};

const SCAN_COUNT: usize = 100;
const MAX_IDLE_TX_CONNECTIONS: usize = 8;

type IdleConnections = Arc<Mutex<Vec<MultiplexedConnection>>>;

/// Redis-backed store.
///
/// Plain commands share one multiplexed connection. `WATCH` state belongs to the
/// connection that issued it, so each transaction takes a connection nobody else
/// writes to. Those come from a small idle pool and go back once EXEC or UNWATCH ran.
pub struct RedisStore {
    client: redis::Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    idle: IdleConnections,
}

impl RedisStore {
    pub async fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!("connected to redis at {}", url);

        Ok(Self {
            client,
            conn: RwLock::new(Some(conn)),
            idle: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or(StoreError::Disconnected)
    }
}

/// Escapes glob metacharacters so a namespace is matched literally by `SCAN MATCH`.
pub(crate) fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn hset_cmd(key: &str, fields: &[(&str, Vec<u8>)]) -> redis::Cmd {
    let mut cmd = redis::cmd("HSET");
    cmd.arg(key);
    for (field, value) in fields {
        cmd.arg(*field).arg(value.as_slice());
    }
    cmd
}

#[async_trait]
impl KeyValueStore for RedisStore {
    type Transaction = RedisTransaction;

    #[instrument(skip(self), err)]
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", glob_escape(prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        // SCAN may report a key more than once across iterations.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn hgetall(&self, key: &str) -> Result<Option<FieldMap>> {
        let mut conn = self.conn().await?;
        let fields: FieldMap = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?)
    }

    async fn hset(&self, key: &str, fields: &[(&str, Vec<u8>)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let _: i64 = hset_cmd(key, fields).query_async(&mut conn).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn watch(&self, keys: &[String]) -> Result<RedisTransaction> {
        if self.conn.read().await.is_none() {
            return Err(StoreError::Disconnected);
        }
        let pooled = self.idle.lock().await.pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };
        if !keys.is_empty() {
            let _: () = redis::cmd("WATCH").arg(keys).query_async(&mut conn).await?;
        }
        Ok(RedisTransaction {
            conn,
            idle: Arc::clone(&self.idle),
        })
    }

    async fn disconnect(&self) {
        self.idle.lock().await.clear();
        if self.conn.write().await.take().is_some() {
            debug!("dropped redis connection");
        }
    }

    async fn connect(&self) -> Result<()> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.conn.write().await = Some(conn);
        debug!("re-established redis connection");
        Ok(())
    }
}

pub struct RedisTransaction {
    conn: MultiplexedConnection,
    idle: IdleConnections,
}

impl RedisTransaction {
    /// Hands the connection back once no WATCH is pending on it.
    async fn recycle(self) {
        let mut idle = self.idle.lock().await;
        if idle.len() < MAX_IDLE_TX_CONNECTIONS {
            idle.push(self.conn);
        }
    }
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn hmget(&mut self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>> {
        Ok(redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn)
            .await?)
    }

    async fn commit(mut self, writes: Vec<HashWrite>) -> Result<bool> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for write in &writes {
            if !write.fields.is_empty() {
                pipe.add_command(hset_cmd(&write.key, &write.fields));
            }
            if !write.removed.is_empty() {
                pipe.cmd("HDEL").arg(&write.key).arg(&write.removed);
            }
        }
        // EXEC answers nil when a watched key changed.
        let replies: Option<Vec<redis::Value>> = pipe.query_async(&mut self.conn).await?;
        self.recycle().await;
        Ok(replies.is_some())
    }

    async fn discard(mut self) -> Result<()> {
        let _: () = redis::cmd("UNWATCH").query_async(&mut self.conn).await?;
        self.recycle().await;
        Ok(())
    }
}
