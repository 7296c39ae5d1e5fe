//! Key-value store access.
//!
//! The [`Store`] trait is the seam between the registry and the external
//! store: production runs against [`RedisStore`], the test suites against
//! [`MemoryStore`]. Callers must never treat a `StoreError` as "absent" -
//! absence is always an `Ok(None)` / `Ok(false)`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connect(#[source] redis::RedisError),

    #[error("store command failed: {0}")]
    Command(#[from] redis::RedisError),
}

/// Minimal key-value surface the gateway needs: strings with TTL, an
/// atomic create-if-absent, and plain sets.
#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Set `key` only if it does not exist, with `ttl`. Returns whether the
    /// write happened. This is the one atomicity primitive cross-pod
    /// coordination relies on.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete all `keys` in a single round trip.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Delete `key` and remove `member` from `set_key` as one pipelined batch.
    async fn delete_and_remove_member(
        &self,
        key: &str,
        set_key: &str,
        member: &str,
    ) -> Result<(), StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

/// Redis-backed store using a shared connection manager.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers a PING.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::Connect)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(StoreError::Connect)?;
        let store = Self { conn };
        store.ping().await?;
        Ok(store)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        // SET NX EX replies OK on write, nil when the key already exists
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn delete_and_remove_member(
        &self,
        key: &str,
        set_key: &str,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .del(key)
            .srem(set_key, member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }
}

#[derive(Debug)]
struct StringEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl StringEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    strings: HashMap<String, StringEntry>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryInner {
    /// Drop the entry if its TTL has lapsed, then read it.
    fn live_value(&mut self, key: &str) -> Option<&str> {
        if self.strings.get(key).map(StringEntry::is_expired) == Some(true) {
            self.strings.remove(key);
        }
        self.strings.get(key).map(|e| e.value.as_str())
    }
}

/// In-process store with the same semantics as [`RedisStore`], including
/// lazy TTL expiry on `tokio::time::Instant` so tests can cross TTLs with
/// paused time. Backs the unit and integration suites.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.live_value(key).map(str::to_string))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.live_value(key).is_some() {
            return Ok(false);
        }
        inner.strings.insert(
            key.to_string(),
            StringEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.live_value(key).is_some() {
            if let Some(entry) = inner.strings.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for key in keys {
            inner.strings.remove(key);
            inner.sets.remove(key);
        }
        Ok(())
    }

    async fn delete_and_remove_member(
        &self,
        key: &str,
        set_key: &str,
        member: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.remove(key);
        if let Some(set) = inner.sets.get_mut(set_key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}
