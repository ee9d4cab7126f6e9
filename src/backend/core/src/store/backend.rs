//! Result store backend implementations.
//!
//! Key/value storage with per-key expiry:
//! - **InMemoryStore**: DashMap-backed store for tests and single-process deployments
//! - **RedisStore**: Shared store using `SET EX`, so Redis evicts expired records itself

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{counter, gauge};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::error::{ErrorCode, Result, TransmuteError};

// ═══════════════════════════════════════════════════════════════════════════════
// Store Statistics
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub size_bytes: u64,
    pub expired: u64,
    /// Backend-specific stats
    pub backend_stats: HashMap<String, String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Result Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Key/value store with per-key TTL.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Get a value; expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Get several values, preserving order.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        futures::future::try_join_all(keys.iter().map(|key| self.get(key))).await
    }

    /// Set a value that becomes unreadable after `ttl`.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

struct StoredEntry {
    data: Vec<u8>,
    expires_at: Instant,
}

impl StoredEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory result store.
#[derive(Default)]
pub struct InMemoryStore {
    entries: DashMap<String, StoredEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries; returns how many were removed.
    pub fn cleanup_expired(&self) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = (before - self.entries.len()) as u64;

        if removed > 0 {
            self.expired.fetch_add(removed, Ordering::Relaxed);
            debug!("Cleaned up {} expired result records", removed);
        }
        removed
    }

    /// Run `cleanup_expired` every `interval` until `shutdown` fires.
    pub fn spawn_cleanup(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.cleanup_expired();
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ResultStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            Ok(Some(entry.data.clone()))
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                data: value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let entries = self.entries.len() as u64;
        let size_bytes = self.entries.iter().map(|e| e.data.len() as u64).sum();

        gauge!("transmute_store_entries", "backend" => "in_memory").set(entries as f64);

        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            size_bytes,
            expired: self.expired.load(Ordering::Relaxed),
            backend_stats: HashMap::new(),
        })
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Open a managed Redis connection, shared by the result store and the broker.
pub async fn connect_manager(config: &RedisConfig, url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url).map_err(|e| {
        TransmuteError::with_internal(
            ErrorCode::ConfigurationError,
            "Invalid Redis URL",
            e.to_string(),
        )
    })?;

    let conn = tokio::time::timeout(config.connection_timeout, ConnectionManager::new(client))
        .await
        .map_err(|_| {
            TransmuteError::new(ErrorCode::StoreUnavailable, "Timed out connecting to Redis")
        })??;
    Ok(conn)
}

/// Redis result store.
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisStore {
    /// Connect and verify the server answers PING.
    pub async fn connect(config: &RedisConfig, url: &str) -> Result<Self> {
        let conn = connect_manager(config, url).await?;
        Self::from_connection(conn, config.key_prefix.clone()).await
    }

    /// Wrap an existing connection (shared with the broker).
    pub async fn from_connection(mut conn: ConnectionManager, key_prefix: String) -> Result<Self> {
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(prefix = %key_prefix, "Redis result store connected");

        Ok(Self {
            conn,
            key_prefix,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Build the full key with prefix.
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn count(&self, found: bool) {
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl ResultStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;
        self.count(data.is_some());
        Ok(data)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let full_keys: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&full_keys)
            .query_async(&mut conn)
            .await?;
        for value in &values {
            self.count(value.is_some());
        }
        Ok(values)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(self.full_key(key), value, secs).await?;
        counter!("transmute_store_writes_total", "backend" => "redis").increment(1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(self.full_key(key)).await?;
        Ok(deleted > 0)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut conn = self.conn.clone();
        let info: String = redis::cmd("INFO").arg("memory").query_async(&mut conn).await?;

        let mut backend_stats = HashMap::new();
        for line in info.lines() {
            if let Some(value) = line.strip_prefix("used_memory_human:") {
                backend_stats.insert("used_memory_human".to_string(), value.trim().to_string());
            }
        }

        let dbsize: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;

        Ok(StoreStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: dbsize,
            size_bytes: 0,
            expired: 0,
            backend_stats,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryStore::new();

        store.set("key1", b"data".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("key1").await.unwrap(), Some(b"data".to_vec()));
        assert_eq!(store.get("missing").await.unwrap(), None);

        assert!(store.delete("key1").await.unwrap());
        assert!(!store.delete("key1").await.unwrap());
        assert_eq!(store.get("key1").await.unwrap(), None);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_memory_ttl_expiry() {
        let store = InMemoryStore::new();
        store.set("short", vec![1], Duration::from_secs(10)).await.unwrap();
        store.set("long", vec![2], Duration::from_secs(3600)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap(), Some(vec![2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.set(&format!("k{}", i), vec![i], Duration::from_secs(5)).await.unwrap();
        }
        store.set("keep", vec![9], Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.cleanup_expired(), 5);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.expired, 5);
    }

    #[tokio::test]
    async fn test_get_many_preserves_order() {
        let store = InMemoryStore::new();
        store.set("a", vec![1], Duration::from_secs(60)).await.unwrap();
        store.set("c", vec![3], Duration::from_secs(60)).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = store.get_many(&keys).await.unwrap();
        assert_eq!(values, vec![Some(vec![1]), None, Some(vec![3])]);
    }
}
