use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::lock_utils::lock_or_recover;

/// PTTL reply for a key that does not exist
pub const PTTL_MISSING: i64 = -2;
/// PTTL reply for a key that exists without an expiry
pub const PTTL_NO_EXPIRY: i64 = -1;

/// Remote key-value store used by the rate limiter and session manager.
///
/// Mirrors the handful of Redis commands the guard needs. `incr` must be atomic
/// on the backend; it is the only cross-instance synchronisation the rate limiter has.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value with an expiry in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Atomically increment an integer counter, creating it at 1
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    /// Set a key's expiry; returns false when the key does not exist
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError>;

    /// Remaining TTL in milliseconds, or `PTTL_MISSING` / `PTTL_NO_EXPIRY`
    async fn pttl(&self, key: &str) -> Result<i64, StoreError>;

    /// Delete a key; returns whether something was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys matching a glob pattern (only trailing `*` is needed here)
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

/// Redis/Upstash-backed store
pub struct RedisStore {
    connection: ConnectionManager,
    command_timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis; every subsequent command is bounded by `command_timeout`
    pub async fn connect(redis_url: &str, command_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(redis_url)?;
        let connection = match tokio::time::timeout(command_timeout, ConnectionManager::new(client)).await {
            Ok(conn) => conn?,
            Err(_) => return Err(StoreError::Timeout(command_timeout.as_millis() as u64)),
        };

        info!("Connected to key-value store (timeout: {:?})", command_timeout);

        Ok(Self {
            connection,
            command_timeout,
        })
    }

    async fn timed<T, F>(&self, command: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, command).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.command_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        self.timed(conn.get::<_, Option<String>>(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        self.timed(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        self.timed(conn.incr::<_, _, i64>(key, 1)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let applied: i64 = self
            .timed(async move {
                redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl_secs)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(applied == 1)
    }

    async fn pttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.connection.clone();
        self.timed(async move { redis::cmd("PTTL").arg(key).query_async(&mut conn).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed = self.timed(conn.del::<_, i64>(key)).await?;
        Ok(removed > 0)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection.clone();
        let mut found = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next_cursor, keys): (u64, Vec<String>) = self
                .timed(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut conn),
                )
                .await?;

            found.extend(keys);

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        debug!("SCAN {} matched {} keys", pattern, found.len());
        Ok(found)
    }
}

struct MemoryValue {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store for local development and tests.
///
/// Single instance only: nothing here is shared between server processes.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock_or_recover(&self.entries, "memory store")
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite a raw value, keeping its expiry. Test hook for corrupting records.
    pub fn overwrite_raw(&self, key: &str, value: &str) -> bool {
        let mut entries = lock_or_recover(&self.entries, "memory store");
        match entries.get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                true
            }
            None => false,
        }
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, MemoryValue>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut MemoryValue> {
        if entries.get(key).is_some_and(|v| !v.is_live(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = lock_or_recover(&self.entries, "memory store");
        Ok(Self::live_entry(&mut entries, key, Instant::now()).map(|v| v.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let mut entries = lock_or_recover(&self.entries, "memory store");
        entries.insert(
            key.to_string(),
            MemoryValue {
                value: value.to_string(),
                expires_at: deadline(Instant::now(), ttl_secs),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = lock_or_recover(&self.entries, "memory store");
        match Self::live_entry(&mut entries, key, Instant::now()) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| StoreError::Malformed {
                    key: key.to_string(),
                    reason: "value is not an integer".to_string(),
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    MemoryValue {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut entries = lock_or_recover(&self.entries, "memory store");
        let now = Instant::now();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = deadline(now, ttl_secs);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = lock_or_recover(&self.entries, "memory store");
        let now = Instant::now();
        Ok(match Self::live_entry(&mut entries, key, now) {
            Some(MemoryValue {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(now).as_millis() as i64,
            Some(_) => PTTL_NO_EXPIRY,
            None => PTTL_MISSING,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = lock_or_recover(&self.entries, "memory store");
        let now = Instant::now();
        Ok(entries.remove(key).is_some_and(|v| v.is_live(now)))
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut entries = lock_or_recover(&self.entries, "memory store");
        entries.retain(|_, v| v.is_live(now));

        let keys = entries
            .keys()
            .filter(|key| glob_matches(pattern, key))
            .cloned()
            .collect();
        Ok(keys)
    }
}

fn glob_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => {
            if pattern.contains('*') {
                warn!("Unsupported glob pattern {}, matching literally", pattern);
            }
            key == pattern
        }
    }
}

/// Expiry instant for a TTL; one past what `Instant` can represent never expires
fn deadline(now: Instant, ttl_secs: u64) -> Option<Instant> {
    now.checked_add(Duration::from_secs(ttl_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_set_and_get() {
        let store = MemoryStore::new();
        store.set_ex("session:abc", "payload", 60).await.unwrap();

        assert_eq!(store.get("session:abc").await.unwrap(), Some("payload".to_string()));
        assert_eq!(store.get("session:missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_incr_creates_counter_without_expiry() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("ratelimit:a").await.unwrap(), 1);
        assert_eq!(store.incr("ratelimit:a").await.unwrap(), 2);
        assert_eq!(store.pttl("ratelimit:a").await.unwrap(), PTTL_NO_EXPIRY);
    }

    #[tokio::test]
    async fn test_memory_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set_ex("k", "not-a-number", 60).await.unwrap();
        assert!(matches!(
            store.incr("k").await,
            Err(StoreError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_expire_and_pttl() {
        let store = MemoryStore::new();
        assert!(!store.expire("missing", 10).await.unwrap());
        assert_eq!(store.pttl("missing").await.unwrap(), PTTL_MISSING);

        store.incr("counter").await.unwrap();
        assert!(store.expire("counter", 10).await.unwrap());

        let ttl = store.pttl("counter").await.unwrap();
        assert!(ttl > 9_000 && ttl <= 10_000, "unexpected pttl {}", ttl);
    }

    #[tokio::test]
    async fn test_memory_ttl_expiration() {
        let store = MemoryStore::new();
        store.set_ex("short", "v", 1).await.unwrap();
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_delete_reports_removal() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_scan_prefix() {
        let store = MemoryStore::new();
        store.set_ex("session:1", "a", 60).await.unwrap();
        store.set_ex("session:2", "b", 60).await.unwrap();
        store.incr("ratelimit:1.2.3.4").await.unwrap();

        let mut keys = store.scan_keys("session:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["session:1".to_string(), "session:2".to_string()]);
    }

    #[test]
    fn test_glob_matches() {
        assert!(glob_matches("session:*", "session:abc"));
        assert!(!glob_matches("session:*", "ratelimit:abc"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("exact", "exactly"));
        assert!(glob_matches("*", "anything"));
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_incr_and_pttl() {
        let store = RedisStore::connect("redis://127.0.0.1:6379", Duration::from_secs(2))
            .await
            .expect("Failed to connect to Redis");

        store.delete("ratelimit:redis-test").await.unwrap();
        assert_eq!(store.incr("ratelimit:redis-test").await.unwrap(), 1);
        assert!(store.expire("ratelimit:redis-test", 30).await.unwrap());

        let ttl = store.pttl("ratelimit:redis-test").await.unwrap();
        assert!(ttl > 0 && ttl <= 30_000);

        assert!(store.delete("ratelimit:redis-test").await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_scan_keys() {
        let store = RedisStore::connect("redis://127.0.0.1:6379", Duration::from_secs(2))
            .await
            .expect("Failed to connect to Redis");

        store.set_ex("session:scan-test", "x", 30).await.unwrap();
        let keys = store.scan_keys("session:*").await.unwrap();
        assert!(keys.contains(&"session:scan-test".to_string()));
        store.delete("session:scan-test").await.unwrap();
    }
}
