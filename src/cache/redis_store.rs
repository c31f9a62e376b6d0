//! Redis durable level (feature `redis-store`).
//!
//! Keys are `cascade:<digest>:<tier>`. Entries with an expiry are written with
//! `SET .. PX` so Redis drops them on its own; invalidation walks the key
//! space with `SCAN MATCH cascade:*` rather than `FLUSHDB`, leaving unrelated
//! keys in a shared database alone.

use super::store::{DurableStore, StoreError};
use super::{CacheEntry, CacheKey};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

const KEY_PREFIX: &str = "cascade";
const SCAN_BATCH: usize = 200;

/// Redis-backed [`DurableStore`].
pub struct RedisStore {
    client: redis::Client,
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl RedisStore {
    /// Connect to `redis_url` and verify the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;

        debug!(url = redis_url, "redis store connected");
        Ok(Self { client })
    }

    fn redis_key(key: &CacheKey) -> String {
        format!("{KEY_PREFIX}:{}:{}", key.digest, key.tier)
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) if entry.key() == *key => Ok(Some(entry)),
            _ => {
                debug!(key = %key, "discarding unreadable redis entry");
                self.remove(key).await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        let body = serde_json::to_string(entry)?;
        let key = Self::redis_key(&entry.key());
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(body);
        if let Some(expires_at) = entry.expires_at {
            let remaining_ms = (expires_at - Utc::now()).num_milliseconds();
            if remaining_ms <= 0 {
                return Ok(());
            }
            cmd.arg("PX").arg(remaining_ms);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("DEL")
            .arg(Self::redis_key(key))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pattern = format!("{KEY_PREFIX}:*");
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            if !keys.is_empty() {
                removed += keys.len();
                redis::cmd("DEL")
                    .arg(&keys)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!(removed, "redis store cleared");
        Ok(())
    }
}
