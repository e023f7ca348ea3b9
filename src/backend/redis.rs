//! Redis storage adapter.
//!
//! Layout under a namespace `ns`:
//! - `{ns}:cache:{key}` - envelope-encoded [`CacheEntry`], expiring in Redis
//!   at the end of its grace window (or TTL when it has none) via `PXAT`
//! - `{ns}:tag:{tag}` - invalidation timestamp in ms, never expires

use super::StorageAdapter;
use crate::entry::CacheEntry;
use crate::error::{Error, Result};
use crate::serialization::{deserialize_from_cache, serialize_for_cache};
use crate::tag::Tag;
use deadpool_redis::{redis::AsyncCommands, Config as PoolConfig, Connection, Pool, Runtime};
use std::time::Duration;

/// Pool statistics information.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Default Redis connection pool size.
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

const DEFAULT_NAMESPACE: &str = "tagged-cache";
const SCAN_BATCH: u32 = 100;

/// Configuration for the Redis adapter.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub pool_size: u32,
    /// How long to wait for a pooled connection.
    pub connection_timeout: Duration,
    /// Prefix for every key the adapter writes.
    pub namespace: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: Duration::from_secs(5),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }
}

impl RedisConfig {
    /// Build Redis connection string.
    pub fn connection_string(&self) -> String {
        if let Some(password) = &self.password {
            if let Some(username) = &self.username {
                format!(
                    "redis://{}:{}@{}:{}/{}",
                    username, password, self.host, self.port, self.database
                )
            } else {
                format!(
                    "redis://default:{}@{}:{}/{}",
                    password, self.host, self.port, self.database
                )
            }
        } else {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        }
    }
}

/// Redis adapter with connection pooling.
///
/// Tag timestamps survive [`StorageAdapter::clear`]; only cache keys of the
/// adapter's namespace are scanned and deleted.
///
/// # Example
///
/// ```no_run
/// # use tagged_cache::backend::{RedisAdapter, RedisConfig};
/// # use tagged_cache::QueryEngine;
/// # async fn example() -> tagged_cache::Result<()> {
/// let adapter = RedisAdapter::new(RedisConfig::default()).await?;
/// let engine = QueryEngine::new(adapter)?;
/// engine.set("key", &42u32, &[], "1m", None).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisAdapter {
    pool: Pool,
    namespace: String,
}

impl RedisAdapter {
    /// Create a new adapter from configuration.
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let mut cfg = PoolConfig::from_url(config.connection_string());
        let mut pool_cfg = deadpool_redis::PoolConfig::new(config.pool_size as usize);
        pool_cfg.timeouts.wait = Some(config.connection_timeout);
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::BackendError(format!("Failed to create Redis pool: {}", e)))?;

        info!(
            "✓ Redis adapter initialized: {}:{} (namespace {})",
            config.host, config.port, config.namespace
        );

        Ok(RedisAdapter {
            pool,
            namespace: config.namespace,
        })
    }

    /// Create from connection string directly, with the default namespace.
    ///
    /// Pool size is determined by:
    /// 1. `REDIS_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn from_connection_string(conn_str: &str) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let mut cfg = PoolConfig::from_url(conn_str);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_size as usize));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::BackendError(format!("Failed to create Redis pool: {}", e)))?;

        info!(
            "✓ Redis adapter initialized from connection string (pool size: {})",
            pool_size
        );

        Ok(RedisAdapter {
            pool,
            namespace: DEFAULT_NAMESPACE.to_string(),
        })
    }

    /// Use a different key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Get current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            connections: status.size as u32,
            idle_connections: status.available as u32,
        }
    }

    fn cache_key(&self, key: &str) -> String {
        format!("{}:cache:{}", self.namespace, key)
    }

    fn tag_key(&self, tag: &Tag) -> String {
        format!("{}:tag:{}", self.namespace, tag.to_key())
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }
}

impl StorageAdapter for RedisAdapter {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.connection().await?;
        let redis_key = self.cache_key(key);

        let data: Option<Vec<u8>> = conn
            .get(&redis_key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis GET failed for key {}: {}", key, e)))?;

        let Some(bytes) = data else {
            debug!("✓ Redis GET {} -> MISS", key);
            return Ok(None);
        };

        match deserialize_from_cache::<CacheEntry>(&bytes) {
            Ok(entry) => {
                debug!("✓ Redis GET {} -> HIT", key);
                Ok(Some(entry))
            }
            Err(e) => {
                // Unreadable blobs (older schema, foreign writer) count as a miss
                warn!("⚠ Redis GET {} -> unreadable entry: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut conn = self.connection().await?;
        let expire_at = entry.usable_until().max(1);
        let bytes = serialize_for_cache(&entry)?;

        deadpool_redis::redis::cmd("SET")
            .arg(self.cache_key(key))
            .arg(bytes)
            .arg("PXAT")
            .arg(expire_at)
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SET failed for key {}: {}", key, e)))?;

        debug!("✓ Redis SET {} (PXAT: {})", key, expire_at);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;

        conn.del::<_, ()>(self.cache_key(key))
            .await
            .map_err(|e| Error::BackendError(format!("Redis DEL failed for key {}: {}", key, e)))?;

        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn get_tag_invalidation_time(&self, tag: &Tag) -> Result<Option<i64>> {
        let mut conn = self.connection().await?;

        conn.get::<_, Option<i64>>(self.tag_key(tag))
            .await
            .map_err(|e| Error::BackendError(format!("Redis GET failed for tag {}: {}", tag, e)))
    }

    async fn set_tag_invalidation_time(&self, tag: &Tag, timestamp: i64) -> Result<()> {
        let mut conn = self.connection().await?;

        conn.set::<_, _, ()>(self.tag_key(tag), timestamp)
            .await
            .map_err(|e| Error::BackendError(format!("Redis SET failed for tag {}: {}", tag, e)))?;

        debug!("✓ Redis INVALIDATE {} @ {}", tag, timestamp);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}:cache:*", self.namespace);
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = deadpool_redis::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await
                .map_err(|e| Error::BackendError(format!("Redis SCAN failed: {}", e)))?;

            if !keys.is_empty() {
                removed += keys.len();
                conn.del::<_, ()>(keys)
                    .await
                    .map_err(|e| Error::BackendError(format!("Redis DEL (bulk) failed: {}", e)))?;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        warn!(
            "⚠ Redis CLEAR executed - {} entries dropped from {}",
            removed, self.namespace
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close();
        info!("✓ Redis adapter disconnected ({})", self.namespace);
        Ok(())
    }
}
