//! Redis-backed `FastStore` over a deadpool connection pool.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use tracing::info;

use crate::{CacheError, FastStore, RedisConfig};

/// Deletes KEYS[1] only while it holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Sets a PX expiry of ARGV[2] on KEYS[1] only while it holds ARGV[1].
const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

fn millis(ttl: Duration) -> u64 {
    // Redis rejects a zero expiry.
    (ttl.as_millis() as u64).max(1)
}

impl RedisStore {
    /// Build the pool and verify connectivity with a `PING`.
    pub async fn connect(config: &RedisConfig) -> Result<Self, CacheError> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|e| CacheError::Pool(e.to_string()))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::Pool(e.to_string()))?;

        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        info!("connected to redis (pool_size={})", config.pool_size);

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl FastStore for RedisStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let count: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut *conn).await?;
        Ok(count > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let applied: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(applied == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(removed > 0)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let removed: i64 = redis::cmd("EVAL")
            .arg(COMPARE_AND_DELETE)
            .arg(1)
            .arg(key)
            .arg(expected)
            .query_async(&mut *conn)
            .await?;
        Ok(removed == 1)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let applied: i64 = redis::cmd("EVAL")
            .arg(COMPARE_AND_EXPIRE)
            .arg(1)
            .arg(key)
            .arg(expected)
            .arg(millis(ttl))
            .query_async(&mut *conn)
            .await?;
        Ok(applied == 1)
    }
}
