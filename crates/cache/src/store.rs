//! The fast-store capability.

use std::time::Duration;

use async_trait::async_trait;

use crate::CacheError;

/// String key/value operations with expiry, as offered by Redis.
///
/// The two `compare_and_*` operations must be atomic with respect to every
/// other operation on the same key.
#[async_trait]
pub trait FastStore: Send + Sync {
    /// Set `key` only if it does not exist. `true` if the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Upsert with expiry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Reset the expiry of an existing key. `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;

    /// `true` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete `key` only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError>;

    /// Reset the expiry of `key` only while it still holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;
}
