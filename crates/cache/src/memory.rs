//! In-process `FastStore` for tests and single-instance deployments.
//!
//! Expiry is measured on `tokio::time::Instant`, so a paused test clock
//! (`#[tokio::test(start_paused = true)]`) drives it.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{CacheError, FastStore};

struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries with expired keys already swept out.
    fn live(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut entries = self.live();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.live().get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.live().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live().contains_key(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        match self.live().get_mut(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.live().remove(key).is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut entries = self.live();
        if entries.get(key).is_some_and(|e| e.value == expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        match self.live().get_mut(key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
