//! TTL-backed cache of in-flight `ExecutionContext`s.
//!
//! A pure accelerator: every miss (absent, expired or unreadable entry) must
//! be answered from the durable snapshot by the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodes::ExecutionContext;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{CacheError, FastStore};

const CONTEXT_PREFIX: &str = "execution:context:";

/// Default lifetime of a cached context.
pub const DEFAULT_CONTEXT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, execution_id: Uuid) -> Result<Option<ExecutionContext>, CacheError>;
    /// Upsert, resetting the TTL.
    async fn save(&self, execution_id: Uuid, context: &ExecutionContext) -> Result<(), CacheError>;
    async fn evict(&self, execution_id: Uuid) -> Result<(), CacheError>;
    async fn exists(&self, execution_id: Uuid) -> Result<bool, CacheError>;
}

/// [`CacheStore`] storing contexts as JSON strings in a [`FastStore`].
pub struct ContextCache {
    store: Arc<dyn FastStore>,
    ttl: Duration,
}

fn context_key(execution_id: Uuid) -> String {
    format!("{CONTEXT_PREFIX}{execution_id}")
}

impl ContextCache {
    pub fn new(store: Arc<dyn FastStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }
}

#[async_trait]
impl CacheStore for ContextCache {
    async fn load(&self, execution_id: Uuid) -> Result<Option<ExecutionContext>, CacheError> {
        let Some(raw) = self.store.get(&context_key(execution_id)).await? else {
            debug!("context cache miss for execution {}", execution_id);
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(context) => Ok(Some(context)),
            Err(e) => {
                warn!("discarding unreadable cached context for execution {}: {}", execution_id, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, execution_id: Uuid, context: &ExecutionContext) -> Result<(), CacheError> {
        let raw = serde_json::to_string(context)?;
        self.store.set(&context_key(execution_id), &raw, self.ttl).await
    }

    async fn evict(&self, execution_id: Uuid) -> Result<(), CacheError> {
        self.store.delete(&context_key(execution_id)).await?;
        debug!("evicted cached context for execution {}", execution_id);
        Ok(())
    }

    async fn exists(&self, execution_id: Uuid) -> Result<bool, CacheError> {
        self.store.exists(&context_key(execution_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::{json, Map};

    fn cache() -> (Arc<dyn FastStore>, ContextCache) {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let cache = ContextCache::new(Arc::clone(&store), DEFAULT_CONTEXT_TTL);
        (store, cache)
    }

    #[tokio::test]
    async fn save_then_load_preserves_the_context() {
        let (_, cache) = cache();
        let id = Uuid::new_v4();

        let mut ctx = ExecutionContext::new(id.to_string(), "wf-1");
        ctx.set_variable("user", json!({ "email": "a@b.c" }));
        ctx.set_node_output("trigger", json!({ "orderId": 7 }));
        let mut trigger_data = Map::new();
        trigger_data.insert("orderId".into(), json!(7));
        ctx.set_trigger_data_for_node("trigger", trigger_data);
        ctx.set_wait_state("ws-1", "wait");

        cache.save(id, &ctx).await.unwrap();
        let loaded = cache.load(id).await.unwrap().unwrap();

        assert_eq!(loaded.variables, ctx.variables);
        assert_eq!(loaded.node_outputs, ctx.node_outputs);
        assert_eq!(loaded.trigger_data_by_node, ctx.trigger_data_by_node);
        assert_eq!(loaded.wait_state_id.as_deref(), Some("ws-1"));
        assert_eq!(loaded.waiting_node_id.as_deref(), Some("wait"));
    }

    #[tokio::test]
    async fn evict_turns_the_entry_into_a_miss() {
        let (_, cache) = cache();
        let id = Uuid::new_v4();
        cache.save(id, &ExecutionContext::new(id.to_string(), "wf")).await.unwrap();
        assert!(cache.exists(id).await.unwrap());

        cache.evict(id).await.unwrap();
        assert!(!cache.exists(id).await.unwrap());
        assert!(cache.load(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_entry_is_a_miss() {
        let (store, cache) = cache();
        let id = Uuid::new_v4();
        store
            .set(&context_key(id), "{not json", DEFAULT_CONTEXT_TTL)
            .await
            .unwrap();

        assert!(cache.load(id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_the_ttl() {
        let store: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let cache = ContextCache::new(store, Duration::from_secs(5));
        let id = Uuid::new_v4();
        cache.save(id, &ExecutionContext::new(id.to_string(), "wf")).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.load(id).await.unwrap().is_none());
    }
}
