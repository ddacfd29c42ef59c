//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tuning knobs for the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Owner tag written into distributed locks and wait-state resumes.
    pub instance_id: String,
    /// Lease of an execution lock; renewed every third of it while held.
    pub lock_lease: Duration,
    /// Lifetime of a cached execution context.
    pub context_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("instance-{}", Uuid::new_v4()),
            lock_lease: Duration::from_secs(5 * 60),
            context_ttl: cache::context_cache::DEFAULT_CONTEXT_TTL,
        }
    }
}

impl EngineConfig {
    /// Read `ENGINE_INSTANCE_ID` (else `HOSTNAME`), `ENGINE_LOCK_LEASE_MS` and
    /// `ENGINE_CONTEXT_TTL_SECS`, falling back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            instance_id: std::env::var("ENGINE_INSTANCE_ID")
                .or_else(|_| std::env::var("HOSTNAME"))
                .ok()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(defaults.instance_id),
            lock_lease: std::env::var("ENGINE_LOCK_LEASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_lease),
            context_ttl: std::env::var("ENGINE_CONTEXT_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.context_ttl),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }
}
