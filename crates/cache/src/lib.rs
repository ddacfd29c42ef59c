//! `cache` crate — fast shared store primitives.
//!
//! [`FastStore`] is the minimal key/value capability (set-if-absent with
//! expiry, compare-and-delete, ...). The distributed lock and the context
//! cache are built on top of it, so either backend serves both: Redis in
//! production, [`MemoryStore`] in tests.

pub mod config;
pub mod context_cache;
pub mod error;
pub mod lock;
pub mod memory;
pub mod redis;
pub mod store;

pub use config::RedisConfig;
pub use context_cache::{CacheStore, ContextCache};
pub use error::CacheError;
pub use lock::{DistributedLock, LockProvider};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use store::FastStore;
