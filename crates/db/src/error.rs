//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("row not found")]
    NotFound,

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Optimistic-concurrency failure: the stored version no longer matches.
    #[error("{entity} '{id}' was modified concurrently")]
    ConcurrentModification { entity: &'static str, id: String },

    #[error("corrupt column value: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// `true` when a racing writer got there first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::ConcurrentModification { .. })
    }

    pub(crate) fn conflict(entity: &'static str, id: impl ToString) -> Self {
        DbError::ConcurrentModification {
            entity,
            id: id.to_string(),
        }
    }
}
