//! `workflow_executions` repository functions.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_column;
use crate::{models::Execution, DbError};

#[derive(Debug, FromRow)]
struct ExecutionRow {
    id: Uuid,
    workflow_id: Uuid,
    status: String,
    trigger_id: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error: Option<String>,
    nodes_executed_count: i32,
    trigger_data: Json<Map<String, Value>>,
    context_snapshot: Option<Value>,
    version: i32,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = DbError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Execution {
            id: row.id,
            workflow_id: row.workflow_id,
            status: parse_column(&row.status)?,
            trigger_id: row.trigger_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            error: row.error,
            nodes_executed_count: row.nodes_executed_count,
            trigger_data: row.trigger_data.0,
            context_snapshot: row.context_snapshot,
            version: row.version,
        })
    }
}

pub async fn insert_execution(pool: &PgPool, execution: &Execution) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflow_executions
            (id, workflow_id, status, trigger_id, started_at, completed_at, duration_ms,
             error, nodes_executed_count, trigger_data, context_snapshot, version)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(execution.id)
    .bind(execution.workflow_id)
    .bind(execution.status.as_str())
    .bind(&execution.trigger_id)
    .bind(execution.started_at)
    .bind(execution.completed_at)
    .bind(execution.duration_ms)
    .bind(&execution.error)
    .bind(execution.nodes_executed_count)
    .bind(Json(&execution.trigger_data))
    .bind(&execution.context_snapshot)
    .bind(execution.version)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<Execution>, DbError> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, workflow_id, status, trigger_id, started_at, completed_at, duration_ms,
               error, nodes_executed_count, trigger_data, context_snapshot, version
        FROM workflow_executions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(Execution::try_from).transpose()
}

/// Version-checked update of every mutable column.
///
/// Returns `DbError::ConcurrentModification` when the stored version moved on
/// (or the row vanished); bumps `execution.version` on success.
pub async fn update_execution(pool: &PgPool, execution: &mut Execution) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE workflow_executions
        SET status = $1, completed_at = $2, duration_ms = $3, error = $4,
            nodes_executed_count = $5, context_snapshot = $6, version = version + 1
        WHERE id = $7 AND version = $8
        "#,
    )
    .bind(execution.status.as_str())
    .bind(execution.completed_at)
    .bind(execution.duration_ms)
    .bind(&execution.error)
    .bind(execution.nodes_executed_count)
    .bind(&execution.context_snapshot)
    .bind(execution.id)
    .bind(execution.version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict("execution", execution.id));
    }

    execution.version += 1;
    Ok(())
}
