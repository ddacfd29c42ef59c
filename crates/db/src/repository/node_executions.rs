//! `node_executions` repository functions.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_column;
use crate::{models::NodeExecution, DbError};

#[derive(Debug, FromRow)]
struct NodeExecutionRow {
    id: Uuid,
    execution_id: Uuid,
    node_id: String,
    status: String,
    input_snapshot: Value,
    output_snapshot: Option<Value>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl TryFrom<NodeExecutionRow> for NodeExecution {
    type Error = DbError;

    fn try_from(row: NodeExecutionRow) -> Result<Self, Self::Error> {
        Ok(NodeExecution {
            id: row.id,
            execution_id: row.execution_id,
            node_id: row.node_id,
            status: parse_column(&row.status)?,
            input_snapshot: row.input_snapshot,
            output_snapshot: row.output_snapshot,
            error: row.error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
        })
    }
}

pub async fn insert_node_execution(pool: &PgPool, record: &NodeExecution) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO node_executions
            (id, execution_id, node_id, status, input_snapshot, output_snapshot, error,
             started_at, completed_at, duration_ms)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(record.id)
    .bind(record.execution_id)
    .bind(&record.node_id)
    .bind(record.status.as_str())
    .bind(&record.input_snapshot)
    .bind(&record.output_snapshot)
    .bind(&record.error)
    .bind(record.started_at)
    .bind(record.completed_at)
    .bind(record.duration_ms)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn update_node_execution(pool: &PgPool, record: &NodeExecution) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE node_executions
        SET status = $1, output_snapshot = $2, error = $3, completed_at = $4, duration_ms = $5
        WHERE id = $6
        "#,
    )
    .bind(record.status.as_str())
    .bind(&record.output_snapshot)
    .bind(&record.error)
    .bind(record.completed_at)
    .bind(record.duration_ms)
    .bind(record.id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }

    Ok(())
}

/// All node executions of one run, ordered by start time.
pub async fn list_node_executions(
    pool: &PgPool,
    execution_id: Uuid,
) -> Result<Vec<NodeExecution>, DbError> {
    let rows = sqlx::query_as::<_, NodeExecutionRow>(
        r#"
        SELECT id, execution_id, node_id, status, input_snapshot, output_snapshot, error,
               started_at, completed_at, duration_ms
        FROM node_executions
        WHERE execution_id = $1
        ORDER BY started_at ASC, seq ASC
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(NodeExecution::try_from).collect()
}
