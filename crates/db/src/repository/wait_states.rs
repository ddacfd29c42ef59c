//! `execution_wait_states` repository functions.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::parse_column;
use crate::{models::ExecutionWaitState, DbError};

const COLUMNS: &str = "id, execution_id, node_id, correlation_id, aggregation_strategy, \
     required_events, enabled_events, received_events, event_data, status, expires_at, \
     resumed_at, resumed_by, version, created_at";

#[derive(Debug, FromRow)]
struct WaitStateRow {
    id: Uuid,
    execution_id: Uuid,
    node_id: String,
    correlation_id: String,
    aggregation_strategy: String,
    required_events: Vec<String>,
    enabled_events: Vec<String>,
    received_events: Vec<String>,
    event_data: Json<Map<String, Value>>,
    status: String,
    expires_at: DateTime<Utc>,
    resumed_at: Option<DateTime<Utc>>,
    resumed_by: Option<String>,
    version: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<WaitStateRow> for ExecutionWaitState {
    type Error = DbError;

    fn try_from(row: WaitStateRow) -> Result<Self, Self::Error> {
        Ok(ExecutionWaitState {
            id: row.id,
            execution_id: row.execution_id,
            node_id: row.node_id,
            correlation_id: row.correlation_id,
            aggregation_strategy: parse_column(&row.aggregation_strategy)?,
            required_events: row.required_events,
            enabled_events: row.enabled_events,
            received_events: row.received_events,
            event_data: row.event_data.0,
            status: parse_column(&row.status)?,
            expires_at: row.expires_at,
            resumed_at: row.resumed_at,
            resumed_by: row.resumed_by,
            version: row.version,
            created_at: row.created_at,
        })
    }
}

fn decode_all(rows: Vec<WaitStateRow>) -> Result<Vec<ExecutionWaitState>, DbError> {
    rows.into_iter().map(ExecutionWaitState::try_from).collect()
}

/// Fails with a unique violation if the node already has a wait state in this run.
pub async fn insert_wait_state(pool: &PgPool, ws: &ExecutionWaitState) -> Result<(), DbError> {
    sqlx::query(&format!(
        "INSERT INTO execution_wait_states ({COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
    ))
    .bind(ws.id)
    .bind(ws.execution_id)
    .bind(&ws.node_id)
    .bind(&ws.correlation_id)
    .bind(ws.aggregation_strategy.as_str())
    .bind(&ws.required_events)
    .bind(&ws.enabled_events)
    .bind(&ws.received_events)
    .bind(Json(&ws.event_data))
    .bind(ws.status.as_str())
    .bind(ws.expires_at)
    .bind(ws.resumed_at)
    .bind(&ws.resumed_by)
    .bind(ws.version)
    .bind(ws.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_wait_state(
    pool: &PgPool,
    execution_id: Uuid,
    node_id: &str,
) -> Result<Option<ExecutionWaitState>, DbError> {
    let row = sqlx::query_as::<_, WaitStateRow>(&format!(
        "SELECT {COLUMNS} FROM execution_wait_states WHERE execution_id = $1 AND node_id = $2"
    ))
    .bind(execution_id)
    .bind(node_id)
    .fetch_optional(pool)
    .await?;

    row.map(ExecutionWaitState::try_from).transpose()
}

pub async fn find_waiting_wait_state(
    pool: &PgPool,
    execution_id: Uuid,
    correlation_id: &str,
) -> Result<Option<ExecutionWaitState>, DbError> {
    let row = sqlx::query_as::<_, WaitStateRow>(&format!(
        "SELECT {COLUMNS} FROM execution_wait_states \
         WHERE execution_id = $1 AND correlation_id = $2 AND status = 'waiting'"
    ))
    .bind(execution_id)
    .bind(correlation_id)
    .fetch_optional(pool)
    .await?;

    row.map(ExecutionWaitState::try_from).transpose()
}

/// Version-checked update; bumps `ws.version` on success.
pub async fn update_wait_state(pool: &PgPool, ws: &mut ExecutionWaitState) -> Result<(), DbError> {
    let result = sqlx::query(
        r#"
        UPDATE execution_wait_states
        SET received_events = $1, event_data = $2, status = $3, resumed_at = $4,
            resumed_by = $5, version = version + 1
        WHERE id = $6 AND version = $7
        "#,
    )
    .bind(&ws.received_events)
    .bind(Json(&ws.event_data))
    .bind(ws.status.as_str())
    .bind(ws.resumed_at)
    .bind(&ws.resumed_by)
    .bind(ws.id)
    .bind(ws.version)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::conflict("execution_wait_state", ws.id));
    }

    ws.version += 1;
    Ok(())
}

pub async fn list_expired_wait_states(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> Result<Vec<ExecutionWaitState>, DbError> {
    let rows = sqlx::query_as::<_, WaitStateRow>(&format!(
        "SELECT {COLUMNS} FROM execution_wait_states \
         WHERE status = 'waiting' AND expires_at <= $1 ORDER BY expires_at ASC"
    ))
    .bind(now)
    .fetch_all(pool)
    .await?;

    decode_all(rows)
}
