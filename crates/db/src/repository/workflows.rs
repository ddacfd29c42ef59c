//! Workflow definition storage.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{models::WorkflowRecord, DbError};

#[derive(Debug, FromRow)]
struct WorkflowRow {
    id: Uuid,
    name: String,
    definition: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl From<WorkflowRow> for WorkflowRecord {
    fn from(row: WorkflowRow) -> Self {
        WorkflowRecord {
            id: row.id,
            name: row.name,
            definition: row.definition,
            created_at: row.created_at,
        }
    }
}

/// Insert a workflow, replacing name and definition if the id exists.
pub async fn upsert_workflow(pool: &PgPool, workflow: &WorkflowRecord) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO workflows (id, name, definition, created_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, definition = EXCLUDED.definition
        "#,
    )
    .bind(workflow.id)
    .bind(&workflow.name)
    .bind(&workflow.definition)
    .bind(workflow.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a single workflow by its primary key.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<WorkflowRecord>, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"SELECT id, name, definition, created_at FROM workflows WHERE id = $1"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(WorkflowRecord::from))
}
