//! Records persisted by the execution state store.
//!
//! These are plain data: state transitions are decided by the engine, the
//! store only checks versions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A stored workflow. `definition` is `None` when the row exists but the
/// definition column was never filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: Uuid,
    pub name: String,
    pub definition: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(name: impl Into<String>, definition: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            definition: Some(definition),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// workflow_executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING"   => Ok(Self::Running),
            "WAITING"   => Ok(Self::Waiting),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED"    => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other       => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub trigger_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub nodes_executed_count: i32,
    pub trigger_data: Map<String, Value>,
    pub context_snapshot: Option<Value>,
    /// Optimistic-concurrency counter, bumped by every successful update.
    pub version: i32,
}

impl Execution {
    /// A fresh `RUNNING` execution starting now.
    pub fn start(
        workflow_id: Uuid,
        trigger_data: Map<String, Value>,
        trigger_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            status: ExecutionStatus::Running,
            trigger_id,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            error: None,
            nodes_executed_count: 0,
            trigger_data,
            context_snapshot: None,
            version: 0,
        }
    }

    /// Move to a terminal status, stamping `completed_at` and `duration_ms`.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

// ---------------------------------------------------------------------------
// node_executions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeExecutionStatus {
    Running,
    Waiting,
    Completed,
    Failed,
}

impl NodeExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NodeExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running"   => Ok(Self::Running),
            "waiting"   => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            other       => Err(format!("unknown node execution status: {other}")),
        }
    }
}

/// The record of one node's visit within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecution {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub status: NodeExecutionStatus,
    pub input_snapshot: Value,
    pub output_snapshot: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl NodeExecution {
    /// A `running` record starting now.
    pub fn start(execution_id: Uuid, node_id: impl Into<String>, input_snapshot: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.into(),
            status: NodeExecutionStatus::Running,
            input_snapshot,
            output_snapshot: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    /// A record that failed before any executor ran.
    pub fn rejected(execution_id: Uuid, node_id: impl Into<String>, error: impl Into<String>) -> Self {
        let mut record = Self::start(execution_id, node_id, Value::Object(Map::new()));
        record.finish(NodeExecutionStatus::Failed, None, Some(error.into()));
        record
    }

    /// Stamp the end of the visit. `waiting` leaves `completed_at` unset.
    pub fn finish(
        &mut self,
        status: NodeExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        let now = Utc::now();
        self.status = status;
        self.output_snapshot = output;
        self.error = error;
        if status != NodeExecutionStatus::Waiting {
            self.completed_at = Some(now);
        }
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
    }
}

// ---------------------------------------------------------------------------
// execution_wait_states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitStateStatus {
    Waiting,
    Resuming,
    Completed,
    Timeout,
    Failed,
}

impl WaitStateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Resuming => "resuming",
            Self::Completed => "completed",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WaitStateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WaitStateStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting"   => Ok(Self::Waiting),
            "resuming"  => Ok(Self::Resuming),
            "completed" => Ok(Self::Completed),
            "timeout"   => Ok(Self::Timeout),
            "failed"    => Ok(Self::Failed),
            other       => Err(format!("unknown wait state status: {other}")),
        }
    }
}

/// How many of the awaited events must arrive before a wait resumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    #[default]
    All,
    Any,
    RequiredOnly,
    Custom,
}

impl AggregationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Any => "any",
            Self::RequiredOnly => "required_only",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case-insensitive; `-` is accepted for `_`.
impl FromStr for AggregationStrategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "all"           => Ok(Self::All),
            "any"           => Ok(Self::Any),
            "required_only" => Ok(Self::RequiredOnly),
            "custom"        => Ok(Self::Custom),
            _               => Err(format!("unknown aggregation strategy: {s}")),
        }
    }
}

/// Suspension record for a wait-events node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionWaitState {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub correlation_id: String,
    pub aggregation_strategy: AggregationStrategy,
    pub required_events: Vec<String>,
    pub enabled_events: Vec<String>,
    pub received_events: Vec<String>,
    /// Payload per received event type.
    pub event_data: Map<String, Value>,
    pub status: WaitStateStatus,
    pub expires_at: DateTime<Utc>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub resumed_by: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}

impl ExecutionWaitState {
    pub fn has_received(&self, event_type: &str) -> bool {
        self.received_events.iter().any(|e| e == event_type)
    }

    pub fn is_enabled(&self, event_type: &str) -> bool {
        self.enabled_events.iter().any(|e| e == event_type)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
