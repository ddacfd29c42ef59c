//! Waiting on correlated external events.
//!
//! [`WaitEventsNode`] suspends a run and registers an `ExecutionWaitState`.
//! [`WaitStateService`] is the event-delivery side: it records inbound events
//! against that wait state, decides when the aggregation strategy is
//! satisfied, and resumes (or, on timeout, fails) the run through the engine.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use db::{
    AggregationStrategy, ExecutionStatus, ExecutionStore, ExecutionWaitState, WaitStateStatus,
};
use nodes::{ExecutionContext, NodeError, NodeExecutionResult, NodeExecutor, NodeType};

use crate::executor::{ResumeOutcome, WorkflowEngine};
use crate::EngineError;

/// Event type of a response to the node's outbound API call.
pub const API_RESPONSE: &str = "api_response";
/// Event type of a correlated message-queue event.
pub const KAFKA_EVENT: &str = "kafka_event";

const DEFAULT_TIMEOUT_SECS: i64 = 300;
const MAX_RECORD_ATTEMPTS: usize = 3;

// ---------------------------------------------------------------------------
// WaitSpec
// ---------------------------------------------------------------------------

/// Parsed configuration of a wait-events node.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitSpec {
    pub strategy: AggregationStrategy,
    pub enabled_events: Vec<String>,
    /// Events that must arrive, derived from the strategy.
    pub required_events: Vec<String>,
    pub timeout: Duration,
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in value.and_then(Value::as_array).into_iter().flatten() {
        if let Some(s) = item.as_str() {
            if !out.iter().any(|e| e == s) {
                out.push(s.to_string());
            }
        }
    }
    out
}

impl WaitSpec {
    /// Reads `aggregationStrategy` (default `all`), `events` (or the legacy
    /// `apiCall` / `kafkaEvent` sections, enabled unless `enabled: false`),
    /// `requiredEvents` and `timeout` in seconds (default 300).
    pub fn from_config(config: &Value) -> Result<Self, NodeError> {
        let strategy = match config.get("aggregationStrategy") {
            None | Some(Value::Null) => AggregationStrategy::default(),
            Some(Value::String(s)) => s
                .parse::<AggregationStrategy>()
                .map_err(NodeError::InvalidConfig)?,
            Some(other) => {
                return Err(NodeError::InvalidConfig(format!(
                    "aggregationStrategy must be a string, got {other}"
                )))
            }
        };

        let enabled_events = if config.get("events").is_some_and(Value::is_array) {
            string_list(config.get("events"))
        } else {
            [("apiCall", API_RESPONSE), ("kafkaEvent", KAFKA_EVENT)]
                .into_iter()
                .filter(|(section, _)| {
                    config.get(*section).is_some_and(|s| {
                        s.is_object() && s.get("enabled").and_then(Value::as_bool).unwrap_or(true)
                    })
                })
                .map(|(_, event)| event.to_string())
                .collect()
        };

        let required_events = match strategy {
            AggregationStrategy::All => enabled_events.clone(),
            AggregationStrategy::Any => Vec::new(),
            AggregationStrategy::RequiredOnly | AggregationStrategy::Custom => {
                string_list(config.get("requiredEvents"))
            }
        };

        let timeout_secs = config
            .get("timeout")
            .and_then(Value::as_i64)
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            strategy,
            enabled_events,
            required_events,
            timeout: Duration::seconds(timeout_secs),
        })
    }
}

// ---------------------------------------------------------------------------
// WaitEventsNode
// ---------------------------------------------------------------------------

/// Executor for `wait_events` nodes.
pub struct WaitEventsNode {
    store: Arc<dyn ExecutionStore>,
}

impl WaitEventsNode {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NodeExecutor for WaitEventsNode {
    fn node_type(&self) -> NodeType {
        NodeType::WaitEvents
    }

    fn name(&self) -> &str {
        "WaitEventsNode"
    }

    async fn execute(
        &self,
        node_id: &str,
        config: &Value,
        ctx: &mut ExecutionContext,
    ) -> Result<NodeExecutionResult, NodeError> {
        let spec = WaitSpec::from_config(config)?;

        if spec.enabled_events.is_empty() {
            info!("no events enabled for wait node '{}', skipping", node_id);
            let mut output = Map::new();
            output.insert("status".into(), json!("skipped"));
            output.insert("reason".into(), json!("No events enabled"));
            return Ok(NodeExecutionResult::success(output));
        }

        let execution_id: Uuid = ctx.execution_id.parse().map_err(|_| {
            NodeError::Failed(format!("execution id '{}' is not a UUID", ctx.execution_id))
        })?;

        let now = Utc::now();
        let wait_state = ExecutionWaitState {
            id: Uuid::new_v4(),
            execution_id,
            node_id: node_id.to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            aggregation_strategy: spec.strategy,
            required_events: spec.required_events,
            enabled_events: spec.enabled_events,
            received_events: Vec::new(),
            event_data: Map::new(),
            status: WaitStateStatus::Waiting,
            expires_at: now + spec.timeout,
            resumed_at: None,
            resumed_by: None,
            version: 0,
            created_at: now,
        };
        self.store
            .insert_wait_state(&wait_state)
            .await
            .map_err(|e| NodeError::Failed(format!("could not register wait state: {e}")))?;

        info!(
            "wait state {} registered for node '{}' (correlation {})",
            wait_state.id, node_id, wait_state.correlation_id
        );

        let mut output = Map::new();
        output.insert("correlationId".into(), json!(wait_state.correlation_id));
        output.insert("executionId".into(), json!(ctx.execution_id));
        output.insert("status".into(), json!("waiting"));
        output.insert("waitStateId".into(), json!(wait_state.id.to_string()));
        output.insert("enabledEvents".into(), json!(wait_state.enabled_events));
        Ok(NodeExecutionResult::waiting(output))
    }
}

// ---------------------------------------------------------------------------
// Aggregation rules
// ---------------------------------------------------------------------------

fn contains_all(received: &[String], wanted: &[String]) -> bool {
    wanted.iter().all(|w| received.contains(w))
}

/// Whether the wait state's strategy is satisfied by what has arrived.
pub fn is_completion_condition_met(ws: &ExecutionWaitState) -> bool {
    match ws.aggregation_strategy {
        AggregationStrategy::All => {
            !ws.enabled_events.is_empty() && contains_all(&ws.received_events, &ws.enabled_events)
        }
        AggregationStrategy::Any => ws
            .received_events
            .iter()
            .any(|e| ws.enabled_events.contains(e)),
        AggregationStrategy::RequiredOnly | AggregationStrategy::Custom => {
            !ws.required_events.is_empty()
                && contains_all(&ws.received_events, &ws.required_events)
        }
    }
}

/// What the reaper does with a wait state past its `expires_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutPolicy {
    #[default]
    Fail,
    /// Resume if the strategy is satisfied by what arrived; otherwise fail.
    Continue,
    /// Always resume with whatever arrived.
    ContinueWithPartial,
}

impl FromStr for TimeoutPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(Self::Fail),
            "continue" => Ok(Self::Continue),
            "continue_with_partial" => Ok(Self::ContinueWithPartial),
            other => Err(EngineError::UnknownTimeoutPolicy(other.to_string())),
        }
    }
}

fn can_continue_on_timeout(ws: &ExecutionWaitState, policy: TimeoutPolicy) -> bool {
    match policy {
        TimeoutPolicy::Fail => false,
        TimeoutPolicy::ContinueWithPartial => true,
        TimeoutPolicy::Continue => {
            !ws.received_events.is_empty()
                && match ws.aggregation_strategy {
                    AggregationStrategy::All => contains_all(&ws.received_events, &ws.enabled_events),
                    AggregationStrategy::Any => true,
                    AggregationStrategy::RequiredOnly | AggregationStrategy::Custom => {
                        !ws.required_events.is_empty()
                            && contains_all(&ws.received_events, &ws.required_events)
                    }
                }
        }
    }
}

/// `{<eventType>: payload, ..., correlation_id, received_events}`, plus the
/// timeout markers when resuming from the reaper.
fn aggregate_event_data(ws: &ExecutionWaitState, timed_out: bool) -> Map<String, Value> {
    let mut aggregated = ws.event_data.clone();
    aggregated.insert("correlation_id".into(), json!(ws.correlation_id));
    aggregated.insert("received_events".into(), json!(ws.received_events));
    if timed_out {
        aggregated.insert("timeout".into(), json!(true));
        aggregated.insert(
            "partial".into(),
            json!(!contains_all(&ws.received_events, &ws.enabled_events)),
        );
        aggregated.insert("enabled_events".into(), json!(ws.enabled_events));
        aggregated.insert(
            "aggregation_strategy".into(),
            json!(ws.aggregation_strategy.as_str()),
        );
    }
    aggregated
}

// ---------------------------------------------------------------------------
// WaitStateService
// ---------------------------------------------------------------------------

/// Result of delivering one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// No waiting state matches the execution/correlation pair.
    Unmatched,
    /// The wait state does not wait for this event type.
    NotEnabled,
    /// This event type was already recorded and there was nothing to resume.
    Duplicate,
    /// Recorded; the run was not resumed by this call.
    Recorded,
    /// Recorded and the run was resumed.
    Resumed(ResumeOutcome),
}

pub struct WaitStateService {
    store: Arc<dyn ExecutionStore>,
    engine: Arc<WorkflowEngine>,
}

impl WaitStateService {
    pub fn new(store: Arc<dyn ExecutionStore>, engine: Arc<WorkflowEngine>) -> Self {
        Self { store, engine }
    }

    /// Record `payload` as the `event_type` event of the waiting state
    /// correlated by `correlation_id`, resuming once the strategy is met.
    pub async fn deliver(
        &self,
        execution_id: Uuid,
        correlation_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<Delivery, EngineError> {
        let mut attempt = 0;
        let ws = loop {
            attempt += 1;
            let Some(mut ws) = self
                .store
                .find_waiting_wait_state(execution_id, correlation_id)
                .await?
            else {
                warn!(
                    "no waiting state for execution {} with correlation {}",
                    execution_id, correlation_id
                );
                return Ok(Delivery::Unmatched);
            };
            if !ws.is_enabled(event_type) {
                warn!(
                    "event '{}' is not enabled for wait node '{}' of execution {}",
                    event_type, ws.node_id, execution_id
                );
                return Ok(Delivery::NotEnabled);
            }
            if ws.has_received(event_type) {
                debug!("event '{}' already received for execution {}", event_type, execution_id);
                // A satisfied state still waiting had its claim handed back.
                if is_completion_condition_met(&ws) {
                    if let Some(outcome) = self.try_resume(execution_id, &ws.node_id).await? {
                        return Ok(Delivery::Resumed(outcome));
                    }
                }
                return Ok(Delivery::Duplicate);
            }

            ws.received_events.push(event_type.to_string());
            ws.event_data.insert(event_type.to_string(), payload.clone());
            match self.store.update_wait_state(&mut ws).await {
                Ok(()) => break ws,
                // Another event landed first; re-read and retry.
                Err(e) if e.is_conflict() && attempt < MAX_RECORD_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        };
        info!(
            "event '{}' received for execution {} (node '{}')",
            event_type, execution_id, ws.node_id
        );

        if !is_completion_condition_met(&ws) {
            return Ok(Delivery::Recorded);
        }
        Ok(match self.try_resume(execution_id, &ws.node_id).await? {
            Some(outcome) => Delivery::Resumed(outcome),
            None => Delivery::Recorded,
        })
    }

    /// Resume the run if the wait state is still waiting and satisfied.
    ///
    /// The wait state is claimed with a version-checked transition to
    /// `resuming`; `None` when it was not this call that resumed the run.
    pub async fn try_resume(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<ResumeOutcome>, EngineError> {
        let Some(ws) = self.store.get_wait_state(execution_id, node_id).await? else {
            warn!("no wait state for node '{}' of execution {}", node_id, execution_id);
            return Ok(None);
        };
        if ws.status != WaitStateStatus::Waiting || ws.resumed_at.is_some() {
            debug!("wait state {} already {}", ws.id, ws.status);
            return Ok(None);
        }
        if !is_completion_condition_met(&ws) {
            debug!("completion condition not met for wait state {}", ws.id);
            return Ok(None);
        }

        let aggregated = aggregate_event_data(&ws, false);
        self.claim_and_resume(ws, aggregated).await
    }

    /// Apply `policy` to an expired wait state.
    pub async fn expire(
        &self,
        execution_id: Uuid,
        node_id: &str,
        policy: TimeoutPolicy,
    ) -> Result<Option<ResumeOutcome>, EngineError> {
        let Some(mut ws) = self.store.get_wait_state(execution_id, node_id).await? else {
            warn!("no wait state to expire for node '{}' of execution {}", node_id, execution_id);
            return Ok(None);
        };
        if ws.status != WaitStateStatus::Waiting {
            debug!("wait state {} already {}, not expiring", ws.id, ws.status);
            return Ok(None);
        }

        if is_completion_condition_met(&ws) {
            debug!("wait state {} was satisfied before expiry, resuming", ws.id);
            let aggregated = aggregate_event_data(&ws, false);
            return self.claim_and_resume(ws, aggregated).await;
        }
        if can_continue_on_timeout(&ws, policy) {
            if policy == TimeoutPolicy::ContinueWithPartial {
                warn!(
                    "continuing execution {} with partial events {:?} of {:?}",
                    execution_id, ws.received_events, ws.enabled_events
                );
            }
            let aggregated = aggregate_event_data(&ws, true);
            return self.claim_and_resume(ws, aggregated).await;
        }

        ws.status = WaitStateStatus::Timeout;
        if let Err(e) = self.store.update_wait_state(&mut ws).await {
            if e.is_conflict() {
                debug!("wait state {} handled by another instance", ws.id);
                return Ok(None);
            }
            return Err(e.into());
        }
        info!("wait state {} timed out, failing execution {}", ws.id, execution_id);
        let outcome = self
            .engine
            .fail_waiting(execution_id, node_id, "Timeout waiting for events")
            .await?;
        Ok(Some(outcome))
    }

    /// Waiting states past their expiry, for the reaper.
    pub async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<ExecutionWaitState>, EngineError> {
        Ok(self.store.list_expired_wait_states(now).await?)
    }

    async fn claim_and_resume(
        &self,
        mut ws: ExecutionWaitState,
        aggregated: Map<String, Value>,
    ) -> Result<Option<ResumeOutcome>, EngineError> {
        ws.status = WaitStateStatus::Resuming;
        ws.resumed_at = Some(Utc::now());
        ws.resumed_by = Some(self.engine.config().instance_id.clone());
        if let Err(e) = self.store.update_wait_state(&mut ws).await {
            if e.is_conflict() {
                debug!("wait state {} already claimed by another instance", ws.id);
                return Ok(None);
            }
            return Err(e.into());
        }

        let outcome = self
            .engine
            .resume(ws.execution_id, &ws.node_id, aggregated)
            .await?;

        match &outcome {
            // Locked, or the run has not reached WAITING yet. Hand the claim
            // back so a redelivery or the reaper can resume.
            ResumeOutcome::Contended
            | ResumeOutcome::AlreadyAdvanced(ExecutionStatus::Running) => {
                warn!(
                    "execution {} not resumable yet ({:?}), releasing claim on wait state {}",
                    ws.execution_id, outcome, ws.id
                );
                ws.status = WaitStateStatus::Waiting;
                ws.resumed_at = None;
                ws.resumed_by = None;
            }
            ResumeOutcome::Failed(_) => ws.status = WaitStateStatus::Failed,
            _ => ws.status = WaitStateStatus::Completed,
        }
        if let Err(e) = self.store.update_wait_state(&mut ws).await {
            warn!("could not settle wait state {}: {}", ws.id, e);
        }
        Ok(Some(outcome))
    }
}
