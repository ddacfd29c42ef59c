//! End-to-end tests for the workflow execution engine.
//!
//! Everything runs in-process: `MemoryExecutionStore` stands in for Postgres,
//! `MemoryStore` for Redis, and `MockNode` for real node implementations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use cache::{ContextCache, DistributedLock, FastStore, LockProvider, MemoryStore};
use db::{
    DbError, Execution, ExecutionStatus, ExecutionStore, ExecutionWaitState, MemoryExecutionStore,
    NodeExecution, NodeExecutionStatus, WaitStateStatus, WorkflowRecord,
};
use nodes::mock::{MockBehaviour, MockNode};
use nodes::{ExecutionContext, NodeExecutor, NodeType, TriggerNode};

use crate::{
    Delivery, Edge, EngineConfig, ExecutorRegistry, NodeDefinition, ResumeOutcome, TimeoutPolicy,
    WaitEventsNode, WaitStateService, Workflow, WorkflowDefinition, WorkflowEngine,
};

const INSTANCE: &str = "instance-test";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Build a workflow from `(id, type)` pairs and `(source, target)` pairs.
fn workflow(nodes: &[(&str, &str)], edges: &[(&str, &str)]) -> Workflow {
    Workflow::new(
        "test-workflow",
        WorkflowDefinition::new(
            nodes
                .iter()
                .map(|(id, ty)| NodeDefinition::new(*id, *ty, json!({})))
                .collect(),
            edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
        ),
    )
}

fn trigger_data() -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("email".into(), json!("ada@example.com"));
    data
}

struct Harness {
    store: Arc<dyn ExecutionStore>,
    fast: Arc<dyn FastStore>,
    engine: Arc<WorkflowEngine>,
}

impl Harness {
    fn new(executors: Vec<Arc<dyn NodeExecutor>>) -> Self {
        Self::with_store(Arc::new(MemoryExecutionStore::new()), executors)
    }

    fn with_store(store: Arc<dyn ExecutionStore>, executors: Vec<Arc<dyn NodeExecutor>>) -> Self {
        let fast: Arc<dyn FastStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(ExecutorRegistry::from_executors(executors));
        let lock = Arc::new(DistributedLock::new(Arc::clone(&fast), INSTANCE));
        let cache = Arc::new(ContextCache::new(Arc::clone(&fast), Duration::from_secs(60)));
        let engine = WorkflowEngine::new(
            Arc::clone(&store),
            registry,
            lock,
            cache,
            EngineConfig::default().with_instance_id(INSTANCE),
        );
        Self {
            store,
            fast,
            engine: Arc::new(engine),
        }
    }

    /// Persist `workflow` so `resume` can load it, then run it.
    async fn run(&self, workflow: &Workflow) -> Execution {
        self.store
            .save_workflow(&workflow.to_record().unwrap())
            .await
            .unwrap();
        self.engine
            .execute(workflow, trigger_data(), Some("manual"))
            .await
            .expect("execute should start")
    }

    async fn execution(&self, id: Uuid) -> Execution {
        self.store.get_execution(id).await.unwrap().unwrap()
    }

    async fn records(&self, id: Uuid) -> Vec<NodeExecution> {
        self.store.list_node_executions(id).await.unwrap()
    }

    fn intruder(&self) -> DistributedLock {
        DistributedLock::new(Arc::clone(&self.fast), "instance-intruder")
    }
}

fn executors(list: &[&Arc<MockNode>]) -> Vec<Arc<dyn NodeExecutor>> {
    let mut out: Vec<Arc<dyn NodeExecutor>> = vec![Arc::new(TriggerNode)];
    out.extend(list.iter().map(|m| Arc::clone(*m) as Arc<dyn NodeExecutor>));
    out
}

fn records_for<'a>(records: &'a [NodeExecution], node_id: &str) -> Vec<&'a NodeExecution> {
    records.iter().filter(|r| r.node_id == node_id).collect()
}

// ---------------------------------------------------------------------------
// execute
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_workflow_completes() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({ "sent": true })));
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(
        &[("start", "trigger"), ("a", "action"), ("b", "action")],
        &[("start", "a"), ("a", "b")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.nodes_executed_count, 3);
    assert!(execution.completed_at.is_some());
    assert!(execution.duration_ms.is_some());
    assert_eq!(h.execution(execution.id).await, execution);

    let records = h.records(execution.id).await;
    let ids: Vec<&str> = records.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(ids, vec!["start", "a", "b"]);
    assert!(records.iter().all(|r| r.status == NodeExecutionStatus::Completed));
    assert!(records.windows(2).all(|w| w[0].started_at <= w[1].started_at));

    // The trigger node emits the seeded payload.
    let trigger_output = records[0].output_snapshot.as_ref().unwrap();
    assert_eq!(trigger_output["email"], "ada@example.com");
    assert_eq!(action.called_ids(), vec!["a", "b"]);
}

#[tokio::test]
async fn later_nodes_see_earlier_outputs() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({ "sent": true })));
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(
        &[("start", "trigger"), ("a", "action"), ("b", "action")],
        &[("start", "a"), ("a", "b")],
    );

    let execution = h.run(&wf).await;

    let records = h.records(execution.id).await;
    let input = &records[2].input_snapshot;
    assert_eq!(input["_nodeOutputs"]["start"]["email"], "ada@example.com");
    assert_eq!(input["_nodeOutputs"]["a"]["sent"], true);
}

#[tokio::test]
async fn execute_releases_the_lock_and_evicts_the_context() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({})));
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(&[("start", "trigger"), ("a", "action")], &[("start", "a")]);

    let execution = h.run(&wf).await;

    assert!(!h.intruder().is_locked(execution.id).await.unwrap());
    assert!(!h
        .fast
        .exists(&format!("execution:context:{}", execution.id))
        .await
        .unwrap());
    let snapshot: ExecutionContext =
        serde_json::from_value(execution.context_snapshot.clone().unwrap()).unwrap();
    assert!(snapshot.get_node_output("a").is_some());
}

#[tokio::test]
async fn unknown_node_type_fails_only_that_node() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({})));
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(
        &[("start", "trigger"), ("odd", "bogus-type"), ("a", "action")],
        &[("start", "odd"), ("start", "a")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let records = h.records(execution.id).await;
    let odd = records_for(&records, "odd");
    assert_eq!(odd.len(), 1);
    assert_eq!(odd[0].status, NodeExecutionStatus::Failed);
    assert!(odd[0].error.as_deref().unwrap().contains("bogus-type"));
    // Definition errors are not counted as executed nodes.
    assert_eq!(execution.nodes_executed_count, 2);
}

#[tokio::test]
async fn missing_executor_fails_the_node() {
    let h = Harness::new(executors(&[]));
    let wf = workflow(&[("start", "trigger"), ("d", "data")], &[("start", "d")]);

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let records = h.records(execution.id).await;
    let d = records_for(&records, "d");
    assert_eq!(d[0].status, NodeExecutionStatus::Failed);
    assert!(d[0].error.as_deref().unwrap().contains("no executor"));
}

#[tokio::test]
async fn failing_node_halts_its_branch() {
    let action = Arc::new(
        MockNode::returning(NodeType::Action, json!({}))
            .with_override("boom", MockBehaviour::Crash("smtp unreachable".into())),
    );
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(
        &[("start", "trigger"), ("boom", "action"), ("after", "action"), ("other", "action")],
        &[("start", "boom"), ("boom", "after"), ("start", "other")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(action.called_ids(), vec!["boom", "other"]);
    let records = h.records(execution.id).await;
    let boom = records_for(&records, "boom");
    assert_eq!(boom[0].status, NodeExecutionStatus::Failed);
    assert!(boom[0].error.as_deref().unwrap().contains("smtp unreachable"));
    assert!(records_for(&records, "after").is_empty());
}

#[tokio::test]
async fn next_node_id_overrides_adjacency() {
    let logic = Arc::new(MockNode::new(NodeType::Logic, MockBehaviour::Branch("B".into())));
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({})));
    let h = Harness::new(executors(&[&logic, &action]));
    let wf = workflow(
        &[("start", "trigger"), ("if", "logic"), ("B", "action"), ("C", "action")],
        &[("start", "if"), ("if", "B"), ("if", "C")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(action.called_ids(), vec!["B"]);
    assert!(records_for(&h.records(execution.id).await, "C").is_empty());
}

#[tokio::test]
async fn diamond_visits_the_join_once() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({})));
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(
        &[("start", "trigger"), ("a", "action"), ("b", "action"), ("join", "action")],
        &[("start", "a"), ("start", "b"), ("a", "join"), ("b", "join")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(action.called_ids(), vec!["a", "join", "b"]);
    assert_eq!(records_for(&h.records(execution.id).await, "join").len(), 1);
    assert_eq!(execution.nodes_executed_count, 4);
}

#[tokio::test]
async fn cycles_do_not_loop() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({})));
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(
        &[("start", "trigger"), ("a", "action"), ("b", "action")],
        &[("start", "a"), ("a", "b"), ("b", "a")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(action.called_ids(), vec!["a", "b"]);
}

// ---------------------------------------------------------------------------
// Waiting and resume
// ---------------------------------------------------------------------------

/// start -> wait (data, suspends) -> after (action)
fn waiting_workflow() -> Workflow {
    workflow(
        &[("start", "trigger"), ("wait", "data"), ("after", "action")],
        &[("start", "wait"), ("wait", "after")],
    )
}

fn waiting_mocks() -> (Arc<MockNode>, Arc<MockNode>) {
    (
        Arc::new(MockNode::waiting(NodeType::Data, "ws-1")),
        Arc::new(MockNode::returning(NodeType::Action, json!({ "sent": true }))),
    )
}

fn events(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn waiting_node_suspends_the_run() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));

    let execution = h.run(&waiting_workflow()).await;

    assert_eq!(execution.status, ExecutionStatus::Waiting);
    assert!(execution.completed_at.is_none());
    assert_eq!(execution.nodes_executed_count, 2);
    assert_eq!(after.call_count(), 0);

    let records = h.records(execution.id).await;
    let waiting = records_for(&records, "wait");
    assert_eq!(waiting[0].status, NodeExecutionStatus::Waiting);
    assert!(waiting[0].completed_at.is_none());

    let snapshot: ExecutionContext =
        serde_json::from_value(execution.context_snapshot.clone().unwrap()).unwrap();
    assert!(snapshot.is_waiting());
    assert_eq!(snapshot.wait_state_id.as_deref(), Some("ws-1"));
    assert_eq!(snapshot.waiting_node_id.as_deref(), Some("wait"));
    assert!(!h.intruder().is_locked(execution.id).await.unwrap());
}

#[tokio::test]
async fn wait_halts_sibling_branches() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let wf = workflow(
        &[("start", "trigger"), ("wait", "data"), ("sibling", "action"), ("lone", "action")],
        &[("start", "wait"), ("start", "sibling")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Waiting);
    // Neither the sibling branch nor the second start node ran.
    assert_eq!(after.call_count(), 0);
    assert_eq!(h.records(execution.id).await.len(), 2);
}

#[tokio::test]
async fn resume_continues_from_successors() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let execution = h.run(&waiting_workflow()).await;

    let outcome = h
        .engine
        .resume(execution.id, "wait", events(&[("api_response", json!({ "code": 200 }))]))
        .await
        .unwrap();

    assert_eq!(outcome, ResumeOutcome::Completed);
    assert_eq!(wait.call_count(), 1);
    assert_eq!(after.called_ids(), vec!["after"]);

    let resumed = h.execution(execution.id).await;
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    assert_eq!(resumed.nodes_executed_count, 3);
    assert!(resumed.duration_ms.is_some());

    let records = h.records(execution.id).await;
    let waited = records_for(&records, "wait");
    assert_eq!(waited.len(), 1);
    assert_eq!(waited[0].status, NodeExecutionStatus::Completed);
    assert_eq!(
        waited[0].output_snapshot.as_ref().unwrap()["api_response"]["code"],
        200
    );

    let snapshot: ExecutionContext =
        serde_json::from_value(resumed.context_snapshot.unwrap()).unwrap();
    assert!(!snapshot.is_waiting());
    assert_eq!(snapshot.get_variable("api_response").unwrap()["code"], 200);
    assert_eq!(
        snapshot.get_trigger_data_for_node("start")["email"],
        "ada@example.com"
    );
    assert!(snapshot.get_node_output("start").is_some());
}

#[tokio::test]
async fn resume_is_a_no_op_unless_waiting() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({})));
    let h = Harness::new(executors(&[&action]));
    let wf = workflow(&[("start", "trigger"), ("a", "action")], &[("start", "a")]);
    let execution = h.run(&wf).await;
    let before = h.execution(execution.id).await;
    let records_before = h.records(execution.id).await;

    let outcome = h.engine.resume(execution.id, "a", Map::new()).await.unwrap();

    assert_eq!(outcome, ResumeOutcome::AlreadyAdvanced(ExecutionStatus::Completed));
    assert_eq!(h.execution(execution.id).await, before);
    assert_eq!(h.records(execution.id).await, records_before);
    assert_eq!(action.call_count(), 1);
}

#[tokio::test]
async fn resume_of_unknown_execution_is_an_error() {
    let h = Harness::new(executors(&[]));
    let err = h
        .engine
        .resume(Uuid::new_v4(), "wait", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, crate::EngineError::ExecutionNotFound(_)));
}

#[tokio::test]
async fn resume_backs_off_while_locked_elsewhere() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let execution = h.run(&waiting_workflow()).await;
    let intruder = h.intruder();
    assert!(intruder
        .acquire(execution.id, Duration::from_secs(30))
        .await
        .unwrap());

    let outcome = h.engine.resume(execution.id, "wait", Map::new()).await.unwrap();

    assert_eq!(outcome, ResumeOutcome::Contended);
    assert_eq!(h.execution(execution.id).await.status, ExecutionStatus::Waiting);
    assert_eq!(after.call_count(), 0);
    // The intruder's lock is untouched.
    assert!(intruder.is_locked_by_me(execution.id).await.unwrap());
}

#[tokio::test]
async fn concurrent_resumes_advance_the_run_once() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let execution = h.run(&waiting_workflow()).await;

    let (first, second) = tokio::join!(
        h.engine.resume(execution.id, "wait", events(&[("kafka_event", json!(1))])),
        h.engine.resume(execution.id, "wait", events(&[("kafka_event", json!(2))])),
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    let completed = outcomes
        .iter()
        .filter(|o| **o == ResumeOutcome::Completed)
        .count();
    assert_eq!(completed, 1, "outcomes: {outcomes:?}");
    assert!(outcomes.iter().all(|o| matches!(
        o,
        ResumeOutcome::Completed
            | ResumeOutcome::AlreadyAdvanced(_)
            | ResumeOutcome::Contended
            | ResumeOutcome::Superseded
    )));

    let records = h.records(execution.id).await;
    let waited = records_for(&records, "wait");
    assert_eq!(waited.len(), 1);
    assert_eq!(waited[0].status, NodeExecutionStatus::Completed);
    assert_eq!(records_for(&records, "after").len(), 1);
    assert_eq!(after.call_count(), 1);
}

#[tokio::test]
async fn nested_wait_suspends_again() {
    let wait = Arc::new(
        MockNode::waiting(NodeType::Data, "ws-1")
            .with_override("second", MockBehaviour::Wait("ws-2".into())),
    );
    let after = Arc::new(MockNode::returning(NodeType::Action, json!({})));
    let h = Harness::new(executors(&[&wait, &after]));
    let wf = workflow(
        &[("start", "trigger"), ("first", "data"), ("second", "data"), ("after", "action")],
        &[("start", "first"), ("first", "second"), ("second", "after")],
    );
    let execution = h.run(&wf).await;

    let outcome = h.engine.resume(execution.id, "first", Map::new()).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::Waiting);
    let paused = h.execution(execution.id).await;
    assert_eq!(paused.status, ExecutionStatus::Waiting);
    assert_eq!(paused.nodes_executed_count, 3);
    let snapshot: ExecutionContext =
        serde_json::from_value(paused.context_snapshot.unwrap()).unwrap();
    assert_eq!(snapshot.wait_state_id.as_deref(), Some("ws-2"));

    let outcome = h.engine.resume(execution.id, "second", Map::new()).await.unwrap();
    assert_eq!(outcome, ResumeOutcome::Completed);
    assert_eq!(h.execution(execution.id).await.nodes_executed_count, 4);
    assert_eq!(after.call_count(), 1);
}

#[tokio::test]
async fn resume_without_workflow_fails_the_run() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let wf = waiting_workflow();
    // Not saved: the definition cannot be loaded on resume.
    let execution = h.engine.execute(&wf, trigger_data(), None).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Waiting);

    let outcome = h.engine.resume(execution.id, "wait", Map::new()).await.unwrap();

    let ResumeOutcome::Failed(reason) = outcome else {
        panic!("expected a failed resume, got {outcome:?}");
    };
    assert!(reason.contains("not found"));
    let failed = h.execution(execution.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(reason.as_str()));
    assert_eq!(after.call_count(), 0);
}

#[tokio::test]
async fn resume_with_null_definition_fails_the_run() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let wf = waiting_workflow();
    let execution = h.run(&wf).await;
    h.store
        .save_workflow(&WorkflowRecord {
            id: wf.id,
            name: wf.name.clone(),
            definition: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let outcome = h.engine.resume(execution.id, "wait", Map::new()).await.unwrap();

    assert!(matches!(outcome, ResumeOutcome::Failed(_)));
    assert_eq!(h.execution(execution.id).await.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn resume_of_unknown_node_fails_the_run() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let execution = h.run(&waiting_workflow()).await;

    let outcome = h.engine.resume(execution.id, "ghost", Map::new()).await.unwrap();

    let ResumeOutcome::Failed(reason) = outcome else {
        panic!("expected a failed resume, got {outcome:?}");
    };
    assert!(reason.contains("ghost"));
    assert_eq!(h.execution(execution.id).await.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn fail_waiting_fails_node_and_run() {
    let (wait, after) = waiting_mocks();
    let h = Harness::new(executors(&[&wait, &after]));
    let execution = h.run(&waiting_workflow()).await;

    let outcome = h
        .engine
        .fail_waiting(execution.id, "wait", "Timeout waiting for events")
        .await
        .unwrap();

    assert_eq!(outcome, ResumeOutcome::Failed("Timeout waiting for events".into()));
    let failed = h.execution(execution.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.completed_at.is_some());
    let records = h.records(execution.id).await;
    let waited = records_for(&records, "wait");
    assert_eq!(waited[0].status, NodeExecutionStatus::Failed);
    assert_eq!(waited[0].error.as_deref(), Some("Timeout waiting for events"));

    // A second call sees the run already advanced.
    let again = h
        .engine
        .fail_waiting(execution.id, "wait", "Timeout waiting for events")
        .await
        .unwrap();
    assert_eq!(again, ResumeOutcome::AlreadyAdvanced(ExecutionStatus::Failed));
}

// ---------------------------------------------------------------------------
// Concurrency failures from the durable store
// ---------------------------------------------------------------------------

/// Delegates to a memory store. While `conflict` is set, every execution
/// update fails as if another instance had written first; inserting the
/// record of node `broken_node` fails like a storage fault.
struct FaultyStore {
    inner: MemoryExecutionStore,
    conflict: AtomicBool,
    broken_node: Option<&'static str>,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: MemoryExecutionStore::new(),
            conflict: AtomicBool::new(false),
            broken_node: None,
        }
    }

    fn failing_on(node_id: &'static str) -> Self {
        Self {
            broken_node: Some(node_id),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ExecutionStore for FaultyStore {
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> Result<(), DbError> {
        self.inner.save_workflow(workflow).await
    }
    async fn get_workflow(&self, id: Uuid) -> Result<Option<WorkflowRecord>, DbError> {
        self.inner.get_workflow(id).await
    }
    async fn insert_execution(&self, execution: &Execution) -> Result<(), DbError> {
        self.inner.insert_execution(execution).await
    }
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, DbError> {
        self.inner.get_execution(id).await
    }
    async fn update_execution(&self, execution: &mut Execution) -> Result<(), DbError> {
        if self.conflict.load(Ordering::SeqCst) {
            return Err(DbError::ConcurrentModification {
                entity: "execution",
                id: execution.id.to_string(),
            });
        }
        self.inner.update_execution(execution).await
    }
    async fn insert_node_execution(&self, record: &NodeExecution) -> Result<(), DbError> {
        if self.broken_node == Some(record.node_id.as_str()) {
            return Err(DbError::Decode("disk full".into()));
        }
        self.inner.insert_node_execution(record).await
    }
    async fn update_node_execution(&self, record: &NodeExecution) -> Result<(), DbError> {
        self.inner.update_node_execution(record).await
    }
    async fn list_node_executions(&self, execution_id: Uuid) -> Result<Vec<NodeExecution>, DbError> {
        self.inner.list_node_executions(execution_id).await
    }
    async fn insert_wait_state(&self, wait_state: &ExecutionWaitState) -> Result<(), DbError> {
        self.inner.insert_wait_state(wait_state).await
    }
    async fn get_wait_state(
        &self,
        execution_id: Uuid,
        node_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError> {
        self.inner.get_wait_state(execution_id, node_id).await
    }
    async fn find_waiting_wait_state(
        &self,
        execution_id: Uuid,
        correlation_id: &str,
    ) -> Result<Option<ExecutionWaitState>, DbError> {
        self.inner.find_waiting_wait_state(execution_id, correlation_id).await
    }
    async fn update_wait_state(&self, wait_state: &mut ExecutionWaitState) -> Result<(), DbError> {
        self.inner.update_wait_state(wait_state).await
    }
    async fn list_expired_wait_states(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionWaitState>, DbError> {
        self.inner.list_expired_wait_states(now).await
    }
}

#[tokio::test]
async fn losing_a_resume_race_is_swallowed() {
    let store = Arc::new(FaultyStore::new());
    let (wait, after) = waiting_mocks();
    let h = Harness::with_store(store.clone(), executors(&[&wait, &after]));
    let execution = h.run(&waiting_workflow()).await;
    let before = h.execution(execution.id).await;

    store.conflict.store(true, Ordering::SeqCst);
    let outcome = h.engine.resume(execution.id, "wait", Map::new()).await.unwrap();

    assert_eq!(outcome, ResumeOutcome::Superseded);
    assert_eq!(h.execution(execution.id).await, before);
    assert_eq!(after.call_count(), 0);
    // The lock is released even though the resume backed off.
    assert!(!h.intruder().is_locked(execution.id).await.unwrap());
}

#[tokio::test]
async fn storage_failure_mid_run_fails_the_execution() {
    let action = Arc::new(MockNode::returning(NodeType::Action, json!({ "sent": true })));
    let h = Harness::with_store(Arc::new(FaultyStore::failing_on("b")), executors(&[&action]));
    let wf = workflow(
        &[("start", "trigger"), ("a", "action"), ("b", "action")],
        &[("start", "a"), ("a", "b")],
    );

    let execution = h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        execution.error.as_deref(),
        Some("database error: corrupt column value: disk full")
    );
    assert!(execution.completed_at.is_some());
    assert_eq!(h.execution(execution.id).await, execution);

    // Rows written before the fault stay behind.
    let records = h.records(execution.id).await;
    let ids: Vec<&str> = records.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(ids, vec!["start", "a"]);
    assert!(records.iter().all(|r| r.status == NodeExecutionStatus::Completed));
    assert_eq!(action.called_ids(), vec!["a"]);
    assert!(!h.intruder().is_locked(execution.id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Event aggregation
// ---------------------------------------------------------------------------

fn wait_events_workflow(config: Value) -> Workflow {
    Workflow::new(
        "wait-for-events",
        WorkflowDefinition::new(
            vec![
                NodeDefinition::new("start", "trigger", json!({})),
                NodeDefinition::new("wait", "wait_events", config),
                NodeDefinition::new("after", "action", json!({})),
            ],
            vec![Edge::new("start", "wait"), Edge::new("wait", "after")],
        ),
    )
}

struct EventHarness {
    h: Harness,
    after: Arc<MockNode>,
    service: WaitStateService,
}

impl EventHarness {
    fn new() -> Self {
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryExecutionStore::new());
        let after = Arc::new(MockNode::returning(NodeType::Action, json!({ "sent": true })));
        let mut list = executors(&[&after]);
        list.push(Arc::new(WaitEventsNode::new(Arc::clone(&store))));
        let h = Harness::with_store(Arc::clone(&store), list);
        let service = WaitStateService::new(store, Arc::clone(&h.engine));
        Self { h, after, service }
    }

    async fn wait_state(&self, execution_id: Uuid) -> ExecutionWaitState {
        self.h
            .store
            .get_wait_state(execution_id, "wait")
            .await
            .unwrap()
            .unwrap()
    }
}

#[tokio::test]
async fn all_strategy_resumes_after_every_event() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({
        "aggregationStrategy": "all",
        "events": ["api_response", "kafka_event"]
    }));
    let execution = t.h.run(&wf).await;
    assert_eq!(execution.status, ExecutionStatus::Waiting);
    let ws = t.wait_state(execution.id).await;
    assert_eq!(ws.required_events, vec!["api_response", "kafka_event"]);

    let first = t
        .service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({ "code": 200 }))
        .await
        .unwrap();
    assert_eq!(first, Delivery::Recorded);
    assert_eq!(t.h.execution(execution.id).await.status, ExecutionStatus::Waiting);
    assert_eq!(t.after.call_count(), 0);

    let duplicate = t
        .service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({ "code": 500 }))
        .await
        .unwrap();
    assert_eq!(duplicate, Delivery::Duplicate);

    let second = t
        .service
        .deliver(execution.id, &ws.correlation_id, "kafka_event", json!({ "offset": 7 }))
        .await
        .unwrap();
    assert_eq!(second, Delivery::Resumed(ResumeOutcome::Completed));

    assert_eq!(t.h.execution(execution.id).await.status, ExecutionStatus::Completed);
    assert_eq!(t.after.call_count(), 1);

    let settled = t.wait_state(execution.id).await;
    assert_eq!(settled.status, WaitStateStatus::Completed);
    assert_eq!(settled.resumed_by.as_deref(), Some(INSTANCE));
    assert!(settled.resumed_at.is_some());

    let records = t.h.records(execution.id).await;
    let output = records_for(&records, "wait")[0].output_snapshot.clone().unwrap();
    assert_eq!(output["api_response"]["code"], 200);
    assert_eq!(output["kafka_event"]["offset"], 7);
    assert_eq!(output["correlation_id"], json!(ws.correlation_id));
    assert_eq!(output["received_events"], json!(["api_response", "kafka_event"]));

    // Late events no longer match a waiting state.
    let late = t
        .service
        .deliver(execution.id, &ws.correlation_id, "kafka_event", json!({}))
        .await
        .unwrap();
    assert_eq!(late, Delivery::Unmatched);
}

#[tokio::test]
async fn any_strategy_resumes_on_first_event() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({
        "aggregationStrategy": "any",
        "apiCall": { "enabled": true },
        "kafkaEvent": { "enabled": true }
    }));
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;

    let delivery = t
        .service
        .deliver(execution.id, &ws.correlation_id, "kafka_event", json!({ "offset": 1 }))
        .await
        .unwrap();

    assert_eq!(delivery, Delivery::Resumed(ResumeOutcome::Completed));
    assert_eq!(t.after.call_count(), 1);
}

#[tokio::test]
async fn events_that_are_not_awaited_are_ignored() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "events": ["api_response"] }));
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;

    let not_enabled = t
        .service
        .deliver(execution.id, &ws.correlation_id, "kafka_event", json!({}))
        .await
        .unwrap();
    let wrong_correlation = t
        .service
        .deliver(execution.id, "not-a-correlation", "api_response", json!({}))
        .await
        .unwrap();

    assert_eq!(not_enabled, Delivery::NotEnabled);
    assert_eq!(wrong_correlation, Delivery::Unmatched);
    assert!(t.wait_state(execution.id).await.received_events.is_empty());
    assert_eq!(t.h.execution(execution.id).await.status, ExecutionStatus::Waiting);
}

#[tokio::test]
async fn wait_without_events_is_skipped() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "apiCall": { "enabled": false } }));

    let execution = t.h.run(&wf).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(t.after.call_count(), 1);
    assert!(t
        .h
        .store
        .get_wait_state(execution.id, "wait")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn try_resume_skips_an_already_resumed_state() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "aggregationStrategy": "any", "events": ["api_response"] }));
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;
    t.service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({}))
        .await
        .unwrap();

    let again = t.service.try_resume(execution.id, "wait").await.unwrap();

    assert_eq!(again, None);
    assert_eq!(t.after.call_count(), 1);
}

#[tokio::test]
async fn contended_resume_hands_the_wait_state_back() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "aggregationStrategy": "any", "events": ["api_response"] }));
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;
    let intruder = t.h.intruder();
    intruder
        .acquire(execution.id, Duration::from_secs(30))
        .await
        .unwrap();

    let delivery = t
        .service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({}))
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Resumed(ResumeOutcome::Contended));
    let released = t.wait_state(execution.id).await;
    assert_eq!(released.status, WaitStateStatus::Waiting);
    assert!(released.resumed_at.is_none());

    intruder.release(execution.id).await.unwrap();
    let retried = t.service.try_resume(execution.id, "wait").await.unwrap();
    assert_eq!(retried, Some(ResumeOutcome::Completed));
    assert_eq!(t.after.call_count(), 1);
}

/// Set the persisted execution's status, as `execute` does between
/// registering the wait state and saving WAITING.
async fn force_status(h: &Harness, execution_id: Uuid, status: ExecutionStatus) {
    let mut execution = h.execution(execution_id).await;
    execution.status = status;
    h.store.update_execution(&mut execution).await.unwrap();
}

#[tokio::test]
async fn event_before_the_run_is_waiting_resumes_on_redelivery() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "aggregationStrategy": "any", "events": ["api_response"] }));
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;
    force_status(&t.h, execution.id, ExecutionStatus::Running).await;

    let early = t
        .service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({ "code": 200 }))
        .await
        .unwrap();
    assert_eq!(
        early,
        Delivery::Resumed(ResumeOutcome::AlreadyAdvanced(ExecutionStatus::Running))
    );
    let released = t.wait_state(execution.id).await;
    assert_eq!(released.status, WaitStateStatus::Waiting);
    assert!(released.resumed_at.is_none());
    assert_eq!(released.received_events, vec!["api_response"]);

    force_status(&t.h, execution.id, ExecutionStatus::Waiting).await;
    let redelivered = t
        .service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({ "code": 200 }))
        .await
        .unwrap();

    assert_eq!(redelivered, Delivery::Resumed(ResumeOutcome::Completed));
    assert_eq!(t.h.execution(execution.id).await.status, ExecutionStatus::Completed);
    assert_eq!(t.wait_state(execution.id).await.status, WaitStateStatus::Completed);
    assert_eq!(t.after.call_count(), 1);
}

#[tokio::test]
async fn reaper_resumes_a_satisfied_wait_state_it_finds_expired() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "aggregationStrategy": "any", "events": ["api_response"] }));
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;
    force_status(&t.h, execution.id, ExecutionStatus::Running).await;
    t.service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({ "code": 200 }))
        .await
        .unwrap();
    force_status(&t.h, execution.id, ExecutionStatus::Waiting).await;

    let expired = t
        .service
        .expired(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);

    // The events arrived in time, so the fail policy does not apply.
    let outcome = t
        .service
        .expire(execution.id, "wait", TimeoutPolicy::Fail)
        .await
        .unwrap();

    assert_eq!(outcome, Some(ResumeOutcome::Completed));
    assert_eq!(t.h.execution(execution.id).await.status, ExecutionStatus::Completed);
    assert_eq!(t.after.call_count(), 1);
    let records = t.h.records(execution.id).await;
    let output = records_for(&records, "wait")[0].output_snapshot.clone().unwrap();
    assert_eq!(output["api_response"]["code"], 200);
    assert!(output.get("partial").is_none());
}

#[tokio::test]
async fn expiry_with_fail_policy_fails_the_run() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "events": ["api_response", "kafka_event"], "timeout": 1 }));
    let execution = t.h.run(&wf).await;

    let expired = t
        .service
        .expired(Utc::now() + chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].node_id, "wait");
    assert!(t.service.expired(Utc::now()).await.unwrap().is_empty());

    let outcome = t
        .service
        .expire(execution.id, "wait", TimeoutPolicy::Fail)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Some(ResumeOutcome::Failed("Timeout waiting for events".into()))
    );
    assert_eq!(t.wait_state(execution.id).await.status, WaitStateStatus::Timeout);
    let failed = t.h.execution(execution.id).await;
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("Timeout waiting for events"));
    assert_eq!(t.after.call_count(), 0);

    // Already timed out: nothing left to do.
    let again = t
        .service
        .expire(execution.id, "wait", TimeoutPolicy::Fail)
        .await
        .unwrap();
    assert_eq!(again, None);
}

#[tokio::test]
async fn expiry_can_continue_with_partial_events() {
    let t = EventHarness::new();
    let wf = wait_events_workflow(json!({ "events": ["api_response", "kafka_event"] }));
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;
    t.service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({ "code": 200 }))
        .await
        .unwrap();

    // `continue` needs the strategy satisfied; only one of two events arrived.
    let refused = t
        .service
        .expire(execution.id, "wait", TimeoutPolicy::Continue)
        .await
        .unwrap();
    assert!(matches!(refused, Some(ResumeOutcome::Failed(_))));

    let t = EventHarness::new();
    let execution = t.h.run(&wf).await;
    let ws = t.wait_state(execution.id).await;
    t.service
        .deliver(execution.id, &ws.correlation_id, "api_response", json!({ "code": 200 }))
        .await
        .unwrap();

    let outcome = t
        .service
        .expire(execution.id, "wait", TimeoutPolicy::ContinueWithPartial)
        .await
        .unwrap();

    assert_eq!(outcome, Some(ResumeOutcome::Completed));
    assert_eq!(t.after.call_count(), 1);
    let records = t.h.records(execution.id).await;
    let output = records_for(&records, "wait")[0].output_snapshot.clone().unwrap();
    assert_eq!(output["timeout"], true);
    assert_eq!(output["partial"], true);
    assert_eq!(output["api_response"]["code"], 200);
    assert_eq!(output["aggregation_strategy"], "all");
}
