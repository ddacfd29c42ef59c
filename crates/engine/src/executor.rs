//! Workflow execution engine.
//!
//! `WorkflowEngine` is the central orchestrator:
//! 1. `execute` creates the `Execution`, seeds the context with the trigger
//!    payload and walks the graph depth-first from its start nodes.
//! 2. Every node is dispatched through the `ExecutorRegistry` and its outcome
//!    is recorded as a `NodeExecution`.
//! 3. A node reporting `waiting` suspends the whole run; the context snapshot
//!    is persisted and its cache entry evicted.
//! 4. `resume` continues a suspended run from the waiting node's successors.
//!    Only a `WAITING` execution is touched, and only under its lock, so
//!    racing resumes from several instances advance the run exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use cache::{CacheStore, LockProvider};
use db::{Execution, ExecutionStatus, ExecutionStore, NodeExecution, NodeExecutionStatus};
use nodes::{ExecutionContext, NodeExecutionResult};

use crate::config::EngineConfig;
use crate::graph::WorkflowGraph;
use crate::registry::ExecutorRegistry;
use crate::{EngineError, Workflow};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What a `resume` (or `fail_waiting`) call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The run finished.
    Completed,
    /// The run reached another wait.
    Waiting,
    /// The execution was no longer `WAITING`; nothing was touched.
    AlreadyAdvanced(ExecutionStatus),
    /// Another instance holds the execution lock; back off.
    Contended,
    /// A concurrent writer won the race; nothing more was written.
    Superseded,
    /// The run was marked `FAILED` with this message.
    Failed(String),
}

/// Result of visiting one node.
enum Step {
    /// The branch ends here.
    Halt,
    /// The node suspended the run.
    Wait,
    /// Continue with these nodes, in order.
    Continue(Vec<String>),
}

enum RunEnd {
    Waiting,
    Completed,
    Failed(String),
    Superseded,
}

/// State of one `execute`/`resume` call.
struct Run {
    execution: Execution,
    context: ExecutionContext,
    visited: HashSet<String>,
    waiting: bool,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Shared by every run on this instance; all per-run state lives in `Run`.
pub struct WorkflowEngine {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<ExecutorRegistry>,
    lock: Arc<dyn LockProvider>,
    cache: Arc<dyn CacheStore>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<ExecutorRegistry>,
        lock: Arc<dyn LockProvider>,
        cache: Arc<dyn CacheStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            lock,
            cache,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Run `workflow` from its start nodes.
    ///
    /// Node failures and infrastructure errors during the run are reported
    /// through the returned execution's status (`FAILED`). `Err` is returned
    /// only when the run could not be started at all.
    #[instrument(skip(self, workflow, trigger_data), fields(workflow_id = %workflow.id))]
    pub async fn execute(
        &self,
        workflow: &Workflow,
        trigger_data: Map<String, Value>,
        trigger_id: Option<&str>,
    ) -> Result<Execution, EngineError> {
        let execution = Execution::start(
            workflow.id,
            trigger_data.clone(),
            trigger_id.map(str::to_owned),
        );
        let execution_id = execution.id;

        if !self.lock.acquire(execution_id, self.config.lock_lease).await? {
            return Err(EngineError::LockUnavailable(execution_id));
        }
        let result = self.run_new(workflow, execution, trigger_data).await;
        self.release(execution_id).await;
        result
    }

    /// Continue a `WAITING` execution after `node_id` with the events
    /// aggregated for it.
    ///
    /// Calling this on an execution that is not `WAITING` is a no-op.
    #[instrument(skip(self, aggregated), fields(execution_id = %execution_id, node_id = %node_id))]
    pub async fn resume(
        &self,
        execution_id: Uuid,
        node_id: &str,
        aggregated: Map<String, Value>,
    ) -> Result<ResumeOutcome, EngineError> {
        let execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Waiting {
            info!(
                "execution {} is {}, not resuming",
                execution_id, execution.status
            );
            return Ok(ResumeOutcome::AlreadyAdvanced(execution.status));
        }

        if !self.lock.acquire(execution_id, self.config.lock_lease).await? {
            warn!("execution {} is being advanced elsewhere", execution_id);
            return Ok(ResumeOutcome::Contended);
        }
        let outcome = self.resume_locked(execution_id, node_id, aggregated).await;
        self.release(execution_id).await;
        outcome
    }

    /// Fail a `WAITING` execution and its waiting node, e.g. on wait timeout.
    #[instrument(skip(self, reason), fields(execution_id = %execution_id, node_id = %node_id))]
    pub async fn fail_waiting(
        &self,
        execution_id: Uuid,
        node_id: &str,
        reason: &str,
    ) -> Result<ResumeOutcome, EngineError> {
        let execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Waiting {
            return Ok(ResumeOutcome::AlreadyAdvanced(execution.status));
        }

        if !self.lock.acquire(execution_id, self.config.lock_lease).await? {
            return Ok(ResumeOutcome::Contended);
        }
        let outcome = self.fail_waiting_locked(execution_id, node_id, reason).await;
        self.release(execution_id).await;
        outcome
    }

    // -----------------------------------------------------------------------
    // execute
    // -----------------------------------------------------------------------

    async fn run_new(
        &self,
        workflow: &Workflow,
        execution: Execution,
        trigger_data: Map<String, Value>,
    ) -> Result<Execution, EngineError> {
        self.store.insert_execution(&execution).await?;
        info!(
            "execution {} started for workflow '{}'",
            execution.id, workflow.name
        );

        let graph = WorkflowGraph::new(&workflow.definition);
        let mut context =
            ExecutionContext::new(execution.id.to_string(), workflow.id.to_string());
        context.set_metadata("workflowName", json!(workflow.name));
        context.set_metadata("startedAt", json!(execution.started_at.to_rfc3339()));
        if let Some(trigger_id) = &execution.trigger_id {
            context.set_metadata("triggerId", json!(trigger_id));
        }
        match graph.trigger_node_id() {
            Some(trigger_node) => context.set_trigger_data_for_node(trigger_node, trigger_data),
            None => warn!(
                "workflow {} has no trigger node, trigger data not seeded",
                workflow.id
            ),
        }

        let mut run = Run {
            execution,
            context,
            visited: HashSet::new(),
            waiting: false,
        };
        self.cache_context(&run).await;

        let traversal = self.traverse(&graph, &graph.start_nodes(), &mut run).await;
        match self.finish_run(&mut run, traversal).await? {
            RunEnd::Completed => info!(
                "execution {} completed ({} nodes)",
                run.execution.id, run.execution.nodes_executed_count
            ),
            RunEnd::Waiting => info!("execution {} is waiting", run.execution.id),
            RunEnd::Failed(_) | RunEnd::Superseded => {}
        }
        Ok(run.execution)
    }

    // -----------------------------------------------------------------------
    // resume
    // -----------------------------------------------------------------------

    async fn resume_locked(
        &self,
        execution_id: Uuid,
        node_id: &str,
        aggregated: Map<String, Value>,
    ) -> Result<ResumeOutcome, EngineError> {
        // Re-check under the lock: the first read raced other instances.
        let execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Waiting {
            return Ok(ResumeOutcome::AlreadyAdvanced(execution.status));
        }

        let workflow = match self.store.get_workflow(execution.workflow_id).await? {
            Some(record) => match Workflow::from_record(record) {
                Ok(workflow) => workflow,
                Err(e) => return self.fail_execution(execution, e.to_string()).await,
            },
            None => {
                let reason = format!("workflow {} not found", execution.workflow_id);
                return self.fail_execution(execution, reason).await;
            }
        };

        let graph = WorkflowGraph::new(&workflow.definition);
        if !graph.contains(node_id) {
            let reason = format!("node '{}' is not part of workflow {}", node_id, workflow.id);
            return self.fail_execution(execution, reason).await;
        }

        let records = self.store.list_node_executions(execution_id).await?;
        let waiting_record = records
            .iter()
            .find(|r| r.node_id == node_id && r.status == NodeExecutionStatus::Waiting)
            .cloned();
        let (context, visited) = self
            .rebuild_context(&execution, &graph, &records, node_id, &aggregated)
            .await;
        let mut run = Run {
            execution,
            context,
            visited,
            waiting: false,
        };

        run.execution.status = ExecutionStatus::Running;
        if let Err(e) = self.store.update_execution(&mut run.execution).await {
            if e.is_conflict() {
                warn!(
                    "execution {} likely resumed by another instance: {}",
                    execution_id, e
                );
                return Ok(ResumeOutcome::Superseded);
            }
            return Err(e.into());
        }
        info!("resuming execution {} after node '{}'", execution_id, node_id);

        let traversal = self
            .continue_from(&graph, node_id, aggregated, waiting_record, &mut run)
            .await;
        Ok(match self.finish_run(&mut run, traversal).await? {
            RunEnd::Completed => {
                info!("execution {} completed after resume", execution_id);
                ResumeOutcome::Completed
            }
            RunEnd::Waiting => ResumeOutcome::Waiting,
            RunEnd::Failed(reason) => ResumeOutcome::Failed(reason),
            RunEnd::Superseded => ResumeOutcome::Superseded,
        })
    }

    /// Context for a resumed run: the last known context (cache, else the
    /// durable snapshot), re-seeded with the trigger payload, the aggregated
    /// events merged into its variables and every finished node's output
    /// replayed. Returns the run's visited set alongside.
    async fn rebuild_context(
        &self,
        execution: &Execution,
        graph: &WorkflowGraph<'_>,
        records: &[NodeExecution],
        node_id: &str,
        aggregated: &Map<String, Value>,
    ) -> (ExecutionContext, HashSet<String>) {
        let mut context = self.last_known_context(execution).await;
        context.clear_wait_state();

        if let Some(trigger_node) = graph.trigger_node_id() {
            context.set_trigger_data_for_node(trigger_node, execution.trigger_data.clone());
        }
        for (key, value) in aggregated {
            context.set_variable(key.clone(), value.clone());
        }

        let mut visited = HashSet::new();
        for record in records {
            if matches!(
                record.status,
                NodeExecutionStatus::Completed | NodeExecutionStatus::Failed
            ) {
                if let Some(output) = &record.output_snapshot {
                    context.set_node_output(record.node_id.clone(), output.clone());
                }
                visited.insert(record.node_id.clone());
            }
        }
        visited.insert(node_id.to_string());

        (context, visited)
    }

    async fn continue_from(
        &self,
        graph: &WorkflowGraph<'_>,
        node_id: &str,
        aggregated: Map<String, Value>,
        waiting_record: Option<NodeExecution>,
        run: &mut Run,
    ) -> Result<(), EngineError> {
        match waiting_record {
            Some(mut record) => {
                record.finish(
                    NodeExecutionStatus::Completed,
                    Some(Value::Object(aggregated.clone())),
                    None,
                );
                self.store.update_node_execution(&record).await?;
                debug!("node '{}' completed by resume", node_id);
            }
            None => info!(
                "node '{}' of execution {} has no waiting record, continuing",
                node_id, run.execution.id
            ),
        }

        run.context.set_node_output(node_id, Value::Object(aggregated));
        self.cache_context(run).await;

        self.traverse(graph, graph.successors(node_id), run).await
    }

    async fn fail_waiting_locked(
        &self,
        execution_id: Uuid,
        node_id: &str,
        reason: &str,
    ) -> Result<ResumeOutcome, EngineError> {
        let mut execution = self.load_execution(execution_id).await?;
        if execution.status != ExecutionStatus::Waiting {
            return Ok(ResumeOutcome::AlreadyAdvanced(execution.status));
        }

        let waiting_record = self
            .store
            .list_node_executions(execution_id)
            .await?
            .into_iter()
            .find(|r| r.node_id == node_id && r.status == NodeExecutionStatus::Waiting);
        if let Some(mut record) = waiting_record {
            let output = record.output_snapshot.take();
            record.finish(NodeExecutionStatus::Failed, output, Some(reason.to_string()));
            self.store.update_node_execution(&record).await?;
        }

        let mut context = self.last_known_context(&execution).await;
        context.clear_wait_state();

        error!("execution {} failed: {}", execution_id, reason);
        execution.finish(ExecutionStatus::Failed, Some(reason.to_string()));
        if self.persist_boundary(&mut execution, &context).await? {
            Ok(ResumeOutcome::Failed(reason.to_string()))
        } else {
            Ok(ResumeOutcome::Superseded)
        }
    }

    /// Mark a run `FAILED` without touching its snapshot.
    async fn fail_execution(
        &self,
        mut execution: Execution,
        reason: String,
    ) -> Result<ResumeOutcome, EngineError> {
        error!("execution {} failed: {}", execution.id, reason);
        execution.finish(ExecutionStatus::Failed, Some(reason.clone()));
        match self.store.update_execution(&mut execution).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                warn!("execution {} modified concurrently: {}", execution.id, e);
                return Ok(ResumeOutcome::Superseded);
            }
            Err(e) => return Err(e.into()),
        }
        self.evict(execution.id).await;
        Ok(ResumeOutcome::Failed(reason))
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    /// Depth-first walk from `roots` with an explicit worklist.
    ///
    /// A node already visited in this run is skipped. Once any node waits,
    /// nothing else is visited.
    async fn traverse(
        &self,
        graph: &WorkflowGraph<'_>,
        roots: &[&str],
        run: &mut Run,
    ) -> Result<(), EngineError> {
        let mut pending: Vec<String> = roots.iter().rev().map(|id| id.to_string()).collect();

        while let Some(node_id) = pending.pop() {
            if !run.visited.insert(node_id.clone()) {
                trace!("node '{}' already visited", node_id);
                continue;
            }
            match self.visit(graph, &node_id, run).await? {
                Step::Halt => {}
                Step::Wait => break,
                Step::Continue(next) => pending.extend(next.into_iter().rev()),
            }
        }
        Ok(())
    }

    async fn visit(
        &self,
        graph: &WorkflowGraph<'_>,
        node_id: &str,
        run: &mut Run,
    ) -> Result<Step, EngineError> {
        let execution_id = run.execution.id;

        let (node, node_type) = match (graph.node(node_id), graph.node_type(node_id)) {
            (Some(node), Some(Ok(node_type))) => (node, *node_type),
            (Some(_), Some(Err(e))) => {
                let reason = format!("node '{}' has an invalid type: {}", node_id, e);
                return self.reject(execution_id, node_id, reason).await;
            }
            _ => {
                let reason = format!("node '{}' is not part of the workflow definition", node_id);
                return self.reject(execution_id, node_id, reason).await;
            }
        };
        let Some(executor) = self.registry.lookup(node_type) else {
            let reason = format!("no executor registered for node type '{}'", node_type);
            return self.reject(execution_id, node_id, reason).await;
        };

        let input = Value::Object(run.context.data_for_node(node_id));
        let mut record = NodeExecution::start(execution_id, node_id, input);
        self.store.insert_node_execution(&record).await?;
        run.execution.nodes_executed_count += 1;
        debug!("executing node '{}' ({}) with {}", node_id, node_type, executor.name());

        let result = match executor.execute(node_id, &node.config, &mut run.context).await {
            Ok(result) => result,
            Err(e) => NodeExecutionResult::failure(e.to_string()),
        };

        if !result.success {
            let reason = result
                .error
                .unwrap_or_else(|| "node reported failure".to_string());
            warn!("node '{}' failed: {}", node_id, reason);
            let output = (!result.output.is_empty()).then(|| Value::Object(result.output));
            record.finish(NodeExecutionStatus::Failed, output, Some(reason));
            self.store.update_node_execution(&record).await?;
            return Ok(Step::Halt);
        }

        let wait_state_id = result.wait_state_id().map(str::to_owned);
        let output = Value::Object(result.output);

        if result.waiting {
            record.finish(NodeExecutionStatus::Waiting, Some(output.clone()), None);
            self.store.update_node_execution(&record).await?;
            run.context.set_node_output(node_id, output);
            match wait_state_id {
                Some(wait_state_id) => run.context.set_wait_state(wait_state_id, node_id),
                None => warn!("node '{}' is waiting without a wait state id", node_id),
            }

            run.waiting = true;
            run.execution.status = ExecutionStatus::Waiting;
            self.store.update_execution(&mut run.execution).await?;
            self.cache_context(run).await;
            info!("node '{}' suspended execution {}", node_id, execution_id);
            return Ok(Step::Wait);
        }

        record.finish(NodeExecutionStatus::Completed, Some(output.clone()), None);
        self.store.update_node_execution(&record).await?;
        run.context.set_node_output(node_id, output);
        self.cache_context(run).await;
        info!("node '{}' succeeded", node_id);

        let next = match result.next_node_id {
            Some(next) => vec![next],
            None => graph
                .successors(node_id)
                .iter()
                .map(|id| id.to_string())
                .collect(),
        };
        Ok(Step::Continue(next))
    }

    /// Record a node that could not be dispatched at all.
    async fn reject(
        &self,
        execution_id: Uuid,
        node_id: &str,
        reason: String,
    ) -> Result<Step, EngineError> {
        warn!("{}", reason);
        let record = NodeExecution::rejected(execution_id, node_id, reason);
        self.store.insert_node_execution(&record).await?;
        Ok(Step::Halt)
    }

    // -----------------------------------------------------------------------
    // Boundaries
    // -----------------------------------------------------------------------

    /// Settle the run's final status and persist it with its snapshot.
    async fn finish_run(
        &self,
        run: &mut Run,
        traversal: Result<(), EngineError>,
    ) -> Result<RunEnd, EngineError> {
        let execution_id = run.execution.id;
        let end = match traversal {
            Ok(()) if run.waiting => RunEnd::Waiting,
            Ok(()) => {
                run.execution.finish(ExecutionStatus::Completed, None);
                RunEnd::Completed
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    "execution {} likely advanced by another instance: {}",
                    execution_id, e
                );
                return Ok(RunEnd::Superseded);
            }
            Err(e) => {
                error!("execution {} failed: {}", execution_id, e);
                let reason = e.to_string();
                run.execution
                    .finish(ExecutionStatus::Failed, Some(reason.clone()));
                RunEnd::Failed(reason)
            }
        };

        if self.persist_boundary(&mut run.execution, &run.context).await? {
            Ok(end)
        } else {
            Ok(RunEnd::Superseded)
        }
    }

    /// Persist `execution` with `context` as its snapshot and evict the cache
    /// entry. `false` if a concurrent writer got there first.
    async fn persist_boundary(
        &self,
        execution: &mut Execution,
        context: &ExecutionContext,
    ) -> Result<bool, EngineError> {
        execution.context_snapshot = Some(serde_json::to_value(context)?);
        let persisted = self.store.update_execution(execution).await;
        self.evict(execution.id).await;

        match persisted {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => {
                warn!("execution {} modified concurrently: {}", execution.id, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Cached context, else the durable snapshot, else an empty context.
    async fn last_known_context(&self, execution: &Execution) -> ExecutionContext {
        match self.cache.load(execution.id).await {
            Ok(Some(context)) => return context,
            Ok(None) => {}
            Err(e) => warn!(
                "context cache unavailable for execution {}: {}",
                execution.id, e
            ),
        }

        execution
            .context_snapshot
            .clone()
            .and_then(|snapshot| match serde_json::from_value(snapshot) {
                Ok(context) => Some(context),
                Err(e) => {
                    warn!("unreadable snapshot for execution {}: {}", execution.id, e);
                    None
                }
            })
            .unwrap_or_else(|| {
                ExecutionContext::new(execution.id.to_string(), execution.workflow_id.to_string())
            })
    }

    async fn cache_context(&self, run: &Run) {
        if let Err(e) = self.cache.save(run.execution.id, &run.context).await {
            warn!(
                "failed to cache context for execution {}: {}",
                run.execution.id, e
            );
        }
    }

    async fn evict(&self, execution_id: Uuid) {
        if let Err(e) = self.cache.evict(execution_id).await {
            warn!(
                "failed to evict cached context for execution {}: {}",
                execution_id, e
            );
        }
    }

    async fn release(&self, execution_id: Uuid) {
        if let Err(e) = self.lock.release(execution_id).await {
            warn!("failed to release lock for execution {}: {}", execution_id, e);
        }
    }
}
