// apiflow — Workflow engine (execution state machine)
//
// pending -> running -> {paused <-> running} -> {completed | failed | cancelled}
//
// Pause and cancel requests are honoured only at step boundaries. A request
// that arrives while a step is in flight is parked and applied once that step
// has finished.

use super::events::{EventBus, EventKind, ExecutionEvent};
use super::step::StepExecutor;
use super::{
    ErrorType, ExecutionError, ExecutionStatus, StepStatus, Transition, Workflow,
    WorkflowExecution,
};
use crate::action::ActionRegistry;
use crate::config::{Config, EngineConfig, StorageBackend};
use crate::http::client::ReqwestTransport;
use crate::storage::file::FileStorage;
use crate::storage::{MemoryStorage, Storage, StorageError};
use crate::variable::dynamic::DynamicVariableRegistry;
use crate::variable::resolver::VariableResolver;
use crate::variable::{validate_key, Variable, VariableContext, VariableScope, VariableType};
use chrono::Utc;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Interval at which a paused execution checks for resumption.
pub const DEFAULT_PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workflow '{workflow}' declares step id '{step}' more than once")]
    DuplicateStepId { workflow: String, step: String },
    #[error("execution '{0}' is already active")]
    DuplicateExecution(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Keep going after a step exhausts its retries.
    pub continue_on_error: bool,
    /// Pause after a failed step; resuming continues with the next step.
    pub pause_on_failure: bool,
    /// Request timeout for steps that do not set their own.
    pub timeout: Option<Duration>,
    /// Fail the execution after this many `nextStep` jumps. `None` = unbounded.
    pub max_jumps: Option<usize>,
    /// Use this id instead of a generated one.
    pub execution_id: Option<String>,
    pub environment: Vec<Variable>,
    pub collection: Vec<Variable>,
    pub request: Vec<Variable>,
}

impl ExecutionOptions {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            continue_on_error: cfg.continue_on_error,
            pause_on_failure: cfg.pause_on_failure,
            timeout: cfg.default_step_timeout_ms.map(Duration::from_millis),
            max_jumps: cfg.max_jumps,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlRequest {
    Pause,
    Cancel,
}

struct ActiveExecution {
    execution: WorkflowExecution,
    step_in_flight: bool,
    pending: Option<ControlRequest>,
}

type Handle = Arc<Mutex<ActiveExecution>>;

pub struct WorkflowEngine {
    executor: StepExecutor,
    storage: Arc<dyn Storage>,
    events: EventBus,
    active: Arc<RwLock<HashMap<String, Handle>>>,
    pause_poll_interval: Duration,
}

impl WorkflowEngine {
    pub fn new(executor: StepExecutor, storage: Arc<dyn Storage>) -> Self {
        Self {
            executor,
            storage,
            events: EventBus::new(),
            active: Arc::new(RwLock::new(HashMap::new())),
            pause_poll_interval: DEFAULT_PAUSE_POLL_INTERVAL,
        }
    }

    /// Wire an engine from config: reqwest transport, configured storage
    /// backend and the built-in dynamic variables.
    pub fn from_config(cfg: &Config, actions: ActionRegistry) -> anyhow::Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(&cfg.http)?);
        let resolver = VariableResolver::new(DynamicVariableRegistry::new());
        let executor = StepExecutor::new(transport, resolver, actions)
            .with_retry_base_delay(Duration::from_millis(cfg.engine.retry_base_delay_ms));

        let storage: Arc<dyn Storage> = match cfg.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::File => Arc::new(FileStorage::new(cfg.storage_path()?)),
        };

        tracing::info!(
            storage = ?cfg.storage.backend,
            retry_base_delay_ms = cfg.engine.retry_base_delay_ms,
            "Creating workflow engine"
        );

        Ok(Self::new(executor, storage).with_pause_poll_interval(Duration::from_millis(
            cfg.engine.pause_poll_interval_ms,
        )))
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval = interval;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run `workflow` to a terminal state (or until cancelled).
    ///
    /// `initial_variables` seed the highest-precedence `resolved` layer.
    pub async fn execute_workflow(
        &self,
        workflow: &Workflow,
        initial_variables: BTreeMap<String, String>,
        options: ExecutionOptions,
    ) -> Result<WorkflowExecution, EngineError> {
        check_unique_step_ids(workflow)?;

        let mut context = bootstrap_context(workflow, initial_variables, &options);
        let mut execution = WorkflowExecution::new(workflow, context.clone());
        if let Some(id) = &options.execution_id {
            execution.id = id.clone();
        }
        let id = execution.id.clone();

        let handle = {
            let mut active = self.active.write().await;
            if active.contains_key(&id) {
                return Err(EngineError::DuplicateExecution(id));
            }
            execution.status = ExecutionStatus::Running;
            let handle = Arc::new(Mutex::new(ActiveExecution {
                execution: execution.clone(),
                step_in_flight: false,
                pending: None,
            }));
            active.insert(id.clone(), handle.clone());
            handle
        };

        tracing::info!(
            execution_id = %id,
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            "Starting workflow execution"
        );
        self.announce(&execution, EventKind::Started, None, None).await;

        self.run_steps(workflow, &handle, &mut context, &options).await;

        // Completion is decided under the same lock that control requests take,
        // so a pause or cancel landing after the last step is never lost.
        let (finished, completed) = loop {
            {
                let mut state = handle.lock().await;
                state.execution.variables = context.clone();
                let status = state.execution.status;
                if status.is_terminal() {
                    break (state.execution.clone(), false);
                }
                if status == ExecutionStatus::Running && state.pending.is_none() {
                    state.execution.finish(ExecutionStatus::Completed);
                    break (state.execution.clone(), true);
                }
            }
            self.at_step_boundary(&handle).await;
        };
        if completed {
            self.announce(&finished, EventKind::Completed, None, None).await;
        }

        self.active.write().await.remove(&id);
        tracing::info!(
            execution_id = %id,
            status = %finished.status,
            duration_ms = ?finished.duration,
            "Workflow execution finished"
        );
        Ok(finished)
    }

    async fn run_steps(
        &self,
        workflow: &Workflow,
        handle: &Handle,
        context: &mut VariableContext,
        options: &ExecutionOptions,
    ) {
        let steps = &workflow.steps;
        let mut index = 0usize;
        let mut jumps = 0usize;

        while index < steps.len() {
            if !self.at_step_boundary(handle).await {
                return;
            }
            let step = &steps[index];

            let snapshot = {
                let mut state = handle.lock().await;
                if state.execution.status != ExecutionStatus::Running {
                    // A control request slipped in after the boundary check.
                    continue;
                }
                state.step_in_flight = true;
                state.execution.current_step = index + 1;
                state.execution.clone()
            };
            self.emit(&snapshot, EventKind::StepStarted, Some(&step.id), None);

            let run = self
                .executor
                .execute_step(step, context, options.timeout)
                .await;

            let snapshot = {
                let mut state = handle.lock().await;
                state.step_in_flight = false;
                state.execution.variables = context.clone();
                state
                    .execution
                    .step_executions
                    .extend(run.attempts.iter().cloned());
                state.execution.clone()
            };
            self.persist(&snapshot).await;
            for attempt in &run.attempts {
                let kind = if attempt.success {
                    EventKind::StepCompleted
                } else {
                    EventKind::StepFailed
                };
                self.emit(
                    &snapshot,
                    kind,
                    Some(&step.id),
                    serde_json::to_value(attempt).ok(),
                );
            }

            let Some(last) = run.last() else {
                index += 1;
                continue;
            };

            if !last.success {
                let error = last
                    .error
                    .clone()
                    .unwrap_or_else(|| ExecutionError::new(ErrorType::Unknown, "step failed"))
                    .with_step(step.id.clone());

                if options.pause_on_failure {
                    tracing::warn!(
                        execution_id = %snapshot.id,
                        step = %step.id,
                        "Step failed, pausing execution"
                    );
                    self.pause_now(handle).await;
                } else if !options.continue_on_error {
                    self.fail(handle, error).await;
                    return;
                } else {
                    tracing::warn!(
                        execution_id = %snapshot.id,
                        step = %step.id,
                        "Step failed, continuing"
                    );
                }
                index += 1;
                continue;
            }

            let transition = match (&step.next_step, last.status) {
                (Some(next), StepStatus::Completed) => {
                    next.resolve(run.response_body().unwrap_or(&Value::Null), context)
                }
                _ => Transition::Continue,
            };

            match transition {
                Transition::Continue => index += 1,
                Transition::End => {
                    tracing::info!(
                        execution_id = %snapshot.id,
                        step = %step.id,
                        "Step ended the workflow early"
                    );
                    break;
                }
                Transition::Goto(target) => {
                    let Some(target_index) = workflow.step_index(&target) else {
                        let error = ExecutionError::new(
                            ErrorType::Unknown,
                            format!("Next step '{}' not found in workflow", target),
                        )
                        .with_step(step.id.clone());
                        self.fail(handle, error).await;
                        return;
                    };
                    jumps += 1;
                    if options.max_jumps.is_some_and(|max| jumps > max) {
                        let error = ExecutionError::new(
                            ErrorType::Unknown,
                            format!("Exceeded the maximum of {} step jumps", jumps - 1),
                        )
                        .with_step(step.id.clone());
                        self.fail(handle, error).await;
                        return;
                    }
                    tracing::debug!(from = %step.id, to = %target, "Jumping to step");
                    index = target_index;
                }
            }
        }
    }

    /// Apply parked control requests and wait out a pause.
    /// Returns `false` once the execution reached a terminal state.
    async fn at_step_boundary(&self, handle: &Handle) -> bool {
        loop {
            let (status, transition) = {
                let mut state = handle.lock().await;
                let running_or_paused = matches!(
                    state.execution.status,
                    ExecutionStatus::Running | ExecutionStatus::Paused
                );
                let transition = match state.pending.take() {
                    Some(ControlRequest::Pause)
                        if state.execution.status == ExecutionStatus::Running =>
                    {
                        state.execution.status = ExecutionStatus::Paused;
                        Some((EventKind::Paused, state.execution.clone()))
                    }
                    Some(ControlRequest::Cancel) if running_or_paused => {
                        state.execution.finish(ExecutionStatus::Cancelled);
                        Some((EventKind::Cancelled, state.execution.clone()))
                    }
                    _ => None,
                };
                (state.execution.status, transition)
            };

            if let Some((kind, snapshot)) = transition {
                tracing::info!(
                    execution_id = %snapshot.id,
                    status = %snapshot.status,
                    "Applied control request at step boundary"
                );
                self.announce(&snapshot, kind, None, None).await;
            }

            match status {
                ExecutionStatus::Running => return true,
                ExecutionStatus::Paused => tokio::time::sleep(self.pause_poll_interval).await,
                _ => return false,
            }
        }
    }

    async fn pause_now(&self, handle: &Handle) {
        let snapshot = {
            let mut state = handle.lock().await;
            if state.execution.status != ExecutionStatus::Running {
                return;
            }
            state.execution.status = ExecutionStatus::Paused;
            state.execution.clone()
        };
        self.announce(&snapshot, EventKind::Paused, None, None).await;
    }

    async fn fail(&self, handle: &Handle, error: ExecutionError) {
        let snapshot = {
            let mut state = handle.lock().await;
            if state.execution.status.is_terminal() {
                return;
            }
            tracing::error!(
                execution_id = %state.execution.id,
                error = %error,
                "Workflow execution failed"
            );
            state.execution.error = Some(error);
            state.execution.finish(ExecutionStatus::Failed);
            state.execution.clone()
        };
        let data = snapshot
            .error
            .as_ref()
            .and_then(|e| serde_json::to_value(e).ok());
        self.announce(&snapshot, EventKind::Failed, None, data).await;
    }

    // -----------------------------------------------------------------------
    // External control
    // -----------------------------------------------------------------------

    async fn handle(&self, id: &str) -> Option<Handle> {
        self.active.read().await.get(id).cloned()
    }

    /// Request a pause. Takes effect immediately between steps, otherwise
    /// when the in-flight step finishes.
    pub async fn pause_execution(&self, id: &str) -> bool {
        let Some(handle) = self.handle(id).await else {
            return false;
        };
        let snapshot = {
            let mut state = handle.lock().await;
            if state.execution.status != ExecutionStatus::Running {
                return false;
            }
            if state.step_in_flight {
                return match state.pending {
                    None => {
                        state.pending = Some(ControlRequest::Pause);
                        tracing::info!(
                            execution_id = %id,
                            "Pause requested, waiting for step to finish"
                        );
                        true
                    }
                    Some(ControlRequest::Pause) => true,
                    Some(ControlRequest::Cancel) => false,
                };
            }
            state.execution.status = ExecutionStatus::Paused;
            state.execution.clone()
        };
        self.announce(&snapshot, EventKind::Paused, None, None).await;
        true
    }

    /// Resume a paused execution, or withdraw a pause still waiting on a step.
    pub async fn resume_execution(&self, id: &str) -> bool {
        let Some(handle) = self.handle(id).await else {
            return false;
        };
        let snapshot = {
            let mut state = handle.lock().await;
            match state.execution.status {
                ExecutionStatus::Paused => {
                    state.execution.status = ExecutionStatus::Running;
                    state.execution.clone()
                }
                ExecutionStatus::Running if state.pending == Some(ControlRequest::Pause) => {
                    state.pending = None;
                    return true;
                }
                _ => return false,
            }
        };
        tracing::info!(execution_id = %id, "Resuming execution");
        self.announce(&snapshot, EventKind::Resumed, None, None).await;
        true
    }

    /// Cancel an execution. A paused execution is cancelled at once; a
    /// running one stops before its next step.
    pub async fn cancel_execution(&self, id: &str) -> bool {
        let Some(handle) = self.handle(id).await else {
            return false;
        };
        let snapshot = {
            let mut state = handle.lock().await;
            match state.execution.status {
                ExecutionStatus::Running if state.step_in_flight => {
                    state.pending = Some(ControlRequest::Cancel);
                    tracing::info!(
                        execution_id = %id,
                        "Cancel requested, waiting for step to finish"
                    );
                    return true;
                }
                ExecutionStatus::Running | ExecutionStatus::Paused => {
                    state.pending = None;
                    state.execution.finish(ExecutionStatus::Cancelled);
                    state.execution.clone()
                }
                _ => return false,
            }
        };
        tracing::info!(execution_id = %id, "Execution cancelled");
        self.announce(&snapshot, EventKind::Cancelled, None, None).await;
        true
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Snapshot of an active execution.
    pub async fn get_execution(&self, id: &str) -> Option<WorkflowExecution> {
        let handle = self.handle(id).await?;
        let state = handle.lock().await;
        Some(state.execution.clone())
    }

    pub async fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn execution_history(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        Ok(self.storage.load_executions_by_workflow(workflow_id).await?)
    }

    // -----------------------------------------------------------------------
    // Persistence and events
    // -----------------------------------------------------------------------

    async fn persist(&self, snapshot: &WorkflowExecution) {
        if let Err(e) = self.storage.save_execution(snapshot).await {
            tracing::error!(execution_id = %snapshot.id, "Failed to persist execution: {}", e);
        }
    }

    fn emit(
        &self,
        snapshot: &WorkflowExecution,
        kind: EventKind,
        step_id: Option<&str>,
        data: Option<Value>,
    ) {
        self.events.emit(&ExecutionEvent {
            kind,
            execution_id: snapshot.id.clone(),
            workflow_id: snapshot.workflow_id.clone(),
            status: snapshot.status,
            step_id: step_id.map(String::from),
            data,
            timestamp: Utc::now(),
        });
    }

    /// Persist a status transition, then announce it.
    async fn announce(
        &self,
        snapshot: &WorkflowExecution,
        kind: EventKind,
        step_id: Option<&str>,
        data: Option<Value>,
    ) {
        self.persist(snapshot).await;
        self.emit(snapshot, kind, step_id, data);
    }
}

fn check_unique_step_ids(workflow: &Workflow) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            return Err(EngineError::DuplicateStepId {
                workflow: workflow.id.clone(),
                step: step.id.clone(),
            });
        }
    }
    Ok(())
}

fn bootstrap_context(
    workflow: &Workflow,
    initial_variables: BTreeMap<String, String>,
    options: &ExecutionOptions,
) -> VariableContext {
    let mut ctx = VariableContext::new();
    ctx.workflow = VariableContext::layer_from(&workflow.variables);
    ctx.environment = VariableContext::layer_from(&options.environment);
    ctx.collection = VariableContext::layer_from(&options.collection);
    ctx.request = VariableContext::layer_from(&options.request);
    for (key, value) in initial_variables {
        match validate_key(&key) {
            Ok(()) => ctx.set_resolved(key, value),
            Err(e) => tracing::warn!(key = %key, "Ignoring initial variable: {}", e),
        }
    }
    ctx
}

/// Turn plain `key -> value` pairs into environment-layer variables.
pub fn environment_variables(values: &HashMap<String, String>) -> Vec<Variable> {
    let mut vars: Vec<Variable> = values
        .iter()
        .filter_map(|(k, v)| {
            Variable::new(k.clone(), v.clone(), VariableType::Environment, VariableScope::Global)
                .map_err(|e| tracing::warn!(key = %k, "Ignoring environment variable: {}", e))
                .ok()
        })
        .collect();
    vars.sort_by(|a, b| a.key.cmp(&b.key));
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::TransportError;
    use crate::workflow::step::tests::{ok, ScriptedTransport};
    use crate::workflow::{
        ExpectedResponse, NextStep, RequestTemplate, StatusExpectation, WorkflowStep,
    };
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn engine(transport: Arc<ScriptedTransport>) -> (Arc<WorkflowEngine>, MemoryStorage) {
        crate::logger::init_test();
        let storage = MemoryStorage::new();
        let executor =
            StepExecutor::new(transport, VariableResolver::default(), ActionRegistry::new())
                .with_retry_base_delay(Duration::from_millis(5));
        let engine = WorkflowEngine::new(executor, Arc::new(storage.clone()))
            .with_pause_poll_interval(Duration::from_millis(10));
        (Arc::new(engine), storage)
    }

    fn step(id: &str) -> WorkflowStep {
        let request = RequestTemplate::new("GET", format!("http://api.test/{}", id));
        WorkflowStep::new(id, id.to_uppercase(), request)
    }

    async fn run(engine: &WorkflowEngine, wf: Workflow) -> WorkflowExecution {
        engine
            .execute_workflow(&wf, BTreeMap::new(), ExecutionOptions::default())
            .await
            .unwrap()
    }

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: "Test flow".into(),
            category: "test".into(),
            description: None,
            steps,
            variables: Vec::new(),
        }
    }

    type EventLog = Arc<StdMutex<Vec<(EventKind, Option<String>)>>>;

    fn record_events(engine: &WorkflowEngine) -> EventLog {
        let log = Arc::new(StdMutex::new(Vec::new()));
        for kind in [
            EventKind::Started,
            EventKind::StepStarted,
            EventKind::StepCompleted,
            EventKind::StepFailed,
            EventKind::Paused,
            EventKind::Resumed,
            EventKind::Completed,
            EventKind::Failed,
            EventKind::Cancelled,
        ] {
            let log = log.clone();
            engine.events().on(kind, move |e| {
                log.lock().unwrap().push((e.kind, e.step_id.clone()));
                Ok(())
            });
        }
        log
    }

    async fn wait_for_status(engine: &WorkflowEngine, id: &str, status: ExecutionStatus) {
        for _ in 0..200 {
            if engine.get_execution(id).await.map(|e| e.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("execution {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_completes_and_persists() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, storage) = engine(transport.clone());
        let events = record_events(&engine);

        let exec = run(&engine, workflow(vec![step("a"), step("b")])).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.current_step, 2);
        assert_eq!(exec.total_steps, 2);
        assert!(exec.completed_at.is_some());
        assert!(exec.duration.is_some());
        assert_eq!(exec.step_executions.len(), 2);
        assert!(engine.active_executions().await.is_empty());

        let stored = storage.execution(&exec.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Completed);

        let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Started,
                EventKind::StepStarted,
                EventKind::StepCompleted,
                EventKind::StepStarted,
                EventKind::StepCompleted,
                EventKind::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_extracted_token_feeds_next_request_body() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        transport.push(ok(200, json!({"data": {"token": "abc"}})));
        let (engine, _) = engine(transport.clone());

        let mut login = step("login");
        login.extract_variables =
            BTreeMap::from([("token".to_string(), "$.data.token".to_string())]);
        let mut use_token = step("use");
        use_token.request = RequestTemplate::new("POST", "http://api.test/use")
            .body(json!({"t": "{{token}}"}));

        let exec = run(&engine, workflow(vec![login, use_token])).await;

        assert_eq!(exec.status, ExecutionStatus::Completed);
        let sent = exec.step_executions[1].request.as_ref().unwrap();
        assert_eq!(sent.body, Some(json!({"t": "abc"})));
        assert_eq!(transport.sent()[1].body, Some(json!({"t": "abc"})));
    }

    #[tokio::test]
    async fn test_fail_fast_by_default() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        transport.push(Err(TransportError::Network("refused".into())));
        let (engine, _) = engine(transport.clone());

        let exec = run(&engine, workflow(vec![step("a"), step("b")])).await;

        assert_eq!(exec.status, ExecutionStatus::Failed);
        let err = exec.error.unwrap();
        assert_eq!(err.error_type, ErrorType::Network);
        assert_eq!(err.step.as_deref(), Some("a"));
        assert_eq!(transport.sent().len(), 1);
        assert!(exec.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_continue_on_error() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        transport.push(Err(TransportError::Network("refused".into())));
        let (engine, _) = engine(transport.clone());

        let options = ExecutionOptions {
            continue_on_error: true,
            ..Default::default()
        };
        let exec = engine
            .execute_workflow(&workflow(vec![step("a"), step("b")]), BTreeMap::new(), options)
            .await
            .unwrap();

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.failed_steps().count(), 1);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_attempts_are_all_recorded() {
        let transport = Arc::new(ScriptedTransport::new(Err(TransportError::Network(
            "refused".into(),
        ))));
        let (engine, _) = engine(transport);
        let events = record_events(&engine);
        let mut s = step("a");
        s.retries = 2;

        let exec = run(&engine, workflow(vec![s])).await;

        let counts: Vec<u32> = exec.step_executions.iter().map(|s| s.retry_count).collect();
        assert_eq!(counts, vec![0, 1, 2]);
        let failed_events = events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == EventKind::StepFailed)
            .count();
        assert_eq!(failed_events, 3);
    }

    #[tokio::test]
    async fn test_static_next_step_skips_ahead() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport.clone());
        let mut a = step("a");
        a.next_step = Some(NextStep::Static("c".into()));

        let exec = run(&engine, workflow(vec![a, step("b"), step("c")])).await;

        let ids: Vec<&str> = exec
            .step_executions
            .iter()
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_computed_next_step_loops_until_condition() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({"done": true}))));
        transport.push(ok(200, json!({"done": false})));
        transport.push(ok(200, json!({"done": false})));
        let (engine, _) = engine(transport.clone());

        let mut poll = step("poll");
        poll.next_step = Some(NextStep::computed(|body, _ctx| {
            if body["done"] == json!(true) {
                Transition::Continue
            } else {
                Transition::Goto("poll".into())
            }
        }));

        let exec = run(&engine, workflow(vec![poll, step("after")])).await;

        let ids: Vec<&str> = exec
            .step_executions
            .iter()
            .map(|s| s.step_id.as_str())
            .collect();
        assert_eq!(ids, vec!["poll", "poll", "poll", "after"]);
    }

    #[tokio::test]
    async fn test_computed_end_terminates_early() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport.clone());
        let mut a = step("a");
        a.next_step = Some(NextStep::computed(|_, _| Transition::End));

        let exec = run(&engine, workflow(vec![a, step("b")])).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_executions.len(), 1);
    }

    #[tokio::test]
    async fn test_max_jumps_valve() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport.clone());
        let mut a = step("a");
        a.next_step = Some(NextStep::Static("a".into()));

        let options = ExecutionOptions {
            max_jumps: Some(3),
            ..Default::default()
        };
        let exec = engine
            .execute_workflow(&workflow(vec![a]), BTreeMap::new(), options)
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(transport.sent().len(), 4);
        assert!(exec.error.unwrap().message.contains("maximum of 3"));
    }

    #[tokio::test]
    async fn test_unknown_next_step_fails() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport);
        let mut a = step("a");
        a.next_step = Some(NextStep::Static("ghost".into()));

        let exec = run(&engine, workflow(vec![a, step("b")])).await;
        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert!(exec.error.unwrap().message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_duplicate_step_ids_rejected() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport);
        let wf = workflow(vec![step("a"), step("a")]);
        let err = engine
            .execute_workflow(&wf, BTreeMap::new(), ExecutionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateStepId { .. }));
    }

    #[tokio::test]
    async fn test_context_layers_bootstrap() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport.clone());
        let mut wf = workflow(vec![WorkflowStep::new(
            "a",
            "A",
            RequestTemplate::new("GET", "{{base}}/{{path}}?v={{version}}"),
        )]);
        wf.variables = vec![Variable::new(
            "path",
            "from-workflow",
            VariableType::Collection,
            VariableScope::Workflow,
        )
        .unwrap()];
        let env = HashMap::from([
            ("base".to_string(), "http://env.test".to_string()),
            ("path".to_string(), "from-env".to_string()),
        ]);
        let options = ExecutionOptions {
            environment: environment_variables(&env),
            ..Default::default()
        };
        let initial = BTreeMap::from([("version".to_string(), "2".to_string())]);

        engine.execute_workflow(&wf, initial, options).await.unwrap();
        assert_eq!(transport.sent()[0].url, "http://env.test/from-workflow?v=2");
    }

    #[tokio::test]
    async fn test_pause_waits_for_in_flight_step_then_resume() {
        let transport = Arc::new(
            ScriptedTransport::new(ok(200, json!({}))).with_delay(Duration::from_millis(100)),
        );
        let (engine, _) = engine(transport.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.events().on(EventKind::StepStarted, move |e| {
            let _ = tx.send(e.step_id.clone());
            Ok(())
        });

        let wf = workflow(vec![step("s1"), step("s2"), step("s3")]);
        let options = ExecutionOptions {
            execution_id: Some("exec-pause".into()),
            ..Default::default()
        };
        let runner = engine.clone();
        let task = tokio::spawn(async move {
            runner.execute_workflow(&wf, BTreeMap::new(), options).await
        });

        loop {
            if rx.recv().await.unwrap().as_deref() == Some("s2") {
                break;
            }
        }

        assert!(engine.pause_execution("exec-pause").await);
        // Step 2 is still in flight: not paused yet, not aborted.
        assert_eq!(
            engine.get_execution("exec-pause").await.unwrap().status,
            ExecutionStatus::Running
        );

        wait_for_status(&engine, "exec-pause", ExecutionStatus::Paused).await;
        let paused = engine.get_execution("exec-pause").await.unwrap();
        assert_eq!(paused.step_executions.len(), 2);
        assert!(paused.step_executions[1].success);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(transport.sent().len(), 2);

        assert!(engine.resume_execution("exec-pause").await);
        let exec = task.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_executions.len(), 3);
        assert_eq!(transport.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_paused_execution() {
        let transport = Arc::new(
            ScriptedTransport::new(ok(200, json!({}))).with_delay(Duration::from_millis(50)),
        );
        let (engine, storage) = engine(transport.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.events().on(EventKind::StepStarted, move |e| {
            let _ = tx.send(e.step_id.clone());
            Ok(())
        });

        let wf = workflow(vec![step("s1"), step("s2"), step("s3")]);
        let options = ExecutionOptions {
            execution_id: Some("exec-cancel".into()),
            ..Default::default()
        };
        let runner = engine.clone();
        let task = tokio::spawn(async move {
            runner.execute_workflow(&wf, BTreeMap::new(), options).await
        });

        rx.recv().await.unwrap();
        assert!(engine.pause_execution("exec-cancel").await);
        wait_for_status(&engine, "exec-cancel", ExecutionStatus::Paused).await;

        assert!(engine.cancel_execution("exec-cancel").await);
        // Illegal transitions are no-ops.
        assert!(!engine.resume_execution("exec-cancel").await);
        assert!(!engine.pause_execution("exec-cancel").await);

        let exec = task.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(exec.completed_at.is_some());
        assert_eq!(exec.step_executions.len(), 1);
        assert_eq!(transport.sent().len(), 1);

        let stored = storage.execution("exec-cancel").await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert!(!engine.cancel_execution("exec-cancel").await);
    }

    #[tokio::test]
    async fn test_cancel_running_stops_before_next_step() {
        let transport = Arc::new(
            ScriptedTransport::new(ok(200, json!({}))).with_delay(Duration::from_millis(50)),
        );
        let (engine, _) = engine(transport.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.events().on(EventKind::StepStarted, move |e| {
            let _ = tx.send(e.step_id.clone());
            Ok(())
        });

        let wf = workflow(vec![step("s1"), step("s2")]);
        let options = ExecutionOptions {
            execution_id: Some("exec-stop".into()),
            ..Default::default()
        };
        let runner = engine.clone();
        let task = tokio::spawn(async move {
            runner.execute_workflow(&wf, BTreeMap::new(), options).await
        });

        rx.recv().await.unwrap();
        assert!(engine.cancel_execution("exec-stop").await);
        let exec = task.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        // The in-flight step was allowed to finish.
        assert_eq!(exec.step_executions.len(), 1);
        assert!(exec.step_executions[0].success);
    }

    #[tokio::test]
    async fn test_pause_on_failure_then_resume_continues() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        transport.push(ok(500, json!({})));
        let (engine, _) = engine(transport.clone());

        let mut a = step("a");
        a.expected_response = Some(ExpectedResponse {
            status: Some(StatusExpectation::One(200)),
            ..Default::default()
        });
        let wf = workflow(vec![a, step("b")]);
        let options = ExecutionOptions {
            pause_on_failure: true,
            execution_id: Some("exec-pof".into()),
            ..Default::default()
        };
        let runner = engine.clone();
        let task = tokio::spawn(async move {
            runner.execute_workflow(&wf, BTreeMap::new(), options).await
        });

        wait_for_status(&engine, "exec-pof", ExecutionStatus::Paused).await;
        assert_eq!(transport.sent().len(), 1);
        assert!(engine.resume_execution("exec-pof").await);

        let exec = task.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_executions.len(), 2);
        assert!(!exec.step_executions[0].success);
    }

    #[tokio::test]
    async fn test_listener_errors_do_not_break_execution() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport);
        engine
            .events()
            .on(EventKind::StepStarted, |_| anyhow::bail!("observer broke"));
        let exec = run(&engine, workflow(vec![step("a")])).await;
        assert_eq!(exec.status, ExecutionStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pause_after_last_step_is_honoured() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, storage) = engine(transport);
        let events = record_events(&engine);

        // Hold the run inside the last step's completion event until the
        // pause has been applied, so it lands before completion is decided.
        let (reached_tx, mut reached_rx) = tokio::sync::mpsc::unbounded_channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = StdMutex::new(release_rx);
        engine.events().on(EventKind::StepCompleted, move |_| {
            let _ = reached_tx.send(());
            let _ = release_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5));
            Ok(())
        });

        let wf = workflow(vec![step("only")]);
        let options = ExecutionOptions {
            execution_id: Some("exec-last".into()),
            ..Default::default()
        };
        let runner = engine.clone();
        let task = tokio::spawn(async move {
            runner.execute_workflow(&wf, BTreeMap::new(), options).await
        });

        reached_rx.recv().await.unwrap();
        assert!(engine.pause_execution("exec-last").await);
        release_tx.send(()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        let paused = engine.get_execution("exec-last").await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(
            storage.execution("exec-last").await.unwrap().status,
            ExecutionStatus::Paused
        );

        assert!(engine.resume_execution("exec-last").await);
        let exec = task.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert_eq!(exec.step_executions.len(), 1);
        assert!(engine.active_executions().await.is_empty());

        let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            &kinds[kinds.len() - 3..],
            &[EventKind::Paused, EventKind::Resumed, EventKind::Completed]
        );
    }

    #[tokio::test]
    async fn test_cancel_during_last_step_is_honoured() {
        let transport = Arc::new(
            ScriptedTransport::new(ok(200, json!({}))).with_delay(Duration::from_millis(50)),
        );
        let (engine, _) = engine(transport);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        engine.events().on(EventKind::StepStarted, move |e| {
            let _ = tx.send(e.step_id.clone());
            Ok(())
        });

        let wf = workflow(vec![step("only")]);
        let options = ExecutionOptions {
            execution_id: Some("exec-last-cancel".into()),
            ..Default::default()
        };
        let runner = engine.clone();
        let task = tokio::spawn(async move {
            runner.execute_workflow(&wf, BTreeMap::new(), options).await
        });

        rx.recv().await.unwrap();
        assert!(engine.cancel_execution("exec-last-cancel").await);
        let exec = task.await.unwrap().unwrap();
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
        assert!(exec.step_executions[0].success);
    }

    #[tokio::test]
    async fn test_shared_event_bus_sees_engine_events() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(EventKind::Completed, move |e| {
            sink.lock().unwrap().push(e.execution_id.clone());
            Ok(())
        });

        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport);
        let engine = Arc::try_unwrap(engine).ok().unwrap().with_events(bus.clone());
        let exec = run(&engine, workflow(vec![step("a")])).await;

        assert_eq!(*seen.lock().unwrap(), vec![exec.id]);
    }

    #[tokio::test]
    async fn test_control_on_unknown_execution_is_noop() {
        let transport = Arc::new(ScriptedTransport::new(ok(200, json!({}))));
        let (engine, _) = engine(transport);
        assert!(!engine.pause_execution("nope").await);
        assert!(!engine.resume_execution("nope").await);
        assert!(!engine.cancel_execution("nope").await);
        assert!(engine.get_execution("nope").await.is_none());
    }
}
