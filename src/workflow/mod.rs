// apiflow — Workflow data model

pub mod catalog;
pub mod engine;
pub mod events;
pub mod extract;
pub mod parser;
pub mod step;
pub mod validate;

use crate::http::{HttpRequest, HttpResponse};
use crate::variable::{Variable, VariableContext};
use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Workflow {
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// A request whose fields may contain `{{var}}` templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestTemplate {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestTemplate {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Expected status: a single code or any member of a set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StatusExpectation {
    One(u16),
    AnyOf(Vec<u16>),
}

impl StatusExpectation {
    pub fn matches(&self, status: u16) -> bool {
        match self {
            StatusExpectation::One(s) => *s == status,
            StatusExpectation::AnyOf(set) => set.contains(&status),
        }
    }
}

impl fmt::Display for StatusExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusExpectation::One(s) => write!(f, "{}", s),
            StatusExpectation::AnyOf(set) => {
                let list: Vec<String> = set.iter().map(|s| s.to_string()).collect();
                write!(f, "one of [{}]", list.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusExpectation>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body_contains: Vec<String>,
    #[serde(default)]
    pub extract_fields: Vec<String>,
    /// Passed to a [`validate::SchemaValidator`] when one is installed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// Where control goes after a computed transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Continue,
    Goto(String),
    End,
}

pub type NextStepFn = Arc<dyn Fn(&Value, &VariableContext) -> Transition + Send + Sync>;

/// Step-to-step transition. Computed transitions are runtime-only and
/// serialize as `null`.
#[derive(Clone)]
pub enum NextStep {
    Static(String),
    Computed(NextStepFn),
}

impl NextStep {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Value, &VariableContext) -> Transition + Send + Sync + 'static,
    {
        NextStep::Computed(Arc::new(f))
    }

    pub fn resolve(&self, body: &Value, ctx: &VariableContext) -> Transition {
        match self {
            NextStep::Static(id) => Transition::Goto(id.clone()),
            NextStep::Computed(f) => f(body, ctx),
        }
    }
}

impl fmt::Debug for NextStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextStep::Static(id) => f.debug_tuple("Static").field(id).finish(),
            NextStep::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

impl Serialize for NextStep {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NextStep::Static(id) => serializer.serialize_str(id),
            NextStep::Computed(_) => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for NextStep {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(NextStep::Static)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Exists,
    NotExists,
    Equals,
    NotEquals,
    Contains,
}

/// Guard evaluated before a step runs; a false guard skips the step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepCondition {
    /// Template such as `{{token}}`.
    pub variable: String,
    pub operator: ConditionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepAction {
    SetVariable {
        key: String,
        value: String,
    },
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },
    Delay {
        ms: u64,
    },
    Custom {
        name: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub order: u32,
    pub request: RequestTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<ExpectedResponse>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extract_variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<NextStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<StepAction>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<StepAction>,
    /// Per-step timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: u32,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, request: RequestTemplate) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            order: 0,
            request,
            expected_response: None,
            extract_variables: BTreeMap::new(),
            next_step: None,
            condition: None,
            on_success: Vec::new(),
            on_failure: Vec::new(),
            timeout: None,
            retries: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Network,
    Timeout,
    Validation,
    Script,
    Unknown,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorType::Network => "network",
            ErrorType::Timeout => "timeout",
            ErrorType::Validation => "validation",
            ErrorType::Script => "script",
            ErrorType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
            step: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.error_type, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<HttpResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_variables: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    pub retry_count: u32,
    pub success: bool,
}

impl StepExecution {
    pub fn start(step: &WorkflowStep, retry_count: u32) -> Self {
        Self {
            step_id: step.id.clone(),
            name: step.name.clone(),
            status: StepStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            request: None,
            response: None,
            extracted_variables: None,
            error: None,
            retry_count,
            success: false,
        }
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.success = matches!(status, StepStatus::Completed | StepStatus::Skipped);
        self.completed_at = Some(now);
        self.duration = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    pub fn complete(&mut self) {
        self.finish(StepStatus::Completed);
    }

    pub fn fail(&mut self, error: ExecutionError) {
        self.error = Some(error);
        self.extracted_variables = None;
        self.finish(StepStatus::Failed);
    }

    pub fn skip(&mut self) {
        self.finish(StepStatus::Skipped);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// 1-based index of the step being (or last) executed; 0 before the first.
    pub current_step: usize,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    pub variables: VariableContext,
    #[serde(default)]
    pub step_executions: Vec<StepExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl WorkflowExecution {
    pub fn new(workflow: &Workflow, variables: VariableContext) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            status: ExecutionStatus::Pending,
            current_step: 0,
            total_steps: workflow.steps.len(),
            started_at: Utc::now(),
            completed_at: None,
            duration: None,
            variables,
            step_executions: Vec::new(),
            error: None,
        }
    }

    /// Stamp `completed_at` and `duration` for a terminal transition.
    pub(crate) fn finish(&mut self, status: ExecutionStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepExecution> {
        self.step_executions
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
    }
}
