// apiflow — Single step execution: resolve, send, validate, extract, act, retry

use super::extract::extract_all;
use super::validate::{validate_response, SchemaValidator};
use super::{
    ConditionOperator, ErrorType, ExecutionError, LogLevel, RequestTemplate, StepAction,
    StepCondition, StepExecution, WorkflowStep,
};
use crate::action::ActionRegistry;
use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::variable::resolver::{unresolved_variables, VariableResolver};
use crate::variable::{validate_key, VariableContext};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default base delay for exponential retry backoff.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Every attempt made for one step; the last entry is the terminal one.
#[derive(Debug, Clone)]
pub struct StepRun {
    pub attempts: Vec<StepExecution>,
}

impl StepRun {
    pub fn last(&self) -> Option<&StepExecution> {
        self.attempts.last()
    }

    pub fn succeeded(&self) -> bool {
        self.last().is_some_and(|s| s.success)
    }

    pub fn response_body(&self) -> Option<&Value> {
        self.last()
            .and_then(|s| s.response.as_ref())
            .map(|r| &r.body)
    }
}

pub struct StepExecutor {
    transport: Arc<dyn HttpTransport>,
    resolver: VariableResolver,
    actions: ActionRegistry,
    schema_validator: Option<Arc<dyn SchemaValidator>>,
    retry_base_delay: Duration,
}

impl StepExecutor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        resolver: VariableResolver,
        actions: ActionRegistry,
    ) -> Self {
        Self {
            transport,
            resolver,
            actions,
            schema_validator: None,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_schema_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.schema_validator = Some(validator);
        self
    }

    /// Materialize a request template against `ctx`.
    pub fn resolve_request(
        &self,
        template: &RequestTemplate,
        ctx: &VariableContext,
    ) -> HttpRequest {
        HttpRequest {
            method: self.resolver.resolve(&template.method, ctx),
            url: self.resolver.resolve(&template.url, ctx),
            headers: template
                .headers
                .iter()
                .map(|(k, v)| (self.resolver.resolve(k, ctx), self.resolver.resolve(v, ctx)))
                .collect(),
            body: template
                .body
                .as_ref()
                .map(|b| self.resolver.resolve_value(b, ctx)),
        }
    }

    /// Evaluate a step guard. Unresolved templates count as missing values.
    pub fn evaluate_condition(&self, condition: &StepCondition, ctx: &VariableContext) -> bool {
        let resolved = self.resolver.resolve(&condition.variable, ctx);
        let actual = if unresolved_variables(&resolved).is_empty() {
            Some(resolved)
        } else {
            None
        };
        let expected = condition
            .value
            .as_ref()
            .map(|v| self.resolver.resolve(v, ctx))
            .unwrap_or_default();

        match condition.operator {
            ConditionOperator::Exists => actual.is_some_and(|v| !v.is_empty()),
            ConditionOperator::NotExists => actual.map_or(true, |v| v.is_empty()),
            ConditionOperator::Equals => actual.as_deref() == Some(expected.as_str()),
            ConditionOperator::NotEquals => actual.as_deref() != Some(expected.as_str()),
            ConditionOperator::Contains => actual.is_some_and(|v| v.contains(&expected)),
        }
    }

    /// Run `step` with retries. `timeout` applies when the step sets none.
    ///
    /// Extracted variables are merged into `ctx` as soon as an attempt
    /// succeeds, so `onSuccess` actions and later steps can reference them.
    pub async fn execute_step(
        &self,
        step: &WorkflowStep,
        ctx: &mut VariableContext,
        timeout: Option<Duration>,
    ) -> StepRun {
        if let Some(condition) = &step.condition {
            if !self.evaluate_condition(condition, ctx) {
                tracing::info!(step = %step.id, "Condition not met, skipping step");
                let mut skipped = StepExecution::start(step, 0);
                skipped.skip();
                return StepRun {
                    attempts: vec![skipped],
                };
            }
        }

        let timeout = step.timeout.map(Duration::from_millis).or(timeout);
        let mut attempts = Vec::new();
        let mut retry_count = 0u32;

        loop {
            let exec = self.attempt(step, ctx, timeout, retry_count).await;
            let success = exec.success;
            attempts.push(exec);

            if success || retry_count >= step.retries {
                break;
            }

            let delay = self
                .retry_base_delay
                .saturating_mul(2u32.saturating_pow(retry_count));
            tracing::info!(
                step = %step.id,
                attempt = retry_count + 1,
                max_retries = step.retries,
                delay_ms = %delay.as_millis(),
                "Step failed, retrying"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }

        StepRun { attempts }
    }

    async fn attempt(
        &self,
        step: &WorkflowStep,
        ctx: &mut VariableContext,
        timeout: Option<Duration>,
        retry_count: u32,
    ) -> StepExecution {
        let mut exec = StepExecution::start(step, retry_count);
        let request = self.resolve_request(&step.request, ctx);

        let unresolved = unresolved_variables(&request.url);
        if !unresolved.is_empty() {
            tracing::warn!(
                step = %step.id,
                unresolved = ?unresolved,
                "Request URL has unresolved variables"
            );
        }

        tracing::debug!(
            step = %step.id,
            method = %request.method,
            url = %request.url,
            attempt = retry_count,
            "Executing step"
        );
        let sent = self.send(&request, timeout).await;
        exec.request = Some(request);

        let outcome = match sent {
            Ok(response) => {
                let checked = self.check_response(step, &response, ctx);
                exec.response = Some(response);
                checked
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                if !step.extract_variables.is_empty() {
                    let body = exec
                        .response
                        .as_ref()
                        .map(|r| &r.body)
                        .unwrap_or(&Value::Null);
                    let extracted = extract_all(body, &step.extract_variables);
                    ctx.merge_resolved(&extracted);
                    exec.extracted_variables = Some(extracted);
                }
                self.run_actions(&step.on_success, ctx, &step.id).await;
                exec.complete();
                tracing::info!(step = %step.id, duration_ms = ?exec.duration, "Step completed");
            }
            Err(error) => {
                self.run_actions(&step.on_failure, ctx, &step.id).await;
                tracing::warn!(
                    step = %step.id,
                    attempt = retry_count,
                    error = %error,
                    "Step attempt failed"
                );
                exec.fail(error.with_step(step.id.clone()));
            }
        }

        exec
    }

    /// Expected header values and body fragments may themselves be templates.
    fn check_response(
        &self,
        step: &WorkflowStep,
        response: &HttpResponse,
        ctx: &VariableContext,
    ) -> Result<(), ExecutionError> {
        let Some(expected) = &step.expected_response else {
            return Ok(());
        };
        let mut expected = expected.clone();
        for value in expected.headers.values_mut() {
            *value = self.resolver.resolve(value, ctx);
        }
        for fragment in expected.body_contains.iter_mut() {
            *fragment = self.resolver.resolve(fragment, ctx);
        }
        validate_response(&expected, response, self.schema_validator.as_deref()).map_err(
            |violations| {
                ExecutionError::new(
                    ErrorType::Validation,
                    format!("Response validation failed: {}", violations.join("; ")),
                )
                .with_details(json!({ "violations": violations }))
            },
        )
    }

    async fn send(
        &self,
        request: &HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, ExecutionError> {
        let token = CancellationToken::new();
        let call = self.transport.send(request, token.clone());

        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    return Err(ExecutionError::new(
                        ErrorType::Timeout,
                        format!("Request timed out after {}ms", limit.as_millis()),
                    ));
                }
            },
            None => call.await,
        };

        result.map_err(|e| match e {
            TransportError::Network(msg) => ExecutionError::new(ErrorType::Network, msg),
            TransportError::Timeout => ExecutionError::new(ErrorType::Timeout, "Request timed out"),
            TransportError::Other(msg) => ExecutionError::new(ErrorType::Unknown, msg),
        })
    }

    async fn run_actions(
        &self,
        actions: &[StepAction],
        ctx: &mut VariableContext,
        step_id: &str,
    ) {
        for action in actions {
            if let Err(e) = self.run_action(action, ctx).await {
                tracing::warn!(step = %step_id, action = ?action, "Step action failed: {}", e);
            }
        }
    }

    async fn run_action(
        &self,
        action: &StepAction,
        ctx: &mut VariableContext,
    ) -> anyhow::Result<()> {
        match action {
            StepAction::SetVariable { key, value } => {
                validate_key(key)?;
                let value = self.resolver.resolve(value, ctx);
                ctx.set_resolved(key.clone(), value);
            }
            StepAction::Log { message, level } => {
                let message = self.resolver.resolve(message, ctx);
                match level {
                    LogLevel::Debug => tracing::debug!(target: "apiflow::action", "{}", message),
                    LogLevel::Info => tracing::info!(target: "apiflow::action", "{}", message),
                    LogLevel::Warn => tracing::warn!(target: "apiflow::action", "{}", message),
                    LogLevel::Error => tracing::error!(target: "apiflow::action", "{}", message),
                }
            }
            StepAction::Delay { ms } => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            StepAction::Custom { name } => {
                self.actions.run(name, ctx).await?;
            }
        }
        Ok(())
    }
}
