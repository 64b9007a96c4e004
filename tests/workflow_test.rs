use apiflow::action::{ActionHandler, ActionRegistry};
use apiflow::config::HttpConfig;
use apiflow::http::client::ReqwestTransport;
use apiflow::storage::file::FileStorage;
use apiflow::storage::Storage;
use apiflow::variable::resolver::VariableResolver;
use apiflow::variable::{Variable, VariableContext, VariableScope, VariableType};
use apiflow::workflow::catalog;
use apiflow::workflow::engine::{ExecutionOptions, WorkflowEngine};
use apiflow::workflow::step::StepExecutor;
use apiflow::workflow::{
    ErrorType, ExecutionStatus, ExpectedResponse, RequestTemplate, StatusExpectation, StepAction,
    Workflow, WorkflowExecution, WorkflowStep,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build_engine(storage: Arc<dyn Storage>, actions: ActionRegistry) -> WorkflowEngine {
    let transport = Arc::new(ReqwestTransport::new(&HttpConfig::default()).unwrap());
    let executor = StepExecutor::new(transport, VariableResolver::default(), actions)
        .with_retry_base_delay(Duration::from_millis(10));
    WorkflowEngine::new(executor, storage).with_pause_poll_interval(Duration::from_millis(10))
}

fn base_url(server: &MockServer) -> BTreeMap<String, String> {
    BTreeMap::from([("baseUrl".to_string(), server.uri())])
}

fn get_step(id: &str, url: &str) -> WorkflowStep {
    WorkflowStep::new(id, id.to_uppercase(), RequestTemplate::new("GET", url))
}

fn env_var(key: &str, value: &str) -> Variable {
    Variable::new(key, value, VariableType::Environment, VariableScope::Global).unwrap()
}

fn scoped_var(key: &str, value: &str, scope: VariableScope) -> Variable {
    Variable::new(key, value, VariableType::Collection, scope).unwrap()
}

async fn run(
    engine: &WorkflowEngine,
    wf: Workflow,
    initial: BTreeMap<String, String>,
) -> WorkflowExecution {
    engine
        .execute_workflow(&wf, initial, ExecutionOptions::default())
        .await
        .unwrap()
}

fn workflow(id: &str, steps: Vec<WorkflowStep>) -> Workflow {
    Workflow {
        id: id.into(),
        name: id.into(),
        category: "test".into(),
        description: None,
        steps,
        variables: Vec::new(),
    }
}

#[tokio::test]
async fn test_token_threads_from_login_to_profile() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"t": "abc"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7})))
        .expect(1)
        .mount(&server)
        .await;

    let mut login = WorkflowStep::new(
        "login",
        "Login",
        RequestTemplate::new("POST", "{{baseUrl}}/login").body(json!({"user": "demo"})),
    );
    login.extract_variables = BTreeMap::from([("token".to_string(), "$.t".to_string())]);
    let mut me = WorkflowStep::new(
        "me",
        "Profile",
        RequestTemplate::new("GET", "{{baseUrl}}/me").header("Authorization", "Bearer {{token}}"),
    );
    me.expected_response = Some(ExpectedResponse {
        status: Some(StatusExpectation::One(200)),
        ..Default::default()
    });

    let tmp = TempDir::new().unwrap();
    let engine = build_engine(Arc::new(FileStorage::new(tmp.path())), ActionRegistry::new());
    let exec = engine
        .execute_workflow(
            &workflow("login-flow", vec![login, me]),
            base_url(&server),
            ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.variables.resolved["token"], "abc");
    let second = &exec.step_executions[1];
    assert_eq!(
        second.request.as_ref().unwrap().headers["Authorization"],
        "Bearer abc"
    );
    assert_eq!(second.response.as_ref().unwrap().body, json!({"id": 7}));

    let history = engine.execution_history("login-flow").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, exec.id);
    assert_eq!(history[0].status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_catalog_magic_link_flow() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/magic-link"))
        .and(body_json(json!({"email": "dev@example.com"})))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"token": "mlt-1"})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/verify"))
        .and(body_json(json!({"token": "mlt-1"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"accessToken": "at-9"})),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .and(header("authorization", "Bearer at-9"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": "u-1", "email": "dev@example.com"})),
        )
        .mount(&server)
        .await;

    let wf = catalog::find("magic-link-auth").unwrap();
    let mut initial = base_url(&server);
    initial.insert("email".into(), "dev@example.com".into());

    let tmp = TempDir::new().unwrap();
    let engine = build_engine(Arc::new(FileStorage::new(tmp.path())), ActionRegistry::new());
    let exec = engine
        .execute_workflow(&wf, initial, ExecutionOptions::default())
        .await
        .unwrap();

    assert_eq!(exec.status, ExecutionStatus::Completed, "{:?}", exec.error);
    assert_eq!(exec.step_executions.len(), 3);
    assert_eq!(exec.variables.resolved["userId"], "u-1");
}

#[tokio::test]
async fn test_retries_recover_from_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let mut step = get_step("flaky", "{{baseUrl}}/flaky");
    step.retries = 3;
    step.expected_response = Some(ExpectedResponse {
        status: Some(StatusExpectation::One(200)),
        ..Default::default()
    });

    let tmp = TempDir::new().unwrap();
    let engine = build_engine(Arc::new(FileStorage::new(tmp.path())), ActionRegistry::new());
    let exec = run(&engine, workflow("retry", vec![step]), base_url(&server)).await;

    assert_eq!(exec.status, ExecutionStatus::Completed);
    let attempts: Vec<(u32, bool)> = exec
        .step_executions
        .iter()
        .map(|s| (s.retry_count, s.success))
        .collect();
    assert_eq!(attempts, vec![(0, false), (1, false), (2, true)]);
    let first_error = exec.step_executions[0].error.as_ref().unwrap();
    assert_eq!(first_error.error_type, ErrorType::Validation);
    assert!(first_error.message.contains("Expected status 200, got 503"));
}

#[tokio::test]
async fn test_step_timeout_fails_execution() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(800)))
        .mount(&server)
        .await;

    let mut slow = get_step("slow", "{{baseUrl}}/slow");
    slow.timeout = Some(100);
    let never = get_step("never", "{{baseUrl}}/never");

    let tmp = TempDir::new().unwrap();
    let engine = build_engine(Arc::new(FileStorage::new(tmp.path())), ActionRegistry::new());
    let exec = run(&engine, workflow("timeout", vec![slow, never]), base_url(&server)).await;

    assert_eq!(exec.status, ExecutionStatus::Failed);
    let err = exec.error.unwrap();
    assert_eq!(err.error_type, ErrorType::Timeout);
    assert_eq!(err.step.as_deref(), Some("slow"));
    assert_eq!(exec.step_executions.len(), 1);
}

#[tokio::test]
async fn test_dynamic_and_layered_variables_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/users"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let step = WorkflowStep::new(
        "create",
        "Create",
        RequestTemplate::new("POST", "{{baseUrl}}/{{version}}/users")
            .header("X-Api-Key", "{{apiKey}}")
            .body(json!({"id": "{{$uuid}}", "email": "{{$randomEmail}}", "tags": ["{{tag}}"]})),
    );
    let mut wf = workflow("dynamic", vec![step]);
    wf.variables = vec![scoped_var("version", "v2", VariableScope::Workflow)];
    let options = ExecutionOptions {
        environment: vec![
            env_var("apiKey", "env-key").secret(),
            env_var("version", "v1"),
        ],
        collection: vec![scoped_var("tag", "beta", VariableScope::Collection)],
        ..Default::default()
    };

    let tmp = TempDir::new().unwrap();
    let engine = build_engine(Arc::new(FileStorage::new(tmp.path())), ActionRegistry::new());
    let exec = engine
        .execute_workflow(&wf, base_url(&server), options)
        .await
        .unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].headers.get("x-api-key").unwrap(), "env-key");
    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["id"].as_str().unwrap().len(), 36);
    assert!(body["email"].as_str().unwrap().ends_with("@example.com"));
    assert_eq!(body["tags"], json!(["beta"]));
}

struct StampAction;

#[async_trait]
impl ActionHandler for StampAction {
    fn name(&self) -> &str {
        "stamp"
    }

    async fn run(&self, context: &mut VariableContext) -> anyhow::Result<()> {
        context.set_resolved("stamp", "stamped");
        Ok(())
    }
}

#[tokio::test]
async fn test_actions_feed_later_steps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/first"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"n": 1})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/second/stamped/1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut first = get_step("first", "{{baseUrl}}/first");
    first.on_success = vec![
        StepAction::Custom { name: "stamp".into() },
        StepAction::SetVariable {
            key: "count".into(),
            value: "{{n}}".into(),
        },
    ];
    first.extract_variables = BTreeMap::from([("n".to_string(), "$.n".to_string())]);
    let second = WorkflowStep::new(
        "second",
        "Second",
        RequestTemplate::new("GET", "{{baseUrl}}/second/{{stamp}}/{{count}}"),
    );

    let actions = ActionRegistry::new();
    actions.register(Arc::new(StampAction)).await;
    let tmp = TempDir::new().unwrap();
    let engine = build_engine(Arc::new(FileStorage::new(tmp.path())), actions);
    let exec = run(&engine, workflow("actions", vec![first, second]), base_url(&server)).await;
    assert_eq!(exec.status, ExecutionStatus::Completed, "{:?}", exec.error);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let step = WorkflowStep::new(
        "down",
        "Down",
        RequestTemplate::new("GET", "http://127.0.0.1:9/unreachable"),
    );
    let tmp = TempDir::new().unwrap();
    let engine = build_engine(Arc::new(FileStorage::new(tmp.path())), ActionRegistry::new());
    let exec = run(&engine, workflow("down", vec![step]), BTreeMap::new()).await;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.error.unwrap().error_type, ErrorType::Network);
}
