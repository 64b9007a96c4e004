// apiflow — Prebuilt workflows
//
// Templates for common API sequences. Every template expects `baseUrl` from
// the environment (or an initial variable) and declares its other inputs as
// workflow variables with placeholder defaults.

use super::{
    ExpectedResponse, LogLevel, RequestTemplate, StatusExpectation, StepAction, Workflow,
    WorkflowStep,
};
use crate::variable::{Variable, VariableScope, VariableType};
use serde_json::json;
use std::collections::BTreeMap;

/// Summary line for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    pub category: String,
    pub steps: usize,
}

pub fn builtin_workflows() -> Vec<Workflow> {
    vec![magic_link_auth(), crud_lifecycle(), health_check()]
}

pub fn list() -> Vec<CatalogEntry> {
    builtin_workflows()
        .into_iter()
        .map(|w| CatalogEntry {
            steps: w.steps.len(),
            id: w.id,
            name: w.name,
            category: w.category,
        })
        .collect()
}

pub fn find(id: &str) -> Option<Workflow> {
    builtin_workflows().into_iter().find(|w| w.id == id)
}

fn expect(status: StatusExpectation) -> ExpectedResponse {
    ExpectedResponse {
        status: Some(status),
        ..Default::default()
    }
}

fn extract(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn workflow_var(key: &str, value: &str) -> Variable {
    Variable {
        key: key.to_string(),
        value: value.to_string(),
        var_type: VariableType::Collection,
        scope: VariableScope::Workflow,
        enabled: true,
        is_secret: false,
        description: None,
    }
}

fn step(id: &str, name: &str, order: u32, request: RequestTemplate) -> WorkflowStep {
    let mut s = WorkflowStep::new(id, name, request);
    s.order = order;
    s
}

/// Request magic link → verify token → fetch profile.
fn magic_link_auth() -> Workflow {
    let mut request_link = step(
        "request-link",
        "Request magic link",
        1,
        RequestTemplate::new("POST", "{{baseUrl}}/auth/magic-link")
            .header("Content-Type", "application/json")
            .body(json!({ "email": "{{email}}" })),
    );
    request_link.expected_response = Some(expect(StatusExpectation::AnyOf(vec![200, 202])));
    request_link.extract_variables = extract(&[("magicToken", "$.token")]);

    let mut verify = step(
        "verify-token",
        "Verify magic link token",
        2,
        RequestTemplate::new("POST", "{{baseUrl}}/auth/verify")
            .header("Content-Type", "application/json")
            .body(json!({ "token": "{{magicToken}}" })),
    );
    verify.expected_response = Some(ExpectedResponse {
        status: Some(StatusExpectation::One(200)),
        extract_fields: vec!["accessToken".into()],
        ..Default::default()
    });
    verify.extract_variables = extract(&[("accessToken", "$.accessToken")]);
    verify.retries = 1;

    let mut profile = step(
        "fetch-profile",
        "Fetch user profile",
        3,
        RequestTemplate::new("GET", "{{baseUrl}}/users/me")
            .header("Authorization", "Bearer {{accessToken}}"),
    );
    profile.expected_response = Some(expect(StatusExpectation::One(200)));
    profile.extract_variables = extract(&[("userId", "$.id")]);
    profile.on_success = vec![StepAction::Log {
        message: "Signed in as user {{userId}}".into(),
        level: LogLevel::Info,
    }];

    Workflow {
        id: "magic-link-auth".into(),
        name: "Magic link authentication".into(),
        category: "auth".into(),
        description: Some("Request a magic link, verify it and load the signed-in profile".into()),
        steps: vec![request_link, verify, profile],
        variables: vec![workflow_var("email", "user@example.com")],
    }
}

/// Create → read → update → delete a resource.
fn crud_lifecycle() -> Workflow {
    let mut create = step(
        "create",
        "Create item",
        1,
        RequestTemplate::new("POST", "{{baseUrl}}/{{resource}}")
            .header("Content-Type", "application/json")
            .body(json!({ "name": "{{$randomUserName}}", "ref": "{{$uuid}}" })),
    );
    create.expected_response = Some(expect(StatusExpectation::AnyOf(vec![200, 201])));
    create.extract_variables = extract(&[("itemId", "$.id"), ("itemName", "$.name")]);

    let mut read = step(
        "read",
        "Read item",
        2,
        RequestTemplate::new("GET", "{{baseUrl}}/{{resource}}/{{itemId}}"),
    );
    read.expected_response = Some(ExpectedResponse {
        status: Some(StatusExpectation::One(200)),
        body_contains: vec!["{{itemName}}".into()],
        ..Default::default()
    });

    let mut update = step(
        "update",
        "Update item",
        3,
        RequestTemplate::new("PUT", "{{baseUrl}}/{{resource}}/{{itemId}}")
            .header("Content-Type", "application/json")
            .body(json!({ "name": "{{itemName}}-updated" })),
    );
    update.expected_response = Some(expect(StatusExpectation::AnyOf(vec![200, 204])));

    let mut delete = step(
        "delete",
        "Delete item",
        4,
        RequestTemplate::new("DELETE", "{{baseUrl}}/{{resource}}/{{itemId}}"),
    );
    delete.expected_response = Some(expect(StatusExpectation::AnyOf(vec![200, 202, 204])));

    Workflow {
        id: "crud-lifecycle".into(),
        name: "CRUD lifecycle".into(),
        category: "crud".into(),
        description: Some("Exercise create, read, update and delete on one resource".into()),
        steps: vec![create, read, update, delete],
        variables: vec![workflow_var("resource", "items")],
    }
}

/// Single health probe with retries.
fn health_check() -> Workflow {
    let mut probe = step(
        "probe",
        "Probe health endpoint",
        1,
        RequestTemplate::new("GET", "{{baseUrl}}{{healthPath}}"),
    );
    probe.expected_response = Some(expect(StatusExpectation::One(200)));
    probe.retries = 3;
    probe.timeout = Some(5_000);
    probe.on_failure = vec![StepAction::Log {
        message: "{{baseUrl}} is unhealthy".into(),
        level: LogLevel::Error,
    }];

    Workflow {
        id: "health-check".into(),
        name: "Health check".into(),
        category: "monitoring".into(),
        description: None,
        steps: vec![probe],
        variables: vec![workflow_var("healthPath", "/health")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parser::lint_workflow;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_ids_are_unique_and_findable() {
        let entries = list();
        let ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids.len(), entries.len());
        for entry in &entries {
            let wf = find(&entry.id).unwrap();
            assert_eq!(wf.steps.len(), entry.steps);
        }
        assert!(find("nope").is_none());
    }

    #[test]
    fn test_catalog_workflows_lint_clean() {
        for wf in builtin_workflows() {
            assert!(lint_workflow(&wf).is_empty(), "{} has problems", wf.id);
            let orders: Vec<u32> = wf.steps.iter().map(|s| s.order).collect();
            let mut sorted = orders.clone();
            sorted.sort();
            assert_eq!(orders, sorted);
        }
    }

    #[test]
    fn test_magic_link_threads_token() {
        let wf = find("magic-link-auth").unwrap();
        assert_eq!(wf.steps[0].extract_variables["magicToken"], "$.token");
        assert_eq!(
            wf.steps[1].request.body.as_ref().unwrap()["token"],
            "{{magicToken}}"
        );
        assert_eq!(
            wf.steps[2].request.headers["Authorization"],
            "Bearer {{accessToken}}"
        );
    }
}
