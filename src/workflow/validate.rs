// apiflow — Response validation against expected status, headers and body

use super::ExpectedResponse;
use crate::http::HttpResponse;
use serde_json::Value;

/// Hook for schema checks. No implementation ships with the crate.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema: &Value, body: &Value) -> Result<(), Vec<String>>;
}

/// Check `response` against every rule in `expected`, collecting all violations.
pub fn validate_response(
    expected: &ExpectedResponse,
    response: &HttpResponse,
    schema_validator: Option<&dyn SchemaValidator>,
) -> Result<(), Vec<String>> {
    let mut violations = Vec::new();

    if let Some(status) = &expected.status {
        if !status.matches(response.status) {
            violations.push(format!(
                "Expected status {}, got {}",
                status, response.status
            ));
        }
    }

    for (name, want) in &expected.headers {
        match response.header(name) {
            Some(got) if got == want => {}
            Some(got) => violations.push(format!(
                "Expected header '{}' to be '{}', got '{}'",
                name, want, got
            )),
            None => violations.push(format!("Missing expected header '{}'", name)),
        }
    }

    if !expected.body_contains.is_empty() {
        let text = serde_json::to_string(&response.body).unwrap_or_default();
        for needle in &expected.body_contains {
            if !text.contains(needle.as_str()) {
                violations.push(format!("Response body does not contain '{}'", needle));
            }
        }
    }

    for field in &expected.extract_fields {
        let present = response
            .body
            .as_object()
            .is_some_and(|obj| obj.contains_key(field));
        if !present {
            violations.push(format!("Response body is missing field '{}'", field));
        }
    }

    if let (Some(schema), Some(validator)) = (&expected.schema, schema_validator) {
        if let Err(errors) = validator.validate(schema, &response.body) {
            violations.extend(errors.into_iter().map(|e| format!("Schema: {}", e)));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
