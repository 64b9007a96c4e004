// apiflow — Load workflow definitions from YAML or JSON files

use super::{NextStep, Workflow};
use crate::variable::resolver::validate_template;
use anyhow::Context;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Yaml,
}

impl Format {
    /// `.json` is JSON, anything else is treated as YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Yaml,
        }
    }
}

pub fn parse_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow file {}", path.display()))?;
    parse_workflow_str(&content, Format::from_path(path))
        .with_context(|| format!("failed to parse workflow file {}", path.display()))
}

pub fn parse_workflow_str(content: &str, format: Format) -> anyhow::Result<Workflow> {
    let workflow: Workflow = match format {
        Format::Json => serde_json::from_str(content)?,
        Format::Yaml => serde_yaml::from_str(content)?,
    };
    if workflow.id.trim().is_empty() {
        anyhow::bail!("workflow id must not be empty");
    }
    Ok(workflow)
}

/// Static problems in a workflow definition: duplicate step ids, jumps to
/// unknown steps and malformed templates.
pub fn lint_workflow(workflow: &Workflow) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    let ids: HashSet<&str> = workflow.steps.iter().map(|s| s.id.as_str()).collect();

    for step in &workflow.steps {
        if !seen.insert(step.id.as_str()) {
            problems.push(format!("duplicate step id '{}'", step.id));
        }
        if let Some(NextStep::Static(target)) = &step.next_step {
            if !ids.contains(target.as_str()) {
                problems.push(format!(
                    "step '{}' jumps to unknown step '{}'",
                    step.id, target
                ));
            }
        }

        let mut templates: Vec<&str> = vec![&step.request.url];
        templates.extend(step.request.headers.values().map(String::as_str));
        for template in templates {
            for err in validate_template(template).errors {
                problems.push(format!("step '{}': {}", step.id, err));
            }
        }
    }
    problems
}
