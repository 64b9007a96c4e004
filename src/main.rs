// apiflow — Multi-step API workflow engine with templated variables

use apiflow::action::ActionRegistry;
use apiflow::config::Config;
use apiflow::variable::resolver::{extract_variables, validate_template, VariableResolver};
use apiflow::variable::VariableContext;
use apiflow::workflow::engine::{environment_variables, ExecutionOptions, WorkflowEngine};
use apiflow::workflow::events::EventKind;
use apiflow::workflow::parser::{lint_workflow, parse_workflow};
use apiflow::workflow::{catalog, ExecutionStatus, StepStatus, Workflow};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "apiflow",
    about = "apiflow: run multi-step API workflows",
    version
)]
struct Cli {
    /// More log output on stderr (-v, -vv, -vvv); `APIFLOW_LOG` overrides
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow file (YAML or JSON) or a catalog workflow by id
    Run {
        /// Path to the workflow file, or a catalog id
        workflow: String,
        /// Initial variable, `key=value` (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Keep going when a step fails
        #[arg(long)]
        continue_on_error: bool,
        /// Pause when a step fails (Ctrl-C cancels)
        #[arg(long)]
        pause_on_failure: bool,
        /// Print the final execution record as JSON
        #[arg(long)]
        json: bool,
        /// Config file path
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Validate a template and list the variables it references
    Check {
        template: String,
        /// Variable to preview against, `key=value` (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Config file path (its environment is used for the preview)
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Show past executions of a workflow
    History {
        workflow_id: String,
        /// Config file path
        #[arg(short, long)]
        config: Option<String>,
    },
    /// List prebuilt workflows
    Catalog,
    /// Show version information
    Version,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    apiflow::logger::init(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            workflow,
            vars,
            continue_on_error,
            pause_on_failure,
            json,
            config,
        } => {
            run_cmd(
                &workflow,
                &vars,
                continue_on_error,
                pause_on_failure,
                json,
                config.as_deref(),
            )
            .await
        }
        Commands::Check {
            template,
            vars,
            config,
        } => check_cmd(&template, &vars, config.as_deref()),
        Commands::History {
            workflow_id,
            config,
        } => history_cmd(&workflow_id, config.as_deref()).await,
        Commands::Catalog => {
            catalog_cmd();
            Ok(true)
        }
        Commands::Version => {
            version_cmd();
            Ok(true)
        }
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(2);
        }
    }
}

// ---------------------------------------------------------------------------
// Run command
// ---------------------------------------------------------------------------

async fn run_cmd(
    source: &str,
    vars: &[String],
    continue_on_error: bool,
    pause_on_failure: bool,
    json: bool,
    config_path: Option<&str>,
) -> anyhow::Result<bool> {
    let cfg = load_config(config_path);
    cfg.validate()?;

    let workflow = load_workflow(source)?;
    let problems = lint_workflow(&workflow);
    if !problems.is_empty() {
        for p in &problems {
            eprintln!("  ✗ {}", p);
        }
        anyhow::bail!("workflow '{}' has {} problem(s)", workflow.id, problems.len());
    }

    let initial = parse_vars(vars)?;
    let engine = Arc::new(WorkflowEngine::from_config(&cfg, ActionRegistry::new())?);

    if !json {
        subscribe_progress(&engine);
    }

    let mut options = ExecutionOptions::from_config(&cfg.engine);
    options.continue_on_error |= continue_on_error;
    options.pause_on_failure |= pause_on_failure;
    options.environment = environment_variables(&cfg.environment);
    let execution_id = uuid::Uuid::new_v4().to_string();
    options.execution_id = Some(execution_id.clone());

    let runner = engine.clone();
    let mut task =
        tokio::spawn(async move { runner.execute_workflow(&workflow, initial, options).await });

    let execution = loop {
        tokio::select! {
            joined = &mut task => break joined??,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Cancelling after the current step…");
                engine.cancel_execution(&execution_id).await;
            }
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        println!();
        println!(
            "{} {} in {}ms ({} step record(s))",
            execution.workflow_id,
            execution.status,
            execution.duration.unwrap_or_default(),
            execution.step_executions.len()
        );
        if let Some(err) = &execution.error {
            println!("  error: {}", err);
        }
    }

    Ok(execution.status == ExecutionStatus::Completed)
}

fn subscribe_progress(engine: &WorkflowEngine) {
    let events = engine.events();
    events.on(EventKind::StepStarted, |e| {
        println!("→ {}", e.step_id.as_deref().unwrap_or("?"));
        Ok(())
    });
    for kind in [EventKind::StepCompleted, EventKind::StepFailed] {
        events.on(kind, |e| {
            let record = e.data.as_ref();
            let status = record
                .and_then(|d| serde_json::from_value::<StepStatus>(d["status"].clone()).ok());
            let duration = record.and_then(|d| d["duration"].as_u64()).unwrap_or(0);
            let mark = match status {
                Some(StepStatus::Completed) => "✓",
                Some(StepStatus::Skipped) => "○",
                _ => "✗",
            };
            let mut line = format!(
                "  {} {} ({}ms)",
                mark,
                e.step_id.as_deref().unwrap_or("?"),
                duration
            );
            if let Some(msg) = record.and_then(|d| d["error"]["message"].as_str()) {
                line.push_str(&format!(": {}", msg));
            }
            println!("{}", line);
            Ok(())
        });
    }
    events.on(EventKind::Paused, |e| {
        println!("⏸ execution {} paused (Ctrl-C to cancel)", e.execution_id);
        Ok(())
    });
}

fn load_workflow(source: &str) -> anyhow::Result<Workflow> {
    let path = Path::new(source);
    if path.exists() {
        return parse_workflow(path);
    }
    catalog::find(source)
        .ok_or_else(|| anyhow::anyhow!("'{}' is neither a workflow file nor a catalog id", source))
}

fn parse_vars(vars: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    vars.iter()
        .map(|raw| -> anyhow::Result<(String, String)> {
            let (k, v) = raw
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got '{}'", raw))?;
            apiflow::variable::validate_key(k.trim())?;
            Ok((k.trim().to_string(), v.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Other commands
// ---------------------------------------------------------------------------

fn check_cmd(template: &str, vars: &[String], config_path: Option<&str>) -> anyhow::Result<bool> {
    let report = validate_template(template);
    let names = extract_variables(template);

    if names.is_empty() {
        println!("Variables: (none)");
    } else {
        let cfg = load_config(config_path);
        let mut ctx = VariableContext::new();
        ctx.environment = VariableContext::layer_from(&environment_variables(&cfg.environment));
        ctx.merge_resolved(&parse_vars(vars)?);

        println!("Variables:");
        for preview in VariableResolver::default().preview_resolution(template, &ctx) {
            match (&preview.value, &preview.source) {
                (Some(value), Some(source)) => {
                    println!("  {:<20} = {}  ({:?})", preview.name, value, source)
                }
                _ => println!(
                    "  {:<20} ✗ {}",
                    preview.name,
                    preview.error.as_deref().unwrap_or("unresolved")
                ),
            }
        }
    }
    for w in &report.warnings {
        println!("  ⚠ {}", w);
    }
    for e in &report.errors {
        println!("  ✗ {}", e);
    }
    if report.valid {
        println!("Template is valid");
    }
    Ok(report.valid)
}

async fn history_cmd(workflow_id: &str, config_path: Option<&str>) -> anyhow::Result<bool> {
    let cfg = load_config(config_path);
    let engine = WorkflowEngine::from_config(&cfg, ActionRegistry::new())?;
    let history = engine.execution_history(workflow_id).await?;

    if history.is_empty() {
        println!("No executions recorded for '{}'", workflow_id);
        return Ok(true);
    }
    for exec in history {
        println!(
            "{}  {}  {:<9}  {:>6}ms  {}/{} steps",
            exec.started_at.format("%Y-%m-%d %H:%M:%S"),
            exec.id,
            exec.status.to_string(),
            exec.duration.unwrap_or_default(),
            exec.current_step,
            exec.total_steps
        );
    }
    Ok(true)
}

fn catalog_cmd() {
    println!("Prebuilt workflows:\n");
    for entry in catalog::list() {
        println!(
            "  {:<18} {:<12} {} ({} steps)",
            entry.id, entry.category, entry.name, entry.steps
        );
    }
}

fn version_cmd() {
    println!("apiflow v{}", apiflow::VERSION);
}

fn load_config(path: Option<&str>) -> Config {
    let config_path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        Config::default_path().unwrap_or_else(|_| PathBuf::from("config.json"))
    };

    Config::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Failed to load config: {}, using defaults", e);
        Config::default()
    })
}
