//! Triage Warden playbook CLI
//!
//! Command-line interface for validating and running response playbooks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Instrument};
use uuid::Uuid;

mod config;
mod playbooks;
mod validator;

use config::AppConfig;
use tw_actions::{register_builtins, register_simulated, ActionRegistry};
use tw_core::events::{Event, EventBus};
use tw_core::orchestrator::PlaybookEngine;
use tw_core::playbook::{
    ConditionEvaluator, ExecutionContext, ExecutionRecord, ExecutionStatus,
    InMemoryExecutionStore, InMemoryPlaybookSource, PlaybookDefinition, StepStatus,
    TemplateResolver,
};
use tw_observability::{ExecutionKpis, MetricsCollector};
use validator::{validate_config, PlaybookValidator};

#[derive(Parser)]
#[command(name = "triage-playbooks")]
#[command(author = "Triage Warden Team")]
#[command(version)]
#[command(about = "Validate and run Triage Warden response playbooks", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "TRIAGE_PLAYBOOKS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a playbook file
    Validate {
        /// Playbook file (defaults to playbooks.path from the config)
        playbooks: Option<PathBuf>,
    },

    /// Evaluate a condition expression against an event
    Eval {
        /// Condition expression
        #[arg(short, long)]
        condition: String,

        /// Event file (JSON or YAML)
        #[arg(short, long)]
        event: PathBuf,
    },

    /// Render a template against an event
    Render {
        /// Template string
        #[arg(short, long)]
        template: String,

        /// Event file (JSON or YAML)
        #[arg(short, long)]
        event: PathBuf,
    },

    /// Run matching playbooks against an event
    Run {
        /// Playbook file (defaults to playbooks.path from the config)
        #[arg(short, long)]
        playbooks: Option<PathBuf>,

        /// Event file (JSON or YAML)
        #[arg(short, long)]
        event: PathBuf,

        /// Stand in for actions that are not built in
        #[arg(long)]
        simulate: bool,
    },

    /// List built-in actions
    Actions,

    /// Show effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_or_default(cli.config.as_deref())?;
    tw_observability::init_logging_with_config(config.logging_config(cli.verbose)?);
    tw_observability::describe_metrics();

    match cli.command {
        Commands::Validate { playbooks } => {
            let path = playbooks.unwrap_or_else(|| config.playbooks.path.clone());
            cmd_validate(&config, &path, cli.format)
        }
        Commands::Eval { condition, event } => cmd_eval(&condition, &event, cli.format),
        Commands::Render { template, event } => cmd_render(&template, &event, cli.format),
        Commands::Run {
            playbooks,
            event,
            simulate,
        } => {
            let path = playbooks.unwrap_or_else(|| config.playbooks.path.clone());
            cmd_run(&config, &path, &event, simulate, cli.format).await
        }
        Commands::Actions => cmd_actions(cli.format),
        Commands::Config => cmd_config(&config, cli.format),
    }
}

fn builtin_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    register_builtins(&mut registry);
    registry
}

fn cmd_validate(config: &AppConfig, path: &Path, format: OutputFormat) -> Result<()> {
    let playbooks = playbooks::load_playbooks(path)?;
    let registry = builtin_registry();

    let mut result = validate_config(config);
    result.merge(PlaybookValidator::new(&registry).validate(&playbooks));

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "file": path.display().to_string(),
                "playbooks": playbooks.len(),
                "valid": !result.has_errors(),
                "errors": result.errors,
                "warnings": result.warnings,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!(
                "{} {} ({} playbooks)",
                "Validating".cyan(),
                path.display(),
                playbooks.len()
            );
            result.print();
        }
    }

    if result.has_errors() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_eval(condition: &str, event_path: &Path, format: OutputFormat) -> Result<()> {
    let event = playbooks::load_event(event_path)?;
    let context = ExecutionContext::for_event(&event);

    let outcome = ConditionEvaluator::try_evaluate(condition, &context);
    match format {
        OutputFormat::Json => {
            let output = match &outcome {
                Ok(value) => serde_json::json!({"condition": condition, "result": value}),
                Err(e) => serde_json::json!({
                    "condition": condition,
                    "result": false,
                    "error": e.to_string(),
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => match &outcome {
            Ok(true) => println!("{}", "true".green().bold()),
            Ok(false) => println!("{}", "false".red().bold()),
            Err(e) => {
                println!("{}", "false".red().bold());
                eprintln!("{}: {}", "Error".red(), e);
            }
        },
    }
    Ok(())
}

fn cmd_render(template: &str, event_path: &Path, format: OutputFormat) -> Result<()> {
    let event = playbooks::load_event(event_path)?;
    let context =
        ExecutionContext::build(&event, &serde_json::Map::new(), Uuid::nil(), Uuid::nil());

    let rendered = TemplateResolver::new().resolve_str(template, &context);
    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({"template": template, "rendered": rendered});
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => println!("{}", rendered),
    }
    Ok(())
}

async fn cmd_run(
    config: &AppConfig,
    playbooks_path: &Path,
    event_path: &Path,
    simulate: bool,
    format: OutputFormat,
) -> Result<()> {
    let playbooks = playbooks::load_playbooks(playbooks_path)?;
    let event = playbooks::load_event(event_path)?;

    let mut registry = builtin_registry();
    if simulate {
        let stubbed = register_simulated(
            &mut registry,
            playbooks
                .iter()
                .flat_map(|p| p.steps.iter().map(|s| s.uses.as_str())),
        );
        if !stubbed.is_empty() {
            info!(actions = ?stubbed, "Simulating actions");
        }
    }

    let bus = Arc::new(
        EventBus::builder()
            .with_history_size(config.engine.event_history_size)
            .build(),
    );
    let source = Arc::new(InMemoryPlaybookSource::with_playbooks(playbooks.clone()));
    let engine = PlaybookEngine::builder(bus, source, Arc::new(registry))
        .with_store(Arc::new(InMemoryExecutionStore::new()))
        .with_config(config.engine.clone())
        .build();

    let span = tw_observability::event_span!(event.id, event_type = %event.event_type);
    let records = engine
        .handle_event(event.clone())
        .instrument(span)
        .await
        .context("Failed to run playbooks")?;
    engine.shutdown().await;

    let collector = MetricsCollector::new();
    for record in &records {
        collector.record_execution(record).await;
    }
    let kpis = collector.calculate_kpis().await;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "event_id": event.id,
                "executions": records,
                "kpis": kpis,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => print_run(&event, &playbooks, &records, &kpis),
    }

    if records
        .iter()
        .any(|r| r.status == ExecutionStatus::Failed)
    {
        std::process::exit(1);
    }
    Ok(())
}

fn print_run(
    event: &Event,
    playbooks: &[PlaybookDefinition],
    records: &[ExecutionRecord],
    kpis: &ExecutionKpis,
) {
    println!(
        "{} {} ({})",
        "Event".bold(),
        event.event_type.cyan(),
        event.id
    );

    if records.is_empty() {
        println!("  {}", "No playbooks matched".yellow());
        return;
    }

    for record in records {
        let name = playbooks
            .iter()
            .find(|p| p.id == record.playbook_id)
            .map(|p| p.name.as_str())
            .unwrap_or("unknown");
        let status = match record.status {
            ExecutionStatus::Completed => record.status.as_str().green(),
            ExecutionStatus::Failed => record.status.as_str().red(),
            ExecutionStatus::Running => record.status.as_str().yellow(),
        };
        println!();
        println!("{} {} [{}]", "Playbook".bold(), name.cyan(), status);
        if let Some(reason) = &record.failure_reason {
            println!("  {} {}", "Reason:".red(), reason);
        }

        let steps = playbooks
            .iter()
            .find(|p| p.id == record.playbook_id)
            .map(|p| p.steps.as_slice())
            .unwrap_or_default();
        for step in steps {
            let Some(state) = record.step(&step.id) else {
                continue;
            };
            let marker = match state.status {
                StepStatus::Completed => "✓".green(),
                StepStatus::Failed => "✗".red(),
                StepStatus::Skipped => "-".dimmed(),
                StepStatus::Pending | StepStatus::Running => "·".dimmed(),
            };
            print!(
                "  {} {} ({}, {} attempt(s))",
                marker,
                step.id,
                state.status.as_str(),
                state.attempts
            );
            match &state.error {
                Some(error) => println!(": {}", error.red()),
                None => println!(),
            }
        }
    }

    println!();
    println!("{}", "Summary".bold());
    println!("  Executions: {}", kpis.total_executions);
    for (status, count) in &kpis.executions_by_status {
        println!("    {}: {}", status, count);
    }
    println!("  Retries: {}", kpis.retries);
    if let Some(mean) = kpis.mean_duration {
        println!("  Mean duration: {} ms", mean.num_milliseconds());
    }
}

fn cmd_actions(format: OutputFormat) -> Result<()> {
    let registry = builtin_registry();
    let infos: Vec<_> = registry
        .list()
        .into_iter()
        .filter_map(|name| registry.action_info(name))
        .collect();

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&infos)?),
        OutputFormat::Text => {
            println!("{}", "Built-in Actions".bold());
            println!("────────────────");
            for info in infos {
                println!("  {} - {}", info.name.cyan(), info.description);
                for param in info.parameters {
                    let required = if param.required { "required" } else { "optional" };
                    println!(
                        "      {} ({}, {}): {}",
                        param.name, param.param_type, required, param.description
                    );
                }
            }
        }
    }
    Ok(())
}

fn cmd_config(config: &AppConfig, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => {
            println!("{}", "Effective Configuration".bold());
            println!("───────────────────────");
            print!("{}", serde_yaml::to_string(config)?);
        }
    }
    Ok(())
}
