//! `taskforge` command-line front end.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskforge_core::Priority;
use taskforge_orchestrator::{
    Failure, Orchestrator, SubmitRequest, TaskStatus, TaskforgeConfig, WorkerRegistry,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskforge", version, about = "Multi-agent task orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskforge.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered worker kinds
    Kinds,
    /// Submit one task and wait for its result
    Run {
        /// Worker kind to run on
        #[arg(short, long)]
        kind: String,
        /// JSON object handed to the worker
        #[arg(short, long, default_value = "{}")]
        payload: String,
        /// critical, high, medium, low or deferred
        #[arg(long, default_value = "medium")]
        priority: String,
        /// How long to wait for a terminal state
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
    /// Run the swarm workflow over a JSON array of failures
    Swarm {
        /// File holding the failure batch
        #[arg(long)]
        batch: PathBuf,
        /// Write the full workflow report here
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// The config file when it exists, defaults otherwise.
fn load_config(path: &Path) -> anyhow::Result<TaskforgeConfig> {
    if path.exists() {
        let config = TaskforgeConfig::load(path)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(TaskforgeConfig::default())
    }
}

fn parse_payload(raw: &str) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(raw).context("payload must be valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map.into_iter().collect()),
        other => anyhow::bail!("payload must be a JSON object, got {other}"),
    }
}

async fn build_orchestrator(config: TaskforgeConfig) -> anyhow::Result<Orchestrator> {
    let registry = Arc::new(WorkerRegistry::new());
    taskforge_builtins::register_builtins(&registry)?;
    Ok(Orchestrator::builder(config, registry).build().await?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.json);
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Kinds => {
            let orchestrator = build_orchestrator(config).await?;
            let kinds = orchestrator.registry().descriptors();
            println!("Registered worker kinds:");
            for d in &kinds {
                let caps: Vec<String> = d.capabilities.iter().map(ToString::to_string).collect();
                println!("  {}: {}", d.kind, d.description);
                println!(
                    "    category: {:?}, instances: {}..={}, capabilities: [{}]",
                    d.category,
                    d.min_instances,
                    d.max_instances,
                    caps.join(", ")
                );
            }
            println!("\nTotal: {} kind(s)", kinds.len());
        }
        Commands::Run {
            kind,
            payload,
            priority,
            wait_secs,
        } => {
            let priority: Priority = priority.parse()?;
            let request = SubmitRequest::new(kind)
                .with_payload(parse_payload(&payload)?)
                .with_priority(priority);

            let orchestrator = build_orchestrator(config).await?;
            orchestrator.start()?;
            let id = orchestrator.submit(request)?;
            let outcome = orchestrator
                .wait_for(&id, Duration::from_secs(wait_secs))
                .await;
            orchestrator.shutdown().await;

            let report = outcome?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.state != TaskStatus::Completed {
                anyhow::bail!("task {id} ended {}: {}", report.state, report.reason);
            }
        }
        Commands::Swarm { batch, report } => {
            let raw = tokio::fs::read_to_string(&batch)
                .await
                .with_context(|| format!("Failed to read batch file '{}'", batch.display()))?;
            let failures: Vec<Failure> =
                serde_json::from_str(&raw).context("batch must be a JSON array of failures")?;

            let orchestrator = build_orchestrator(config).await?;
            let context = HashMap::from([(
                "batch".to_string(),
                serde_json::Value::String(batch.display().to_string()),
            )]);
            let summary = orchestrator.run_swarm_workflow(failures, context).await?;

            if let Some(path) = report {
                tokio::fs::write(&path, serde_json::to_vec_pretty(&summary)?)
                    .await
                    .with_context(|| format!("Failed to write report '{}'", path.display()))?;
                info!(path = %path.display(), "Workflow report written");
            }
            println!(
                "Run {}: {} failure(s), {} group(s), success rate {:.0}%",
                summary.run_id,
                summary.total_failures,
                summary.groups,
                summary.success_rate * 100.0
            );
            for line in &summary.recommendations {
                println!("  - {line}");
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, TaskforgeConfig::default());
    }

    #[test]
    fn test_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskforge.toml");
        std::fs::write(&path, "[scheduler]\nqueue_capacity = 42\n").unwrap();
        assert_eq!(load_config(&path).unwrap().scheduler.queue_capacity, 42);
    }

    #[test]
    fn test_payload_must_be_object() {
        assert_eq!(parse_payload(r#"{"a": 1}"#).unwrap()["a"], 1);
        assert!(parse_payload("[1, 2]").is_err());
        assert!(parse_payload("not json").is_err());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "taskforge", "--json", "run", "--kind", "echo", "--payload", "{}", "--priority", "high",
        ])
        .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Run { ref kind, .. } if kind == "echo"));
    }
}
