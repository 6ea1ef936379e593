use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use atlas_core::{AuditBackend, Fixtures, GovernanceConfig, GovernanceKernel, ToolRequest};
use atlas_receipts::{jsonl::read_log, verify_log, AuditFilter, AuditRecorder, PageRequest, StatsWindow};
use atlas_redactor::Sanitizer;

#[derive(Parser)]
#[command(name = "atlas", about = "Governed tool invocation")]
struct Cli {
    /// YAML config; falls back to $ATLAS_CONFIG, then built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authorization decision only; nothing runs and nothing is audited.
    Check {
        #[arg(long)]
        fixtures: Option<PathBuf>,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        tool: String,
    },
    /// Full governed execution of one tool call.
    Run {
        #[arg(long)]
        fixtures: Option<PathBuf>,
        #[arg(long)]
        actor: String,
        #[arg(long)]
        tool: String,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        request_id: Option<String>,
    },
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Last lines of a JSONL audit log.
    Tail {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    /// Checks the hash chain of a JSONL audit log.
    Verify {
        #[arg(long)]
        path: Option<PathBuf>,
    },
    Show {
        request_id: String,
    },
    Actor {
        actor_id: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        tool: Option<String>,
        /// Only successful (`true`) or failed (`false`) attempts.
        #[arg(long)]
        success: Option<bool>,
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
    Stats {
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => GovernanceConfig::from_path(path)?,
        None => GovernanceConfig::from_env()?,
    };

    match cli.command {
        Command::Check {
            fixtures,
            actor,
            tool,
        } => {
            let kernel = kernel(&config, fixtures.as_deref())?;
            let decision = kernel.resolver().check_tool_permission(&actor, &tool).await;
            print_json(&decision)?;
        }
        Command::Run {
            fixtures,
            actor,
            tool,
            params,
            session,
            request_id,
        } => {
            let params = serde_json::from_str(&params).context("--params must be JSON")?;
            let kernel = kernel(&config, fixtures.as_deref())?;
            let outcome = kernel
                .execute(ToolRequest {
                    actor_id: actor,
                    tool_id: tool,
                    params,
                    session_id: session,
                    request_id,
                })
                .await;
            print_json(&outcome)?;
        }
        Command::Audit { action } => audit(&config, action).await?,
    }

    Ok(())
}

async fn audit(config: &GovernanceConfig, action: AuditCommand) -> anyhow::Result<()> {
    match action {
        AuditCommand::Tail { path, lines } => {
            let path = log_path(config, path)?;
            let chain = read_log(&path)?;
            let start = chain.len().saturating_sub(lines);
            for entry in &chain[start..] {
                println!("{}", serde_json::to_string(&entry.record)?);
            }
        }
        AuditCommand::Verify { path } => {
            let path = log_path(config, path)?;
            let n = verify_log(&path)?;
            println!("audit log ok ({n} records)");
        }
        AuditCommand::Show { request_id } => {
            let recorder = recorder(config)?;
            match recorder.get_by_request_id(&request_id).await? {
                Some(record) => print_json(&record)?,
                None => bail!("no audit record for request '{request_id}'"),
            }
        }
        AuditCommand::Actor {
            actor_id,
            page,
            limit,
            tool,
            success,
            since,
            until,
        } => {
            let filter = AuditFilter {
                tool_id: tool,
                success,
                start: since,
                end: until,
            };
            let page = recorder(config)?
                .get_by_actor(&actor_id, &filter, PageRequest::new(page, limit))
                .await?;
            print_json(&page)?;
        }
        AuditCommand::Stats { since, until } => {
            let window = StatsWindow {
                start: since,
                end: until,
            };
            print_json(&recorder(config)?.get_stats(&window).await?)?;
        }
    }
    Ok(())
}

fn kernel(config: &GovernanceConfig, fixtures: Option<&Path>) -> anyhow::Result<GovernanceKernel> {
    let fixtures = match fixtures {
        Some(path) => Fixtures::from_path(path)?,
        None => Fixtures::default(),
    };
    Ok(GovernanceKernel::from_config(config, fixtures.into_collaborators(config)?))
}

fn recorder(config: &GovernanceConfig) -> anyhow::Result<AuditRecorder> {
    if config.audit.backend == AuditBackend::Memory {
        tracing::warn!("audit backend is in-memory; nothing from earlier runs is visible");
    }
    Ok(AuditRecorder::new(
        config.audit.open_store()?,
        Sanitizer::new(&config.sanitizer),
    ))
}

fn log_path(config: &GovernanceConfig, explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    match (&config.audit.backend, &config.audit.path) {
        (AuditBackend::Jsonl, Some(path)) => Ok(path.clone()),
        _ => bail!("no JSONL audit log configured; pass --path"),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}
