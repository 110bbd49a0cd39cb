//! strata: operator CLI over a memory database.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use strata::ai::AiConfig;
use strata::config::EngineConfig;
use strata::db::MemoryDB;
use strata::recall::RetrievalRequest;
use strata::{Engine, MemoryError, SharedDB};

#[derive(Parser)]
#[command(name = "strata", version, about = "Tiered memory engine for multi-tenant AI agents")]
struct Args {
    /// SQLite database path
    #[arg(short, long, default_value = "strata.db", env = "STRATA_DB")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rank memories for a query and print the result
    Retrieve {
        query: String,
        #[arg(long)]
        team: String,
        #[arg(long)]
        agent: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        #[arg(long, default_value = "2000")]
        budget: usize,
    },
    /// Re-evaluate tiers for a scope
    Sweep {
        #[arg(long)]
        team: String,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Consolidate one scope, or every scope when --team is omitted
    Consolidate {
        #[arg(long)]
        team: Option<String>,
        #[arg(long, requires = "team")]
        agent: Option<String>,
    },
    /// Print the audit history of a memory
    History { id: String },
    /// Print a memory as it was at a timestamp (unix ms)
    Reconstruct { id: String, timestamp: i64 },
    /// Row counts for a team
    Stats {
        #[arg(long)]
        team: String,
    },
    /// Run background consolidation until interrupted
    Run,
}

fn print_json<T: Serialize>(v: &T) -> Result<(), MemoryError> {
    let s = serde_json::to_string_pretty(v).map_err(|e| MemoryError::Internal(e.to_string()))?;
    println!("{s}");
    Ok(())
}

async fn run(args: Args) -> Result<(), MemoryError> {
    let shared: SharedDB = Arc::new(MemoryDB::open(&args.db)?);
    let config = EngineConfig::from_env();
    let mut builder = Engine::builder(shared).config(config);
    let ai_status = match AiConfig::from_env() {
        Some(cfg) => {
            let mut parts = vec![];
            if cfg.has_llm() {
                parts.push(format!("llm={}", cfg.llm_model));
            }
            if cfg.has_embed() {
                parts.push(format!("embed={}", cfg.embed_model));
            }
            builder = builder.ai(cfg);
            parts.join(", ")
        }
        None => "disabled".into(),
    };
    let engine = builder.build()?;
    info!(version = env!("CARGO_PKG_VERSION"), db = %args.db, ai = %ai_status, "strata starting");

    match args.command {
        Command::Retrieve { query, team, agent, user, conversation, budget } => {
            let mut req = RetrievalRequest::new(query, team, agent, budget);
            req.user_id = user;
            req.conversation_id = conversation;
            let result = engine.retrieve(&req).await?;
            engine.flush_access().await;
            print_json(&result)
        }
        Command::Sweep { team, agent } => print_json(&engine.run_tier_sweep(&team, agent.as_deref()).await?),
        Command::Consolidate { team: Some(team), agent } => {
            print_json(&engine.consolidate(&team, agent.as_deref()).await?)
        }
        Command::Consolidate { team: None, .. } => {
            let reports = engine.consolidate_all().await?;
            info!(scopes = reports.len(), "all scopes consolidated");
            print_json(&reports)
        }
        Command::History { id } => print_json(&engine.history(&id).await?),
        Command::Reconstruct { id, timestamp } => print_json(&engine.reconstruct_at(&id, timestamp).await?),
        Command::Stats { team } => print_json(&engine.stats(&team).await?),
        Command::Run => {
            let Some(handle) = engine.spawn_consolidation() else {
                return Err(MemoryError::Validation("STRATA_CONSOLIDATE_MINS is 0, nothing to run".into()));
            };
            shutdown_signal().await;
            handle.abort();
            engine.flush_access().await;
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "strata failed");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutting down");
}
