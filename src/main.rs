// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Archon entry point - serve the control plane or check configuration.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use archon::assistant::ProcessAssistantClient;
use archon::config::Settings;
use archon::lock::CancelToken;
use archon::orchestrator::Orchestrator;
use archon::store::Store;
use archon::telemetry::{init_telemetry, TelemetryConfig};
use archon::workflow::WorkflowRegistry;

/// Archon - remote control plane for AI coding assistants.
#[derive(Parser)]
#[command(name = "archon")]
#[command(author, version, about = "Remote control plane for AI coding assistants", long_about = None)]
struct Cli {
    /// Archon home directory (state, workspaces)
    #[arg(long, env = "ARCHON_HOME")]
    home: Option<PathBuf>,

    /// Show debug output
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane until interrupted
    Serve,

    /// Validate settings and the workflows of a cloned repository
    Check {
        /// Repository path to validate (defaults to every clone)
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Run one cleanup cycle and exit
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = if cli.debug {
        TelemetryConfig::development()
    } else {
        TelemetryConfig::default()
    };
    let _guard = init_telemetry(&telemetry)?;

    let mut settings = Settings::from_env();
    if let Some(home) = cli.home {
        settings.home = home;
    }

    match cli.command {
        Commands::Serve => serve(settings).await,
        Commands::Check { repo } => check(settings, repo),
        Commands::Cleanup => cleanup_once(settings).await,
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&settings.database_path())?);
    let assistant = Arc::new(ProcessAssistantClient::new());
    let orchestrator = Arc::new(Orchestrator::new(settings.clone(), store, assistant));

    tracing::info!(
        "archon {} serving from {} (max {} conversations)",
        archon::VERSION,
        settings.home.display(),
        settings.max_concurrent_conversations
    );

    // Platform adapters register against the orchestrator out of process
    // scope; the periodic cleanup runs regardless.
    let cancel = CancelToken::never();
    let cleanup = Arc::clone(orchestrator.cleanup_scheduler()).spawn_periodic(cancel);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    orchestrator.shutdown().await;
    cleanup.abort();

    Ok(())
}

fn check(settings: Settings, repo: Option<PathBuf>) -> anyhow::Result<()> {
    let repos: Vec<PathBuf> = match repo {
        Some(repo) => vec![repo],
        None => {
            let root = settings.workspace_root();
            let mut found = Vec::new();
            if let Ok(owners) = std::fs::read_dir(&root) {
                for owner in owners.flatten() {
                    if let Ok(children) = std::fs::read_dir(owner.path()) {
                        for child in children.flatten() {
                            if child.path().is_dir() {
                                found.push(child.path());
                            }
                        }
                    }
                }
            }
            found
        }
    };

    let mut rejected_total = 0;
    for repo in &repos {
        let registry = WorkflowRegistry::new();
        let report = registry.reload_from_clone(repo);
        println!(
            "{}: {} workflow(s) ok, {} rejected",
            repo.display(),
            report.loaded.len(),
            report.rejected.len()
        );
        for (file, reason) in &report.rejected {
            println!("  {}: {}", file, reason);
            rejected_total += 1;
        }
    }

    if rejected_total > 0 {
        anyhow::bail!("{} workflow file(s) failed validation", rejected_total);
    }
    println!(
        "ok ({} repositories, home {})",
        repos.len(),
        settings.home.display()
    );
    Ok(())
}

async fn cleanup_once(settings: Settings) -> anyhow::Result<()> {
    let store = Arc::new(Store::open(&settings.database_path())?);
    let assistant = Arc::new(ProcessAssistantClient::new());
    let orchestrator = Arc::new(Orchestrator::new(settings, store, assistant));

    let report = orchestrator.cleanup_scheduler().run_cycle().await;
    println!("{}", report.summary());
    Ok(())
}
