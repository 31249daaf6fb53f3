//! finopsd — the rightsizing pipeline daemon.
//!
//! One binary that runs every stage against a shared store:
//! - Recommender (usage → created events)
//! - Policy listener (created → approved / violated)
//! - Apply coordinator (approved → branch, commit, pull request)
//! - Sync reconciler (approved / PR created → applied / failed)
//! - Replica scheduler (fixed-time replica changes → created events)
//! - Prometheus `/metrics` endpoint
//!
//! # Usage
//!
//! ```text
//! finopsd run --config /etc/finops/finops.toml
//! finopsd policies list --config /etc/finops/finops.toml
//! finopsd recommendations list --namespace dev --status APPROVED
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use finops_core::{FinopsConfig, RecommendationStatus};
use finops_state::StateStore;
use finopsd::pipeline::{Pipeline, Stages};
use tracing::info;

#[derive(Parser)]
#[command(name = "finopsd", about = "Kubernetes rightsizing pipeline")]
struct Cli {
    /// Configuration file; built-in defaults when absent.
    #[arg(long, global = true, default_value = "/etc/finops/finops.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every stage until Ctrl-C.
    Run,

    /// Inspect or seed policies.
    Policies {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Inspect stored recommendations.
    Recommendations {
        #[command(subcommand)]
        action: RecommendationAction,
    },

    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
enum PolicyAction {
    /// List stored policies.
    List,
    /// Install the default policies into an empty store.
    Seed,
}

#[derive(Subcommand)]
enum RecommendationAction {
    /// List recommendations as JSON lines.
    List {
        #[arg(long)]
        namespace: Option<String>,

        /// Repeatable; e.g. `--status APPROVED --status APPLIED`.
        #[arg(long)]
        status: Vec<RecommendationStatus>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,finopsd=debug,finops=debug")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Run => run(config).await,
        Command::Policies { action } => {
            let store = open_store(&config)?;
            match action {
                PolicyAction::List => {
                    for policy in store.list_policies()? {
                        println!("{}", serde_json::to_string(&policy)?);
                    }
                }
                PolicyAction::Seed => {
                    let seeded = store.seed_default_policies()?;
                    info!(seeded, "default policies seeded");
                }
            }
            Ok(())
        }
        Command::Recommendations {
            action: RecommendationAction::List { namespace, status },
        } => {
            let store = open_store(&config)?;
            let recommendations = store.list_recommendations()?.into_iter().filter(|rec| {
                namespace.as_deref().is_none_or(|ns| rec.namespace == ns)
                    && (status.is_empty() || status.contains(&rec.status))
            });
            for rec in recommendations {
                println!("{}", serde_json::to_string(&rec)?);
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<FinopsConfig> {
    if path.exists() {
        FinopsConfig::from_file(path).with_context(|| format!("reading {}", path.display()))
    } else {
        info!(path = %path.display(), "config file not found, using defaults");
        Ok(FinopsConfig::default())
    }
}

fn open_store(config: &FinopsConfig) -> anyhow::Result<StateStore> {
    StateStore::open(&config.store.path)
        .with_context(|| format!("opening store at {}", config.store.path.display()))
}

async fn run(config: FinopsConfig) -> anyhow::Result<()> {
    info!("finops daemon starting");

    let stages = Stages::from_config(&config)?;
    let pipeline = Pipeline::start(stages).await?;

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    pipeline.shutdown().await;
    info!("finops daemon stopped");
    Ok(())
}
