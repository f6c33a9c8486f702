//! crucible server - multi-provider sandbox orchestration.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crucible::api::{build_app, AppState};
use crucible::config::Settings;
use crucible::provider::DriverRegistry;
use crucible::run::Orchestrator;
use crucible::store::InMemoryStore;

#[derive(Parser)]
#[command(name = "crucible")]
#[command(about = "Multi-provider sandbox orchestration server", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1:8400", env = "CRUCIBLE_BIND")]
        bind: String,
    },

    /// List the providers configured in this environment
    Providers,

    /// Verify provider credentials with a cheap list call
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { bind } => serve(&bind).await,
        Commands::Providers => providers(),
        Commands::Check => check().await,
    }
}

async fn serve(bind: &str) -> Result<()> {
    let settings = Settings::from_env();
    let registry = Arc::new(DriverRegistry::from_settings(&settings));
    if registry.is_empty() {
        anyhow::bail!(
            "no providers configured; set provider credentials (e.g. E2B_API_KEY) \
             or make a Docker daemon reachable"
        );
    }

    let orchestrator = Arc::new(Orchestrator::new(registry.clone()));
    let store = Arc::new(InMemoryStore::new());
    let app = build_app(AppState::new(registry, orchestrator, store));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(%bind, "crucible server listening");
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}

fn providers() -> Result<()> {
    let settings = Settings::from_env();
    let configured = settings.configured_providers();
    if configured.is_empty() {
        println!("no providers configured");
        return Ok(());
    }
    for provider in configured {
        println!("{provider}");
    }
    Ok(())
}

async fn check() -> Result<()> {
    let settings = Settings::from_env();
    let registry = DriverRegistry::from_settings(&settings);
    if registry.is_empty() {
        anyhow::bail!("no providers configured");
    }

    let mut failures = 0usize;
    for provider in registry.providers() {
        let Ok(driver) = registry.get(provider) else {
            continue;
        };
        match driver.lifecycle().list().await {
            Ok(sandboxes) => {
                println!("{provider}: ok ({} sandboxes visible)", sandboxes.len());
            }
            Err(e) => {
                failures += 1;
                println!("{provider}: FAILED ({}: {})", e.kind, e.message);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} provider(s) failed the credential check");
    }
    Ok(())
}
