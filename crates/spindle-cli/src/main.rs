mod demo;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spindle_core::domain::{NewTask, Tenant};
use spindle_core::impls::StaticCredentials;
use spindle_core::ports::{Credentials, TaskStore};
use spindle_core::{OrchestratorBuilder, SpindleConfig, telemetry};

#[derive(Debug, Parser)]
#[command(name = "spindle", version, about = "Multi-tenant task queue runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run workers and the reaper against the configured store.
    Run {
        /// TOML config file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Submit this many demo tasks, then exit once all are settled.
        #[arg(long, default_value_t = 0)]
        demo_tasks: usize,
    },

    /// Print task counts per phase as JSON.
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, demo_tasks } => run(config.as_deref(), demo_tasks).await,
        Command::Status { config } => status(config.as_deref()).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<SpindleConfig> {
    let config = SpindleConfig::load(path).context("loading config")?;
    telemetry::init(config.logging.format).context("installing tracing subscriber")?;
    Ok(config)
}

/// Credentials come from the environment variable each tenant names in
/// `credentials_ref`; they are never written to the store.
fn credentials_from_env(tenants: &[Tenant]) -> StaticCredentials {
    let mut credentials = StaticCredentials::new();
    for tenant in tenants {
        let Some(var) = &tenant.credentials_ref else {
            continue;
        };
        match std::env::var(var) {
            Ok(secret) => credentials.insert(tenant.id.clone(), Credentials::new(secret)),
            Err(_) => tracing::warn!(tenant = %tenant.id, var = %var, "credentials variable not set"),
        }
    }
    credentials
}

async fn run(path: Option<&Path>, demo_tasks: usize) -> Result<()> {
    let config = load_config(path)?;
    let (store, ledger) = config.open_backends().context("opening store")?;

    let mut builder = OrchestratorBuilder::new()
        .backends(store, ledger)
        .config(&config)
        .credentials(credentials_from_env(&config.tenants))
        .pipeline(demo::pipeline()?);
    for (stage, handler) in demo::handlers() {
        builder = builder.handler(stage, handler)?;
    }
    let orch = builder.build()?;

    let mut tenants = config.tenants.clone();
    if tenants.is_empty() {
        tenants.push(Tenant::new("demo", "Demo tenant"));
    }
    for tenant in &tenants {
        orch.register_tenant(tenant).await?;
    }
    for n in 0..demo_tasks {
        let tenant = &tenants[n % tenants.len()];
        orch.submit(NewTask::new(tenant.id.clone()).with_payload(demo::task_payload(n)))
            .await?;
    }

    let workers = orch.spawn_workers(config.worker.count);
    let reaper = orch.spawn_reaper();
    tracing::info!(workers = workers.len(), demo_tasks, "spindle running");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for ctrl-c")?;
                tracing::info!("shutdown requested");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if demo_tasks == 0 {
                    continue;
                }
                match orch.counts().await {
                    Ok(counts) if counts.is_settled() => break,
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "counting tasks failed"),
                }
            }
        }
    }

    workers.shutdown_and_join().await;
    reaper.shutdown_and_join().await;

    let counts = orch.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}

async fn status(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    let (store, _ledger) = config.open_backends().context("opening store")?;
    let counts = store.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}
