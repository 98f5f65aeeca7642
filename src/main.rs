//! dockwatch - Main entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dockwatch::{
    ServiceRegistry,
    cli::{
        Cli, Command, run_exec_command, run_logs_command, run_services_command,
        run_setup_status_command, run_status_command, run_watch_command,
    },
    config::Config,
    container::{ContainerRuntime, DockerRuntime},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load .env if present
    let _ = dotenvy::dotenv();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dockwatch=info"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    // Setup progress only reads the bring-up log.
    if let Command::SetupStatus { history } = &cli.command {
        return run_setup_status_command(&config, *history, cancel).await;
    }

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);
    let registry = Arc::new(ServiceRegistry::from_config(
        &config,
        runtime,
        cancel.child_token(),
    )?);
    tracing::debug!(services = registry.len(), network = %config.network, "Registry ready");

    let mut exit_code = 0;
    let result = match cli.command {
        Command::Services { json } => run_services_command(&registry, json),
        Command::Status { service, json } => {
            run_status_command(&registry, service.as_deref(), json).await
        }
        Command::Logs {
            service,
            since,
            tail,
            follow,
        } => run_logs_command(&registry, &service, &since, &tail, follow, cancel.clone()).await,
        Command::Exec { service, cmd } => match run_exec_command(&registry, &service, &cmd).await {
            Ok(code) => {
                exit_code = code;
                Ok(())
            }
            Err(e) => Err(e),
        },
        Command::Watch { interval } => {
            run_watch_command(
                registry.clone(),
                Duration::from_secs(interval.max(1)),
                cancel.clone(),
            )
            .await
        }
        Command::SetupStatus { .. } => Ok(()),
    };

    registry.close().await;
    result?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
