//! # Replix Server
//!
//! Entry point for the replication job orchestrator.
//!
//! - `replix-server` / `replix-server serve`: HTTP API (and, in dev mode
//!   without Redis, an in-process queue consumer)
//! - `replix-server consume`: provisioning queue consumer
//! - `replix-server db migrate`: apply database migrations
//! - `replix-server vault keygen`: print a fresh credential vault key

use std::{net::SocketAddr, path::PathBuf};

use anyhow::{Context, bail};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replix_config::{Config, ConfigLoad, ConfigLoader, ConfigLoaderOptions};
use replix_core::credentials::AesGcmVault;
use replix_server::{
    create_router,
    infra::startup::{self, QueueBackend},
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "replix-server")]
#[command(about = "Replication job orchestrator: submission API, worker provisioning and queue consumer")]
struct Cli {
    /// Path to a replix.toml configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve(ServeArgs),
    /// Drain the provisioning queue until interrupted
    Consume,
    #[command(subcommand)]
    Db(DbCommand),
    #[command(subcommand)]
    Vault(VaultCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[derive(Debug, Subcommand)]
enum VaultCommand {
    /// Print a new base64 AES-256 key suitable for VAULT_KEY
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let options = ConfigLoaderOptions {
        config_path: cli.config.clone(),
        env_file: cli.env_file.clone(),
    };

    match cli.command {
        Some(Command::Vault(VaultCommand::Keygen)) => {
            println!("{}", AesGcmVault::generate_key());
            Ok(())
        }
        Some(Command::Db(DbCommand::Migrate)) => run_db_migrate(options).await,
        Some(Command::Consume) => run_consumer(options).await,
        Some(Command::Serve(args)) => run_server(options, args).await,
        None => run_server(options, cli.serve).await,
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_runtime_config(options: ConfigLoaderOptions) -> anyhow::Result<Config> {
    let ConfigLoad { config, warnings } = ConfigLoader::with_options(options)
        .load()
        .context("failed to load configuration")?;

    init_tracing();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
        trigger.cancel();
    });
    token
}

async fn run_db_migrate(options: ConfigLoaderOptions) -> anyhow::Result<()> {
    let config = load_runtime_config(options)?;
    let Some(url) = &config.database.url else {
        bail!("DATABASE_URL must be set to run migrations");
    };
    let pool = startup::connect_pool(url, 1).await?;
    startup::run_migrations(&pool).await
}

async fn run_consumer(options: ConfigLoaderOptions) -> anyhow::Result<()> {
    let config = load_runtime_config(options)?;
    let runtime = startup::wire(&config).await?;

    let (Some(QueueBackend::Redis(queue)), Some(consumer)) = (&runtime.queue, runtime.consumer)
    else {
        bail!(
            "the queue consumer needs REDIS_URL; in dev mode without Redis the server runs it in-process"
        );
    };

    let recovered = queue
        .recover_in_flight()
        .await
        .context("failed to recover in-flight provisioning messages")?;
    if recovered > 0 {
        warn!(recovered, "requeued messages left in flight by a previous consumer");
    }

    consumer.run(shutdown_token()).await;
    Ok(())
}

async fn run_server(options: ConfigLoaderOptions, args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_runtime_config(options)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let runtime = startup::wire(&config).await?;
    let shutdown = shutdown_token();

    let consumer_task = match (&runtime.queue, &runtime.consumer) {
        (Some(QueueBackend::InProcess(_)), Some(consumer)) => {
            info!("running the provisioning queue consumer in-process");
            let consumer = consumer.clone();
            let token = shutdown.clone();
            Some(tokio::spawn(async move { consumer.run(token).await }))
        }
        _ => None,
    };

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind_address()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "replix server listening");

    axum::serve(listener, create_router(runtime.state))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if let Some(task) = consumer_task
        && let Err(e) = task.await
    {
        error!(error = %e, "queue consumer task failed");
    }

    info!("replix server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_serves_with_overrides() {
        let cli = Cli::try_parse_from(["replix-server", "--port", "9090"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.port, Some(9090));
    }

    #[test]
    fn parses_operator_subcommands() {
        let cli = Cli::try_parse_from(["replix-server", "vault", "keygen"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Vault(VaultCommand::Keygen))));

        let cli =
            Cli::try_parse_from(["replix-server", "--config", "replix.toml", "db", "migrate"])
                .unwrap();
        assert!(matches!(cli.command, Some(Command::Db(DbCommand::Migrate))));
        assert_eq!(cli.config, Some(PathBuf::from("replix.toml")));
    }
}
