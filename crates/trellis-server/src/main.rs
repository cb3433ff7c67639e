use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trellis_core::executor::ExecutorRegistry;
use trellis_db::{MemoryRepository, PgRepository, Repository, RepositoryConfig, pool};

use trellis_server::builtins::{EchoExecutor, SleepExecutor};
use trellis_server::config::{FileConfig, ServerConfig};
use trellis_server::state::AppState;
use trellis_server::build_router;

#[derive(Parser)]
#[command(name = "trellis", about = "Task-tree orchestration engine")]
struct Cli {
    /// Repository URL (overrides TRELLIS_REPOSITORY_URL and the config
    /// file); `memory:` or a PostgreSQL URL
    #[arg(long, global = true)]
    repository_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the RPC server
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
        /// Listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create the PostgreSQL database and apply migrations
    DbInit,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let file = FileConfig::load().context("failed to load config file")?;

    match cli.command {
        Commands::Serve { bind, port } => {
            let config = ServerConfig::resolve(file, bind, port, cli.repository_url);
            serve(config).await
        }
        Commands::DbInit => {
            let config = ServerConfig::resolve(file, None, None, cli.repository_url);
            db_init(&config.repository).await
        }
    }
}

async fn serve(config: ServerConfig) -> Result<()> {
    let repo = build_repository(&config.repository).await?;

    let mut registry = ExecutorRegistry::new();
    registry.register(EchoExecutor);
    registry.register(SleepExecutor);

    let state = AppState::new(repo, registry, config.clone());
    let scheduler = state.scheduler.clone();

    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("invalid bind address")?;
    tracing::info!("trellis listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain running tasks and end every live stream before exit.
    scheduler.shutdown(Duration::from_secs(10)).await;
    tracing::info!("trellis shut down");
    Ok(())
}

async fn db_init(config: &RepositoryConfig) -> Result<()> {
    if config.is_memory() {
        anyhow::bail!("db-init needs a PostgreSQL repository URL");
    }
    pool::ensure_database_exists(config).await?;
    let pg = pool::create_pool(config).await?;
    pool::run_migrations(&pg).await?;
    tracing::info!("database initialised");
    Ok(())
}

async fn build_repository(config: &RepositoryConfig) -> Result<Arc<dyn Repository>> {
    if config.is_memory() {
        tracing::info!("using in-memory repository");
        Ok(Arc::new(MemoryRepository::new()))
    } else {
        let pg = pool::create_pool(config).await?;
        pool::run_migrations(&pg).await?;
        tracing::info!(url = %config.repository_url, "using PostgreSQL repository");
        Ok(Arc::new(PgRepository::new(pg)))
    }
}

async fn shutdown_signal() {
    // Ctrl+C is the only shutdown trigger; failure to install the handler
    // would leave no way to stop cleanly.
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
    }
}
