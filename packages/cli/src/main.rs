// ABOUTME: devboxd entry point: runs the sandbox service or one-off maintenance passes
// ABOUTME: Configuration comes from DEVBOX_* environment variables, optionally via a .env file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use devbox_sandbox::network::{derive_subnet, network_name};
use devbox_sandbox::{open_database, SandboxService, SandboxStatus, SandboxStorage, ServiceConfig};

#[derive(Parser)]
#[command(name = "devboxd")]
#[command(about = "Devbox sandbox service")]
#[command(version)]
struct Cli {
    /// Overrides DEVBOX_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the service until interrupted (default)
    Serve,
    /// Run one log retention pass and one session idle sweep, then exit
    Cleanup,
    /// List sandboxes
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Print the network a sandbox id maps to
    Subnet { sandbox_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("Invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = ServiceConfig::from_env().context("Invalid DEVBOX_* configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Cleanup => cleanup(config).await,
        Commands::List { project, status } => list(config, project, status).await,
        Commands::Subnet { sandbox_id } => {
            let subnet = derive_subnet(&sandbox_id);
            println!("network: {}", network_name(&sandbox_id));
            println!("subnet:  {}", subnet.cidr());
            println!("gateway: {}", subnet.gateway());
            Ok(())
        }
    }
}

async fn serve(config: ServiceConfig) -> Result<()> {
    info!("devboxd v{} starting", env!("CARGO_PKG_VERSION"));

    let service = SandboxService::connect(config)
        .await
        .context("Failed to start sandbox service")?;
    service.start_background_tasks().await;
    info!(
        "Sandbox service running, press Ctrl+C to stop. No client transport is bound; \
         embedders attach clients through Gateway::connect"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    service.shutdown().await;
    Ok(())
}

async fn cleanup(config: ServiceConfig) -> Result<()> {
    let service = SandboxService::connect(config).await?;

    let retention = service.retention().run_cleanup().await?;
    println!(
        "logs: {} expired, {} over budget, {} bytes freed",
        retention.expired_deleted, retention.over_budget_deleted, retention.bytes_freed
    );

    let sweep = service.sessions().run_idle_sweep().await?;
    println!(
        "sessions: {} marked idle, {} expired",
        sweep.marked_idle,
        sweep.expired.len()
    );

    service.shutdown().await;
    Ok(())
}

async fn list(config: ServiceConfig, project: Option<String>, status: Option<String>) -> Result<()> {
    let status = status
        .map(|s| SandboxStatus::from_str(&s))
        .transpose()
        .context("Unknown sandbox status")?;

    let storage = SandboxStorage::new(open_database(&config.database_url).await?);
    let sandboxes = storage.list_sandboxes(project.as_deref(), status).await?;

    if sandboxes.is_empty() {
        println!("No sandboxes");
        return Ok(());
    }
    for sandbox in sandboxes {
        println!(
            "{:<40} {:<10} {:<24} {}",
            sandbox.id,
            sandbox.status.as_str(),
            sandbox.image,
            sandbox.error_message.unwrap_or_default()
        );
    }
    Ok(())
}
