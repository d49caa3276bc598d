//! BioID - WebAuthn biometric enrollment server

use bioid::{AppContext, BioIdConfig};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API (default)
    Serve {
        /// Port to listen on, overriding configuration
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Generate example configuration
    Init {
        /// Output path for configuration
        #[arg(short, long, default_value = "bioid.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("bioid=debug,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => serve(port).await?,
        Commands::Init { output } => generate_config(output).await?,
    }

    Ok(())
}

async fn serve(port: Option<u16>) -> anyhow::Result<()> {
    let mut config = BioIdConfig::from_env()?;
    if let Some(port) = port {
        config.port = port;
    }

    info!("Configuration loaded for: {}", config.app_name);
    info!(
        rp_id = %config.webauthn.rp_id,
        rp_origin = %config.webauthn.rp_origin,
        "Relying party configured"
    );

    let context = AppContext::new(config.clone()).await?;
    info!("Database initialized");

    spawn_purge_task(context.clone(), config.cleanup_interval());

    let app = bioid::web::create_router(context);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("BioID running at http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("BioID stopped");
    Ok(())
}

fn spawn_purge_task(context: AppContext, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(std::time::Duration::from_secs(1)));
        loop {
            interval.tick().await;
            match context.purge_expired().await {
                Ok((challenges, sessions)) => {
                    debug!(challenges, sessions, "Purged expired state");
                }
                Err(e) => error!("Challenge purge failed: {}", e),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
}

async fn generate_config(output: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("Configuration file already exists: {:?}", output);
    }

    let example_config = include_str!("../bioid.example.toml");
    tokio::fs::write(&output, example_config).await?;

    info!("Generated configuration file: {:?}", output);
    info!("Set webauthn.rp_id and webauthn.rp_origin to your public domain, then run:");
    info!("  bioid serve");

    Ok(())
}
