use clap::Parser;
use sqlipc::{serve, PermitConfig, PermittedDatabase, ServerConfig, SqlServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sqlipc")]
#[command(about = "sqlipc - remote SQL database server", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// First message code, decimal or 0x hex
    #[arg(long, value_parser = sqlipc::config::parse_chunk)]
    chunk: Option<u32>,

    /// Databases to permit (e.g., --permit sqlite:/srv/*.db:reader)
    #[arg(long = "permit")]
    permits: Vec<PermitConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqlipc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::from_env(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(chunk) = args.chunk {
        config.chunk = chunk;
    }

    let server = SqlServer::from_config(&config)?;
    for permit in &args.permits {
        server.add_database(PermittedDatabase::from_config(permit)?);
    }
    if config.permits.is_empty() && args.permits.is_empty() {
        tracing::warn!("No databases are permitted, every Open will be refused");
    }
    let server = Arc::new(server);

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(
        "Server listening on {} (chunk {:#x}, drivers: {})",
        config.listen,
        config.chunk,
        server.registry().names().join(", ")
    );

    tokio::select! {
        result = serve(server.clone(), listener) => result?,
        _ = shutdown_signal() => {}
    }

    tracing::info!(
        "Shutdown complete, {} handles were still live",
        server.handle_count()
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
