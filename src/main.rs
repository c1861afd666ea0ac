use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use shellgate::config::Config;
use shellgate::gate::{create_authorizer_from_config, ConnectionGate};
use shellgate::process::NativePtySpawner;
use shellgate::server;

#[derive(Parser)]
#[command(name = "shellgate")]
#[command(about = "Interactive PTY-backed shell sessions over WebSocket", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration file and PORT
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(max_sessions) = cli.max_sessions {
        config.limits.max_sessions = max_sessions;
    }
    config.validate().context("invalid configuration")?;

    let authorizer = create_authorizer_from_config(&config.auth);
    let gate = Arc::new(ConnectionGate::new(
        &config,
        authorizer,
        Arc::new(NativePtySpawner::new()),
    ));

    let listener = tokio::net::TcpListener::bind(config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    log::info!(
        "shellgate listening on ws://{}{}",
        listener.local_addr()?,
        config.server.ws_path
    );

    server::serve_with_shutdown(listener, gate, &config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await
    .context("server error")?;

    log::info!("shellgate stopped");
    Ok(())
}
