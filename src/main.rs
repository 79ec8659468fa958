#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunnelgate
//!
//! Token-authenticated WebSocket to TCP tunnel gateway.
//!
//! A caller asks for a tunnel to a target host; tunnelgate starts a reverse
//! tunnel on that host through a remote-execution command, which forwards to
//! a free port on this machine, and hands back a credential. A browser client
//! (noVNC and friends) then opens `ws://<gateway>/websockify?token=<credential>`
//! and its frames are relayed byte-for-byte to that port. Idle tunnels are
//! reclaimed by a background sweep.
//!
//! ## API surface
//!
//! | Method | Path                            | Auth   | Description                  |
//! |--------|---------------------------------|--------|------------------------------|
//! | GET    | `/api/health`                   | No     | Liveness probe               |
//! | POST   | `/api/tunnels/{target}`         | Bearer | Create or reuse a tunnel     |
//! | GET    | `/api/tunnels/{target}`         | Bearer | Describe a tunnel            |
//! | GET    | `/api/tunnels`                  | Bearer | List tunnels                 |
//! | DELETE | `/api/credentials/{credential}` | Bearer | Revoke a tunnel              |
//! | GET    | `/websockify[/..]?token=`       | Token  | WebSocket upgrade and relay  |

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use tunnelgate::{routes, AppState, CommandBackend, Config, TunnelGateway};

/// Token-authenticated WebSocket to TCP tunnel gateway.
#[derive(Parser)]
#[command(name = "tunnelgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to TOML config file (when no subcommand is given).
    #[arg(long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config.or(cli.config),
        None => cli.config,
    };

    if let Err(e) = run_server(config_path.as_deref()).await {
        error!("{e}");
        eprintln!("tunnelgate: {e}");
        std::process::exit(1);
    }
}

async fn run_server(config_path: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunnelgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Upgrade endpoint: {}", config.upgrade_route());

    if config.auth.api_key == "change-me" {
        warn!("Using default API key; set TUNNELGATE_API_KEY or update config");
    }
    if config.cors.allowed_origins.is_none() && config.cors.allow_credentials {
        warn!("CORS allows any origin with credentials; browsers will refuse credentialed requests");
    }

    let backend = Arc::new(CommandBackend::new(
        config.backend.open_command.clone(),
        config.backend.close_command.clone(),
    ));
    let gateway = Arc::new(TunnelGateway::from_config(&config, backend));
    let state = AppState::new(config, gateway.clone());
    let app = routes::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen).await?;
    info!("Server ready");

    gateway.start_sweeper();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup
    info!("Shutting down...");
    let closed = gateway.shutdown().await;
    info!(tunnels = closed, "Goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            },
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
