//! tutor-server: session orchestrator for interactive terminal tutoring.
//!
//! Accepts WebSocket connections, and for each one runs a student and a
//! tutor sandbox, bridges their terminals to the client, walks the course
//! and drives the typing autopilot.

mod config;
mod course;
mod net;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::ServerConfig;
use server::TutorServer;
use session::DockerEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// tutor-server: interactive terminal tutoring sessions
#[derive(Parser, Debug)]
#[command(name = "tutor-server", version, about = "Interactive terminal tutoring server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.tutor/config.toml")]
    config: String,

    /// Base URL of the course API (unset: built-in curriculum)
    #[arg(long)]
    api_host: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tutor-server");

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.api_host.as_deref(),
        cli.max_sessions,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let courses = course::from_config(&server_config);
    let server = TutorServer::new(server_config, Arc::new(DockerEngine), courses);

    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
