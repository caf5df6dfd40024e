#![forbid(unsafe_code)]

//! `stagehand` — OSC session-management server binary.
//!
//! Bootstraps configuration, scans the sessions home directory, and runs
//! the UDP protocol dispatcher until a shutdown signal or a fatal
//! background failure cancels the supervision scope.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use stagehand::config::Config;
use stagehand::server::Server;
use stagehand::session::registry::SessionRegistry;
use stagehand::supervisor::Supervisor;
use stagehand::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stagehand", about = "OSC session-management server", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the sessions home directory.
    #[arg(long)]
    home: Option<PathBuf>,

    /// Override the UDP listening host.
    #[arg(long)]
    host: Option<String>,

    /// Override the UDP listening port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("stagehand server bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::default(),
    };
    if let Some(home) = args.home {
        config.home = home;
    }
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;
    info!(home = %config.home.display(), "configuration loaded");

    let supervisor = Supervisor::new();

    // An inconsistent current-session marker refuses startup here.
    let sessions = Arc::new(
        SessionRegistry::open(
            config.home.clone(),
            supervisor.clone(),
            config.shutdown_grace(),
        )
        .await?,
    );

    let server = Server::bind(config, Arc::clone(&sessions), supervisor.clone()).await?;
    info!(addr = %server.local_addr()?, "stagehand ready");

    let serve_supervisor = supervisor.clone();
    let serve_handle = tokio::spawn({
        let server = Arc::clone(&server);
        async move {
            if let Err(err) = server.serve().await {
                serve_supervisor.fail(err);
            }
        }
    });

    tokio::select! {
        () = shutdown_signal() => {
            info!("shutdown signal received");
            supervisor.shutdown();
        }
        // A background task already failed and cancelled the scope.
        () = supervisor.cancelled() => {}
    }

    let _ = serve_handle.await;

    // Join every session's process group before exiting.
    let wait_result = sessions.shutdown().await;
    if let Err(err) = &wait_result {
        error!(%err, "process supervision ended with failures");
    }

    if let Some(err) = supervisor.take_error() {
        error!(%err, "fatal background error");
        return Err(err);
    }
    info!("stagehand shut down");
    wait_result
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
