use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use tracing::{error, info};

use plaza_api::{create_router, AppState};
use plaza_core::{logging, Config};

/// Config file: `PLAZA_CONFIG_PATH`, else `config.yaml` in the working directory
fn load_config() -> Result<Config> {
    let config_path = std::env::var("PLAZA_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            let cwd = "config.yaml";
            Path::new(cwd).exists().then(|| cwd.to_string())
        });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path).with_context(|| format!("failed to load {path}"))?
        }
        None => {
            eprintln!("No config file found, using defaults and environment");
            Config::from_env().context("failed to load configuration from environment")?
        }
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Plaza signaling service starting...");

    let http_addr: SocketAddr = config
        .http_address()
        .parse()
        .with_context(|| format!("invalid HTTP address {}", config.http_address()))?;
    if config.relay.is_enabled() {
        info!(relay = %config.relay.url, threshold = config.capacity.relay_threshold, "Relay routing enabled");
    } else {
        info!("No relay configured, every room runs as a mesh");
    }

    // 3. Build state and router
    let state = AppState::new(config)?;
    let router = create_router(state);

    // 4. Serve until a shutdown signal arrives
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP address {http_addr}"))?;
    info!("HTTP server listening on {}", http_addr);

    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
        return Err(e.into());
    }

    info!("HTTP server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
