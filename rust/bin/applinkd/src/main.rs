//! `applinkd`: the AppLink provisioning service.
//!
//! Usage:
//!   applinkd [-c <name-or-path>] [--listen <addr>]
//!
//! The config name resolves to `/etc/applink/<name>.toml`.
//! If a path with `/` or `.` is given, it's used directly.
//! Without `-c` the built-in defaults are used.

mod config;
mod context_middleware;
mod org_client;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use applink_core::Module;
use clap::Parser;
use tracing::{info, warn};

use config::{LogFormat, ServerConfig};
use context_middleware::ContextState;
use routes::AppState;

/// AppLink provisioning service.
#[derive(Parser, Debug)]
#[command(name = "applinkd", about = "AppLink provisioning service")]
struct Cli {
    /// Config name or path to config file.
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Listen address (overrides the configured one).
    #[arg(long = "listen")]
    listen: Option<String>,
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load server configuration.
    let (mut server_config, source) = match &cli.config {
        Some(name) => {
            let path = ServerConfig::resolve_path(name);
            (ServerConfig::load(&path)?, path.display().to_string())
        }
        None => (ServerConfig::default(), "built-in defaults".to_string()),
    };
    if let Some(listen) = cli.listen {
        server_config.server.listen = listen;
    }

    init_logging(server_config.log.format);
    info!("Configuration loaded from {}", source);

    // Verify configuration is valid.
    config::verify_config(&server_config)?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let provision_module = provision::ProvisionModule::new(server_config.provision.worker_config());
    let worker = provision_module.worker().clone();
    info!(
        item_delay = ?worker.config().item_delay,
        job_timeout = ?worker.config().job_timeout,
        "Provision module initialized"
    );

    let module_routes = vec![(provision_module.name(), provision_module.routes())];

    let app_state = AppState {
        context: Arc::new(ContextState {
            http,
            default_api_version: server_config.org.api_version.clone(),
        }),
        worker: worker.clone(),
    };
    let app = routes::build_router(app_state, module_routes);

    // Start server.
    let listener = tokio::net::TcpListener::bind(&server_config.server.listen).await?;
    info!("applinkd listening on {}", server_config.server.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let detached jobs finish before exiting.
    let grace = server_config.provision.shutdown_grace();
    if worker.shutdown(grace).await {
        info!("applinkd stopped");
    } else {
        warn!("applinkd stopped with provisioning jobs still running");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
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
    info!("shutdown signal received");
}
