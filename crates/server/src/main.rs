mod api;
mod metrics;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use harvester_core::{
    load_config, load_config_from_env, validate_config, AmqpTransport, CommandRunner, Config,
    GatewayClient, HarvesterService,
};

use api::create_router;
use state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default config file, read when present and `HARVESTER_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

/// `RUST_LOG` wins, then `LOG_LEVEL`, then `info`.
/// `HARVESTER_LOG_FORMAT=json` switches to structured output.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });

    let json = std::env::var("HARVESTER_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn load() -> Result<Config> {
    let config_path = std::env::var("HARVESTER_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()));

    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            load_config(&path)
                .with_context(|| format!("Failed to load config from {:?}", path))?
        }
        None => {
            info!("No config file, reading configuration from the environment");
            load_config_from_env().context("Failed to load config from the environment")?
        }
    };

    validate_config(&config).context("Configuration validation failed")?;
    Ok(config)
}

async fn run() -> Result<()> {
    info!(version = VERSION, "Starting harvester");

    let config = load()?;

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        config_hash = &config_hash[..16],
        processors_path = %config.processors.path.display(),
        parallelism = config.processors.effective_parallelism(),
        batch_size = config.batch.size,
        "Configuration loaded"
    );

    let gateway = GatewayClient::new(&config.gateway).context("Failed to create gateway client")?;
    info!("Delivering records to {}", gateway.url());

    let service = HarvesterService::start(
        &config,
        Arc::new(AmqpTransport::new()),
        Arc::new(CommandRunner::new()),
        Arc::new(gateway),
    )
    .await
    .context("Failed to start worker")?;
    info!(processors = service.registry().len(), "Worker started");

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::clone(service.registry()),
        service.session().subscribe(),
    ));
    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Serving health and metrics on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            service.shutdown().await;
            return Err(e).with_context(|| format!("Failed to bind to {}", addr));
        }
    };

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Shutting down...");
    service.shutdown().await;
    info!("Broker session closed");

    served
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
