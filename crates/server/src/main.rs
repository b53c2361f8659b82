//! Metalboot Server
//!
//! HTTP boot and admin API, TFTP and syslog services and the power worker
//! in one process

use anyhow::{Context, Result};
use metalboot_metal::Drivers;
use metalboot_server::{
    create_router, AppState, Config, MemoryStore, RedisStore, Store, SyslogServer, TftpServer,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "metalboot_server=debug,metalboot_metal=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Metalboot Server");
    info!("Base URL: {}", config.base_url);
    info!("Images directory: {}", config.images_dir.display());

    config.ensure_directories()?;

    // Initialize storage
    let store: Arc<dyn Store> = match &config.redis_url {
        Some(url) => {
            info!("Redis endpoint: {}", config.redis_endpoint().unwrap_or_default());
            Arc::new(
                RedisStore::new(url)
                    .await
                    .context("Failed to initialize Redis storage")?,
            )
        }
        None => {
            info!("REDIS_URL not set, using in-memory storage");
            Arc::new(MemoryStore::new())
        }
    };

    let drivers = Drivers::new(&config.metal());
    let http_addr = config.http_address();
    let tftp_addr = config.tftp_enabled.then(|| config.tftp_address());
    let syslog_addr = config.syslog_enabled.then(|| config.syslog_address());
    let logs_dir = config.logs_dir.clone();

    // Create application state, this also starts the power worker
    let state = AppState::new(config, store, drivers);
    let boot = state.boot.clone();

    // Spawn TFTP service
    let tftp_handle = match tftp_addr {
        Some(addr) => {
            let server = TftpServer::bind(&addr, boot).await?;
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::error!("TFTP server error: {}", e);
                }
            }))
        }
        None => {
            info!("TFTP service disabled");
            None
        }
    };

    // Spawn syslog receiver for installer logs
    let syslog_handle = match syslog_addr {
        Some(addr) => {
            let server = SyslogServer::bind(&addr, logs_dir).await?;
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    tracing::error!("Syslog server error: {}", e);
                }
            }))
        }
        None => {
            info!("Syslog service disabled");
            None
        }
    };

    // Create router
    let app = create_router(state);

    // Start HTTP server
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .context("Failed to bind to address")?;

    info!("Metalboot Server running on http://{}", http_addr);

    axum::serve(listener, app).await.context("Server error")?;

    for handle in [tftp_handle, syslog_handle].into_iter().flatten() {
        handle.abort();
    }

    Ok(())
}
