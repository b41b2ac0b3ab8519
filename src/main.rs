use marketplace_chat::{
    auth,
    bus::EventBus,
    config::Config,
    realtime::ChatHub,
    server::{ChatServer, Heartbeat},
    store::Store,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the filter so RUST_LOG can come from it
    let dotenv = dotenvy::dotenv();

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        // It's not fatal if .env doesn't exist, but good to know
        info!("No .env file found or failed to load: {}", e);
    }

    let config = Config::from_env()?;
    info!("Marketplace chat starting...");

    info!("Initializing store at {}", config.database_path.display());
    let store = Store::new(&config.database_path).await?;
    store.init().await?;

    let bus = Arc::new(EventBus::new(config.event_bus_capacity));
    let hub = Arc::new(ChatHub::new(store.clone(), bus.clone(), config.limits.clone()));
    let authenticator = auth::from_secret(config.jwt_secret.as_deref());

    // Audit tap: every delivery the hub makes.
    let mut deliveries = bus.subscribe();
    let audit_handle = tokio::spawn(async move {
        loop {
            match deliveries.recv().await {
                Ok(envelope) => {
                    debug!(
                        event = envelope.event.name(),
                        audience = ?envelope.audience,
                        delivered = envelope.delivered,
                        "Delivered"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Audit tap lagged, skipped {} deliveries", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = ChatServer::new(
        hub,
        authenticator,
        Heartbeat {
            interval: config.heartbeat_interval,
            timeout: config.client_timeout,
        },
    );
    let app = server.router();

    info!("Starting chat server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    tokio::select! {
        res = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()) => {
            if let Err(e) = res {
                error!("Server stopped with error: {}", e);
            }
        }
        _ = audit_handle => {
            error!("Audit tap finished unexpectedly");
        }
    }

    store.close().await;
    info!("Marketplace chat stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down...");
}
