use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use veil_server::{accept_connection, ServerConfig, ServerState, Store};

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();

    let store = match Store::open(&config.database_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                "Failed to open database {}: {}",
                config.database_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    // Expired sessions are rejected anyway; this only keeps the table small
    let purge_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            match purge_store.purge_expired_sessions() {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Purged expired sessions"),
                Err(e) => error!(error = %e, "Failed to purge expired sessions"),
            }
        }
    });

    let state = Arc::new(ServerState::with_store(store));

    // Bind TCP listener
    let listener = match TcpListener::bind(&config.addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.addr, e);
            std::process::exit(1);
        }
    };

    info!("Veil server listening on {}", config.addr);

    // Accept connections
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!("New connection from {}", peer_addr);
                tokio::spawn(accept_connection(stream, peer_addr, state.clone()));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
