// Delivery Engine - live order delivery tracking
// Courier assignment, status updates, tracking ledger and live feeds over HTTP

use anyhow::Context;
use delivery_engine::{
    access::TokenVerifier,
    config::{Config, StoreBackend},
    router,
    store::{DeliveryStore, InMemoryStore, PgDeliveryStore},
    AppState, DeliveryService, ServiceSettings,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("delivery_engine=info,tower_http=info"));
    if config.log.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    config.validate().map_err(anyhow::Error::msg)?;

    info!("Starting Delivery Engine v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn DeliveryStore> = match config.database.backend {
        StoreBackend::Postgres => {
            info!("Connecting to PostgreSQL");
            let store = PgDeliveryStore::connect(&config.database).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; deliveries are lost on restart");
            Arc::new(InMemoryStore::new())
        }
    };

    let service = Arc::new(DeliveryService::new(store, ServiceSettings::from(&config)));
    let state = AppState {
        service: service.clone(),
        verifier: Arc::new(TokenVerifier::new(&config.auth.jwt_secret)),
    };

    let app = router(state);

    let bind_addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Delivery Engine listening on: {}", bind_addr);
    info!("   GET    /deliveries/:id          - Delivery detail");
    info!("   PUT    /deliveries/:id          - Status / location update");
    info!("   POST   /deliveries/:id/assign   - Assign courier");
    info!("   GET    /deliveries/:id/tracking - Tracking history");
    info!("   GET    /deliveries/:id/stream   - Live feed (SSE)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(service))
        .await?;

    info!("Delivery Engine stopped");
    Ok(())
}

async fn shutdown_signal(service: Arc<DeliveryService>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
    // Open SSE responses would otherwise keep the server from draining
    service.shutdown_feeds();
}
