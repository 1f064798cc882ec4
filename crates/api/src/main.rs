// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Snapdock API Server
//!
//! HTTP surface for the billing subsystem: the payment-processor webhook
//! endpoint and the admin migration endpoints.

mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use snapdock_billing::{BillingService, LoggingTelemetry};
use snapdock_store::{InMemoryStore, RecordStore};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,snapdock_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Snapdock API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    if config.webhook_secret.is_none() {
        tracing::warn!("WEBHOOK_SECRET not set; webhook deliveries will be rejected");
    }
    if config.admin_token.is_none() {
        tracing::warn!("ADMIN_TOKEN not set; admin endpoints are disabled");
    }

    // TODO: swap for the durable record store backend once it lands; the
    // in-memory store covers local and single-node deployments.
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryStore::new());

    let billing = Arc::new(BillingService::new(
        store,
        config.webhook_secret.clone(),
        Arc::new(LoggingTelemetry),
    ));

    let state = AppState::new(billing, config.clone());
    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
