use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use scrapco_dispatch::api::rest;
use scrapco_dispatch::config::Config;
use scrapco_dispatch::engine::offer::HttpOfferTransport;
use scrapco_dispatch::engine::sweeper::run_sweeper;
use scrapco_dispatch::error::AppError;
use scrapco_dispatch::state::AppState;
use scrapco_dispatch::store::memory::MemoryStore;
use scrapco_dispatch::store::rest::{RestIdentity, RestStore};
use scrapco_dispatch::store::{IdentityProvider, PickupStore, VendorDirectory};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store: Arc<dyn PickupStore>;
    let vendors: Arc<dyn VendorDirectory>;
    let identity: Arc<dyn IdentityProvider>;
    match &config.store_url {
        Some(url) => {
            let gateway = Arc::new(RestStore::new(url, &config.store_service_key)?);
            store = gateway.clone();
            vendors = gateway;
            identity = Arc::new(RestIdentity::new(url, &config.store_anon_key)?);
        }
        None => {
            tracing::warn!("STORE_URL not set; using the in-memory store");
            let memory = Arc::new(MemoryStore::new());
            store = memory.clone();
            vendors = memory.clone();
            identity = memory;
        }
    }

    let offers = Arc::new(HttpOfferTransport::from_config(&config));
    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        vendors,
        identity,
        offers,
    ));

    tokio::spawn(run_sweeper(state.clone()));

    let app = rest::router(state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
