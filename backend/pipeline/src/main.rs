//! Blue-carbon MRV pipeline — entry point.
//!
//! Wires the lifecycle controller, marketplace, payment distributor, and
//! reconciliation service over a shared SQLite pool and a JSON-RPC ledger
//! client, then starts the background workers (ledger event consumer,
//! scheduled reconciliation sweep) and the Axum REST API.

mod api;
mod config;
mod db;
mod errors;
mod ledger;
mod lifecycle;
mod marketplace;
mod media;
mod payments;
mod reconcile;

use std::sync::Arc;

use reqwest::Client;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use ledger::rpc::JsonRpcLedger;
use ledger::Ledger;
use lifecycle::{LifecycleController, WriteGate};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    // Load config from environment; missing contract addresses are fatal.
    let mut config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    // Resume event polling from the persisted cursor.
    let last_block = db::get_last_block(&pool).await?;
    config.start_block = config.start_block.max(last_block as u64);
    let config = Arc::new(config);

    // HTTP client shared between the ledger client and the media gateway.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let ledger = Arc::new(JsonRpcLedger::new(client.clone(), config.clone()));
    let write_gate: WriteGate = Arc::new(Mutex::new(()));

    let controller = Arc::new(LifecycleController::new(
        pool.clone(),
        ledger.clone(),
        config.clone(),
        write_gate.clone(),
    ));
    let marketplace = Arc::new(marketplace::MarketplaceEngine::new(
        pool.clone(),
        ledger.clone(),
        controller.clone(),
        write_gate.clone(),
    ));
    let payments = Arc::new(payments::PaymentDistributor::new(
        pool.clone(),
        ledger.clone(),
        write_gate.clone(),
    ));
    let reconciler = Arc::new(reconcile::ReconciliationService::new(
        pool.clone(),
        ledger.clone(),
        controller.clone(),
        config.clone(),
        write_gate.clone(),
    ));
    let media = Arc::new(media::HttpMediaGateway::new(
        client,
        config.media_gateway_url.clone(),
    ));

    let cancel = CancellationToken::new();

    // ─── Background workers ───────────────────────────────
    let events_rx = ledger.subscribe_events(cancel.clone());
    tokio::spawn(
        ledger::events::EventConsumer::new(pool.clone(), controller.clone()).run(events_rx),
    );
    tokio::spawn(reconcile::run(reconciler.clone(), cancel.clone()));

    // ─── REST API ─────────────────────────────────────────
    let state = Arc::new(api::ApiState {
        pool,
        config: config.clone(),
        ledger,
        controller,
        marketplace,
        payments,
        reconciler,
        media,
    });

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;

    Ok(())
}

/// Stop background workers when the process receives Ctrl-C.
async fn shutdown(cancel: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
    cancel.cancel();
}
