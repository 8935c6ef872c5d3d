//! x402 facilitator HTTP entrypoint.
//!
//! Endpoints:
//! - `GET /verify`, `POST /verify` — describe, then run, payment verification
//! - `GET /settle`, `POST /settle` — describe, then run, on-chain settlement
//! - `GET /supported` — list supported scheme/network combinations
//! - `GET /health` — liveness probe
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the bind address
//! - `DATABASE_URL` selects the Postgres-backed NonceLedger/PaymentStore
//! - `FACILITATOR_SIGNER`, `RPC_URL_*` configure the Submitter
//! - `RUST_LOG`, `OTEL_*` control logging and tracing export

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::Method;
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use x402_facilitator::config::Config;
use x402_facilitator::facilitator::{Facilitator, FacilitatorLocal};
use x402_facilitator::handlers;
use x402_facilitator::nonce_ledger::{NonceLedger, PostgresNonceLedger};
use x402_facilitator::sig_down::SigDown;
use x402_facilitator::store::{PaymentStore, PostgresPaymentStore};
use x402_facilitator::submitter::{AlloySubmitter, Submitter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("rustls crypto provider installed exactly once");

    #[cfg(feature = "telemetry")]
    let _telemetry = x402_facilitator::telemetry::Telemetry::new();
    #[cfg(not(feature = "telemetry"))]
    tracing_subscriber::fmt::init();

    let config = Config::load()?;

    let database_url = config.require_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let nonce_ledger: Arc<dyn NonceLedger> = Arc::new(PostgresNonceLedger::new(pool.clone()));
    let store: Arc<dyn PaymentStore> = Arc::new(PostgresPaymentStore::new(pool));

    let signer = alloy_signer_local::PrivateKeySigner::from_str(&config.facilitator_signer)
        .map_err(|e| format!("invalid FACILITATOR_SIGNER: {e}"))?;
    let rpc_urls: HashMap<u64, url::Url> = config.rpc_urls.clone();
    let submitter: Arc<dyn Submitter> = Arc::new(AlloySubmitter::new(signer, rpc_urls));

    let facilitator: Arc<dyn Facilitator> = Arc::new(FacilitatorLocal::new(
        nonce_ledger,
        store,
        submitter,
        config.max_in_flight_settlements,
        config.clock_skew_seconds,
        config.min_remaining_lifetime_seconds,
        config.inclusion_timeout,
    ));

    let app = handlers::routes(facilitator)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    tracing::info!("starting x402 facilitator on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        tracing::error!("failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    let sig_down = SigDown::try_new()?;
    let cancellation_token = sig_down.cancellation_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancellation_token.cancelled().await })
        .await?;

    Ok(())
}
