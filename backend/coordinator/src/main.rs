//! Food donation coordinator entry point.
//!
//! Serves the volunteer/restaurant/NGO REST API over SQLite and runs a
//! background sweeper that expires donations nobody delivered in time.

mod api;
mod auth;
mod config;
mod db;
mod donations;
mod errors;
mod lifecycle;
mod models;
mod notify;
mod otp;
mod redistribution;
mod sms;
mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use donations::Coordinator;
use sms::SmsSender;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url).await?;

    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let sender: Arc<dyn SmsSender> = match config.sms.clone() {
        Some(credentials) => Arc::new(sms::HttpSms::new(client, &config.sms_api_url, credentials)),
        None => {
            warn!("TWILIO_* not set; OTPs will only be logged");
            Arc::new(sms::LogOnlySms)
        }
    };

    let shutdown = CancellationToken::new();

    // ─── Expiry sweeper ───────────────────────────────────
    let sweeper = tokio::spawn(sweeper::run(
        pool.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        shutdown.clone(),
    ));

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(api::ApiState {
        coordinator: Coordinator {
            pool,
            sms: sender,
            notifier: Arc::new(notify::LogNotifier),
            otp_ttl: chrono::Duration::seconds(config.otp_ttl_secs),
            default_country_code: config.default_country_code.clone(),
        },
        tokens: auth::TokenVerifier::new(&config.access_token_secret),
    });

    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_ctrl_c(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sweeper.await?;
    info!("Shut down cleanly");
    Ok(())
}

async fn wait_for_ctrl_c(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {e}");
        // Keep serving until something else cancels.
        shutdown.cancelled().await;
        return;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
