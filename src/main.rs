use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

mod audit;
mod catalog;
mod claims;
mod codec;
mod config;
mod datastore;
mod delivery;
mod entitlement;
mod error;
mod issuance;
mod middleware;
mod redemption;
mod replay;
mod session;
mod telemetry;
#[cfg(test)]
mod testing;

pub struct AppState {
    sessions: session::SessionVerifier,
    issuance: issuance::IssuanceService,
    redemption: redemption::RedemptionService,
    delivery: delivery::FileDelivery,
}

impl AppState {
    /// Wires the services to the hosted database and identity provider.
    pub fn from_settings(settings: &config::Settings) -> anyhow::Result<Self> {
        let api_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.datastore.timeout_secs))
            .build()?;
        // Ebook files can be large, so only the connect phase is bounded.
        let storage_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(settings.datastore.timeout_secs))
            .build()?;

        let datastore = Arc::new(datastore::RestDatastore::new(&settings.datastore)?);
        let codec = codec::TokenCodec::from_settings(settings);

        let issuance = issuance::IssuanceService::new(
            codec.clone(),
            datastore.clone(),
            datastore.clone(),
            datastore.clone(),
        );
        let mut redemption = redemption::RedemptionService::new(
            codec,
            datastore.clone(),
            datastore.clone(),
            datastore,
        );
        if settings.single_use_tokens {
            redemption = redemption.with_single_use();
        }

        Ok(Self {
            sessions: session::SessionVerifier::new(settings.identity.clone(), api_client),
            issuance,
            redemption,
            delivery: delivery::FileDelivery::new(storage_client),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/issuance", post(issuance::issue_download_token))
        .route(
            "/redemption/{resource_id}",
            post(redemption::redeem_download_token).get(redemption::redemption_method_not_allowed),
        )
        .layer(middleware::RequestContextLayer)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = config::load_config()?;
    let _otel_guard = telemetry::init(&settings.telemetry)?;

    let state = Arc::new(AppState::from_settings(&settings)?);
    tracing::info!(
        ttl_minutes = settings.token_ttl_minutes,
        single_use = settings.single_use_tokens,
        "download authorization configured"
    );

    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
