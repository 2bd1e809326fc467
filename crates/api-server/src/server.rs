//! HTTP ingress server and the Prometheus exporter.

use crate::engine_rest;
use crate::rest::{self, AppState};
use axum::routing::{get, post};
use axum::Router;
use mailflow_core::config::AppConfig;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve HTTP until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Install the global metrics recorder and its scrape listener.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.metrics.port);
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Definitions
        .route("/v1/templates", post(engine_rest::handle_create_template))
        .route("/v1/audiences", post(engine_rest::handle_create_audience))
        .route("/v1/sequences", post(engine_rest::handle_create_sequence))
        .route("/v1/campaigns", post(engine_rest::handle_create_campaign))
        // Flows
        .route("/v1/sequences/:key/trigger", post(engine_rest::handle_trigger))
        .route("/v1/events/:event", post(engine_rest::handle_event))
        .route("/v1/campaigns/:id/send", post(engine_rest::handle_send_campaign))
        .route("/v1/campaigns/:id/schedule", post(engine_rest::handle_schedule_campaign))
        .route("/v1/campaigns/:id/cancel", post(engine_rest::handle_cancel_campaign))
        .route("/v1/campaigns/:id/analytics", get(engine_rest::handle_campaign_analytics))
        .route("/v1/webhooks/delivery", post(engine_rest::handle_delivery_webhook))
        .route("/v1/replies", post(engine_rest::handle_reply))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
