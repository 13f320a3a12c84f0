use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use qbank_access_provider::{IdentityClient, MailClient};
use qbank_access_storage::Database;

use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    webhook_secret: Option<Arc<[u8]>>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    identity: IdentityClient,
    mailer: MailClient,
    public_base_url: String,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        webhook_secret: Option<Arc<[u8]>>,
        identity: IdentityClient,
        mailer: MailClient,
        public_base_url: String,
    ) -> Self {
        let clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> = Arc::new(Utc::now);
        Self {
            metrics,
            storage,
            webhook_secret,
            clock,
            identity,
            mailer,
            public_base_url,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn webhook_secret(&self) -> Option<Arc<[u8]>> {
        self.webhook_secret.clone()
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn identity(&self) -> &IdentityClient {
        &self.identity
    }

    pub fn mailer(&self) -> &MailClient {
        &self.mailer
    }

    pub fn public_base_url(&self) -> &str {
        &self.public_base_url
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route(
            "/webhooks/delivery",
            get(webhook::alive).post(webhook::handle),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}
