mod problem;
mod provisioning;
mod router;
mod telemetry;
mod webhook;

use std::{net::SocketAddr, sync::Arc};

use reqwest::Client;
use tracing::{info, warn};
use url::Url;

use qbank_access_provider::{IdentityClient, MailClient};
use qbank_access_storage::Database;
use qbank_access_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let http = Client::builder().build()?;
    let identity = IdentityClient::new(
        config.identity_api_key.clone(),
        Url::parse(&config.identity_api_url)?,
        http.clone(),
    );
    let mailer = MailClient::new(
        config.mail_api_key.clone(),
        Url::parse(&config.mail_api_url)?,
        config.mail_from.clone(),
        http,
    );

    let webhook_secret: Option<Arc<[u8]>> = config
        .webhook_secret
        .as_ref()
        .map(|secret| Arc::from(secret.as_bytes().to_vec().into_boxed_slice()));
    if webhook_secret.is_none() {
        warn!(
            stage = "app",
            "DELIVERY_WEBHOOK_SECRET is not set, webhook deliveries will be rejected"
        );
    }

    let state = router::AppState::new(
        metrics,
        database,
        webhook_secret,
        identity,
        mailer,
        config.public_base_url.clone(),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
