//! Export-importer binary: serves `/health`, `/schedule` (C3), and
//! `/import` (C4). The timer-driven invocation model is provided
//! externally — an outside scheduler hits these HTTP endpoints on a
//! cadence; this process holds no internal ticker.

use std::sync::Arc;

use exposure_exchange_core::http::{export_importer_router, AppState};
use exposure_exchange_core::http_client::ReqwestClient;
use exposure_exchange_core::keystore::InMemoryKeyStore;
use exposure_exchange_core::kms::LocalEnvelopeKms;
use exposure_exchange_core::lock::PgLockManager;
use exposure_exchange_core::repository::PgRepository;
use exposure_exchange_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "export-importer panicked");
    }));

    let config = Config::from_env()?;
    tracing::info!(bind_addr = %config.bind_addr, "starting export-importer");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let state = Arc::new(AppState {
        locks: Arc::new(PgLockManager::new(pool.clone())),
        repository: Arc::new(PgRepository::new(pool.clone())),
        http_client: Arc::new(ReqwestClient::new()),
        // The local exposure-key store is an external collaborator
        // (§1 non-goal); wire a real implementation in place of this one
        // when deploying against the actual key store.
        key_store: Arc::new(InMemoryKeyStore::new()),
        kms: Arc::new(LocalEnvelopeKms::from_key_id(&config.kms_key_id)),
        pool,
        config: config.clone(),
    });

    let router = export_importer_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "export-importer listening");
    axum::serve(listener, router).await?;

    Ok(())
}
