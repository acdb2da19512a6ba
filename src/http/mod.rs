//! HTTP route wiring for both binaries, following the CORS + trace layer
//! convention and `Extension`/`State`-carried shared pool used throughout
//! this crate's HTTP surface.

pub mod handlers;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::http_client::HttpClient;
use crate::keystore::KeyStore;
use crate::kms::Kms;
use crate::lock::LockManager;
use crate::repository::Repository;

/// Shared application state threaded into every handler. Holds no
/// back-pointer to HTTP dispatch state, per the design notes on cyclic
/// handler/server references. The revision-token manager (C8) is not
/// wired in here: it is consumed by the publish path, external to this
/// HTTP surface.
pub struct AppState {
    pub config: Config,
    pub pool: sqlx::PgPool,
    pub locks: Arc<dyn LockManager>,
    pub repository: Arc<dyn Repository>,
    pub http_client: Arc<dyn HttpClient>,
    pub key_store: Arc<dyn KeyStore>,
    pub kms: Arc<dyn Kms>,
}

pub fn export_importer_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/schedule", get(handlers::schedule))
        .route("/import", get(handlers::import))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn key_rotation_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/", get(handlers::rotate))
        .route("/rotate", get(handlers::rotate))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
