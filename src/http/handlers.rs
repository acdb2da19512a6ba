//! Route handlers. Each job is a straight-line function with a deadline;
//! the handler's only job is to invoke it and translate the result into
//! the `{ok, errors}` JSON discipline.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::error::CoreError;
use crate::sync::run_sync;
use crate::worker::run_worker_pool;

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(OkResponse { ok: false })).into_response()
        }
    }
}

pub async fn schedule(State(state): State<Arc<AppState>>) -> Response {
    let result = run_sync(
        state.locks.as_ref(),
        state.repository.as_ref(),
        state.http_client.as_ref(),
        state.config.max_runtime,
        state.config.index_file_download_timeout,
    )
    .await;

    respond(result)
}

pub async fn import(State(state): State<Arc<AppState>>) -> Response {
    let result = run_worker_pool(
        state.locks.as_ref(),
        state.repository.as_ref(),
        state.http_client.as_ref(),
        state.key_store.as_ref(),
        &state.config,
    )
    .await;

    match result {
        Ok(outcome) => {
            tracing::info!(
                leased = outcome.leased,
                completed = outcome.completed,
                failed = outcome.failed,
                "import run complete"
            );
            (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
        }
        Err(e) => respond(Err(e)),
    }
}

pub async fn rotate(State(state): State<Arc<AppState>>) -> Response {
    let result = crate::rotation::run_rotation(
        state.locks.as_ref(),
        &state.pool,
        state.kms.as_ref(),
        state.config.new_key_period,
        state.config.delete_old_key_period,
        chrono::Utc::now(),
    )
    .await;

    match result {
        Ok(outcome) => {
            tracing::info!(created = outcome.created, deleted = outcome.deleted, "rotation run complete");
            (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
        }
        Err(e) => respond(Err(e)),
    }
}

fn respond<T>(result: Result<T, CoreError>) -> Response {
    match result {
        Ok(_) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => e.into_response(),
    }
}
