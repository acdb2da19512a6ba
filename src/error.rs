//! Top-level error kinds surfaced by the core, and their HTTP mapping.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use serde::Serialize;
use thiserror::Error;

use crate::lock::LockError;
use crate::repository::RepositoryError;
use crate::token::TokenError;
use crate::verify::VerifyError;

/// Errors that can terminate a job run or an HTTP handler.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Another replica already holds the lock. Not fatal: callers treat this as success.
    #[error("already locked")]
    AlreadyLocked,

    /// Remote archive or index responded 404.
    #[error("archive not found")]
    ArchiveNotFound,

    /// No embedded signature verified against the allowed key set.
    #[error("unauthentic archive")]
    Unauthentic,

    /// Contents or signatures blob missing or unparseable.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// A download failed for reasons other than 404.
    #[error("transient download error: {0}")]
    TransientDownload(String),

    /// A database call failed for reasons that should be retried by the external scheduler.
    #[error("transient database error: {0}")]
    TransientDb(String),

    /// Benign lease race; current iteration aborts, next timer tick retries.
    #[error("not leasable")]
    NotLeasable,

    /// A KMS call failed.
    #[error("kms error: {0}")]
    Kms(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Serialize)]
struct JobResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<String>>,
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        match self {
            CoreError::AlreadyLocked => (
                StatusCode::OK,
                Json(JobResponse { ok: true, errors: None }),
            )
                .into_response(),
            CoreError::NotLeasable => (
                StatusCode::OK,
                Json(JobResponse { ok: true, errors: None }),
            )
                .into_response(),
            CoreError::Lock(LockError::AlreadyLocked) => (
                StatusCode::OK,
                Json(JobResponse { ok: true, errors: None }),
            )
                .into_response(),
            other => {
                tracing::error!(error = %other, "job failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(JobResponse {
                        ok: false,
                        errors: Some(vec![other.to_string()]),
                    }),
                )
                    .into_response()
            }
        }
    }
}
