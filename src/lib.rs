//! Core of an exposure-notification export-import subsystem: discovers
//! signed archives listed in per-source index files, verifies and
//! transforms their contents, and inserts them into the local key store
//! exactly once per archive. Also owns revision-key rotation and the
//! revision-token envelope used by the publish path.

pub mod config;
pub mod error;
pub mod http;
pub mod http_client;
pub mod keystore;
pub mod kms;
pub mod lock;
pub mod model;
pub mod repository;
pub mod rotation;
pub mod sync;
pub mod token;
pub mod transform;
pub mod verify;
pub mod worker;

pub use config::Config;
pub use error::{CoreError, CoreResult};
