//! Storage collaborators: board file, encrypted credentials, event log.

mod board;
mod logs;
mod models;
mod secrets;

pub use board::*;
pub use logs::*;
pub use models::*;
pub use secrets::*;

use thiserror::Error;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
}
