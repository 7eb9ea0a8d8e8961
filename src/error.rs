//! Error types for the demonstration RPC.

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),

    /// The server answered the call with an error.
    #[error("{0}")]
    Remote(String),

    #[error("connection is shut down")]
    Shutdown,

    #[error("caller task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The error handed to every caller of one flight. Cloning it keeps the
/// instance, so all waiters observe the same error.
pub type SharedError = Arc<Error>;
