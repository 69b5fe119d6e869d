//! Errors raised by the protocol/session layer.
//!
//! None of these are fatal: each one is scoped to a single frame, datagram
//! or session and is logged by the caller.

/// Unified error type for session operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed RPC frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("outbound queue is full")]
    OutboundFull,

    #[error("session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<tokio::sync::mpsc::error::TrySendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::TrySendError<T>) -> Self {
        match e {
            tokio::sync::mpsc::error::TrySendError::Full(_) => Self::OutboundFull,
            tokio::sync::mpsc::error::TrySendError::Closed(_) => Self::SessionClosed,
        }
    }
}
