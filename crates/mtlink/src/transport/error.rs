//! Errors raised by transport collaborators.

use thiserror::Error;

use super::rpc::RpcError;

/// Failure to construct, drive, or tear down a session or connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key exchange with the server did not complete.
    #[error("handshake with {addr} failed: {message}")]
    Handshake { addr: String, message: String },

    /// No persisted state exists for the phone number.
    #[error("no stored session for {0}")]
    NoStoredSession(String),

    /// The server rejected a call made during setup.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The link is already closed.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn handshake(addr: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handshake {
            addr: addr.into(),
            message: message.into(),
        }
    }
}
