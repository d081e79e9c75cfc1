//! Errors returned by manager requests.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::{ConnectionId, RpcError, SessionId, TransportError};

/// Outcome of a failed manager request.
///
/// Every request sent to the dispatch loop resolves to exactly one value of
/// this type or a success; handler errors never stop the loop.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The dispatch loop has stopped, or dropped the request while stopping.
    #[error("manager has shut down")]
    Shutdown,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// The session exists but is not bound to a connection.
    #[error("session {0} is not bound to a connection")]
    NotBound(SessionId),

    #[error("connection {0} has no bound session")]
    NoBoundSession(ConnectionId),

    /// A second session was offered to a connection that already hosts one.
    #[error("connection {connection_id} is busy with session {session_id}")]
    ConnectionBusy {
        connection_id: ConnectionId,
        session_id: SessionId,
    },

    /// The transport handed out an id that is already registered.
    #[error("session id {0} is already registered")]
    DuplicateSession(SessionId),

    /// The transport opened a link under an id that is already registered.
    #[error("connection id {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("failed to construct session or connection: {0}")]
    Construction(#[source] TransportError),

    #[error("failed to discard session {session_id}: {source}")]
    Discard {
        session_id: SessionId,
        #[source]
        source: TransportError,
    },

    #[error("discard step failed for session {session_id}: {source}")]
    DiscardStep {
        session_id: SessionId,
        #[source]
        source: Box<ManagerError>,
    },

    #[error("connect step to {addr} failed: {source}")]
    ConnectStep {
        addr: String,
        #[source]
        source: Box<ManagerError>,
    },

    #[error("reload step for {phone} failed: {source}")]
    ReloadStep {
        phone: String,
        #[source]
        source: Box<ManagerError>,
    },

    #[error("cannot close connection, discard of session {session_id} failed: {source}")]
    CloseConnection {
        session_id: SessionId,
        #[source]
        source: Box<ManagerError>,
    },

    #[error("failed to close connection {connection_id}: {source}")]
    ConnectionClose {
        connection_id: ConnectionId,
        #[source]
        source: TransportError,
    },

    /// The server does not recognise the session as logged in.
    #[error("authentication required on connection {connection_id}: {source}")]
    Unauthenticated {
        connection_id: ConnectionId,
        #[source]
        source: RpcError,
    },

    #[error(transparent)]
    Rpc(RpcError),

    #[error("no address configured for data center {0}")]
    UnknownDataCenter(i32),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ManagerError {
    /// Whether the request was rejected because the manager stopped.
    pub fn is_shutdown(&self) -> bool {
        match self {
            Self::Shutdown => true,
            Self::DiscardStep { source, .. }
            | Self::ConnectStep { source, .. }
            | Self::ReloadStep { source, .. }
            | Self::CloseConnection { source, .. } => source.is_shutdown(),
            _ => false,
        }
    }
}
