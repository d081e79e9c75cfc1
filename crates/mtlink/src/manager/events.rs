//! Event protocol of the dispatch loop.
//!
//! [`Event`] is the public vocabulary: requests carry a one-shot reply sender,
//! notifications are raised by transport collaborators. [`Internal`] holds the
//! follow-up results workers hand back to the loop; only the crate can build
//! those, which keeps registry mutation inside the loop.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::ManagerError;
use crate::transport::{
    Connection, ConnectionId, Session, SessionId, TransportError, UpdatesState, User,
};

/// Reply channel of a request event.
pub type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

// ============================================================================
// Event
// ============================================================================

/// Everything the dispatch loop reacts to.
pub enum Event {
    // Requests
    /// Handshake a fresh session and bind it, reusing `conn_id` when registered.
    NewSession {
        conn_id: Option<ConnectionId>,
        phone: String,
        addr: String,
        use_ipv6: bool,
        reply: Reply<SessionBinding>,
    },
    /// Rebuild a session from persisted state and bind it.
    LoadSession {
        conn_id: Option<ConnectionId>,
        phone: String,
        preferred_addr: Option<String>,
        reply: Reply<SessionBinding>,
    },
    /// Discard, then re-authenticate on the same connection.
    RenewSession {
        session_id: SessionId,
        phone: String,
        addr: String,
        use_ipv6: bool,
        reply: Reply<SessionBinding>,
    },
    /// Discard, then reload from persisted state on the same connection.
    RefreshSession {
        session_id: SessionId,
        phone: String,
        reply: Reply<SessionBinding>,
    },
    /// Close the session's transport resources and detach it from `conn_id`.
    ///
    /// Replies with the detached binding. The session stays registered until
    /// its [`Event::SessionDiscarded`] is processed.
    DiscardSession {
        conn_id: ConnectionId,
        session_id: SessionId,
        reply: Reply<SessionBinding>,
    },
    /// Discard the bound session, then close the connection.
    CloseConnection {
        conn_id: ConnectionId,
        reply: Reply<()>,
    },

    // Notifications
    SessionEstablished {
        session_id: SessionId,
    },
    /// Deregisters the session. Unknown ids are ignored.
    SessionDiscarded {
        session_id: SessionId,
    },
    ConnectionOpened {
        conn_id: ConnectionId,
    },
    SessionBound {
        conn_id: ConnectionId,
        session_id: SessionId,
    },
    SessionUnbound {
        conn_id: ConnectionId,
        session_id: SessionId,
    },
    /// Deregisters the connection. Unknown ids are ignored.
    ConnectionClosed {
        conn_id: ConnectionId,
    },
    UpdateReceived {
        session_id: SessionId,
        update: serde_json::Value,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewSession { .. } => EventKind::NewSession,
            Self::LoadSession { .. } => EventKind::LoadSession,
            Self::RenewSession { .. } => EventKind::RenewSession,
            Self::RefreshSession { .. } => EventKind::RefreshSession,
            Self::DiscardSession { .. } => EventKind::DiscardSession,
            Self::CloseConnection { .. } => EventKind::CloseConnection,
            Self::SessionEstablished { .. } => EventKind::SessionEstablished,
            Self::SessionDiscarded { .. } => EventKind::SessionDiscarded,
            Self::ConnectionOpened { .. } => EventKind::ConnectionOpened,
            Self::SessionBound { .. } => EventKind::SessionBound,
            Self::SessionUnbound { .. } => EventKind::SessionUnbound,
            Self::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            Self::UpdateReceived { .. } => EventKind::UpdateReceived,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event::{}", self.kind())
    }
}

// ============================================================================
// Internal Follow-ups
// ============================================================================

/// Results produced by workers, applied by the loop.
pub(crate) enum Internal {
    /// A session (and possibly a fresh connection) is ready to register.
    SessionReady {
        session: Arc<dyn Session>,
        target: ConnectionTarget,
        reply: Reply<SessionBinding>,
    },
    /// A session's transport resources were released (or failed to be).
    DiscardApplied {
        conn_id: ConnectionId,
        session: Arc<dyn Session>,
        cursor: Option<UpdatesState>,
        outcome: Result<(), TransportError>,
        reply: Reply<SessionBinding>,
    },
    UserResolved {
        session_id: SessionId,
        user: User,
    },
    Snapshot {
        reply: oneshot::Sender<RegistrySnapshot>,
    },
}

/// Where a ready session should be bound.
pub(crate) enum ConnectionTarget {
    /// A connection that was registered when the request was dispatched.
    Existing(ConnectionId),
    /// A connection opened by the worker for this session.
    Fresh(Arc<dyn Connection>),
}

impl Internal {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Self::SessionReady { .. } => EventKind::SessionReady,
            Self::DiscardApplied { .. } => EventKind::DiscardApplied,
            Self::UserResolved { .. } => EventKind::UserResolved,
            Self::Snapshot { .. } => EventKind::Snapshot,
        }
    }
}

/// Unit of the event queue.
pub(crate) enum Envelope {
    Event(Event),
    Internal(Internal),
}

impl Envelope {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Self::Event(event) => event.kind(),
            Self::Internal(internal) => internal.kind(),
        }
    }
}

// ============================================================================
// Event Kind
// ============================================================================

/// Discriminant of everything that passes through the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewSession,
    LoadSession,
    RenewSession,
    RefreshSession,
    DiscardSession,
    CloseConnection,
    SessionEstablished,
    SessionDiscarded,
    ConnectionOpened,
    SessionBound,
    SessionUnbound,
    ConnectionClosed,
    UpdateReceived,
    SessionReady,
    DiscardApplied,
    UserResolved,
    Snapshot,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewSession => "new_session",
            Self::LoadSession => "load_session",
            Self::RenewSession => "renew_session",
            Self::RefreshSession => "refresh_session",
            Self::DiscardSession => "discard_session",
            Self::CloseConnection => "close_connection",
            Self::SessionEstablished => "session_established",
            Self::SessionDiscarded => "session_discarded",
            Self::ConnectionOpened => "connection_opened",
            Self::SessionBound => "session_bound",
            Self::SessionUnbound => "session_unbound",
            Self::ConnectionClosed => "connection_closed",
            Self::UpdateReceived => "update_received",
            Self::SessionReady => "session_ready",
            Self::DiscardApplied => "discard_applied",
            Self::UserResolved => "user_resolved",
            Self::Snapshot => "snapshot",
        }
    }

    /// Whether the kind carries a reply channel.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::NewSession
                | Self::LoadSession
                | Self::RenewSession
                | Self::RefreshSession
                | Self::DiscardSession
                | Self::CloseConnection
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Replies
// ============================================================================

/// A session together with the connection it is (or was) bound to.
#[derive(Clone)]
pub struct SessionBinding {
    pub connection_id: ConnectionId,
    pub connection: Arc<dyn Connection>,
    pub session: Arc<dyn Session>,
}

impl SessionBinding {
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }
}

impl fmt::Debug for SessionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBinding")
            .field("connection_id", &self.connection_id)
            .field("session_id", &self.session.id())
            .finish()
    }
}

// ============================================================================
// Registry Snapshot
// ============================================================================

/// Point-in-time view of both registries, taken by the loop.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub manager_id: String,
    pub taken_at: DateTime<Utc>,
    pub connections: Vec<ConnectionInfo>,
    pub sessions: Vec<SessionInfo>,
}

impl RegistrySnapshot {
    pub fn connection(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn session(&self, id: SessionId) -> Option<&SessionInfo> {
        self.sessions.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub bound_session: Option<SessionId>,
    /// Cursor kept from the last discarded session, awaiting the next bind.
    pub retained_cursor: Option<UpdatesState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub phone: String,
    pub addr: String,
    pub connection_id: Option<ConnectionId>,
    pub discarding: bool,
    pub user: Option<User>,
    pub registered_at: DateTime<Utc>,
}
