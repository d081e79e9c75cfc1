//! Collaborator boundary of the manager.
//!
//! The manager does not speak the wire protocol. Everything that touches a
//! socket, performs the key exchange, or encodes API calls lives behind the
//! traits in this module and is supplied by the embedding application:
//!
//! - [`Transport`] constructs sessions (fresh handshake or persisted state)
//!   and connections.
//! - [`Session`] is one authenticated identity: key material, sequence state
//!   and the pending-update cursor.
//! - [`Connection`] is one physical link hosting at most one bound session,
//!   and the pass-through for remote calls.
//!
//! Collaborators report lifecycle changes by sending notification [`Event`]s
//! through the [`EventSink`] they were handed at construction. The manager
//! relies on two of them for deregistration:
//!
//! - [`Session::close`] must eventually raise [`Event::SessionDiscarded`].
//! - [`Connection::close`] must eventually raise [`Event::ConnectionClosed`].

mod error;
pub mod rpc;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::Config;
use crate::manager::Event;
use crate::manager::events::{Envelope, Internal};

pub use error::TransportError;
pub use rpc::RpcError;
pub use types::{ConnectionId, SentCode, SessionId, UpdatesState, User};

// ============================================================================
// Event Sink
// ============================================================================

/// Producer side of the manager's event queue.
///
/// Cheap to clone. Sending never blocks; once the manager has stopped, events
/// are dropped and [`EventSink::send`] returns `false`.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { tx }
    }

    /// Push an event onto the queue.
    pub fn send(&self, event: Event) -> bool {
        self.push(Envelope::Event(event))
    }

    pub(crate) fn send_internal(&self, internal: Internal) -> bool {
        self.push(Envelope::Internal(internal))
    }

    fn push(&self, envelope: Envelope) -> bool {
        match self.tx.send(envelope) {
            Ok(()) => true,
            Err(rejected) => {
                debug!(event = %rejected.0.kind(), "Event queue closed, dropping event");
                false
            }
        }
    }

    /// Whether the manager has stopped consuming events.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// Session
// ============================================================================

/// One logical authenticated identity.
#[async_trait]
pub trait Session: Send + Sync {
    fn id(&self) -> SessionId;

    fn phone_number(&self) -> &str;

    /// Server endpoint the session was established against.
    fn addr(&self) -> &str;

    /// Current pending-update cursor, if the session has synchronised one.
    fn updates_state(&self) -> Option<UpdatesState>;

    /// Inject an event as if the session had raised it.
    fn notify(&self, event: Event);

    /// Tear down transport-facing resources.
    ///
    /// Must raise [`Event::SessionDiscarded`] once teardown completes.
    async fn close(&self) -> Result<(), TransportError>;
}

// ============================================================================
// Connection
// ============================================================================

/// One physical link to a server endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Attach a session, resuming updates from `resume_from` when present.
    ///
    /// Called only by the manager's dispatch loop and must not block: hand
    /// the session to the link's own tasks and return.
    fn bind(&self, session: Arc<dyn Session>, resume_from: Option<UpdatesState>);

    /// Detach the bound session, returning its id. Must not block.
    fn unbind(&self) -> Option<SessionId>;

    /// Session currently attached to the link.
    fn session(&self) -> Option<Arc<dyn Session>>;

    /// Close the link. Must raise [`Event::ConnectionClosed`].
    async fn close(&self) -> Result<(), TransportError>;

    /// "Who am I": the account the bound session is authorized as.
    async fn get_self(&self) -> Result<User, RpcError>;

    /// Ask the server to send a login code to `phone`.
    async fn send_code(&self, phone: &str) -> Result<SentCode, RpcError>;
}

// ============================================================================
// Transport
// ============================================================================

/// Factory for sessions and connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a fresh handshake against `addr`.
    async fn new_session(
        &self,
        phone: &str,
        addr: &str,
        use_ipv6: bool,
        config: &Config,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, TransportError>;

    /// Rebuild a session from persisted key material.
    async fn load_session(
        &self,
        phone: &str,
        preferred_addr: Option<&str>,
        config: &Config,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, TransportError>;

    /// Open a new physical link. Should raise [`Event::ConnectionOpened`].
    async fn new_connection(&self, events: EventSink)
    -> Result<Arc<dyn Connection>, TransportError>;
}
