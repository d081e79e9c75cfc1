//! `Manager`: the façade in front of the dispatch loop.
//!
//! Each method builds a request event with a private one-shot reply channel,
//! pushes it onto the queue, and waits for the reply under the configured
//! request timeout.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::config::Config;
use crate::error::ManagerError;
use crate::observer::{EventObserver, NoopObserver};
use crate::store::{FileSessionStore, SessionStore};
use crate::transport::{ConnectionId, EventSink, RpcError, SentCode, SessionId, Transport};

use super::dispatch::{DispatchParts, Dispatcher};
use super::events::{Event, Internal, RegistrySnapshot, Reply, SessionBinding};

/// Handle to a running session/connection manager.
///
/// Dropping the handle stops the dispatch loop without closing connections;
/// call [`Manager::finish`] for an orderly shutdown.
pub struct Manager {
    id: String,
    config: Arc<Config>,
    store: Arc<dyn SessionStore>,
    sink: EventSink,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Manager {
    /// Start a manager with the file session store and no observer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self, ManagerError> {
        let store = Arc::new(FileSessionStore::new(&config.session_home));
        Self::with_parts(config, transport, store, Arc::new(NoopObserver))
    }

    /// Start a manager with explicit collaborators.
    ///
    /// Validates `config` first; the dispatch loop is running when this returns.
    pub fn with_parts(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<dyn SessionStore>,
        observer: Arc<dyn EventObserver>,
    ) -> Result<Self, ManagerError> {
        config.check()?;

        let id = Ulid::new().to_string();
        let config = Arc::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let dispatcher = Dispatcher::new(DispatchParts {
            manager_id: id.clone(),
            config: config.clone(),
            transport,
            observer,
            rx,
            sink: sink.clone(),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
        });
        tracker.spawn(dispatcher.run());

        info!(manager_id = %id, "Manager started");
        Ok(Self {
            id,
            config,
            store,
            sink,
            cancel,
            tracker,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sink for injecting notifications as a collaborator would.
    pub fn event_sink(&self) -> EventSink {
        self.sink.clone()
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    /// Whether a persisted session exists for `phone`.
    pub async fn is_authenticated(&self, phone: &str) -> bool {
        self.store.exists(phone).await
    }

    /// Load the persisted session for `phone` and confirm it is still logged in.
    ///
    /// If the server does not recognise the session, fails with
    /// [`ManagerError::Unauthenticated`]; the loaded session stays registered
    /// on the connection named in the error.
    pub async fn load_authentication(
        &self,
        phone: &str,
        preferred_addr: Option<&str>,
    ) -> Result<SessionBinding, ManagerError> {
        let binding = self.load_session(None, phone, preferred_addr).await?;

        let who = self
            .timed("get_self", async { Ok(binding.connection.get_self().await) })
            .await?;
        match who {
            Ok(user) => {
                info!(
                    manager_id = %self.id,
                    session_id = %binding.session_id(),
                    user_id = user.id,
                    "Authenticated"
                );
                self.sink.send_internal(Internal::UserResolved {
                    session_id: binding.session_id(),
                    user,
                });
                Ok(binding)
            }
            Err(source) => {
                warn!(manager_id = %self.id, %phone, error = %source, "Stored session is not authorized");
                Err(ManagerError::Unauthenticated {
                    connection_id: binding.connection_id,
                    source,
                })
            }
        }
    }

    /// Start a fresh login: handshake a new session and request a login code.
    ///
    /// A data-center redirect from the server is followed once by renewing
    /// the session against the named data center's address.
    pub async fn new_authentication(
        &self,
        phone: &str,
        addr: &str,
        use_ipv6: bool,
    ) -> Result<(SessionBinding, SentCode), ManagerError> {
        let binding = self.new_session(None, phone, addr, use_ipv6).await?;

        let sent = self.send_code(&binding, phone).await?;
        let rpc = match sent {
            Ok(code) => return Ok((binding, code)),
            Err(rpc) => rpc,
        };
        let Some(dc) = rpc.migrate_dc() else {
            if let Some(seconds) = rpc.flood_wait_seconds() {
                warn!(manager_id = %self.id, %phone, seconds, "Login code request rate limited");
            }
            return Err(ManagerError::Rpc(rpc));
        };
        let target = self
            .config
            .data_centers
            .addr_of(dc)
            .ok_or(ManagerError::UnknownDataCenter(dc))?
            .to_string();

        info!(manager_id = %self.id, %phone, dc, addr = %target, "Following data center redirect");
        let binding = self
            .renew_session(binding.session_id(), phone, &target, use_ipv6)
            .await?;
        let code = self
            .send_code(&binding, phone)
            .await?
            .map_err(ManagerError::Rpc)?;
        Ok((binding, code))
    }

    async fn send_code(
        &self,
        binding: &SessionBinding,
        phone: &str,
    ) -> Result<Result<SentCode, RpcError>, ManagerError> {
        self.timed("send_code", async { Ok(binding.connection.send_code(phone).await) })
            .await
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    /// Handshake a new session; reuse `conn_id` if it is registered.
    pub async fn new_session(
        &self,
        conn_id: Option<ConnectionId>,
        phone: &str,
        addr: &str,
        use_ipv6: bool,
    ) -> Result<SessionBinding, ManagerError> {
        self.request("new_session", |reply| Event::NewSession {
            conn_id,
            phone: phone.to_string(),
            addr: addr.to_string(),
            use_ipv6,
            reply,
        })
        .await
    }

    /// Rebuild a session from persisted state; reuse `conn_id` if registered.
    pub async fn load_session(
        &self,
        conn_id: Option<ConnectionId>,
        phone: &str,
        preferred_addr: Option<&str>,
    ) -> Result<SessionBinding, ManagerError> {
        self.request("load_session", |reply| Event::LoadSession {
            conn_id,
            phone: phone.to_string(),
            preferred_addr: preferred_addr.map(str::to_string),
            reply,
        })
        .await
    }

    pub async fn discard_session(
        &self,
        conn_id: ConnectionId,
        session_id: SessionId,
    ) -> Result<SessionBinding, ManagerError> {
        self.request("discard_session", |reply| Event::DiscardSession {
            conn_id,
            session_id,
            reply,
        })
        .await
    }

    /// Replace a bound session with a freshly handshaked one on the same connection.
    pub async fn renew_session(
        &self,
        session_id: SessionId,
        phone: &str,
        addr: &str,
        use_ipv6: bool,
    ) -> Result<SessionBinding, ManagerError> {
        self.request("renew_session", |reply| Event::RenewSession {
            session_id,
            phone: phone.to_string(),
            addr: addr.to_string(),
            use_ipv6,
            reply,
        })
        .await
    }

    /// Reload a session from persisted state on the same connection.
    ///
    /// Waits for the session to be registered and bound first.
    pub async fn refresh_session(
        &self,
        session_id: SessionId,
        phone: &str,
    ) -> Result<SessionBinding, ManagerError> {
        self.request("refresh_session", |reply| Event::RefreshSession {
            session_id,
            phone: phone.to_string(),
            reply,
        })
        .await
    }

    pub async fn close_connection(&self, conn_id: ConnectionId) -> Result<(), ManagerError> {
        self.request("close_connection", |reply| Event::CloseConnection { conn_id, reply })
            .await
    }

    /// Current contents of both registries.
    pub async fn snapshot(&self) -> Result<RegistrySnapshot, ManagerError> {
        let (tx, rx) = oneshot::channel();
        if !self.sink.send_internal(Internal::Snapshot { reply: tx }) {
            return Err(ManagerError::Shutdown);
        }
        self.timed("snapshot", async { rx.await.map_err(|_| ManagerError::Shutdown) })
            .await
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Close every registered connection, then stop the loop and wait for
    /// all workers to drain.
    ///
    /// Call at most once. Requests issued afterwards fail with
    /// [`ManagerError::Shutdown`].
    pub async fn finish(&self) {
        let connections = match self.snapshot().await {
            Ok(snapshot) => snapshot.connections,
            Err(e) => {
                warn!(manager_id = %self.id, error = %e, "Could not list connections for shutdown");
                Vec::new()
            }
        };

        let closes = connections.iter().map(|info| async move {
            (info.id, self.close_connection(info.id).await)
        });
        for (conn_id, result) in join_all(closes).await {
            match result {
                Ok(()) => {}
                Err(ManagerError::NoBoundSession(_)) => {
                    debug!(manager_id = %self.id, connection_id = %conn_id, "Leaving idle connection open");
                }
                Err(e) => {
                    warn!(manager_id = %self.id, connection_id = %conn_id, error = %e, "Failed to close connection");
                }
            }
        }

        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!(manager_id = %self.id, "Manager stopped");
    }

    /// Whether the dispatch loop has stopped.
    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled() && self.tracker.is_empty()
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn request<T>(
        &self,
        operation: &'static str,
        build: impl FnOnce(Reply<T>) -> Event,
    ) -> Result<T, ManagerError> {
        let (tx, rx) = oneshot::channel();
        if !self.sink.send(build(tx)) {
            return Err(ManagerError::Shutdown);
        }
        self.timed(operation, async {
            rx.await.unwrap_or(Err(ManagerError::Shutdown))
        })
        .await
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, ManagerError>>,
    ) -> Result<T, ManagerError> {
        let after = self.config.manager.request_timeout();
        tokio::time::timeout(after, fut)
            .await
            .unwrap_or_else(|_| Err(ManagerError::Timeout { operation, after }))
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
