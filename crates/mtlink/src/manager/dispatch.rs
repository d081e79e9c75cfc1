//! The dispatch loop.
//!
//! One task owns the [`Registry`] and pulls events off the queue one at a
//! time. Anything that blocks (handshakes, closing links, waiting on another
//! request) runs in a worker spawned on the shared [`TaskTracker`]. Workers
//! never see the registry: they reply to the requester directly or hand an
//! [`Internal`] follow-up back to the loop, which applies it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::config::Config;
use crate::error::ManagerError;
use crate::observer::EventObserver;
use crate::transport::{
    Connection, ConnectionId, EventSink, Session, SessionId, Transport, TransportError,
    UpdatesState, User,
};

use super::events::{ConnectionTarget, Envelope, Event, Internal, Reply, SessionBinding};
use super::registry::Registry;

/// Everything the loop needs, handed over by the manager at start.
pub(crate) struct DispatchParts {
    pub(crate) manager_id: String,
    pub(crate) config: Arc<Config>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) observer: Arc<dyn EventObserver>,
    pub(crate) rx: mpsc::UnboundedReceiver<Envelope>,
    pub(crate) sink: EventSink,
    pub(crate) cancel: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

pub(crate) struct Dispatcher {
    manager_id: String,
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn EventObserver>,
    registry: Registry,
    /// Refresh requests waiting for a session to be bound.
    bind_waiters: HashMap<SessionId, Vec<oneshot::Sender<SessionBinding>>>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    sink: EventSink,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub(crate) fn new(parts: DispatchParts) -> Self {
        Self {
            manager_id: parts.manager_id,
            config: parts.config,
            transport: parts.transport,
            observer: parts.observer,
            registry: Registry::new(),
            bind_waiters: HashMap::new(),
            rx: parts.rx,
            sink: parts.sink,
            cancel: parts.cancel,
            tracker: parts.tracker,
        }
    }

    /// Run until the cancellation token fires.
    ///
    /// Requests still queued when the loop exits are dropped, which resolves
    /// their callers with [`ManagerError::Shutdown`].
    pub(crate) async fn run(mut self) {
        let span = info_span!("manager", manager_id = %self.manager_id);
        async move {
            debug!("Dispatch loop started");
            loop {
                tokio::select! {
                    biased;

                    _ = self.cancel.cancelled() => {
                        debug!("Dispatch loop received shutdown signal");
                        break;
                    }

                    envelope = self.rx.recv() => {
                        match envelope {
                            Some(envelope) => self.dispatch(envelope),
                            None => break,
                        }
                    }
                }
            }

            self.rx.close();
            self.release_pending().await;
            debug!(
                connections = self.registry.connection_count(),
                sessions = self.registry.session_count(),
                "Dispatch loop stopped"
            );
            self.observer.on_stopped(&self.manager_id);
        }
        .instrument(span)
        .await
    }

    /// Close whatever queued workers built but the loop never registered.
    ///
    /// Every other queued envelope is dropped, resolving its caller with
    /// [`ManagerError::Shutdown`].
    async fn release_pending(&mut self) {
        while let Ok(envelope) = self.rx.try_recv() {
            let Envelope::Internal(Internal::SessionReady { session, target, .. }) = envelope else {
                continue;
            };
            debug!(session_id = %session.id(), "Closing session built during shutdown");
            close_session(session).await;
            if let ConnectionTarget::Fresh(connection) = target
                && self.registry.connection(connection.id()).is_none()
            {
                close_connection(connection).await;
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        self.observer.on_event(&self.manager_id, envelope.kind());

        match envelope {
            Envelope::Event(event) => self.handle_event(event),
            Envelope::Internal(internal) => self.handle_internal(internal),
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            // Requests
            Event::NewSession {
                conn_id,
                phone,
                addr,
                use_ipv6,
                reply,
            } => self.new_session(conn_id, phone, addr, use_ipv6, reply),
            Event::LoadSession {
                conn_id,
                phone,
                preferred_addr,
                reply,
            } => self.load_session(conn_id, phone, preferred_addr, reply),
            Event::RenewSession {
                session_id,
                phone,
                addr,
                use_ipv6,
                reply,
            } => self.renew_session(session_id, phone, addr, use_ipv6, reply),
            Event::RefreshSession {
                session_id,
                phone,
                reply,
            } => self.refresh_session(session_id, phone, reply),
            Event::DiscardSession {
                conn_id,
                session_id,
                reply,
            } => self.discard_session(conn_id, session_id, reply),
            Event::CloseConnection { conn_id, reply } => self.close_connection(conn_id, reply),

            // Notifications with a registry effect
            Event::SessionDiscarded { session_id } => self.session_discarded(session_id),
            Event::ConnectionClosed { conn_id } => self.connection_closed(conn_id),

            // Observation points only
            Event::SessionEstablished { session_id } => {
                debug!(%session_id, "Session established");
            }
            Event::ConnectionOpened { conn_id } => {
                debug!(connection_id = %conn_id, "Connection opened");
            }
            Event::SessionBound {
                conn_id,
                session_id,
            } => {
                debug!(connection_id = %conn_id, %session_id, "Session bound");
            }
            Event::SessionUnbound {
                conn_id,
                session_id,
            } => {
                debug!(connection_id = %conn_id, %session_id, "Session unbound");
            }
            Event::UpdateReceived { session_id, update } => {
                trace!(%session_id, %update, "Update received");
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SessionReady {
                session,
                target,
                reply,
            } => self.session_ready(session, target, reply),
            Internal::DiscardApplied {
                conn_id,
                session,
                cursor,
                outcome,
                reply,
            } => self.discard_applied(conn_id, session, cursor, outcome, reply),
            Internal::UserResolved { session_id, user } => self.user_resolved(session_id, user),
            Internal::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot(&self.manager_id));
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task.in_current_span());
    }

    /// Connection a new session may reuse: only one registered right now.
    fn reusable(&self, conn_id: Option<ConnectionId>) -> Option<ConnectionId> {
        let conn_id = conn_id?;
        if self.registry.connection(conn_id).is_some() {
            Some(conn_id)
        } else {
            debug!(connection_id = %conn_id, "Requested connection not registered, opening a new one");
            None
        }
    }

    // ========================================================================
    // Session Construction
    // ========================================================================

    fn new_session(
        &mut self,
        conn_id: Option<ConnectionId>,
        phone: String,
        addr: String,
        use_ipv6: bool,
        reply: Reply<SessionBinding>,
    ) {
        let reuse = self.reusable(conn_id);
        let transport = self.transport.clone();
        let config = self.config.clone();
        let sink = self.sink.clone();

        self.spawn(async move {
            let built = transport
                .new_session(&phone, &addr, use_ipv6, &config, sink.clone())
                .await;
            match built {
                Ok(session) => attach(transport.as_ref(), sink, session, reuse, reply).await,
                Err(e) => {
                    error!(%phone, %addr, error = %e, "Failed to create session");
                    let _ = reply.send(Err(ManagerError::Construction(e)));
                }
            }
        });
    }

    fn load_session(
        &mut self,
        conn_id: Option<ConnectionId>,
        phone: String,
        preferred_addr: Option<String>,
        reply: Reply<SessionBinding>,
    ) {
        let reuse = self.reusable(conn_id);
        let transport = self.transport.clone();
        let config = self.config.clone();
        let sink = self.sink.clone();

        self.spawn(async move {
            let built = transport
                .load_session(&phone, preferred_addr.as_deref(), &config, sink.clone())
                .await;
            match built {
                Ok(session) => attach(transport.as_ref(), sink, session, reuse, reply).await,
                Err(e) => {
                    error!(%phone, error = %e, "Failed to load session");
                    let _ = reply.send(Err(ManagerError::Construction(e)));
                }
            }
        });
    }

    /// Register a constructed session and bind it.
    fn session_ready(
        &mut self,
        session: Arc<dyn Session>,
        target: ConnectionTarget,
        reply: Reply<SessionBinding>,
    ) {
        let session_id = session.id();
        let fresh = match &target {
            ConnectionTarget::Fresh(connection) => Some(connection.clone()),
            ConnectionTarget::Existing(_) => None,
        };

        match self.registry.register(session.clone(), target) {
            Ok(binding) => {
                info!(
                    %session_id,
                    connection_id = %binding.connection_id,
                    phone = %session.phone_number(),
                    "Session registered"
                );
                if let Some(waiters) = self.bind_waiters.remove(&session_id) {
                    for waiter in waiters {
                        let _ = waiter.send(binding.clone());
                    }
                }
                let _ = reply.send(Ok(binding));
            }
            Err(e) => {
                warn!(%session_id, error = %e, "Session not registered");
                // The id belongs to a live session; closing would deregister it
                if !matches!(e, ManagerError::DuplicateSession(_)) {
                    self.spawn(close_session(session));
                }
                if let Some(connection) = fresh {
                    // Closing a link whose id is registered would deregister the live one
                    if self.registry.connection(connection.id()).is_none() {
                        self.spawn(close_connection(connection));
                    } else {
                        error!(
                            connection_id = %connection.id(),
                            "Transport reused a registered connection id, new link not closed"
                        );
                    }
                }
                let _ = reply.send(Err(e));
            }
        }
    }

    // ========================================================================
    // Discard
    // ========================================================================

    fn discard_session(
        &mut self,
        conn_id: ConnectionId,
        session_id: SessionId,
        reply: Reply<SessionBinding>,
    ) {
        let binding = match self.registry.begin_discard(conn_id, session_id) {
            Ok(binding) => binding,
            Err(e) => {
                debug!(%session_id, connection_id = %conn_id, error = %e, "Discard rejected");
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!(%session_id, connection_id = %conn_id, "Discarding session");
        let sink = self.sink.clone();
        self.spawn(async move {
            let session = binding.session;
            let cursor = session.updates_state();
            let outcome = session.close().await;
            sink.send_internal(Internal::DiscardApplied {
                conn_id,
                session,
                cursor,
                outcome,
                reply,
            });
        });
    }

    fn discard_applied(
        &mut self,
        conn_id: ConnectionId,
        session: Arc<dyn Session>,
        cursor: Option<UpdatesState>,
        outcome: Result<(), TransportError>,
        reply: Reply<SessionBinding>,
    ) {
        let session_id = session.id();
        if let Err(source) = outcome {
            warn!(%session_id, error = %source, "Failed to discard session");
            self.registry.abort_discard(session_id);
            let _ = reply.send(Err(ManagerError::Discard { session_id, source }));
            return;
        }

        let retained = serde_json::to_string(&cursor).unwrap_or_else(|_| format!("{cursor:?}"));
        debug!(%session_id, connection_id = %conn_id, cursor = %retained, "Retaining update cursor");

        let result = match self.registry.apply_discard(conn_id, session_id, cursor) {
            Some(connection) => Ok(SessionBinding {
                connection_id: conn_id,
                connection,
                session,
            }),
            None => Err(ManagerError::ConnectionNotFound(conn_id)),
        };
        let _ = reply.send(result);
    }

    fn session_discarded(&mut self, session_id: SessionId) {
        match self.registry.remove_session(session_id) {
            Some(_) => info!(%session_id, "Session deregistered"),
            None => debug!(%session_id, "Discard notification for unknown session"),
        }
    }

    // ========================================================================
    // Renew / Refresh
    // ========================================================================

    fn renew_session(
        &mut self,
        session_id: SessionId,
        phone: String,
        addr: String,
        use_ipv6: bool,
        reply: Reply<SessionBinding>,
    ) {
        let binding = match self.registry.binding_of(session_id) {
            Ok(binding) => binding,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!(%session_id, connection_id = %binding.connection_id, %addr, "Renewing session");
        let sink = self.sink.clone();
        self.spawn(async move {
            let _ = reply.send(renew(binding, phone, addr, use_ipv6, sink).await);
        });
    }

    fn refresh_session(&mut self, session_id: SessionId, phone: String, reply: Reply<SessionBinding>) {
        let sink = self.sink.clone();
        match self.registry.binding_of(session_id) {
            Ok(binding) => {
                info!(%session_id, connection_id = %binding.connection_id, "Refreshing session");
                self.spawn(async move {
                    let _ = reply.send(refresh(binding, phone, sink).await);
                });
            }
            // A registered but unbound session never binds again
            Err(ManagerError::SessionNotFound(_)) => {
                debug!(%session_id, "Refresh waiting for session to be bound");
                let (tx, rx) = oneshot::channel();
                self.bind_waiters
                    .retain(|_, waiters| waiters.iter().any(|w| !w.is_closed()));
                self.bind_waiters.entry(session_id).or_default().push(tx);

                let wait = self.config.manager.bind_wait_timeout();
                self.spawn(async move {
                    let binding = match tokio::time::timeout(wait, rx).await {
                        Ok(Ok(binding)) => binding,
                        Ok(Err(_)) => {
                            let _ = reply.send(Err(ManagerError::Shutdown));
                            return;
                        }
                        Err(_) => {
                            warn!(%session_id, ?wait, "Session was not bound in time for refresh");
                            let _ = reply.send(Err(ManagerError::NotBound(session_id)));
                            return;
                        }
                    };
                    let _ = reply.send(refresh(binding, phone, sink).await);
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    // ========================================================================
    // Connections
    // ========================================================================

    fn close_connection(&mut self, conn_id: ConnectionId, reply: Reply<()>) {
        let Some(slot) = self.registry.connection(conn_id) else {
            let _ = reply.send(Err(ManagerError::ConnectionNotFound(conn_id)));
            return;
        };
        let Some(session_id) = slot.bound else {
            let _ = reply.send(Err(ManagerError::NoBoundSession(conn_id)));
            return;
        };
        let Some(session) = self.registry.session(session_id) else {
            let _ = reply.send(Err(ManagerError::SessionNotFound(session_id)));
            return;
        };

        let binding = SessionBinding {
            connection_id: conn_id,
            connection: slot.connection.clone(),
            session: session.session.clone(),
        };
        info!(connection_id = %conn_id, %session_id, "Closing connection");
        self.spawn(async move {
            if let Err(e) = discard_through_session(&binding).await {
                warn!(connection_id = %conn_id, %session_id, error = %e, "Connection kept, discard failed");
                let _ = reply.send(Err(ManagerError::CloseConnection {
                    session_id,
                    source: Box::new(e),
                }));
                return;
            }
            let result = binding
                .connection
                .close()
                .await
                .map_err(|source| ManagerError::ConnectionClose {
                    connection_id: conn_id,
                    source,
                });
            let _ = reply.send(result);
        });
    }

    fn connection_closed(&mut self, conn_id: ConnectionId) {
        match self.registry.remove_connection(conn_id) {
            Some(_) => info!(connection_id = %conn_id, "Connection deregistered"),
            None => debug!(connection_id = %conn_id, "Close notification for unknown connection"),
        }
    }

    fn user_resolved(&mut self, session_id: SessionId, user: User) {
        let user_id = user.id;
        if self.registry.set_user(session_id, user) {
            debug!(%session_id, user_id, "Session identity resolved");
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

/// Open a connection if needed, then hand the session back for registration.
async fn attach(
    transport: &dyn Transport,
    sink: EventSink,
    session: Arc<dyn Session>,
    reuse: Option<ConnectionId>,
    reply: Reply<SessionBinding>,
) {
    let target = match reuse {
        Some(conn_id) => ConnectionTarget::Existing(conn_id),
        None => match transport.new_connection(sink.clone()).await {
            Ok(connection) => ConnectionTarget::Fresh(connection),
            Err(e) => {
                error!(session_id = %session.id(), error = %e, "Failed to open connection");
                close_session(session).await;
                let _ = reply.send(Err(ManagerError::Construction(e)));
                return;
            }
        },
    };
    let fresh = match &target {
        ConnectionTarget::Fresh(connection) => Some(connection.clone()),
        ConnectionTarget::Existing(_) => None,
    };
    let ready = Internal::SessionReady {
        session: session.clone(),
        target,
        reply,
    };
    if !sink.send_internal(ready) {
        debug!(session_id = %session.id(), "Manager stopped before session was registered");
        close_session(session).await;
        if let Some(connection) = fresh {
            close_connection(connection).await;
        }
    }
}

/// Discard a session by routing the request through the session itself.
async fn discard_through_session(binding: &SessionBinding) -> Result<SessionBinding, ManagerError> {
    let (tx, rx) = oneshot::channel();
    binding.session.notify(Event::DiscardSession {
        conn_id: binding.connection_id,
        session_id: binding.session_id(),
        reply: tx,
    });
    rx.await.unwrap_or(Err(ManagerError::Shutdown))
}

// TODO: reconcile updates missed between discard and rebind (updates.getDifference
// from the retained cursor) once the transport exposes a difference call.
async fn renew(
    binding: SessionBinding,
    phone: String,
    addr: String,
    use_ipv6: bool,
    sink: EventSink,
) -> Result<SessionBinding, ManagerError> {
    let session_id = binding.session_id();
    discard_through_session(&binding)
        .await
        .map_err(|e| ManagerError::DiscardStep {
            session_id,
            source: Box::new(e),
        })?;

    let (tx, rx) = oneshot::channel();
    sink.send(Event::NewSession {
        conn_id: Some(binding.connection_id),
        phone,
        addr: addr.clone(),
        use_ipv6,
        reply: tx,
    });
    rx.await
        .unwrap_or(Err(ManagerError::Shutdown))
        .map_err(|e| ManagerError::ConnectStep {
            addr,
            source: Box::new(e),
        })
}

async fn refresh(
    binding: SessionBinding,
    phone: String,
    sink: EventSink,
) -> Result<SessionBinding, ManagerError> {
    let session_id = binding.session_id();
    discard_through_session(&binding)
        .await
        .map_err(|e| ManagerError::DiscardStep {
            session_id,
            source: Box::new(e),
        })?;

    let (tx, rx) = oneshot::channel();
    sink.send(Event::LoadSession {
        conn_id: Some(binding.connection_id),
        phone: phone.clone(),
        preferred_addr: Some(binding.session.addr().to_string()),
        reply: tx,
    });
    rx.await
        .unwrap_or(Err(ManagerError::Shutdown))
        .map_err(|e| ManagerError::ReloadStep {
            phone,
            source: Box::new(e),
        })
}

async fn close_session(session: Arc<dyn Session>) {
    if let Err(e) = session.close().await {
        warn!(session_id = %session.id(), error = %e, "Failed to close unregistered session");
    }
}

async fn close_connection(connection: Arc<dyn Connection>) {
    if let Err(e) = connection.close().await {
        warn!(connection_id = %connection.id(), error = %e, "Failed to close unregistered connection");
    }
}
