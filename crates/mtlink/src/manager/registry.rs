//! Connection and session registries.
//!
//! Owned by the dispatch loop and never shared: every method takes `&mut self`
//! or `&self` on the loop's own value, so mutations are totally ordered by the
//! order in which the loop processes events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::ManagerError;
use crate::transport::{Connection, ConnectionId, Session, SessionId, UpdatesState, User};

use super::events::{
    ConnectionInfo, ConnectionTarget, RegistrySnapshot, SessionBinding, SessionInfo,
};

// ============================================================================
// Slots
// ============================================================================

pub(crate) struct ConnectionSlot {
    pub(crate) connection: Arc<dyn Connection>,
    pub(crate) bound: Option<SessionId>,
    /// Cursor of the last session discarded from this connection.
    pub(crate) retained_cursor: Option<UpdatesState>,
}

pub(crate) struct SessionSlot {
    pub(crate) session: Arc<dyn Session>,
    pub(crate) connection_id: Option<ConnectionId>,
    /// A discard is in flight; the session cannot be discarded again.
    pub(crate) discarding: bool,
    pub(crate) user: Option<User>,
    pub(crate) registered_at: DateTime<Utc>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub(crate) struct Registry {
    connections: HashMap<ConnectionId, ConnectionSlot>,
    sessions: HashMap<SessionId, SessionSlot>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Option<&ConnectionSlot> {
        self.connections.get(&id)
    }

    pub(crate) fn session(&self, id: SessionId) -> Option<&SessionSlot> {
        self.sessions.get(&id)
    }

    /// Current binding of a registered session.
    pub(crate) fn binding_of(&self, session_id: SessionId) -> Result<SessionBinding, ManagerError> {
        let slot = self
            .sessions
            .get(&session_id)
            .ok_or(ManagerError::SessionNotFound(session_id))?;
        let connection_id = slot
            .connection_id
            .ok_or(ManagerError::NotBound(session_id))?;
        let conn = self
            .connections
            .get(&connection_id)
            .ok_or(ManagerError::ConnectionNotFound(connection_id))?;
        if conn.bound != Some(session_id) || slot.discarding {
            return Err(ManagerError::NotBound(session_id));
        }
        Ok(SessionBinding {
            connection_id,
            connection: conn.connection.clone(),
            session: slot.session.clone(),
        })
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Register a session and bind it to its target connection.
    ///
    /// Either everything is registered or nothing is.
    pub(crate) fn register(
        &mut self,
        session: Arc<dyn Session>,
        target: ConnectionTarget,
    ) -> Result<SessionBinding, ManagerError> {
        let session_id = session.id();
        if self.sessions.contains_key(&session_id) {
            return Err(ManagerError::DuplicateSession(session_id));
        }

        let connection_id = match &target {
            ConnectionTarget::Existing(id) => *id,
            ConnectionTarget::Fresh(connection) => connection.id(),
        };
        match self.connections.get(&connection_id) {
            Some(slot) => {
                if matches!(target, ConnectionTarget::Fresh(_)) {
                    return Err(ManagerError::DuplicateConnection(connection_id));
                }
                if let Some(bound) = slot.bound {
                    return Err(ManagerError::ConnectionBusy {
                        connection_id,
                        session_id: bound,
                    });
                }
            }
            None => {
                let ConnectionTarget::Fresh(connection) = target else {
                    return Err(ManagerError::ConnectionNotFound(connection_id));
                };
                self.connections.insert(
                    connection_id,
                    ConnectionSlot {
                        connection,
                        bound: None,
                        retained_cursor: None,
                    },
                );
            }
        }

        // Validated above
        let Some(slot) = self.connections.get_mut(&connection_id) else {
            return Err(ManagerError::ConnectionNotFound(connection_id));
        };
        let resume_from = slot.retained_cursor.take();
        slot.connection.bind(session.clone(), resume_from);
        slot.bound = Some(session_id);
        let connection = slot.connection.clone();

        self.sessions.insert(
            session_id,
            SessionSlot {
                session: session.clone(),
                connection_id: Some(connection_id),
                discarding: false,
                user: None,
                registered_at: Utc::now(),
            },
        );

        Ok(SessionBinding {
            connection_id,
            connection,
            session,
        })
    }

    // ------------------------------------------------------------------------
    // Discard
    // ------------------------------------------------------------------------

    /// Mark a bound session as being discarded from `conn_id`.
    pub(crate) fn begin_discard(
        &mut self,
        conn_id: ConnectionId,
        session_id: SessionId,
    ) -> Result<SessionBinding, ManagerError> {
        let conn = self
            .connections
            .get(&conn_id)
            .ok_or(ManagerError::ConnectionNotFound(conn_id))?;
        let slot = self
            .sessions
            .get_mut(&session_id)
            .ok_or(ManagerError::SessionNotFound(session_id))?;
        if slot.discarding || conn.bound != Some(session_id) {
            return Err(ManagerError::NotBound(session_id));
        }
        slot.discarding = true;
        Ok(SessionBinding {
            connection_id: conn_id,
            connection: conn.connection.clone(),
            session: slot.session.clone(),
        })
    }

    /// Detach a discarded session and keep its cursor on the connection.
    ///
    /// The session entry itself stays until [`Registry::remove_session`].
    pub(crate) fn apply_discard(
        &mut self,
        conn_id: ConnectionId,
        session_id: SessionId,
        cursor: Option<UpdatesState>,
    ) -> Option<Arc<dyn Connection>> {
        if let Some(slot) = self.sessions.get_mut(&session_id) {
            slot.connection_id = None;
        }
        let conn = self.connections.get_mut(&conn_id)?;
        if conn.bound == Some(session_id) {
            conn.connection.unbind();
            conn.bound = None;
            conn.retained_cursor = cursor;
        }
        Some(conn.connection.clone())
    }

    /// Allow another discard attempt after a failed one.
    pub(crate) fn abort_discard(&mut self, session_id: SessionId) {
        if let Some(slot) = self.sessions.get_mut(&session_id) {
            slot.discarding = false;
        }
    }

    // ------------------------------------------------------------------------
    // Deregistration
    // ------------------------------------------------------------------------

    /// Remove a session. No-op for unknown ids.
    ///
    /// A session that closed on its own (no discard in flight) is also
    /// detached from its connection, keeping its cursor there.
    pub(crate) fn remove_session(&mut self, session_id: SessionId) -> Option<SessionSlot> {
        let slot = self.sessions.remove(&session_id)?;
        if !slot.discarding
            && let Some(conn_id) = slot.connection_id
            && let Some(conn) = self.connections.get_mut(&conn_id)
            && conn.bound == Some(session_id)
        {
            conn.connection.unbind();
            conn.bound = None;
            conn.retained_cursor = slot.session.updates_state();
        }
        Some(slot)
    }

    /// Remove a connection. No-op for unknown ids.
    pub(crate) fn remove_connection(&mut self, conn_id: ConnectionId) -> Option<ConnectionSlot> {
        let slot = self.connections.remove(&conn_id)?;
        if let Some(session_id) = slot.bound
            && let Some(session) = self.sessions.get_mut(&session_id)
        {
            session.connection_id = None;
        }
        Some(slot)
    }

    pub(crate) fn set_user(&mut self, session_id: SessionId, user: User) -> bool {
        match self.sessions.get_mut(&session_id) {
            Some(slot) => {
                slot.user = Some(user);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    pub(crate) fn snapshot(&self, manager_id: &str) -> RegistrySnapshot {
        let mut connections: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|(id, slot)| ConnectionInfo {
                id: *id,
                bound_session: slot.bound,
                retained_cursor: slot.retained_cursor,
            })
            .collect();
        connections.sort_by_key(|c| c.id);

        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|(id, slot)| SessionInfo {
                id: *id,
                phone: slot.session.phone_number().to_string(),
                addr: slot.session.addr().to_string(),
                connection_id: slot.connection_id,
                discarding: slot.discarding,
                user: slot.user.clone(),
                registered_at: slot.registered_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.id);

        RegistrySnapshot {
            manager_id: manager_id.to_string(),
            taken_at: Utc::now(),
            connections,
            sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::manager::Event;
    use crate::transport::{RpcError, SentCode, TransportError};

    // ========================================================================
    // Stubs
    // ========================================================================

    struct StubSession {
        id: SessionId,
        cursor: Option<UpdatesState>,
    }

    #[async_trait]
    impl Session for StubSession {
        fn id(&self) -> SessionId {
            self.id
        }
        fn phone_number(&self) -> &str {
            "15550001"
        }
        fn addr(&self) -> &str {
            "10.0.0.1:443"
        }
        fn updates_state(&self) -> Option<UpdatesState> {
            self.cursor
        }
        fn notify(&self, _event: Event) {}
        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubConnection {
        id: i32,
        binds: Mutex<Vec<(SessionId, Option<UpdatesState>)>>,
        unbinds: Mutex<usize>,
    }

    #[async_trait]
    impl Connection for StubConnection {
        fn id(&self) -> ConnectionId {
            ConnectionId(self.id)
        }
        fn bind(&self, session: Arc<dyn Session>, resume_from: Option<UpdatesState>) {
            self.binds.lock().unwrap().push((session.id(), resume_from));
        }
        fn unbind(&self) -> Option<SessionId> {
            *self.unbinds.lock().unwrap() += 1;
            None
        }
        fn session(&self) -> Option<Arc<dyn Session>> {
            None
        }
        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn get_self(&self) -> Result<User, RpcError> {
            Err(RpcError::new(401, "AUTH_KEY_UNREGISTERED"))
        }
        async fn send_code(&self, _phone: &str) -> Result<SentCode, RpcError> {
            Err(RpcError::new(500, "UNSUPPORTED"))
        }
    }

    fn session(id: i64) -> Arc<dyn Session> {
        Arc::new(StubSession {
            id: SessionId(id),
            cursor: None,
        })
    }

    fn session_with_cursor(id: i64, pts: i32) -> Arc<dyn Session> {
        Arc::new(StubSession {
            id: SessionId(id),
            cursor: Some(UpdatesState {
                pts,
                ..Default::default()
            }),
        })
    }

    fn connection(id: i32) -> Arc<StubConnection> {
        Arc::new(StubConnection {
            id,
            ..Default::default()
        })
    }

    // ========================================================================
    // Registration
    // ========================================================================

    #[test]
    fn register_fresh_connection_binds_session() {
        let mut registry = Registry::new();
        let conn = connection(1);
        let binding = registry
            .register(session(10), ConnectionTarget::Fresh(conn.clone()))
            .unwrap();

        assert_eq!(binding.connection_id, ConnectionId(1));
        assert_eq!(binding.session_id(), SessionId(10));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(
            registry.connection(ConnectionId(1)).unwrap().bound,
            Some(SessionId(10))
        );
        assert_eq!(conn.binds.lock().unwrap().as_slice(), &[(SessionId(10), None)]);
    }

    #[test]
    fn register_rejects_duplicate_session() {
        let mut registry = Registry::new();
        registry
            .register(session(10), ConnectionTarget::Fresh(connection(1)))
            .unwrap();
        let err = registry
            .register(session(10), ConnectionTarget::Fresh(connection(2)))
            .unwrap_err();

        assert!(matches!(err, ManagerError::DuplicateSession(SessionId(10))));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn register_rejects_fresh_connection_with_registered_id() {
        let mut registry = Registry::new();
        let original = connection(1);
        let binding = registry
            .register(session(10), ConnectionTarget::Fresh(original.clone()))
            .unwrap();
        let cursor = binding.session.updates_state();
        registry.begin_discard(ConnectionId(1), SessionId(10)).unwrap();
        registry.apply_discard(ConnectionId(1), SessionId(10), cursor);

        let impostor = connection(1);
        let err = registry
            .register(session(11), ConnectionTarget::Fresh(impostor.clone()))
            .unwrap_err();

        assert!(matches!(err, ManagerError::DuplicateConnection(ConnectionId(1))));
        assert!(registry.session(SessionId(11)).is_none());
        assert!(impostor.binds.lock().unwrap().is_empty());
        assert_eq!(original.binds.lock().unwrap().len(), 1);
        assert_eq!(registry.connection(ConnectionId(1)).unwrap().bound, None);
    }

    #[test]
    fn register_on_busy_connection_changes_nothing() {
        let mut registry = Registry::new();
        registry
            .register(session(10), ConnectionTarget::Fresh(connection(1)))
            .unwrap();
        let err = registry
            .register(session(11), ConnectionTarget::Existing(ConnectionId(1)))
            .unwrap_err();

        assert!(matches!(
            err,
            ManagerError::ConnectionBusy {
                connection_id: ConnectionId(1),
                session_id: SessionId(10)
            }
        ));
        assert_eq!(registry.session_count(), 1);
        assert!(registry.session(SessionId(11)).is_none());
    }

    #[test]
    fn register_on_missing_connection_fails() {
        let mut registry = Registry::new();
        let err = registry
            .register(session(10), ConnectionTarget::Existing(ConnectionId(9)))
            .unwrap_err();
        assert!(matches!(err, ManagerError::ConnectionNotFound(ConnectionId(9))));
        assert_eq!(registry.session_count(), 0);
    }

    // ========================================================================
    // Discard
    // ========================================================================

    #[test]
    fn discard_moves_cursor_to_next_bind() {
        let mut registry = Registry::new();
        let conn = connection(1);
        registry
            .register(session_with_cursor(10, 77), ConnectionTarget::Fresh(conn.clone()))
            .unwrap();

        let binding = registry.begin_discard(ConnectionId(1), SessionId(10)).unwrap();
        let cursor = binding.session.updates_state();
        registry.apply_discard(ConnectionId(1), SessionId(10), cursor);

        let slot = registry.connection(ConnectionId(1)).unwrap();
        assert_eq!(slot.bound, None);
        assert_eq!(slot.retained_cursor.map(|c| c.pts), Some(77));
        assert_eq!(*conn.unbinds.lock().unwrap(), 1);
        // Session entry survives until its discard notification
        assert!(registry.session(SessionId(10)).is_some());

        registry
            .register(session(11), ConnectionTarget::Existing(ConnectionId(1)))
            .unwrap();
        let binds = conn.binds.lock().unwrap();
        assert_eq!(binds[1].0, SessionId(11));
        assert_eq!(binds[1].1.map(|c| c.pts), Some(77));
        assert!(
            registry
                .connection(ConnectionId(1))
                .unwrap()
                .retained_cursor
                .is_none()
        );
    }

    #[test]
    fn begin_discard_twice_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(session(10), ConnectionTarget::Fresh(connection(1)))
            .unwrap();
        registry.begin_discard(ConnectionId(1), SessionId(10)).unwrap();
        let err = registry
            .begin_discard(ConnectionId(1), SessionId(10))
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotBound(SessionId(10))));

        registry.abort_discard(SessionId(10));
        assert!(registry.begin_discard(ConnectionId(1), SessionId(10)).is_ok());
    }

    #[test]
    fn begin_discard_on_wrong_connection_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(session(10), ConnectionTarget::Fresh(connection(1)))
            .unwrap();
        registry
            .register(session(20), ConnectionTarget::Fresh(connection(2)))
            .unwrap();
        let err = registry
            .begin_discard(ConnectionId(2), SessionId(10))
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotBound(SessionId(10))));
    }

    // ========================================================================
    // Deregistration
    // ========================================================================

    #[test]
    fn remove_session_is_idempotent() {
        let mut registry = Registry::new();
        registry
            .register(session(10), ConnectionTarget::Fresh(connection(1)))
            .unwrap();
        registry.begin_discard(ConnectionId(1), SessionId(10)).unwrap();
        registry.apply_discard(ConnectionId(1), SessionId(10), None);

        assert!(registry.remove_session(SessionId(10)).is_some());
        assert!(registry.remove_session(SessionId(10)).is_none());
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn spontaneous_session_close_frees_connection() {
        let mut registry = Registry::new();
        let conn = connection(1);
        registry
            .register(session_with_cursor(10, 5), ConnectionTarget::Fresh(conn.clone()))
            .unwrap();

        registry.remove_session(SessionId(10));

        let slot = registry.connection(ConnectionId(1)).unwrap();
        assert_eq!(slot.bound, None);
        assert_eq!(slot.retained_cursor.map(|c| c.pts), Some(5));
        assert_eq!(*conn.unbinds.lock().unwrap(), 1);
    }

    #[test]
    fn remove_connection_unlinks_session() {
        let mut registry = Registry::new();
        registry
            .register(session(10), ConnectionTarget::Fresh(connection(1)))
            .unwrap();

        assert!(registry.remove_connection(ConnectionId(1)).is_some());
        assert!(registry.remove_connection(ConnectionId(1)).is_none());
        assert_eq!(registry.session(SessionId(10)).unwrap().connection_id, None);
        assert!(matches!(
            registry.binding_of(SessionId(10)),
            Err(ManagerError::NotBound(SessionId(10)))
        ));
    }

    // ========================================================================
    // Snapshot
    // ========================================================================

    #[test]
    fn snapshot_is_sorted_and_carries_user() {
        let mut registry = Registry::new();
        registry
            .register(session(30), ConnectionTarget::Fresh(connection(3)))
            .unwrap();
        registry
            .register(session(10), ConnectionTarget::Fresh(connection(1)))
            .unwrap();
        assert!(registry.set_user(
            SessionId(10),
            User {
                id: 5,
                first_name: "Ada".to_string(),
                last_name: None,
                username: None,
                phone: None,
            }
        ));
        assert!(!registry.set_user(
            SessionId(99),
            User {
                id: 6,
                first_name: "Nobody".to_string(),
                last_name: None,
                username: None,
                phone: None,
            }
        ));

        let snapshot = registry.snapshot("01TEST");
        assert_eq!(snapshot.manager_id, "01TEST");
        let ids: Vec<_> = snapshot.connections.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![ConnectionId(1), ConnectionId(3)]);
        assert_eq!(
            snapshot
                .session(SessionId(10))
                .and_then(|s| s.user.as_ref())
                .map(|u| u.id),
            Some(5)
        );
        assert_eq!(
            snapshot.connection(ConnectionId(3)).unwrap().bound_session,
            Some(SessionId(30))
        );
    }
}
