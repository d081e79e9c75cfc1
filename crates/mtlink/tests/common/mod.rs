//! Common test utilities: a scripted in-memory transport.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use mtlink::config::{AppConfig, Config, DataCenterConfig, ManagerConfig};
use mtlink::manager::{Event, EventKind};
use mtlink::observer::EventObserver;
use mtlink::store::FileSessionStore;
use mtlink::transport::{
    Connection, ConnectionId, EventSink, RpcError, SentCode, Session, SessionId, Transport,
    TransportError, UpdatesState, User,
};
use mtlink::Manager;

pub const DEFAULT_ADDR: &str = "10.0.0.2:443";
pub const DC4_ADDR: &str = "10.0.0.4:443";

/// First id handed out by [`FakeTransport`] for sessions.
pub const FIRST_SESSION_ID: i64 = 1000;

// ============================================================================
// Script
// ============================================================================

/// Behaviour switches for the fake transport.
#[derive(Default)]
pub struct Script {
    /// Session construction fails for these phones.
    pub failing_phones: HashSet<String>,
    /// `Session::close` fails for these phones.
    pub fail_close_phones: HashSet<String>,
    /// Phones with persisted key material (`load_session` succeeds).
    pub persisted_phones: HashSet<String>,
    /// Phones whose sessions answer "who am I".
    pub authorized_phones: HashSet<String>,
    /// Phone -> (dc, addr): send-code redirects until the session lives at addr.
    pub migrations: HashMap<String, (i32, String)>,
    pub fail_connections: bool,
    /// Delay before a session is constructed.
    pub session_delay: Option<Duration>,
}

struct Shared {
    script: Mutex<Script>,
    next_session: AtomicI64,
    next_connection: AtomicI32,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Clone)]
pub struct FakeTransport {
    shared: Arc<Shared>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::with_script(Script::default())
    }

    pub fn with_script(script: Script) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(script),
                next_session: AtomicI64::new(FIRST_SESSION_ID),
                next_connection: AtomicI32::new(1),
                sessions: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.shared.script.lock().unwrap()
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.shared.sessions.lock().unwrap().clone()
    }

    pub fn session(&self, id: SessionId) -> Arc<FakeSession> {
        self.sessions()
            .into_iter()
            .find(|s| s.id == id)
            .expect("session was created by the fake transport")
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.shared.connections.lock().unwrap().clone()
    }

    pub fn connection(&self, id: ConnectionId) -> Arc<FakeConnection> {
        self.connections()
            .into_iter()
            .find(|c| c.id == id)
            .expect("connection was created by the fake transport")
    }

    fn build_session(&self, phone: &str, addr: &str, events: EventSink) -> Arc<FakeSession> {
        let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(FakeSession {
            id,
            phone: phone.to_string(),
            addr: addr.to_string(),
            cursor: Mutex::new(Some(UpdatesState {
                pts: id.0 as i32,
                seq: 1,
                ..Default::default()
            })),
            events: events.clone(),
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        });
        self.shared.sessions.lock().unwrap().push(session.clone());
        events.send(Event::SessionEstablished { session_id: id });
        session
    }

    async fn construction_delay(&self) {
        let delay = self.script().session_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn new_session(
        &self,
        phone: &str,
        addr: &str,
        _use_ipv6: bool,
        _config: &Config,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, TransportError> {
        self.construction_delay().await;
        if self.script().failing_phones.contains(phone) {
            return Err(TransportError::handshake(addr, "connection refused"));
        }
        Ok(self.build_session(phone, addr, events))
    }

    async fn load_session(
        &self,
        phone: &str,
        preferred_addr: Option<&str>,
        config: &Config,
        events: EventSink,
    ) -> Result<Arc<dyn Session>, TransportError> {
        self.construction_delay().await;
        if !self.script().persisted_phones.contains(phone) {
            return Err(TransportError::NoStoredSession(phone.to_string()));
        }
        let addr = preferred_addr.unwrap_or(&config.data_centers.default_addr);
        Ok(self.build_session(phone, addr, events))
    }

    async fn new_connection(
        &self,
        events: EventSink,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        if self.script().fail_connections {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no route",
            )));
        }
        let id = ConnectionId(self.shared.next_connection.fetch_add(1, Ordering::SeqCst));
        let connection = Arc::new(FakeConnection {
            id,
            events: events.clone(),
            shared: self.shared.clone(),
            bound: Mutex::new(None),
            binds: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.shared
            .connections
            .lock()
            .unwrap()
            .push(connection.clone());
        events.send(Event::ConnectionOpened { conn_id: id });
        Ok(connection)
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct FakeSession {
    pub id: SessionId,
    pub phone: String,
    pub addr: String,
    cursor: Mutex<Option<UpdatesState>>,
    events: EventSink,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl FakeSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn phone_number(&self) -> &str {
        &self.phone
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn updates_state(&self) -> Option<UpdatesState> {
        *self.cursor.lock().unwrap()
    }

    fn notify(&self, event: Event) {
        self.events.send(event);
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self
            .shared
            .script
            .lock()
            .unwrap()
            .fail_close_phones
            .contains(&self.phone)
        {
            return Err(TransportError::Io(std::io::Error::other("socket stuck")));
        }
        self.closed.store(true, Ordering::SeqCst);
        self.events
            .send(Event::SessionDiscarded { session_id: self.id });
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct FakeConnection {
    pub id: ConnectionId,
    events: EventSink,
    shared: Arc<Shared>,
    bound: Mutex<Option<Arc<dyn Session>>>,
    binds: Mutex<Vec<(SessionId, Option<UpdatesState>)>>,
    closed: AtomicBool,
}

impl FakeConnection {
    /// Every bind so far, with the cursor handed over at that bind.
    pub fn binds(&self) -> Vec<(SessionId, Option<UpdatesState>)> {
        self.binds.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn bind(&self, session: Arc<dyn Session>, resume_from: Option<UpdatesState>) {
        let session_id = session.id();
        self.binds.lock().unwrap().push((session_id, resume_from));
        *self.bound.lock().unwrap() = Some(session);
        self.events.send(Event::SessionBound {
            conn_id: self.id,
            session_id,
        });
    }

    fn unbind(&self) -> Option<SessionId> {
        let session_id = self.bound.lock().unwrap().take().map(|s| s.id())?;
        self.events.send(Event::SessionUnbound {
            conn_id: self.id,
            session_id,
        });
        Some(session_id)
    }

    fn session(&self) -> Option<Arc<dyn Session>> {
        self.bound.lock().unwrap().clone()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.events.send(Event::ConnectionClosed { conn_id: self.id });
        Ok(())
    }

    async fn get_self(&self) -> Result<User, RpcError> {
        let session = self
            .session()
            .ok_or_else(|| RpcError::new(401, "AUTH_KEY_UNREGISTERED"))?;
        let authorized = self
            .shared
            .script
            .lock()
            .unwrap()
            .authorized_phones
            .contains(session.phone_number());
        if !authorized {
            return Err(RpcError::new(401, "AUTH_KEY_UNREGISTERED"));
        }
        Ok(User {
            id: 777,
            first_name: "Test".to_string(),
            last_name: None,
            username: Some("tester".to_string()),
            phone: Some(session.phone_number().to_string()),
        })
    }

    async fn send_code(&self, phone: &str) -> Result<SentCode, RpcError> {
        let session = self
            .session()
            .ok_or_else(|| RpcError::new(401, "AUTH_KEY_UNREGISTERED"))?;
        let migration = self
            .shared
            .script
            .lock()
            .unwrap()
            .migrations
            .get(phone)
            .cloned();
        if let Some((dc, addr)) = migration
            && session.addr() != addr
        {
            return Err(RpcError::new(303, format!("PHONE_MIGRATE_{dc}")));
        }
        Ok(SentCode {
            phone_code_hash: format!("hash-{}", session.id()),
            phone_registered: true,
            timeout: Some(60),
        })
    }
}

// ============================================================================
// Observer
// ============================================================================

#[derive(Default)]
pub struct RecordingObserver {
    kinds: Mutex<Vec<EventKind>>,
    stopped: AtomicBool,
}

impl RecordingObserver {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.kinds.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, _manager_id: &str, kind: EventKind) {
        self.kinds.lock().unwrap().push(kind);
    }

    fn on_stopped(&self, _manager_id: &str) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Manager Setup
// ============================================================================

/// Valid configuration with short timeouts, sessions under `session_home`.
pub fn test_config(session_home: &Path) -> Config {
    Config {
        session_home: session_home.to_path_buf(),
        app: AppConfig {
            api_id: 12345,
            api_hash: "0123456789abcdef0123456789abcdef".to_string(),
            ..Default::default()
        },
        data_centers: DataCenterConfig {
            default_addr: DEFAULT_ADDR.to_string(),
            use_ipv6: false,
            addresses: HashMap::from([(2, DEFAULT_ADDR.to_string()), (4, DC4_ADDR.to_string())]),
        },
        manager: ManagerConfig {
            request_timeout_seconds: 5,
            bind_wait_timeout_seconds: 1,
        },
    }
}

pub fn start_manager(transport: &FakeTransport, session_home: &Path) -> Manager {
    Manager::new(test_config(session_home), Arc::new(transport.clone())).unwrap()
}

pub fn start_observed_manager(
    transport: &FakeTransport,
    session_home: &Path,
    observer: Arc<RecordingObserver>,
) -> Manager {
    Manager::with_parts(
        test_config(session_home),
        Arc::new(transport.clone()),
        Arc::new(FileSessionStore::new(session_home)),
        observer,
    )
    .unwrap()
}

pub fn phones(list: &[&str]) -> HashSet<String> {
    list.iter().map(|p| p.to_string()).collect()
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
