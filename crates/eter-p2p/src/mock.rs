//! Mock signaling server for testing
//!
//! An in-process stand-in for the signaling service: sessions register under
//! an id, KEY/DATA/HEARTBEAT messages are routed by `dst`, and `connect`
//! produces linked pairs of direct channels. Tests drive failures through the
//! helper methods on [`MockSession`] and [`MockDirectChannel`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::events::{Emitter, Subscription};
use crate::transport::{
    CandidateType, ChannelEvent, DirectChannel, IceConnectionState, SessionFactory, SessionParams,
    SignalingErrorKind, SignalingEvent, SignalingSession, StatsReport, TransportError,
};
use crate::types::{AppMessage, SignalingMessage};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Server
// ============================================================================

/// How `connect` behaves
#[derive(Debug, Clone)]
pub enum DirectMode {
    /// Both ends open immediately and report these stats
    Open(StatsReport),
    /// Channels are created but never open
    Stall,
    /// `connect` fails
    Disabled,
}

impl Default for DirectMode {
    fn default() -> Self {
        DirectMode::Open(StatsReport::with_selected_pair(CandidateType::Host))
    }
}

#[derive(Default)]
struct ServerState {
    sessions: HashMap<String, Weak<MockSessionInner>>,
    direct_mode: DirectMode,
    connect_counts: HashMap<String, usize>,
    sessions_created: usize,
    fail_create: bool,
}

/// In-process signaling server
#[derive(Default)]
pub struct MockSignalingServer {
    state: Mutex<ServerState>,
}

impl MockSignalingServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn factory(self: &Arc<Self>) -> MockSessionFactory {
        MockSessionFactory {
            server: self.clone(),
        }
    }

    /// Register and open a session directly
    pub fn open_session(self: &Arc<Self>, id: &str) -> MockSession {
        let session = MockSession::new(id, Arc::downgrade(self));
        if self.register(&session) {
            session.mark_open();
        } else {
            session.emit_error(SignalingErrorKind::UnavailableId);
        }
        session
    }

    /// Live session registered under `id`
    pub fn session(&self, id: &str) -> Option<MockSession> {
        self.state
            .lock()
            .sessions
            .get(id)
            .and_then(Weak::upgrade)
            .map(|inner| MockSession { inner })
    }

    pub fn set_direct_mode(&self, mode: DirectMode) {
        self.state.lock().direct_mode = mode;
    }

    /// Make the factory refuse to create sessions
    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    /// How many direct channels were requested towards `peer`
    pub fn connect_count(&self, peer: &str) -> usize {
        self.state
            .lock()
            .connect_counts
            .get(peer)
            .copied()
            .unwrap_or(0)
    }

    pub fn sessions_created(&self) -> usize {
        self.state.lock().sessions_created
    }

    fn register(&self, session: &MockSession) -> bool {
        let mut state = self.state.lock();
        state.sessions_created += 1;
        let taken = state
            .sessions
            .get(&session.inner.id)
            .and_then(Weak::upgrade)
            .is_some_and(|existing| !existing.destroyed.load(Ordering::SeqCst));
        if taken {
            return false;
        }
        state
            .sessions
            .insert(session.inner.id.clone(), Arc::downgrade(&session.inner));
        true
    }

    fn unregister(&self, inner: &Arc<MockSessionInner>) {
        let mut state = self.state.lock();
        let registered = state
            .sessions
            .get(&inner.id)
            .is_some_and(|weak| weak.ptr_eq(&Arc::downgrade(inner)));
        if registered {
            state.sessions.remove(&inner.id);
        }
    }

    fn lookup(&self, id: &str) -> Option<Arc<MockSessionInner>> {
        self.state
            .lock()
            .sessions
            .get(id)
            .and_then(Weak::upgrade)
            .filter(|inner| inner.open.load(Ordering::SeqCst))
    }

    fn route(&self, msg: SignalingMessage) {
        if let Some(target) = self.lookup(&msg.dst) {
            target.events.emit(SignalingEvent::Message(msg));
        }
    }

    fn open_direct(
        &self,
        from: &Arc<MockSessionInner>,
        to: &str,
    ) -> Result<Arc<dyn DirectChannel>, TransportError> {
        let mode = {
            let mut state = self.state.lock();
            *state.connect_counts.entry(to.to_string()).or_default() += 1;
            state.direct_mode.clone()
        };
        let report = match mode {
            DirectMode::Disabled => return Err(TransportError::Unsupported),
            DirectMode::Stall => None,
            DirectMode::Open(report) => Some(report),
        };

        let (local, remote) = MockDirectChannel::pair(&from.id, to);
        if let Some(report) = &report {
            local.set_stats(report.clone());
            remote.set_stats(report.clone());
        }

        match self.lookup(to) {
            Some(target) => {
                let inbound: Arc<dyn DirectChannel> = remote.clone();
                target.events.emit(SignalingEvent::Connection(inbound));
                if report.is_some() {
                    local.open();
                    remote.open();
                }
            }
            None => from
                .events
                .emit(SignalingEvent::Error(SignalingErrorKind::PeerUnavailable)),
        }
        let outbound: Arc<dyn DirectChannel> = local;
        Ok(outbound)
    }
}

/// Factory handing out sessions on a [`MockSignalingServer`]
#[derive(Clone)]
pub struct MockSessionFactory {
    server: Arc<MockSignalingServer>,
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, params: &SessionParams) -> Result<Arc<dyn SignalingSession>, TransportError> {
        if self.server.state.lock().fail_create {
            return Err(TransportError::ConnectionFailed(
                "signaling unavailable".to_string(),
            ));
        }
        let session: Arc<dyn SignalingSession> = Arc::new(self.server.open_session(&params.id));
        Ok(session)
    }
}

// ============================================================================
// Session
// ============================================================================

struct MockSessionInner {
    id: String,
    server: Weak<MockSignalingServer>,
    open: AtomicBool,
    disconnected: AtomicBool,
    destroyed: AtomicBool,
    fail_reconnect: AtomicBool,
    hold_reconnect: AtomicBool,
    reconnects: AtomicUsize,
    reconnect_times: Mutex<Vec<Instant>>,
    sent: Mutex<Vec<SignalingMessage>>,
    events: Emitter<SignalingEvent>,
}

/// Session handle on the mock server
#[derive(Clone)]
pub struct MockSession {
    inner: Arc<MockSessionInner>,
}

impl MockSession {
    fn new(id: &str, server: Weak<MockSignalingServer>) -> Self {
        Self {
            inner: Arc::new(MockSessionInner {
                id: id.to_string(),
                server,
                open: AtomicBool::new(false),
                disconnected: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                fail_reconnect: AtomicBool::new(false),
                hold_reconnect: AtomicBool::new(false),
                reconnects: AtomicUsize::new(0),
                reconnect_times: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                events: Emitter::new(),
            }),
        }
    }

    fn mark_open(&self) {
        self.inner.disconnected.store(false, Ordering::SeqCst);
        self.inner.open.store(true, Ordering::SeqCst);
        self.inner.events.emit(SignalingEvent::Open);
    }

    pub fn emit_error(&self, kind: SignalingErrorKind) {
        self.inner.events.emit(SignalingEvent::Error(kind));
    }

    /// Deliver a message as if relayed by the server
    pub fn deliver(&self, msg: SignalingMessage) {
        self.inner.events.emit(SignalingEvent::Message(msg));
    }

    pub fn heartbeat(&self) {
        self.deliver(SignalingMessage::heartbeat());
    }

    /// Drop the server connection without destroying the session
    pub fn disconnect(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.disconnected.store(true, Ordering::SeqCst);
        self.inner.events.emit(SignalingEvent::Disconnected);
    }

    pub fn set_fail_reconnect(&self, fail: bool) {
        self.inner.fail_reconnect.store(fail, Ordering::SeqCst);
    }

    /// Accept reconnects without ever reopening the session
    pub fn set_hold_reconnect(&self, hold: bool) {
        self.inner.hold_reconnect.store(hold, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> usize {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// When each reconnect was requested
    pub fn reconnect_times(&self) -> Vec<Instant> {
        self.inner.reconnect_times.lock().clone()
    }

    /// Everything this session relayed through the server
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.inner.sent.lock().clone()
    }
}

impl SignalingSession for MockSession {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Subscription<SignalingEvent> {
        self.inner.events.subscribe()
    }

    fn send(&self, mut msg: SignalingMessage) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        if msg.src.is_empty() {
            msg.src = self.inner.id.clone();
        }
        self.inner.sent.lock().push(msg.clone());
        if let Some(server) = self.inner.server.upgrade() {
            server.route(msg);
        }
        Ok(())
    }

    fn connect(&self, peer: &str) -> Result<Arc<dyn DirectChannel>, TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let server = self
            .inner
            .server
            .upgrade()
            .ok_or(TransportError::NotConnected)?;
        server.open_direct(&self.inner, peer)
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        self.inner.reconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.reconnect_times.lock().push(Instant::now());
        if self.inner.fail_reconnect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "reconnect refused".to_string(),
            ));
        }
        if self.inner.hold_reconnect.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.mark_open();
        Ok(())
    }

    fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.open.store(false, Ordering::SeqCst);
        self.inner.disconnected.store(true, Ordering::SeqCst);
        if let Some(server) = self.inner.server.upgrade() {
            server.unregister(&self.inner);
        }
        self.inner.events.emit(SignalingEvent::Close);
    }
}

// ============================================================================
// Direct channel
// ============================================================================

/// One end of an in-memory direct channel pair
pub struct MockDirectChannel {
    peer: String,
    connection_id: String,
    open: AtomicBool,
    closed: AtomicBool,
    remote: Mutex<Weak<MockDirectChannel>>,
    events: Emitter<ChannelEvent>,
    report: Mutex<StatsReport>,
    stats_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<AppMessage>>,
}

impl MockDirectChannel {
    fn new(peer: &str, connection_id: &str) -> Arc<Self> {
        Arc::new(Self {
            peer: peer.to_string(),
            connection_id: connection_id.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote: Mutex::new(Weak::new()),
            events: Emitter::new(),
            report: Mutex::new(StatsReport::with_selected_pair(CandidateType::Host)),
            stats_delay: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Linked pair: the first end is held by `a` and talks to `b`
    pub fn pair(a: &str, b: &str) -> (Arc<Self>, Arc<Self>) {
        let connection_id = format!("dc_{}", NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
        let local = Self::new(b, &connection_id);
        let remote = Self::new(a, &connection_id);
        *local.remote.lock() = Arc::downgrade(&remote);
        *remote.remote.lock() = Arc::downgrade(&local);
        (local, remote)
    }

    pub fn open(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            self.events.emit(ChannelEvent::Open);
        }
    }

    pub fn set_stats(&self, report: StatsReport) {
        *self.report.lock() = report;
    }

    /// Delay answering `stats()`
    pub fn set_stats_delay(&self, delay: Duration) {
        *self.stats_delay.lock() = Some(delay);
    }

    pub fn set_ice_state(&self, state: IceConnectionState) {
        self.events.emit(ChannelEvent::IceStateChanged(state));
    }

    pub fn emit_error(&self, error: &str) {
        self.events.emit(ChannelEvent::Error(error.to_string()));
    }

    pub fn sent(&self) -> Vec<AppMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DirectChannel for MockDirectChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Subscription<ChannelEvent> {
        self.events.subscribe()
    }

    fn send(&self, msg: &AppMessage) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(msg.clone());
        let remote = self.remote.lock().upgrade();
        if let Some(remote) = remote.filter(|r| r.is_open()) {
            remote.events.emit(ChannelEvent::Data(msg.clone()));
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.events.emit(ChannelEvent::Close);
        let remote = self.remote.lock().upgrade();
        if let Some(remote) = remote {
            remote.close();
        }
    }

    async fn stats(&self) -> Result<StatsReport, TransportError> {
        let delay = *self.stats_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.report.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalingKind;

    #[tokio::test]
    async fn test_sessions_route_messages() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let b = server.open_session("b");
        let mut events = b.subscribe();
        assert!(matches!(events.recv().await, Some(SignalingEvent::Open)));

        a.send(SignalingMessage::data("", "b", "hello")).unwrap();
        match events.recv().await {
            Some(SignalingEvent::Message(msg)) => {
                assert_eq!(msg.kind, SignalingKind::Data);
                assert_eq!(msg.src, "a");
                assert_eq!(msg.payload.as_deref(), Some("hello"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let server = MockSignalingServer::new();
        let _first = server.open_session("a");
        let second = server.open_session("a");
        let mut events = second.subscribe();
        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Error(SignalingErrorKind::UnavailableId))
        ));
        assert!(!second.is_open());
    }

    #[tokio::test]
    async fn test_destroy_frees_id() {
        let server = MockSignalingServer::new();
        let first = server.open_session("a");
        first.destroy();
        let second = server.open_session("a");
        assert!(second.is_open());
        assert!(first.send(SignalingMessage::heartbeat()).is_err());
    }

    #[tokio::test]
    async fn test_channel_pair() {
        let (a, b) = MockDirectChannel::pair("a", "b");
        assert_eq!(a.peer(), "b");
        assert_eq!(b.peer(), "a");
        let mut b_events = b.subscribe();
        a.open();
        b.open();
        assert!(matches!(b_events.recv().await, Some(ChannelEvent::Open)));

        a.send(&AppMessage::new("hi")).unwrap();
        match b_events.recv().await {
            Some(ChannelEvent::Data(msg)) => assert_eq!(msg.event, "hi"),
            other => panic!("unexpected {:?}", other),
        }

        a.close();
        assert!(matches!(b_events.recv().await, Some(ChannelEvent::Close)));
        assert!(!b.is_open());
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let mut events = a.subscribe();
        let _ = events.recv().await;

        let channel = a.connect("nobody").unwrap();
        assert!(!channel.is_open());
        assert!(matches!(
            events.recv().await,
            Some(SignalingEvent::Error(SignalingErrorKind::PeerUnavailable))
        ));
        assert_eq!(server.connect_count("nobody"), 1);
    }
}
