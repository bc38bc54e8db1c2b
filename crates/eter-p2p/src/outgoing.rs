//! Links we initiated
//!
//! Greets with `eter:join` once open. An implicit close (remote gone,
//! network failure) schedules a fresh connection after a backoff delay; a
//! wait timeout recreates immediately over the signaling relay. Only an
//! explicit close ends the session.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::exp_backoff;
use crate::connection::{Connection, ConnectionEvent, ConnectionOptions};
use crate::events::{Emitter, Subscription, SubscriptionId};
use crate::session::{SessionEvent, SessionStatus};
use crate::timer::Timer;
use crate::transport::SignalingSession;
use crate::types::{AppMessage, ConnectionType};

#[derive(Debug, Clone, Default)]
pub struct OutgoingOptions {
    /// Fixed delay before reconnecting, instead of exponential backoff
    pub retry_delay: Option<Duration>,
    /// Options for every connection this session creates
    pub connection: ConnectionOptions,
}

struct OutgoingState {
    connection: Connection,
    pump: Option<AbortHandle>,
    retry_count: u32,
    retry_timer: Option<Timer>,
    status: SessionStatus,
    closed: bool,
}

struct OutgoingInner {
    peer: String,
    session: Arc<dyn SignalingSession>,
    options: OutgoingOptions,
    state: Mutex<OutgoingState>,
    events: Emitter<SessionEvent>,
}

#[derive(Clone)]
pub struct OutgoingSession {
    inner: Arc<OutgoingInner>,
}

impl fmt::Debug for OutgoingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingSession")
            .field("peer", &self.inner.peer)
            .field("connection", &self.connection())
            .field("status", &self.status())
            .finish()
    }
}

impl OutgoingSession {
    pub fn new(connection: Connection, options: OutgoingOptions) -> Self {
        let inner = Arc::new(OutgoingInner {
            peer: connection.peer().to_string(),
            session: connection.session().clone(),
            options,
            state: Mutex::new(OutgoingState {
                connection,
                pump: None,
                retry_count: 0,
                retry_timer: None,
                status: SessionStatus::Connecting,
                closed: false,
            }),
            events: Emitter::new(),
        });
        {
            let mut state = inner.state.lock();
            inner.attach(&mut state);
        }
        Self { inner }
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Connection currently in use
    pub fn connection(&self) -> Connection {
        self.inner.state.lock().connection.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.lock().status
    }

    /// Consecutive implicit closes since the last open
    pub fn retry_count(&self) -> u32 {
        self.inner.state.lock().retry_count
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.events.unsubscribe(id);
    }

    /// Close for good: cancels a pending reconnect
    pub fn close(&self) {
        let connection = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.status = SessionStatus::Failed;
            state.retry_timer = None;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            state.connection.clone()
        };
        connection.clear_listeners();
        connection.close();
        debug!("Outgoing session to {} closed", self.inner.peer);
        self.inner.events.emit(SessionEvent::Close);
    }
}

impl OutgoingInner {
    fn attach(self: &Arc<Self>, state: &mut OutgoingState) {
        let mut connection_events = state.connection.subscribe();
        let connection_id = state.connection.id();
        let weak: Weak<Self> = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(event) = connection_events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_connection_event(connection_id, event);
            }
        });
        if let Some(old) = state.pump.replace(pump.abort_handle()) {
            old.abort();
        }
    }

    fn on_connection_event(self: &Arc<Self>, connection_id: u64, event: ConnectionEvent) {
        let mut state = self.state.lock();
        if state.closed || state.connection.id() != connection_id {
            return;
        }
        match event {
            ConnectionEvent::Open => {
                state.retry_count = 0;
                state.status = SessionStatus::Ready;
                let connection = state.connection.clone();
                drop(state);
                if let Err(e) = connection.send(&AppMessage::join()) {
                    warn!("Failed to send join to {}: {}", self.peer, e);
                }
                self.events.emit(SessionEvent::Connect(connection));
            }
            ConnectionEvent::Data(msg) => {
                drop(state);
                self.events.emit(SessionEvent::Data(msg));
            }
            ConnectionEvent::Error(e) => {
                drop(state);
                error!("Outgoing connection error to {}: {}", self.peer, e);
                self.events.emit(SessionEvent::Error(e));
            }
            ConnectionEvent::Timeout => {
                info!("Connection to {} timed out, retrying via server", self.peer);
                state.status = SessionStatus::Connecting;
                self.recreate(&mut state, true);
                drop(state);
                self.events.emit(SessionEvent::Retry);
            }
            ConnectionEvent::Close { explicit: false } => {
                info!("Connection to {} lost, retrying", self.peer);
                state.status = SessionStatus::Connecting;
                self.delayed_recreate(&mut state);
                drop(state);
                self.events.emit(SessionEvent::Retry);
            }
            ConnectionEvent::Close { explicit: true } => {
                state.closed = true;
                state.status = SessionStatus::Failed;
                state.retry_timer = None;
                state.pump = None;
                let connection = state.connection.clone();
                drop(state);
                connection.clear_listeners();
                self.events.emit(SessionEvent::Close);
            }
            ConnectionEvent::CryptoReady => {}
        }
    }

    fn delayed_recreate(self: &Arc<Self>, state: &mut OutgoingState) {
        let delay = self
            .options
            .retry_delay
            .unwrap_or_else(|| exp_backoff(state.retry_count));
        state.retry_count += 1;
        debug!("Reconnecting to {} in {:?}", self.peer, delay);

        let weak: Weak<Self> = Arc::downgrade(self);
        state.retry_timer = Some(Timer::start(delay, move |timer_id| {
            if let Some(inner) = weak.upgrade() {
                inner.on_retry_due(timer_id);
            }
        }));
    }

    fn on_retry_due(self: &Arc<Self>, timer_id: u64) {
        let mut state = self.state.lock();
        let current = state.retry_timer.as_ref().map(Timer::id);
        if state.closed || current != Some(timer_id) {
            return;
        }
        state.retry_timer = None;
        self.recreate(&mut state, false);
    }

    /// Replace the connection. Falls back to the relay if direct fails to start.
    fn recreate(self: &Arc<Self>, state: &mut OutgoingState, force_server: bool) {
        let old = state.connection.clone();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        old.clear_listeners();
        old.close();

        if self.session.is_destroyed() {
            debug!("Session destroyed, not reconnecting to {}", self.peer);
            return;
        }

        let use_relay = force_server || old.connection_type() == ConnectionType::Server;
        let options = self.options.connection.clone();
        state.connection = if use_relay {
            Connection::relay(self.peer.clone(), self.session.clone(), options)
        } else {
            match self.session.connect(&self.peer) {
                Ok(channel) => Connection::direct(self.session.clone(), channel, options),
                Err(e) => {
                    warn!("Direct connect to {} failed ({}), using relay", self.peer, e);
                    Connection::relay(self.peer.clone(), self.session.clone(), options)
                }
            }
        };
        self.attach(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DirectMode, MockDirectChannel, MockSignalingServer};
    use crate::transport::DirectChannel;

    async fn next_event(sub: &mut Subscription<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(60), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    fn direct_to(server: &Arc<MockSignalingServer>, from: &str, to: &str) -> Connection {
        let session: Arc<dyn SignalingSession> = Arc::new(server.open_session(from));
        let channel = session.connect(to).unwrap();
        Connection::direct(session, channel, Default::default())
    }

    #[tokio::test]
    async fn test_join_on_open() {
        let server = MockSignalingServer::new();
        let b = server.open_session("b");
        let mut b_events = b.subscribe();
        let outgoing = OutgoingSession::new(direct_to(&server, "a", "b"), Default::default());
        let mut events = outgoing.subscribe();

        match next_event(&mut events).await {
            SessionEvent::Connect(connection) => assert_eq!(connection.peer(), "b"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(outgoing.status(), SessionStatus::Ready);

        let inbound = loop {
            if let Some(crate::transport::SignalingEvent::Connection(channel)) =
                b_events.recv().await
            {
                break channel;
            }
        };
        let mut inbound_events = inbound.subscribe();
        loop {
            if let Some(crate::transport::ChannelEvent::Data(msg)) = inbound_events.recv().await {
                assert_eq!(msg, AppMessage::join());
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_close_triggers_reconnect() {
        let server = MockSignalingServer::new();
        let session: Arc<dyn SignalingSession> = Arc::new(server.open_session("a"));
        let (local, remote) = MockDirectChannel::pair("a", "b");
        let _b = server.open_session("b");

        let outgoing = OutgoingSession::new(
            Connection::direct(session, local.clone(), Default::default()),
            Default::default(),
        );
        let mut events = outgoing.subscribe();
        local.open();
        remote.open();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Connect(_)));
        let before = outgoing.connection().id();

        let closed_at = tokio::time::Instant::now();
        remote.close();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Retry));
        assert_eq!(outgoing.retry_count(), 1);

        assert!(matches!(next_event(&mut events).await, SessionEvent::Connect(_)));
        assert!(closed_at.elapsed() >= Duration::from_secs(1));
        assert_ne!(outgoing.connection().id(), before);
        assert_eq!(server.connect_count("b"), 1);
        assert_eq!(outgoing.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_retry_delay() {
        let server = MockSignalingServer::new();
        let session: Arc<dyn SignalingSession> = Arc::new(server.open_session("a"));
        let (local, remote) = MockDirectChannel::pair("a", "b");
        let _b = server.open_session("b");
        server.set_direct_mode(DirectMode::Stall);

        let options = OutgoingOptions {
            retry_delay: Some(Duration::from_secs(7)),
            ..Default::default()
        };
        let outgoing = OutgoingSession::new(
            Connection::direct(session, local.clone(), Default::default()),
            options,
        );
        let mut events = outgoing.subscribe();
        local.open();
        remote.open();
        next_event(&mut events).await;

        let closed_at = tokio::time::Instant::now();
        remote.close();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Retry));
        while server.connect_count("b") == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(closed_at.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_retry() {
        let server = MockSignalingServer::new();
        let session: Arc<dyn SignalingSession> = Arc::new(server.open_session("a"));
        let (local, remote) = MockDirectChannel::pair("a", "b");
        let _b = server.open_session("b");

        let outgoing = OutgoingSession::new(
            Connection::direct(session, local.clone(), Default::default()),
            Default::default(),
        );
        let mut events = outgoing.subscribe();
        local.open();
        remote.open();
        next_event(&mut events).await;

        remote.close();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Retry));
        outgoing.close();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Close));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.connect_count("b"), 0);
        assert_eq!(outgoing.status(), SessionStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_recreates_over_relay() {
        let server = MockSignalingServer::new();
        server.set_direct_mode(DirectMode::Stall);
        let session: Arc<dyn SignalingSession> = Arc::new(server.open_session("a"));
        let _b = server.open_session("b");

        let options = OutgoingOptions {
            connection: ConnectionOptions {
                wait_timeout: Some(Duration::from_secs(10)),
                ..Default::default()
            },
            ..Default::default()
        };
        let channel = session.connect("b").unwrap();
        let outgoing = OutgoingSession::new(
            Connection::direct(session, channel, options.connection.clone()),
            options,
        );
        let mut events = outgoing.subscribe();

        assert!(matches!(next_event(&mut events).await, SessionEvent::Retry));
        assert!(outgoing.connection().is_relay());
    }

    #[tokio::test]
    async fn test_destroyed_session_stops_recreating() {
        let server = MockSignalingServer::new();
        let session: Arc<dyn SignalingSession> = Arc::new(server.open_session("a"));
        let (local, remote) = MockDirectChannel::pair("a", "b");
        let outgoing = OutgoingSession::new(
            Connection::direct(session.clone(), local.clone(), Default::default()),
            OutgoingOptions {
                retry_delay: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );
        let mut events = outgoing.subscribe();
        local.open();
        remote.open();
        next_event(&mut events).await;
        let before = outgoing.connection().id();

        session.destroy();
        remote.close();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Retry));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(outgoing.connection().id(), before);
        assert_eq!(server.connect_count("b"), 0);
    }
}
