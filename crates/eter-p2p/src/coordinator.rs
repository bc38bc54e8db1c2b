//! Peer coordinator
//!
//! Owns the signaling session and the registry of links, one per remote peer.
//! Turns signaling events into status/quality/error updates, routes relayed
//! KEY and DATA messages to the right connection, keeps the session alive with
//! a heartbeat watchdog, and retries with capped exponential backoff.
//!
//! Status transitions:
//! - session open: `ready` (or connect to the configured server first)
//! - recoverable signaling error, heartbeat loss, link retry: `retry`
//! - id taken too often, peer never reachable, reconnect refused: `failed`
//! - `destroy()`: `inactive`

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionOptions};
use crate::events::{Emitter, Subscription, SubscriptionId};
use crate::incoming::IncomingSession;
use crate::outgoing::{OutgoingOptions, OutgoingSession};
use crate::session::{Direction, Link, SessionEvent};
use crate::timer::Timer;
use crate::transport::{
    DirectChannel, SessionFactory, SessionParams, SignalingErrorKind, SignalingEvent,
    SignalingSession,
};
use crate::types::{
    AppMessage, BuiltinEvent, CoordinatorConfig, PeerErrorKind, PeerStatus, SignalingKind,
    SignalingMessage,
};

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Signaling session registered
    Open,
    Status(PeerStatus),
    Quality(u8),
    Error(PeerErrorKind),
    Connect { peer: String, connection: Connection },
    Close { peer: String },
    Data { peer: String, message: AppMessage },
}

#[derive(Debug, Clone, Copy)]
enum RetryAction {
    Reconnect,
    Reset,
}

struct LinkEntry {
    serial: u64,
    link: Link,
    pump: AbortHandle,
    via_server: bool,
}

#[derive(Default)]
struct CoordinatorState {
    session: Option<Arc<dyn SignalingSession>>,
    generation: u64,
    session_pump: Option<AbortHandle>,
    status: PeerStatus,
    error: PeerErrorKind,
    quality: u8,
    links: HashMap<String, LinkEntry>,
    next_serial: u64,
    peer_retry_count: u32,
    id_retry_count: u32,
    conn_retry_count: u32,
    retry_timer: Option<Timer>,
    heartbeat_timer: Option<Timer>,
    connect_timers: HashMap<String, Timer>,
    reconnect_timers: HashMap<String, Timer>,
    destroyed: bool,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    factory: Arc<dyn SessionFactory>,
    state: Mutex<CoordinatorState>,
    events: Emitter<CoordinatorEvent>,
    hidden: AtomicBool,
}

/// Connection manager for one local peer id
///
/// Dropping the coordinator destroys it.
pub struct PeerCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PeerCoordinator {
    /// Open a signaling session under `config.code`. Must run inside a tokio runtime.
    pub fn new(config: CoordinatorConfig, factory: Arc<dyn SessionFactory>) -> Self {
        info!("Starting peer {} on {}:{}", config.code, config.host, config.port);
        let inner = Arc::new(CoordinatorInner {
            config,
            factory,
            state: Mutex::new(CoordinatorState::default()),
            events: Emitter::new(),
            hidden: AtomicBool::new(false),
        });
        {
            let mut state = inner.state.lock();
            inner.attach_session(&mut state);
        }
        Self { inner }
    }

    pub fn code(&self) -> &str {
        &self.inner.config.code
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PeerStatus {
        self.inner.state.lock().status
    }

    pub fn error(&self) -> PeerErrorKind {
        self.inner.state.lock().error
    }

    pub fn quality(&self) -> u8 {
        self.inner.state.lock().quality
    }

    pub fn subscribe(&self) -> Subscription<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.events.unsubscribe(id);
    }

    /// Current signaling session, if one could be created
    pub fn session(&self) -> Option<Arc<dyn SignalingSession>> {
        self.inner.state.lock().session.clone()
    }

    /// Open an outgoing link to `code`, directly or through the signaling relay
    pub fn create_peer(&self, code: &str, use_server: bool) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        self.inner.create_peer_locked(&mut state, code, use_server);
    }

    pub fn connection(&self, peer: &str) -> Option<Connection> {
        self.inner
            .state
            .lock()
            .links
            .get(peer)
            .map(|entry| entry.link.connection())
    }

    pub fn link(&self, peer: &str) -> Option<Link> {
        self.inner
            .state
            .lock()
            .links
            .get(peer)
            .map(|entry| entry.link.clone())
    }

    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.inner.state.lock().links.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Send to every open link except `exclude`. No-op unless ready.
    pub fn send_all(&self, data: &AppMessage, exclude: &[&str]) {
        let state = self.inner.state.lock();
        if state.status != PeerStatus::Ready {
            debug!("Not ready ({}), dropping broadcast", state.status);
            return;
        }
        for (peer, entry) in &state.links {
            if exclude.contains(&peer.as_str()) {
                continue;
            }
            let connection = entry.link.connection();
            if !connection.is_open() {
                continue;
            }
            if let Err(e) = connection.send(data) {
                warn!("Failed to send to {}: {}", peer, e);
            }
        }
    }

    /// Tear everything down and start a fresh signaling session
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        self.inner.reset_locked(&mut state);
    }

    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return;
        }
        info!("Destroying peer {}", self.inner.config.code);
        self.inner.teardown(&mut state);
        state.destroyed = true;
        self.inner.set_status(&mut state, PeerStatus::Inactive);
    }

    /// While hidden a missed heartbeat does not reset the session
    pub fn set_hidden(&self, hidden: bool) {
        self.inner.hidden.store(hidden, Ordering::SeqCst);
    }

    pub fn is_hidden(&self) -> bool {
        self.inner.hidden.load(Ordering::SeqCst)
    }
}

impl Drop for PeerCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl CoordinatorInner {
    fn session_params(&self) -> SessionParams {
        let config = &self.config;
        SessionParams {
            id: config.code.clone(),
            host: config.host.clone(),
            secure: config.secure,
            key: config.key.clone(),
            port: config.port,
            path: config.path.clone(),
            ice_servers: config.ice.ice_servers.iter().take(1).cloned().collect(),
            relay_only: config.relay_only(),
        }
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            wait_timeout: None,
            drop_ice: self.config.options.drop_ice,
        }
    }

    fn outgoing_options(&self) -> OutgoingOptions {
        OutgoingOptions {
            retry_delay: None,
            connection: self.connection_options(),
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    fn attach_session(self: &Arc<Self>, state: &mut CoordinatorState) {
        state.generation += 1;
        let generation = state.generation;
        match self.factory.create(&self.session_params()) {
            Ok(session) => {
                let mut events = session.subscribe();
                let weak = Arc::downgrade(self);
                let pump = tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_signaling_event(generation, event);
                    }
                });
                state.session = Some(session);
                state.session_pump = Some(pump.abort_handle());
            }
            Err(e) => {
                error!("Failed to create signaling session: {}", e);
                state.session = None;
                self.set_status(state, PeerStatus::Failed);
                self.set_error(state, PeerErrorKind::NoSignaling);
            }
        }
    }

    fn teardown(&self, state: &mut CoordinatorState) {
        for (peer, entry) in state.links.drain() {
            entry.pump.abort();
            entry.link.close();
            self.events.emit(CoordinatorEvent::Close { peer });
        }
        state.connect_timers.clear();
        state.reconnect_timers.clear();
        state.retry_timer = None;
        state.heartbeat_timer = None;
        if let Some(pump) = state.session_pump.take() {
            pump.abort();
        }
        if let Some(session) = state.session.take() {
            session.destroy();
        }
        self.update_quality(state);
    }

    fn reset_locked(self: &Arc<Self>, state: &mut CoordinatorState) {
        info!("Resetting peer {}", self.config.code);
        self.teardown(state);
        self.attach_session(state);
    }

    fn on_signaling_event(self: &Arc<Self>, generation: u64, event: SignalingEvent) {
        let mut state = self.state.lock();
        if state.destroyed || state.generation != generation {
            return;
        }
        match event {
            SignalingEvent::Open => self.on_open(&mut state),
            SignalingEvent::Connection(channel) => self.on_connection(&mut state, channel),
            SignalingEvent::Message(msg) => self.on_message(&mut state, msg),
            SignalingEvent::Error(kind) => self.on_error(&mut state, kind),
            SignalingEvent::Disconnected | SignalingEvent::Close => {
                debug!("Signaling session down");
                self.update_quality(&mut state);
            }
        }
    }

    fn on_open(self: &Arc<Self>, state: &mut CoordinatorState) {
        info!("Signaling session open as {}", self.config.code);
        state.peer_retry_count = 0;
        state.id_retry_count = 0;
        state.conn_retry_count = 0;
        state.retry_timer = None;
        self.arm_heartbeat(state);
        self.update_quality(state);
        self.events.emit(CoordinatorEvent::Open);

        let server = self.config.server.clone();
        match server {
            Some(server) if !self.is_connected(state, &server) => {
                self.create_peer_locked(state, &server, self.config.options.force_websocket);
            }
            _ => {
                self.set_status(state, PeerStatus::Ready);
                self.set_error(state, PeerErrorKind::None);
            }
        }
    }

    fn on_connection(self: &Arc<Self>, state: &mut CoordinatorState, channel: Arc<dyn DirectChannel>) {
        let Some(session) = state.session.clone() else {
            return;
        };
        let peer = channel.peer().to_string();
        info!("Incoming connection from {}", peer);
        let connection = Connection::direct(session, channel, self.connection_options());
        self.register(state, &peer, Link::Incoming(IncomingSession::new(connection)), false);
        self.update_quality(state);
    }

    fn on_message(self: &Arc<Self>, state: &mut CoordinatorState, msg: SignalingMessage) {
        match msg.kind {
            SignalingKind::Heartbeat => {
                debug!("Heartbeat");
                self.arm_heartbeat(state);
            }
            SignalingKind::Key => {
                let Some(key) = msg.payload.as_deref() else {
                    warn!("KEY without payload from {}", msg.src);
                    return;
                };
                let existing = state
                    .links
                    .get(&msg.src)
                    .map(|entry| (entry.link.direction(), entry.link.connection()));
                let connection = match existing {
                    Some((direction, connection))
                        if connection.is_relay()
                            && (direction == Direction::Outgoing || !connection.is_closed()) =>
                    {
                        connection
                    }
                    _ => {
                        let Some(session) = state.session.clone() else {
                            return;
                        };
                        info!("Relay connection requested by {}", msg.src);
                        let connection = Connection::relay(
                            msg.src.clone(),
                            session,
                            ConnectionOptions::default(),
                        );
                        self.register(
                            state,
                            &msg.src,
                            Link::Incoming(IncomingSession::new(connection.clone())),
                            true,
                        );
                        connection
                    }
                };
                if let Err(e) = connection.set_key(key) {
                    warn!("Rejected key from {}: {}", msg.src, e);
                }
            }
            SignalingKind::Data => {
                let Some(payload) = msg.payload.as_deref() else {
                    return;
                };
                match state.links.get(&msg.src) {
                    Some(entry) => {
                        if let Err(e) = entry.link.connection().decrypt_payload(payload) {
                            warn!("Dropping packet from {}: {}", msg.src, e);
                        }
                    }
                    None => debug!("DATA from unknown peer {}", msg.src),
                }
            }
        }
    }

    fn on_error(self: &Arc<Self>, state: &mut CoordinatorState, kind: SignalingErrorKind) {
        let timing = self.config.timing;
        match kind {
            SignalingErrorKind::Disconnected
            | SignalingErrorKind::Network
            | SignalingErrorKind::ServerError
            | SignalingErrorKind::Other(_) => {
                let delay = timing.backoff(state.peer_retry_count);
                state.peer_retry_count += 1;
                warn!("Signaling error: {}, reconnecting in {:?}", kind, delay);
                self.set_status(state, PeerStatus::Retry);
                self.schedule_retry(state, delay, RetryAction::Reconnect);
            }
            SignalingErrorKind::UnavailableId => {
                if state.id_retry_count < timing.max_id_retry {
                    let delay = timing.backoff(state.id_retry_count);
                    state.id_retry_count += 1;
                    warn!("Id {} in use, retrying in {:?}", self.config.code, delay);
                    self.set_status(state, PeerStatus::Retry);
                    self.schedule_retry(state, delay, RetryAction::Reset);
                } else {
                    error!("Id {} still in use, giving up", self.config.code);
                    state.retry_timer = None;
                    if let Some(session) = &state.session {
                        session.destroy();
                    }
                    self.set_status(state, PeerStatus::Failed);
                    self.set_error(state, PeerErrorKind::IdInUse);
                }
            }
            SignalingErrorKind::BrowserIncompatible => {
                error!("Direct channels unsupported here");
                self.set_status(state, PeerStatus::Failed);
                self.set_error(state, PeerErrorKind::BadBrowser);
            }
            SignalingErrorKind::PeerUnavailable => match self.config.server.clone() {
                Some(server) => {
                    warn!("Server peer {} unavailable", server);
                    self.retry_connection(state, &server, self.config.options.force_websocket);
                }
                None => debug!("Ignoring peer-unavailable without a server"),
            },
            SignalingErrorKind::WebRtc => debug!("Ignoring webrtc error"),
        }
        self.update_quality(state);
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut CoordinatorState, delay: Duration, action: RetryAction) {
        let weak = Arc::downgrade(self);
        state.retry_timer = Some(Timer::start(delay, move |timer_id| {
            if let Some(inner) = weak.upgrade() {
                inner.on_retry_due(timer_id, action);
            }
        }));
    }

    fn on_retry_due(self: &Arc<Self>, timer_id: u64, action: RetryAction) {
        let mut state = self.state.lock();
        let current = state.retry_timer.as_ref().map(Timer::id);
        if state.destroyed || current != Some(timer_id) {
            return;
        }
        state.retry_timer = None;
        match action {
            RetryAction::Reset => self.reset_locked(&mut state),
            RetryAction::Reconnect => {
                let session = state.session.clone().filter(|s| !s.is_destroyed());
                let Some(session) = session else {
                    self.reset_locked(&mut state);
                    return;
                };
                info!("Reconnecting to signaling server");
                if let Err(e) = session.reconnect() {
                    error!("Reconnect failed: {}", e);
                    self.set_status(&mut state, PeerStatus::Failed);
                    self.set_error(&mut state, PeerErrorKind::PeerNotFound);
                }
            }
        }
    }

    fn arm_heartbeat(self: &Arc<Self>, state: &mut CoordinatorState) {
        let weak = Arc::downgrade(self);
        state.heartbeat_timer = Some(Timer::start(
            self.config.timing.heartbeat_timeout(),
            move |timer_id| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_heartbeat_expired(timer_id);
                }
            },
        ));
    }

    fn on_heartbeat_expired(self: &Arc<Self>, timer_id: u64) {
        let mut state = self.state.lock();
        let current = state.heartbeat_timer.as_ref().map(Timer::id);
        if state.destroyed || current != Some(timer_id) {
            return;
        }
        state.heartbeat_timer = None;
        if self.hidden.load(Ordering::SeqCst) {
            debug!("Heartbeat missed while hidden");
            self.arm_heartbeat(&mut state);
            return;
        }
        warn!("No heartbeat from signaling server, resetting");
        self.set_status(&mut state, PeerStatus::Retry);
        self.reset_locked(&mut state);
    }

    // ========================================================================
    // Links
    // ========================================================================

    fn is_connected(&self, state: &CoordinatorState, peer: &str) -> bool {
        state
            .links
            .get(peer)
            .is_some_and(|entry| entry.link.connection().is_open())
    }

    fn create_peer_locked(self: &Arc<Self>, state: &mut CoordinatorState, code: &str, use_server: bool) {
        let Some(session) = state.session.clone() else {
            warn!("No signaling session, cannot connect to {}", code);
            return;
        };
        if session.is_destroyed() {
            return;
        }
        let options = self.outgoing_options();
        let connection = if use_server {
            Connection::relay(code, session, options.connection.clone())
        } else {
            match session.connect(code) {
                Ok(channel) => Connection::direct(session, channel, options.connection.clone()),
                Err(e) => {
                    warn!("Direct connect to {} failed ({}), using relay", code, e);
                    Connection::relay(code, session, options.connection.clone())
                }
            }
        };
        let via_server = connection.is_relay();
        info!(
            "Connecting to {} {}",
            code,
            if via_server { "through the server" } else { "directly" }
        );
        let link = Link::Outgoing(OutgoingSession::new(connection, options));
        let serial = self.register(state, code, link, via_server);
        self.arm_connect_timer(state, code, serial);
        self.update_quality(state);
    }

    fn register(self: &Arc<Self>, state: &mut CoordinatorState, peer: &str, link: Link, via_server: bool) -> u64 {
        if let Some(old) = state.links.remove(peer) {
            debug!("Replacing {} link to {}", old.link.direction(), peer);
            old.pump.abort();
            old.link.close();
        }
        state.connect_timers.remove(peer);
        state.reconnect_timers.remove(peer);

        state.next_serial += 1;
        let serial = state.next_serial;
        let mut events = link.subscribe();
        let weak = Arc::downgrade(self);
        let key = peer.to_string();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_link_event(&key, serial, event);
            }
        });
        state.links.insert(
            peer.to_string(),
            LinkEntry {
                serial,
                link,
                pump: pump.abort_handle(),
                via_server,
            },
        );
        serial
    }

    fn remove_link(&self, state: &mut CoordinatorState, peer: &str) {
        if let Some(entry) = state.links.remove(peer) {
            entry.pump.abort();
            entry.link.close();
        }
        state.connect_timers.remove(peer);
    }

    fn arm_connect_timer(self: &Arc<Self>, state: &mut CoordinatorState, peer: &str, serial: u64) {
        let weak = Arc::downgrade(self);
        let key = peer.to_string();
        let timer = Timer::start(self.config.timing.wait_time(), move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.on_connect_timeout(&key, serial);
            }
        });
        state.connect_timers.insert(peer.to_string(), timer);
    }

    fn on_connect_timeout(self: &Arc<Self>, peer: &str, serial: u64) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let Some(entry) = state.links.get(peer) else {
            return;
        };
        if entry.serial != serial {
            return;
        }
        let via_server = entry.via_server;
        let open = entry.link.connection().is_open();
        state.connect_timers.remove(peer);
        if open {
            return;
        }
        if via_server {
            warn!("Relay connection to {} timed out", peer);
            self.retry_connection(&mut state, peer, true);
        } else {
            warn!("Direct connection to {} timed out, trying the server relay", peer);
            self.remove_link(&mut state, peer);
            self.set_status(&mut state, PeerStatus::Retry);
            self.create_peer_locked(&mut state, peer, true);
        }
    }

    fn retry_connection(self: &Arc<Self>, state: &mut CoordinatorState, peer: &str, use_server: bool) {
        self.remove_link(state, peer);
        let timing = self.config.timing;
        if state.conn_retry_count >= timing.max_conn_retry {
            error!("Giving up on {} after {} attempts", peer, state.conn_retry_count);
            state.reconnect_timers.remove(peer);
            self.set_status(state, PeerStatus::Failed);
            self.set_error(state, PeerErrorKind::PeerNotFound);
            self.update_quality(state);
            return;
        }
        let delay = timing.backoff(state.conn_retry_count);
        state.conn_retry_count += 1;
        info!("Retrying {} in {:?}", peer, delay);
        self.set_status(state, PeerStatus::Retry);

        let weak = Arc::downgrade(self);
        let key = peer.to_string();
        let timer = Timer::start(delay, move |timer_id| {
            if let Some(inner) = weak.upgrade() {
                inner.on_reconnect_due(&key, timer_id, use_server);
            }
        });
        state.reconnect_timers.insert(peer.to_string(), timer);
        self.update_quality(state);
    }

    fn on_reconnect_due(self: &Arc<Self>, peer: &str, timer_id: u64, use_server: bool) {
        let mut state = self.state.lock();
        let current = state.reconnect_timers.get(peer).map(Timer::id);
        if state.destroyed || current != Some(timer_id) {
            return;
        }
        state.reconnect_timers.remove(peer);
        self.create_peer_locked(&mut state, peer, use_server);
    }

    fn on_link_event(self: &Arc<Self>, peer: &str, serial: u64, event: SessionEvent) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        let direction = match state.links.get(peer) {
            Some(entry) if entry.serial == serial => entry.link.direction(),
            _ => return,
        };
        match event {
            SessionEvent::Connect(connection) => {
                state.connect_timers.remove(peer);
                state.conn_retry_count = 0;
                info!(
                    "Connected to {} ({}, {})",
                    peer,
                    direction,
                    connection.connection_type()
                );
                if direction == Direction::Outgoing {
                    self.set_status(&mut state, PeerStatus::Ready);
                    self.set_error(&mut state, PeerErrorKind::None);
                }
                self.update_quality(&mut state);
                self.events.emit(CoordinatorEvent::Connect {
                    peer: peer.to_string(),
                    connection,
                });
            }
            SessionEvent::Data(message) => self.on_peer_data(&mut state, peer, message),
            SessionEvent::Retry => {
                self.events.emit(CoordinatorEvent::Close {
                    peer: peer.to_string(),
                });
                state.conn_retry_count += 1;
                if state.conn_retry_count > self.config.timing.max_conn_retry {
                    error!("Giving up on {}", peer);
                    self.remove_link(&mut state, peer);
                    self.set_status(&mut state, PeerStatus::Failed);
                    self.set_error(&mut state, PeerErrorKind::PeerNotFound);
                } else {
                    self.set_status(&mut state, PeerStatus::Retry);
                }
                self.update_quality(&mut state);
            }
            SessionEvent::Error(e) => {
                error!("Connection error with {}: {}", peer, e);
                if direction == Direction::Outgoing {
                    self.set_error(&mut state, PeerErrorKind::Unknown);
                    self.set_status(&mut state, PeerStatus::Failed);
                }
            }
            SessionEvent::Close => {
                if let Some(entry) = state.links.remove(peer) {
                    entry.pump.abort();
                }
                state.connect_timers.remove(peer);
                self.update_quality(&mut state);
                self.events.emit(CoordinatorEvent::Close {
                    peer: peer.to_string(),
                });
            }
        }
    }

    fn on_peer_data(self: &Arc<Self>, state: &mut CoordinatorState, peer: &str, message: AppMessage) {
        match message.builtin() {
            Some(BuiltinEvent::Connect { code }) => {
                if code == self.config.code || self.is_connected(state, &code) {
                    debug!("Already connected to {}", code);
                    return;
                }
                info!("{} asked us to connect to {}", peer, code);
                self.create_peer_locked(state, &code, false);
            }
            Some(BuiltinEvent::Ping { ok: false }) => {
                if let Some(entry) = state.links.get(peer) {
                    if let Err(e) = entry.link.connection().send(&AppMessage::pong()) {
                        warn!("Failed to answer ping from {}: {}", peer, e);
                    }
                }
            }
            _ => self.events.emit(CoordinatorEvent::Data {
                peer: peer.to_string(),
                message,
            }),
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    fn set_status(&self, state: &mut CoordinatorState, status: PeerStatus) {
        debug!("Status {} -> {}", state.status, status);
        state.status = status;
        self.events.emit(CoordinatorEvent::Status(status));
    }

    fn set_error(&self, state: &mut CoordinatorState, error: PeerErrorKind) {
        state.error = error;
        if error != PeerErrorKind::None {
            self.events.emit(CoordinatorEvent::Error(error));
        }
    }

    fn update_quality(&self, state: &mut CoordinatorState) {
        let session_up = state
            .session
            .as_ref()
            .is_some_and(|s| s.is_open() && !s.is_disconnected() && !s.is_destroyed());
        let quality = if session_up {
            state
                .links
                .values()
                .map(|entry| entry.link.connection().quality())
                .max()
                .unwrap_or(0)
        } else {
            0
        };
        if quality != state.quality {
            debug!("Quality {} -> {}", state.quality, quality);
            state.quality = quality;
            self.events.emit(CoordinatorEvent::Quality(quality));
        }
    }
}
