//! One logical link to a remote peer
//!
//! A [`Connection`] either wraps a direct data channel (p2p or TURN, found out
//! from the ICE stats once the channel opens) or runs in relay mode, where
//! every message is encrypted and sent through the signaling server. Both
//! modes expose the same events: `Open`, `Data`, `Close { explicit }`.
//!
//! Relay handshake:
//! 1. generate an ephemeral key pair, send `KEY` with our public JWK
//! 2. on the remote `KEY` (`set_key`) derive the AES key, emit `Open`
//! 3. `DATA` payloads arriving before step 2 are queued and replayed

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::crypto::{CryptoError, KeyExchange, SymmetricCipher};
use crate::events::{Emitter, Subscription, SubscriptionId};
use crate::timer::Timer;
use crate::transport::{
    CandidatePairState, CandidateType, ChannelEvent, DirectChannel, IceConnectionState,
    SignalingEvent, SignalingSession, StatsEntry, StatsReport, TransportError,
};
use crate::types::{AppMessage, ConnectionType, EncryptedPayload, SignalingMessage};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Key exchange is not used on a direct connection")]
    NotRelay,
    #[error("Failed to send, no key")]
    NoKey,
    #[error("Invalid encrypted packet")]
    InvalidPacket,
    #[error("Connection closed")]
    Closed,
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    Data(AppMessage),
    /// `explicit` is true when closed through [`Connection::close`]
    Close { explicit: bool },
    Error(String),
    /// Our key pair exists and our KEY was sent
    CryptoReady,
    /// Not open within `wait_timeout`
    Timeout,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub wait_timeout: Option<Duration>,
    /// Close the direct channel once ICE starts checking
    pub drop_ice: bool,
}

#[derive(Default)]
struct ConnectionState {
    connection_type: ConnectionType,
    opened: bool,
    closed: bool,
    keys: Option<Arc<KeyExchange>>,
    pending_remote_key: Option<String>,
    remote_key: Option<String>,
    cipher: Option<Arc<SymmetricCipher>>,
    queue: Vec<String>,
    wait_timer: Option<Timer>,
}

struct ConnectionInner {
    id: u64,
    peer: String,
    session: Arc<dyn SignalingSession>,
    channel: Option<Arc<dyn DirectChannel>>,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    events: Emitter<ConnectionEvent>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// Link to one remote peer. Cloning shares the link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("type", &self.connection_type())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Wrap a direct channel. The path type is read from stats when it opens.
    pub fn direct(
        session: Arc<dyn SignalingSession>,
        channel: Arc<dyn DirectChannel>,
        options: ConnectionOptions,
    ) -> Self {
        let peer = channel.peer().to_string();
        let mut channel_events = channel.subscribe();
        let inner = Arc::new(ConnectionInner::new(peer, session, Some(channel), options));

        let weak = Arc::downgrade(&inner);
        let driver = tokio::spawn(async move {
            while let Some(event) = channel_events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_channel_event(event).await;
            }
        });
        inner.track(driver.abort_handle());
        inner.arm_wait_timer();
        debug!("Direct connection {} to {}", inner.id, inner.peer);
        Self { inner }
    }

    /// Encrypted link through the signaling server
    pub fn relay(
        peer: impl Into<String>,
        session: Arc<dyn SignalingSession>,
        options: ConnectionOptions,
    ) -> Self {
        let mut session_events = session.subscribe();
        let inner = Arc::new(ConnectionInner::new(peer.into(), session, None, options));

        let weak = Arc::downgrade(&inner);
        let listener = tokio::spawn(async move {
            while let Some(event) = session_events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                match event {
                    SignalingEvent::Disconnected | SignalingEvent::Close => {
                        inner.mark_closed(false);
                    }
                    SignalingEvent::Open => inner.on_session_reopened(),
                    _ => {}
                }
            }
        });

        let weak = Arc::downgrade(&inner);
        let keygen = tokio::spawn(async move {
            match tokio::task::spawn_blocking(KeyExchange::generate).await {
                Ok(keys) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_keys_ready(keys);
                    }
                }
                Err(e) => error!("Key generation failed: {}", e),
            }
        });

        inner.track(listener.abort_handle());
        inner.track(keygen.abort_handle());
        inner.arm_wait_timer();
        debug!("Relay connection {} to {}", inner.id, inner.peer);
        Self { inner }
    }

    /// Unique per connection object
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn session(&self) -> &Arc<dyn SignalingSession> {
        &self.inner.session
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.inner.state.lock().connection_type
    }

    /// Relayed through the signaling server
    pub fn is_relay(&self) -> bool {
        self.inner.channel.is_none()
    }

    pub fn is_open(&self) -> bool {
        let state = self.inner.state.lock();
        if state.closed {
            return false;
        }
        match &self.inner.channel {
            Some(channel) => state.opened && channel.is_open(),
            None => state.cipher.is_some(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// 0 when not open, otherwise the path's quality
    pub fn quality(&self) -> u8 {
        if self.is_open() {
            self.connection_type().quality()
        } else {
            0
        }
    }

    /// Our public JWK once generated (relay mode)
    pub fn public_key(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .keys
            .as_ref()
            .map(|keys| keys.public_key().to_string())
    }

    pub fn subscribe(&self) -> Subscription<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.events.unsubscribe(id);
    }

    pub fn clear_listeners(&self) {
        self.inner.events.clear();
    }

    pub fn send(&self, msg: &AppMessage) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        if let Some(channel) = &inner.channel {
            return Ok(channel.send(msg)?);
        }
        let cipher = inner
            .state
            .lock()
            .cipher
            .clone()
            .ok_or(ConnectionError::NoKey)?;
        let plaintext = serde_json::to_vec(msg)?;
        let payload = serde_json::to_string(&cipher.seal(&plaintext)?)?;
        inner.session.send(SignalingMessage::data(
            inner.session.id(),
            inner.peer.clone(),
            payload,
        ))?;
        Ok(())
    }

    /// Apply the remote public key (relay mode)
    pub fn set_key(&self, remote_jwk: &str) -> Result<(), ConnectionError> {
        self.inner.set_key(remote_jwk)
    }

    /// Decrypt a DATA payload and emit it (relay mode)
    pub fn decrypt_payload(&self, raw: &str) -> Result<(), ConnectionError> {
        self.inner.decrypt_payload(raw)
    }

    pub fn close(&self) {
        if !self.inner.mark_closed(true) {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            state.cipher = None;
            state.keys = None;
            state.pending_remote_key = None;
        }
        if let Some(channel) = &self.inner.channel {
            channel.close();
        }
        debug!("Closed connection {} to {}", self.inner.id, self.inner.peer);
    }
}

impl ConnectionInner {
    fn new(
        peer: String,
        session: Arc<dyn SignalingSession>,
        channel: Option<Arc<dyn DirectChannel>>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            session,
            channel,
            options,
            state: Mutex::new(ConnectionState::default()),
            events: Emitter::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, handle: AbortHandle) {
        self.tasks.lock().push(handle);
    }

    fn arm_wait_timer(self: &Arc<Self>) {
        let Some(delay) = self.options.wait_timeout else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = Timer::start(delay, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.on_wait_timeout();
            }
        });
        self.state.lock().wait_timer = Some(timer);
    }

    fn on_wait_timeout(&self) {
        {
            let mut state = self.state.lock();
            if state.closed || state.opened {
                return;
            }
            state.wait_timer = None;
        }
        warn!("Connection to {} not open in time", self.peer);
        self.events.emit(ConnectionEvent::Timeout);
    }

    /// Returns false if already closed
    fn mark_closed(&self, explicit: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            state.wait_timer = None;
            state.queue.clear();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.events.emit(ConnectionEvent::Close { explicit });
        true
    }

    async fn on_channel_event(&self, event: ChannelEvent) {
        let Some(channel) = self.channel.clone() else {
            return;
        };
        match event {
            ChannelEvent::Open => {
                let connection_type = match channel.stats().await {
                    Ok(report) => classify_path(&report),
                    Err(e) => {
                        warn!("Stats unavailable for {}: {}", self.peer, e);
                        ConnectionType::Server
                    }
                };
                if connection_type == ConnectionType::Server {
                    warn!("Could not determine connection type for {}", self.peer);
                }
                {
                    let mut state = self.state.lock();
                    if state.closed {
                        debug!("Connection to {} closed before stats resolved", self.peer);
                        return;
                    }
                    state.connection_type = connection_type;
                    state.opened = true;
                    state.wait_timer = None;
                }
                info!("Connection to {} open ({})", self.peer, connection_type);
                self.events.emit(ConnectionEvent::Open);
            }
            ChannelEvent::Data(msg) => {
                if !self.state.lock().closed {
                    self.events.emit(ConnectionEvent::Data(msg));
                }
            }
            ChannelEvent::Close => {
                if self.mark_closed(false) {
                    info!("Channel to {} closed", self.peer);
                }
            }
            ChannelEvent::Error(e) => {
                error!("Channel error from {}: {}", self.peer, e);
                self.events.emit(ConnectionEvent::Error(e));
            }
            ChannelEvent::IceStateChanged(IceConnectionState::Disconnected) => {
                debug!("ICE disconnected for {}", self.peer);
                if channel.is_open() {
                    channel.close();
                } else {
                    self.mark_closed(false);
                }
            }
            ChannelEvent::IceStateChanged(IceConnectionState::Checking) if self.options.drop_ice => {
                debug!("Dropping ICE for {}", self.peer);
                channel.close();
            }
            ChannelEvent::IceStateChanged(_) => {}
        }
    }

    fn on_keys_ready(&self, keys: KeyExchange) {
        let pending = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.keys = Some(Arc::new(keys));
            state.pending_remote_key.take()
        };
        self.send_handshake();
        self.events.emit(ConnectionEvent::CryptoReady);
        if let Some(remote_jwk) = pending {
            if let Err(e) = self.set_key(&remote_jwk) {
                warn!("Failed to apply key from {}: {}", self.peer, e);
            }
        }
    }

    fn on_session_reopened(&self) {
        let waiting = {
            let state = self.state.lock();
            !state.closed && state.cipher.is_none() && state.keys.is_some()
        };
        if waiting {
            self.send_handshake();
        }
    }

    fn send_handshake(&self) {
        let Some(jwk) = self
            .state
            .lock()
            .keys
            .as_ref()
            .map(|keys| keys.public_key().to_string())
        else {
            return;
        };
        let msg = SignalingMessage::key(self.session.id(), self.peer.clone(), jwk);
        match self.session.send(msg) {
            Ok(()) => debug!("Sent public key to {}", self.peer),
            Err(e) => warn!("Failed to send public key to {}: {}", self.peer, e),
        }
    }

    fn set_key(&self, remote_jwk: &str) -> Result<(), ConnectionError> {
        if self.channel.is_some() {
            return Err(ConnectionError::NotRelay);
        }
        let keys = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            if state.cipher.is_some() && state.remote_key.as_deref() == Some(remote_jwk) {
                return Ok(());
            }
            match state.keys.clone() {
                Some(keys) => keys,
                None => {
                    debug!("Keys not ready, holding key from {}", self.peer);
                    state.pending_remote_key = Some(remote_jwk.to_string());
                    return Ok(());
                }
            }
        };

        let cipher = Arc::new(keys.derive(remote_jwk)?);
        let (rekey, queued) = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            let rekey = state.cipher.is_some();
            state.cipher = Some(cipher);
            state.remote_key = Some(remote_jwk.to_string());
            state.opened = true;
            state.wait_timer = None;
            (rekey, std::mem::take(&mut state.queue))
        };

        if rekey {
            info!("Remote key changed for {}, re-keyed", self.peer);
            self.send_handshake();
        }
        info!("Relay connection to {} open", self.peer);
        self.events.emit(ConnectionEvent::Open);

        for raw in queued {
            if let Err(e) = self.decrypt_payload(&raw) {
                warn!("Dropping queued packet from {}: {}", self.peer, e);
            }
        }
        Ok(())
    }

    fn decrypt_payload(&self, raw: &str) -> Result<(), ConnectionError> {
        if self.channel.is_some() {
            return Err(ConnectionError::NotRelay);
        }
        let cipher = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ConnectionError::Closed);
            }
            match state.cipher.clone() {
                Some(cipher) => cipher,
                None => {
                    state.queue.push(raw.to_string());
                    return Ok(());
                }
            }
        };

        let payload: EncryptedPayload =
            serde_json::from_str(raw).map_err(|_| ConnectionError::InvalidPacket)?;
        if payload.data.is_empty() || payload.iv.is_empty() {
            return Err(ConnectionError::InvalidPacket);
        }
        let plaintext = cipher.open(&payload)?;
        let msg: AppMessage = serde_json::from_slice(&plaintext)?;
        self.events.emit(ConnectionEvent::Data(msg));
        Ok(())
    }
}

/// Path type from ICE stats: a selected pair whose remote candidate is a
/// relay means TURN, any other remote candidate means p2p.
pub fn classify_path(report: &StatsReport) -> ConnectionType {
    let mut path = ConnectionType::Server;
    for entry in report.entries.values() {
        let StatsEntry::CandidatePair {
            state,
            remote_candidate_id,
        } = entry
        else {
            continue;
        };
        if !matches!(
            state,
            CandidatePairState::Succeeded | CandidatePairState::InProgress
        ) {
            continue;
        }
        match report.get(remote_candidate_id) {
            Some(StatsEntry::RemoteCandidate {
                candidate_type: CandidateType::Relay,
            }) => path = ConnectionType::Relay,
            Some(_) => return ConnectionType::P2p,
            None => {}
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{DirectMode, MockDirectChannel, MockSignalingServer};
    use crate::types::SignalingKind;

    async fn next_event(sub: &mut Subscription<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(30), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    async fn wait_open(sub: &mut Subscription<ConnectionEvent>) {
        loop {
            if let ConnectionEvent::Open = next_event(sub).await {
                return;
            }
        }
    }

    fn session(server: &Arc<MockSignalingServer>, id: &str) -> Arc<dyn SignalingSession> {
        Arc::new(server.open_session(id))
    }

    #[test]
    fn test_classify_path() {
        assert_eq!(
            classify_path(&StatsReport::with_selected_pair(CandidateType::Host)),
            ConnectionType::P2p
        );
        assert_eq!(
            classify_path(&StatsReport::with_selected_pair(CandidateType::Srflx)),
            ConnectionType::P2p
        );
        assert_eq!(
            classify_path(&StatsReport::with_selected_pair(CandidateType::Relay)),
            ConnectionType::Relay
        );
        assert_eq!(classify_path(&StatsReport::new()), ConnectionType::Server);
    }

    #[test]
    fn test_classify_ignores_unselected_pairs() {
        let mut report = StatsReport::new();
        report.insert(
            "pair",
            StatsEntry::CandidatePair {
                state: CandidatePairState::Failed,
                remote_candidate_id: "remote".to_string(),
            },
        );
        report.insert(
            "remote",
            StatsEntry::RemoteCandidate {
                candidate_type: CandidateType::Host,
            },
        );
        assert_eq!(classify_path(&report), ConnectionType::Server);

        report.insert(
            "pair2",
            StatsEntry::CandidatePair {
                state: CandidatePairState::InProgress,
                remote_candidate_id: "missing".to_string(),
            },
        );
        assert_eq!(classify_path(&report), ConnectionType::Server);
    }

    #[tokio::test]
    async fn test_direct_open_reports_p2p() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let _b = session(&server, "b");

        let conn = Connection::direct(a.clone(), a.connect("b").unwrap(), Default::default());
        let mut events = conn.subscribe();
        wait_open(&mut events).await;

        assert!(conn.is_open());
        assert!(!conn.is_relay());
        assert_eq!(conn.connection_type(), ConnectionType::P2p);
        assert_eq!(conn.quality(), 3);
    }

    #[tokio::test]
    async fn test_direct_open_reports_turn_relay() {
        let server = MockSignalingServer::new();
        server.set_direct_mode(DirectMode::Open(StatsReport::with_selected_pair(
            CandidateType::Relay,
        )));
        let a = session(&server, "a");
        let _b = session(&server, "b");

        let conn = Connection::direct(a.clone(), a.connect("b").unwrap(), Default::default());
        let mut events = conn.subscribe();
        wait_open(&mut events).await;
        assert_eq!(conn.connection_type(), ConnectionType::Relay);
        assert_eq!(conn.quality(), 2);
    }

    #[tokio::test]
    async fn test_inconclusive_stats_still_open() {
        let server = MockSignalingServer::new();
        server.set_direct_mode(DirectMode::Open(StatsReport::new()));
        let a = session(&server, "a");
        let _b = session(&server, "b");

        let conn = Connection::direct(a.clone(), a.connect("b").unwrap(), Default::default());
        let mut events = conn.subscribe();
        wait_open(&mut events).await;
        assert_eq!(conn.connection_type(), ConnectionType::Server);
        assert_eq!(conn.quality(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_stats_suppresses_open() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let (local, remote) = MockDirectChannel::pair("a", "b");
        local.set_stats_delay(Duration::from_secs(1));

        let conn = Connection::direct(a, local.clone(), Default::default());
        let mut events = conn.subscribe();
        local.open();
        remote.open();
        tokio::time::sleep(Duration::from_millis(10)).await;

        conn.close();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(matches!(
            events.try_recv(),
            Some(ConnectionEvent::Close { explicit: true })
        ));
        assert!(events.try_recv().is_none());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_close_emits_once() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let _b = session(&server, "b");
        let conn = Connection::direct(a.clone(), a.connect("b").unwrap(), Default::default());
        let mut events = conn.subscribe();
        wait_open(&mut events).await;

        conn.close();
        conn.close();
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Close { explicit: true }
        ));
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_remote_close_is_implicit() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let (local, remote) = MockDirectChannel::pair("a", "b");
        let conn = Connection::direct(a, local.clone(), Default::default());
        let mut events = conn.subscribe();
        local.open();
        remote.open();
        wait_open(&mut events).await;

        remote.close();
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Close { explicit: false }
        ));
    }

    #[tokio::test]
    async fn test_ice_disconnect_closes_channel() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let (local, remote) = MockDirectChannel::pair("a", "b");
        let conn = Connection::direct(a, local.clone(), Default::default());
        let mut events = conn.subscribe();
        local.open();
        remote.open();
        wait_open(&mut events).await;

        local.set_ice_state(IceConnectionState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Close { explicit: false }
        ));
        assert!(!local.is_open());
        assert!(!remote.is_open());
    }

    #[tokio::test]
    async fn test_ice_disconnect_before_open() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let (local, _remote) = MockDirectChannel::pair("a", "b");
        let conn = Connection::direct(a, local.clone(), Default::default());
        let mut events = conn.subscribe();

        local.set_ice_state(IceConnectionState::Disconnected);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Close { explicit: false }
        ));
    }

    #[tokio::test]
    async fn test_drop_ice_closes_on_checking() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let (local, _remote) = MockDirectChannel::pair("a", "b");
        let options = ConnectionOptions {
            drop_ice: true,
            ..Default::default()
        };
        let conn = Connection::direct(a, local.clone(), options);
        let mut events = conn.subscribe();

        local.set_ice_state(IceConnectionState::Checking);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Close { explicit: false }
        ));
    }

    #[tokio::test]
    async fn test_direct_rejects_key_operations() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let (local, _remote) = MockDirectChannel::pair("a", "b");
        let conn = Connection::direct(a, local, Default::default());
        assert!(matches!(conn.set_key("{}"), Err(ConnectionError::NotRelay)));
        assert!(matches!(
            conn.decrypt_payload("{}"),
            Err(ConnectionError::NotRelay)
        ));
    }

    #[tokio::test]
    async fn test_relay_handshake_and_data() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let b = server.open_session("b");
        let mut b_inbox = b.subscribe();

        let conn_a = Connection::relay("b", Arc::new(a.clone()), Default::default());
        let conn_b = Connection::relay("a", Arc::new(b.clone()), Default::default());
        let mut a_events = conn_a.subscribe();
        let mut b_events = conn_b.subscribe();

        assert!(matches!(
            next_event(&mut a_events).await,
            ConnectionEvent::CryptoReady
        ));
        assert!(matches!(
            next_event(&mut b_events).await,
            ConnectionEvent::CryptoReady
        ));
        assert!(!conn_a.is_open());
        assert!(matches!(conn_a.send(&AppMessage::new("x")), Err(ConnectionError::NoKey)));

        let key_to_b = a
            .sent()
            .into_iter()
            .find(|m| m.kind == SignalingKind::Key && m.dst == "b")
            .unwrap();
        assert_eq!(key_to_b.payload.as_deref(), conn_a.public_key().as_deref());

        conn_a.set_key(&conn_b.public_key().unwrap()).unwrap();
        conn_b.set_key(&conn_a.public_key().unwrap()).unwrap();
        wait_open(&mut a_events).await;
        wait_open(&mut b_events).await;
        assert!(conn_a.is_open());
        assert_eq!(conn_a.connection_type(), ConnectionType::Server);
        assert_eq!(conn_a.quality(), 1);

        let msg = AppMessage::new("chat").with("text", "hello").with("n", 3);
        conn_a.send(&msg).unwrap();

        let payload = loop {
            match b_inbox.recv().await {
                Some(SignalingEvent::Message(m)) if m.kind == SignalingKind::Data => {
                    break m.payload.unwrap();
                }
                Some(_) => continue,
                None => panic!("session closed"),
            }
        };
        assert!(!payload.contains("hello"));

        conn_b.decrypt_payload(&payload).unwrap();
        match next_event(&mut b_events).await {
            ConnectionEvent::Data(received) => assert_eq!(received, msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_before_key_is_replayed() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let b = server.open_session("b");

        let conn_a = Connection::relay("b", Arc::new(a), Default::default());
        let conn_b = Connection::relay("a", Arc::new(b), Default::default());
        let mut a_events = conn_a.subscribe();
        let mut b_events = conn_b.subscribe();
        next_event(&mut a_events).await;
        next_event(&mut b_events).await;

        conn_a.set_key(&conn_b.public_key().unwrap()).unwrap();
        let cipher = conn_a.inner.state.lock().cipher.clone().unwrap();
        let sealed = cipher.seal(br#"{"event":"early"}"#).unwrap();
        let raw = serde_json::to_string(&sealed).unwrap();

        conn_b.decrypt_payload(&raw).unwrap();
        conn_b.set_key(&conn_a.public_key().unwrap()).unwrap();

        assert!(matches!(next_event(&mut b_events).await, ConnectionEvent::Open));
        match next_event(&mut b_events).await {
            ConnectionEvent::Data(msg) => assert_eq!(msg.event, "early"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_early_payloads_replayed_in_order() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let b = server.open_session("b");

        let conn_a = Connection::relay("b", Arc::new(a), Default::default());
        let conn_b = Connection::relay("a", Arc::new(b), Default::default());
        let mut a_events = conn_a.subscribe();
        let mut b_events = conn_b.subscribe();
        next_event(&mut a_events).await;
        next_event(&mut b_events).await;

        conn_a.set_key(&conn_b.public_key().unwrap()).unwrap();
        let cipher = conn_a.inner.state.lock().cipher.clone().unwrap();
        for i in 0..300 {
            let msg = AppMessage::new(format!("m{}", i));
            let sealed = cipher.seal(&serde_json::to_vec(&msg).unwrap()).unwrap();
            conn_b
                .decrypt_payload(&serde_json::to_string(&sealed).unwrap())
                .unwrap();
        }
        conn_b.set_key(&conn_a.public_key().unwrap()).unwrap();

        assert!(matches!(next_event(&mut b_events).await, ConnectionEvent::Open));
        for i in 0..300 {
            match next_event(&mut b_events).await {
                ConnectionEvent::Data(msg) => assert_eq!(msg.event, format!("m{}", i)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_remote_key_before_own_keys() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let _b = server.open_session("b");
        let remote = KeyExchange::generate();

        let conn = Connection::relay("b", Arc::new(a), Default::default());
        let mut events = conn.subscribe();
        conn.set_key(remote.public_key()).unwrap();

        assert!(matches!(next_event(&mut events).await, ConnectionEvent::CryptoReady));
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Open));
    }

    #[tokio::test]
    async fn test_invalid_packets() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let conn = Connection::relay("b", Arc::new(a), Default::default());
        let mut events = conn.subscribe();
        next_event(&mut events).await;
        conn.set_key(KeyExchange::generate().public_key()).unwrap();

        assert!(matches!(
            conn.decrypt_payload("garbage"),
            Err(ConnectionError::InvalidPacket)
        ));
        assert!(matches!(
            conn.decrypt_payload(r#"{"data":"","iv":""}"#),
            Err(ConnectionError::InvalidPacket)
        ));
        assert!(matches!(
            conn.decrypt_payload(r#"{"data":"AAAA","iv":"AAAAAAAAAAAAAAAA"}"#),
            Err(ConnectionError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_session_disconnect_closes_relay() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let conn = Connection::relay("b", Arc::new(a.clone()), Default::default());
        let mut events = conn.subscribe();
        next_event(&mut events).await;

        a.disconnect();
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Close { explicit: false }
        ));
    }

    #[tokio::test]
    async fn test_rekey_resends_own_key() {
        let server = MockSignalingServer::new();
        let a = server.open_session("a");
        let conn = Connection::relay("b", Arc::new(a.clone()), Default::default());
        let mut events = conn.subscribe();
        next_event(&mut events).await;

        let first = KeyExchange::generate();
        conn.set_key(first.public_key()).unwrap();
        conn.set_key(first.public_key()).unwrap();
        let keys_sent = |s: &crate::mock::MockSession| {
            s.sent()
                .iter()
                .filter(|m| m.kind == SignalingKind::Key)
                .count()
        };
        assert_eq!(keys_sent(&a), 1);

        let second = KeyExchange::generate();
        conn.set_key(second.public_key()).unwrap();
        assert_eq!(keys_sent(&a), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let server = MockSignalingServer::new();
        let a = session(&server, "a");
        let (local, _remote) = MockDirectChannel::pair("a", "b");
        let options = ConnectionOptions {
            wait_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let conn = Connection::direct(a, local, options);
        let mut events = conn.subscribe();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Timeout));
        assert!(!conn.is_open());
    }
}
