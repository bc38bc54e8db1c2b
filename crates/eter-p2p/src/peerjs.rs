//! PeerJS-compatible signaling over a WebSocket
//!
//! Speaks the PeerJS server protocol: connects to
//! `{ws|wss}://host:port{path}peerjs?key=..&id=..&token=..`, keeps the socket
//! alive with HEARTBEAT frames, and maps server frames onto
//! [`SignalingEvent`]s. Negotiation frames (OFFER/ANSWER/CANDIDATE/LEAVE) are
//! handed to an optional [`DirectChannelFactory`]; without one, `connect`
//! fails and peers fall back to the relay.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::events::{Emitter, Subscription};
use crate::transport::{
    DirectChannel, DirectChannelFactory, NegotiationMessage, SessionFactory, SessionParams,
    SignalSender, SignalingErrorKind, SignalingEvent, SignalingSession, TransportError,
};
use crate::types::{SignalingKind, SignalingMessage};

/// Interval between client HEARTBEAT frames
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Build the socket URL for a session
pub fn socket_url(params: &SessionParams, token: &str) -> String {
    let scheme = if params.secure { "wss" } else { "ws" };
    let path = if params.path.ends_with('/') {
        params.path.clone()
    } else {
        format!("{}/", params.path)
    };
    format!(
        "{}://{}:{}{}peerjs?key={}&id={}&token={}",
        scheme, params.host, params.port, path, params.key, params.id, token
    )
}

#[derive(Debug, Deserialize)]
struct ServerFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    src: String,
    #[serde(default)]
    dst: String,
    #[serde(default)]
    payload: Value,
}

/// Decoded server frame
#[derive(Debug, Clone, PartialEq)]
enum Inbound {
    Open,
    Error(SignalingErrorKind),
    Message(SignalingMessage),
    Negotiation(NegotiationMessage),
    Ignored(String),
}

fn payload_string(payload: Value) -> Option<String> {
    match payload {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn parse_frame(text: &str) -> Result<Inbound, serde_json::Error> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    let relayed = |kind| {
        Inbound::Message(SignalingMessage {
            kind,
            src: frame.src.clone(),
            dst: frame.dst.clone(),
            payload: payload_string(frame.payload.clone()),
        })
    };
    Ok(match frame.kind.as_str() {
        "OPEN" => Inbound::Open,
        "ID-TAKEN" => Inbound::Error(SignalingErrorKind::UnavailableId),
        "ERROR" => Inbound::Error(SignalingErrorKind::ServerError),
        "INVALID-KEY" => Inbound::Error(SignalingErrorKind::Other("invalid-key".to_string())),
        "EXPIRE" => Inbound::Error(SignalingErrorKind::PeerUnavailable),
        "KEY" => relayed(SignalingKind::Key),
        "DATA" => relayed(SignalingKind::Data),
        "HEARTBEAT" => relayed(SignalingKind::Heartbeat),
        "OFFER" | "ANSWER" | "CANDIDATE" | "LEAVE" => Inbound::Negotiation(NegotiationMessage {
            kind: frame.kind.clone(),
            src: frame.src.clone(),
            dst: frame.dst.clone(),
            payload: frame.payload.clone(),
        }),
        other => Inbound::Ignored(other.to_string()),
    })
}

// ============================================================================
// Factory
// ============================================================================

/// Opens PeerJS sessions
#[derive(Clone, Default)]
pub struct PeerJsSessionFactory {
    channels: Option<Arc<dyn DirectChannelFactory>>,
}

impl PeerJsSessionFactory {
    /// Relay-only factory: no direct channels
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(channels: Arc<dyn DirectChannelFactory>) -> Self {
        Self {
            channels: Some(channels),
        }
    }
}

impl SessionFactory for PeerJsSessionFactory {
    fn create(&self, params: &SessionParams) -> Result<Arc<dyn SignalingSession>, TransportError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TransportError::ConnectionFailed(
                "no tokio runtime".to_string(),
            ));
        }
        let session = PeerJsSession::open(params.clone(), self.channels.clone());
        Ok(Arc::new(session))
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Default)]
struct SocketState {
    open: bool,
    disconnected: bool,
    destroyed: bool,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<AbortHandle>,
}

struct PeerJsInner {
    params: SessionParams,
    channels: Option<Arc<dyn DirectChannelFactory>>,
    state: Mutex<SocketState>,
    events: Emitter<SignalingEvent>,
}

/// Live PeerJS session
#[derive(Clone)]
pub struct PeerJsSession {
    inner: Arc<PeerJsInner>,
}

impl PeerJsSession {
    /// Start connecting. `Open` is emitted once the server accepts the id.
    pub fn open(params: SessionParams, channels: Option<Arc<dyn DirectChannelFactory>>) -> Self {
        let inner = Arc::new(PeerJsInner {
            params,
            channels,
            state: Mutex::new(SocketState::default()),
            events: Emitter::new(),
        });
        inner.start_socket();
        Self { inner }
    }

    pub fn params(&self) -> &SessionParams {
        &self.inner.params
    }
}

impl PeerJsInner {
    fn start_socket(self: &Arc<Self>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = socket_url(&self.params, &uuid::Uuid::new_v4().to_string());
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        state.outbound = Some(tx);
        state.disconnected = false;
        let weak = Arc::downgrade(self);
        info!("Connecting to signaling server {}:{}", self.params.host, self.params.port);
        let task = tokio::spawn(run_socket(weak, generation, url, rx));
        state.task = Some(task.abort_handle());
    }

    fn signal_sender(self: &Arc<Self>) -> SignalSender {
        let weak: Weak<PeerJsInner> = Arc::downgrade(self);
        Arc::new(move |mut msg: NegotiationMessage| {
            let inner = weak.upgrade().ok_or(TransportError::Destroyed)?;
            if msg.src.is_empty() {
                msg.src = inner.params.id.clone();
            }
            let text = serde_json::to_string(&msg)
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            inner.send_text(text)
        })
    }

    fn send_text(&self, text: String) -> Result<(), TransportError> {
        let state = self.state.lock();
        if state.destroyed {
            return Err(TransportError::Destroyed);
        }
        let outbound = state.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        outbound
            .send(text)
            .map_err(|_| TransportError::NotConnected)
    }

    fn on_frame(self: &Arc<Self>, generation: u64, text: &str) {
        if self.state.lock().generation != generation {
            return;
        }
        let inbound = match parse_frame(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Malformed signaling frame: {}", e);
                return;
            }
        };
        match inbound {
            Inbound::Open => {
                {
                    let mut state = self.state.lock();
                    state.open = true;
                    state.disconnected = false;
                }
                info!("Registered as {}", self.params.id);
                self.events.emit(SignalingEvent::Open);
            }
            Inbound::Error(kind) => {
                debug!("Signaling error frame: {}", kind);
                self.events.emit(SignalingEvent::Error(kind));
            }
            Inbound::Message(msg) => self.events.emit(SignalingEvent::Message(msg)),
            Inbound::Negotiation(msg) => {
                let Some(channels) = &self.channels else {
                    debug!("Ignoring {} from {}: no direct channels", msg.kind, msg.src);
                    return;
                };
                if let Some(channel) =
                    channels.handle_signal(&self.params.id, msg, self.signal_sender())
                {
                    self.events.emit(SignalingEvent::Connection(channel));
                }
            }
            Inbound::Ignored(kind) => debug!("Ignoring {} frame", kind),
        }
    }

    fn on_socket_lost(&self, generation: u64, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.destroyed || state.generation != generation {
                return;
            }
            state.open = false;
            state.disconnected = true;
            state.outbound = None;
            state.task = None;
        }
        warn!("Lost signaling server: {}", reason);
        self.events.emit(SignalingEvent::Disconnected);
        self.events.emit(SignalingEvent::Error(SignalingErrorKind::Network));
    }
}

async fn run_socket(
    weak: Weak<PeerJsInner>,
    generation: u64,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let reason = match connect_async(url.as_str()).await {
        Ok((stream, _)) => {
            let (mut write, mut read) = stream.split();
            let heartbeat = SignalingMessage::heartbeat();
            let heartbeat = serde_json::to_string(&heartbeat).unwrap_or_default();
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = write.send(Message::Text(heartbeat.clone().into())).await {
                            break e.to_string();
                        }
                    }
                    Some(text) = outbound.recv() => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            break e.to_string();
                        }
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let Some(inner) = weak.upgrade() else {
                                    return;
                                };
                                inner.on_frame(generation, &text);
                            }
                            Some(Ok(Message::Close(_))) | None => break "socket closed".to_string(),
                            Some(Err(e)) => break e.to_string(),
                            _ => {}
                        }
                    }
                }
            }
        }
        Err(e) => e.to_string(),
    };
    if let Some(inner) = weak.upgrade() {
        inner.on_socket_lost(generation, &reason);
    }
}

impl SignalingSession for PeerJsSession {
    fn id(&self) -> &str {
        &self.inner.params.id
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    fn is_disconnected(&self) -> bool {
        self.inner.state.lock().disconnected
    }

    fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    fn subscribe(&self) -> Subscription<SignalingEvent> {
        self.inner.events.subscribe()
    }

    fn send(&self, mut msg: SignalingMessage) -> Result<(), TransportError> {
        if msg.src.is_empty() {
            msg.src = self.inner.params.id.clone();
        }
        let text =
            serde_json::to_string(&msg).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.inner.send_text(text)
    }

    fn connect(&self, peer: &str) -> Result<Arc<dyn DirectChannel>, TransportError> {
        if self.is_destroyed() {
            return Err(TransportError::Destroyed);
        }
        let channels = self.inner.channels.as_ref().ok_or(TransportError::Unsupported)?;
        channels.connect(&self.inner.params.id, peer, self.inner.signal_sender())
    }

    fn reconnect(&self) -> Result<(), TransportError> {
        {
            let state = self.inner.state.lock();
            if state.destroyed {
                return Err(TransportError::Destroyed);
            }
            if state.open || state.task.is_some() {
                return Ok(());
            }
        }
        self.inner.start_socket();
        Ok(())
    }

    fn destroy(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.open = false;
            state.disconnected = true;
            state.outbound = None;
            if let Some(task) = state.task.take() {
                task.abort();
            }
        }
        if let Some(channels) = &self.inner.channels {
            channels.close_all();
        }
        info!("Signaling session {} destroyed", self.inner.params.id);
        self.inner.events.emit(SignalingEvent::Close);
    }
}
