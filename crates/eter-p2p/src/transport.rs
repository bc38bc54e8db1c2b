//! Signaling transport abstraction
//!
//! The signaling server (peer discovery, message relay) and the raw direct
//! data channels are provided by an external library. These traits are the
//! seam: real adapters (`peerjs`, `rtc`) and the in-process `mock` implement
//! them, and everything above is shared.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::events::Subscription;
use crate::types::{AppMessage, IceServer, SignalingMessage};

/// Errors from transport operations
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Session destroyed")]
    Destroyed,
    #[error("Direct channels not supported")]
    Unsupported,
}

/// Error reported by the signaling session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SignalingErrorKind {
    Disconnected,
    Network,
    ServerError,
    UnavailableId,
    BrowserIncompatible,
    PeerUnavailable,
    WebRtc,
    Other(String),
}

impl SignalingErrorKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "disconnected" => Self::Disconnected,
            "network" => Self::Network,
            "server-error" => Self::ServerError,
            "unavailable-id" => Self::UnavailableId,
            "browser-incompatible" => Self::BrowserIncompatible,
            "peer-unavailable" => Self::PeerUnavailable,
            "webrtc" => Self::WebRtc,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Network => "network",
            Self::ServerError => "server-error",
            Self::UnavailableId => "unavailable-id",
            Self::BrowserIncompatible => "browser-incompatible",
            Self::PeerUnavailable => "peer-unavailable",
            Self::WebRtc => "webrtc",
            Self::Other(other) => other,
        }
    }
}

impl fmt::Display for SignalingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event from a signaling session
#[derive(Clone)]
pub enum SignalingEvent {
    /// Registered with the server under our id
    Open,
    /// A remote peer opened a direct channel to us
    Connection(Arc<dyn DirectChannel>),
    /// KEY / DATA / HEARTBEAT relayed by the server
    Message(SignalingMessage),
    Error(SignalingErrorKind),
    /// Lost the server but can reconnect
    Disconnected,
    /// Destroyed
    Close,
}

impl fmt::Debug for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("Open"),
            Self::Connection(channel) => write!(f, "Connection({})", channel.peer()),
            Self::Message(msg) => write!(f, "Message({:?})", msg),
            Self::Error(kind) => write!(f, "Error({})", kind),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Close => f.write_str("Close"),
        }
    }
}

/// Parameters for opening a signaling session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub id: String,
    pub host: String,
    pub secure: bool,
    pub key: String,
    pub port: u16,
    pub path: String,
    /// At most one server is passed on
    pub ice_servers: Vec<IceServer>,
    /// Restrict ICE to relayed candidates
    pub relay_only: bool,
}

/// Connection to the signaling server under one identifier
pub trait SignalingSession: Send + Sync {
    fn id(&self) -> &str;

    fn is_open(&self) -> bool;

    fn is_disconnected(&self) -> bool;

    fn is_destroyed(&self) -> bool;

    fn subscribe(&self) -> Subscription<SignalingEvent>;

    /// Relay a message through the server
    fn send(&self, msg: SignalingMessage) -> Result<(), TransportError>;

    /// Start opening a direct channel to `peer`. The channel reports `Open` later.
    fn connect(&self, peer: &str) -> Result<Arc<dyn DirectChannel>, TransportError>;

    /// Re-register after a disconnect
    fn reconnect(&self) -> Result<(), TransportError>;

    fn destroy(&self);
}

/// Creates signaling sessions
pub trait SessionFactory: Send + Sync {
    fn create(&self, params: &SessionParams) -> Result<Arc<dyn SignalingSession>, TransportError>;
}

impl<T: SessionFactory + ?Sized> SessionFactory for Arc<T> {
    fn create(&self, params: &SessionParams) -> Result<Arc<dyn SignalingSession>, TransportError> {
        (**self).create(params)
    }
}

/// ICE connection state of a direct channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Event from a direct channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Data(AppMessage),
    Close,
    Error(String),
    IceStateChanged(IceConnectionState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsEntry {
    CandidatePair {
        state: CandidatePairState,
        remote_candidate_id: String,
    },
    RemoteCandidate {
        candidate_type: CandidateType,
    },
    Other,
}

/// Connection statistics keyed by stats id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsReport {
    pub entries: HashMap<String, StatsEntry>,
}

impl StatsReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, entry: StatsEntry) {
        self.entries.insert(id.into(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&StatsEntry> {
        self.entries.get(id)
    }

    /// Report with one succeeded pair whose remote candidate has `candidate_type`
    pub fn with_selected_pair(candidate_type: CandidateType) -> Self {
        let mut report = Self::new();
        report.insert(
            "pair",
            StatsEntry::CandidatePair {
                state: CandidatePairState::Succeeded,
                remote_candidate_id: "remote".to_string(),
            },
        );
        report.insert("remote", StatsEntry::RemoteCandidate { candidate_type });
        report
    }
}

/// Raw direct data channel to one peer
#[async_trait]
pub trait DirectChannel: Send + Sync {
    fn peer(&self) -> &str;

    fn connection_id(&self) -> &str;

    fn is_open(&self) -> bool;

    fn subscribe(&self) -> Subscription<ChannelEvent>;

    fn send(&self, msg: &AppMessage) -> Result<(), TransportError>;

    fn close(&self);

    async fn stats(&self) -> Result<StatsReport, TransportError>;
}

/// Negotiation frame exchanged through the server (OFFER, ANSWER, CANDIDATE, LEAVE, EXPIRE)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Sends negotiation frames through the signaling socket
pub type SignalSender = Arc<dyn Fn(NegotiationMessage) -> Result<(), TransportError> + Send + Sync>;

/// Builds direct channels for a signaling adapter
pub trait DirectChannelFactory: Send + Sync {
    /// Begin an outbound negotiation with `peer`
    fn connect(
        &self,
        local_id: &str,
        peer: &str,
        signal: SignalSender,
    ) -> Result<Arc<dyn DirectChannel>, TransportError>;

    /// Handle a negotiation frame. Returns the new channel for an inbound offer.
    fn handle_signal(
        &self,
        local_id: &str,
        msg: NegotiationMessage,
        signal: SignalSender,
    ) -> Option<Arc<dyn DirectChannel>>;

    fn close_all(&self);
}
