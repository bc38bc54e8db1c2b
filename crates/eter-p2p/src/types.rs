//! Shared types for the peer connection manager
//!
//! Defines the signaling wire messages exchanged through the server, the
//! application message envelope carried over every tier, ICE configuration,
//! and the coordinator's status/error vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Default signaling API key
pub const DEFAULT_KEY: &str = "peerjs";
/// Default signaling port
pub const DEFAULT_PORT: u16 = 443;
/// Default signaling path
pub const DEFAULT_PATH: &str = "/";

/// Event sent by the accepting side once a connection opens
pub const EVENT_WELCOME: &str = "eter:welcome";
/// Event sent by the initiating side once a connection opens
pub const EVENT_JOIN: &str = "eter:join";
/// Event announcing a graceful close
pub const EVENT_CLOSE: &str = "eter:close";
/// Request asking the receiver to connect to `code`
pub const EVENT_CONNECT: &str = "eter:connect";
/// Liveness probe, answered with `ok: true`
pub const EVENT_PING: &str = "ping";

/// Coordinator status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    #[default]
    Starting,
    Ready,
    Retry,
    Failed,
    Inactive,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Starting => "starting",
            PeerStatus::Ready => "ready",
            PeerStatus::Retry => "retry",
            PeerStatus::Failed => "failed",
            PeerStatus::Inactive => "inactive",
        };
        write!(f, "{}", s)
    }
}

/// User-facing error reported by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerErrorKind {
    #[default]
    None,
    IdInUse,
    PeerNotFound,
    NoSignaling,
    MissingIce,
    Unknown,
    BadBrowser,
}

impl fmt::Display for PeerErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerErrorKind::None => "none",
            PeerErrorKind::IdInUse => "id-in-use",
            PeerErrorKind::PeerNotFound => "peer-not-found",
            PeerErrorKind::NoSignaling => "no-signaling",
            PeerErrorKind::MissingIce => "missing-ice",
            PeerErrorKind::Unknown => "unknown",
            PeerErrorKind::BadBrowser => "bad-browser",
        };
        write!(f, "{}", s)
    }
}

/// Network path a connection travels over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Direct peer-to-peer path
    P2p,
    /// Through a TURN relay
    Relay,
    /// Encrypted relay through the signaling server
    #[default]
    Server,
}

impl ConnectionType {
    /// Quality score: p2p 3, relay 2, server 1
    pub fn quality(self) -> u8 {
        match self {
            ConnectionType::P2p => 3,
            ConnectionType::Relay => 2,
            ConnectionType::Server => 1,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionType::P2p => "p2p",
            ConnectionType::Relay => "relay",
            ConnectionType::Server => "server",
        };
        write!(f, "{}", s)
    }
}

/// Kind of message relayed through the signaling server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingKind {
    /// Public key announcement (JWK JSON in `payload`)
    #[serde(rename = "KEY")]
    Key,
    /// Encrypted application data (`EncryptedPayload` JSON in `payload`)
    #[serde(rename = "DATA")]
    Data,
    /// Server liveness
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

/// Message sent through the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalingKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub src: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dst: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl SignalingMessage {
    pub fn key(src: impl Into<String>, dst: impl Into<String>, jwk: impl Into<String>) -> Self {
        Self {
            kind: SignalingKind::Key,
            src: src.into(),
            dst: dst.into(),
            payload: Some(jwk.into()),
        }
    }

    pub fn data(src: impl Into<String>, dst: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            kind: SignalingKind::Data,
            src: src.into(),
            dst: dst.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            kind: SignalingKind::Heartbeat,
            src: String::new(),
            dst: String::new(),
            payload: None,
        }
    }
}

/// Encrypted application message carried in a DATA payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 ciphertext
    pub data: String,
    /// Base64 12-byte nonce
    pub iv: String,
}

/// Application message: a JSON object with an `event` discriminator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMessage {
    pub event: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Protocol events handled by the sessions and coordinator themselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinEvent {
    Welcome,
    Join,
    Close,
    Connect { code: String },
    Ping { ok: bool },
}

impl AppMessage {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn welcome() -> Self {
        Self::new(EVENT_WELCOME)
    }

    pub fn join() -> Self {
        Self::new(EVENT_JOIN)
    }

    pub fn close() -> Self {
        Self::new(EVENT_CLOSE)
    }

    pub fn connect_to(code: impl Into<String>) -> Self {
        Self::new(EVENT_CONNECT).with("code", code.into())
    }

    pub fn ping() -> Self {
        Self::new(EVENT_PING)
    }

    pub fn pong() -> Self {
        Self::new(EVENT_PING).with("ok", true)
    }

    /// Recognize a protocol event. `eter:connect` without a string code is not one.
    pub fn builtin(&self) -> Option<BuiltinEvent> {
        match self.event.as_str() {
            EVENT_WELCOME => Some(BuiltinEvent::Welcome),
            EVENT_JOIN => Some(BuiltinEvent::Join),
            EVENT_CLOSE => Some(BuiltinEvent::Close),
            EVENT_CONNECT => self
                .get("code")
                .and_then(Value::as_str)
                .map(|code| BuiltinEvent::Connect {
                    code: code.to_string(),
                }),
            EVENT_PING => Some(BuiltinEvent::Ping {
                ok: self.get("ok").and_then(Value::as_bool).unwrap_or(false),
            }),
            _ => None,
        }
    }
}

/// How a TURN server should be picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteType {
    #[default]
    Any,
    Nearest,
}

/// One STUN/TURN server entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default)]
    pub route_type: RouteType,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// ICE configuration as served by the rtcconfig endpoint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceConfig {
    /// Expiry timestamp (ISO 8601) of the TURN credentials
    #[serde(default)]
    pub expires_on: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// Test and troubleshooting switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoordinatorOptions {
    /// Only allow TURN-relayed ICE candidates
    pub force_turn: bool,
    /// Always connect to the configured server over the signaling relay
    pub force_websocket: bool,
    /// Close direct channels as soon as ICE starts checking
    pub drop_ice: bool,
}

/// Timing and retry limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub base_retry_ms: u64,
    pub max_backoff: u32,
    pub wait_time_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_id_retry: u32,
    pub max_conn_retry: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            base_retry_ms: 1_000,
            max_backoff: crate::backoff::MAX_BACKOFF,
            wait_time_ms: 10_000,
            heartbeat_timeout_ms: 10_000,
            max_id_retry: 10,
            max_conn_retry: 20,
        }
    }
}

impl Timing {
    pub fn backoff(&self, count: u32) -> Duration {
        crate::backoff::backoff_delay(
            Duration::from_millis(self.base_retry_ms),
            count,
            self.max_backoff,
        )
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Everything a coordinator needs to join a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Our identifier on the signaling server
    pub code: String,
    pub host: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub ice: IceConfig,
    /// Restrict ICE to TURN relays
    #[serde(default)]
    pub relay: bool,
    /// Peer to connect to once the session opens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default)]
    pub options: CoordinatorOptions,
    #[serde(default)]
    pub timing: Timing,
}

fn default_key() -> String {
    DEFAULT_KEY.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

impl CoordinatorConfig {
    pub fn new(code: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            host: host.into(),
            secure: true,
            key: default_key(),
            port: default_port(),
            path: default_path(),
            ice: IceConfig::default(),
            relay: false,
            server: None,
            options: CoordinatorOptions::default(),
            timing: Timing::default(),
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_ice(mut self, ice: IceConfig) -> Self {
        self.ice = ice;
        self
    }

    pub fn with_options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// ICE transport restricted to relays?
    pub fn relay_only(&self) -> bool {
        self.relay || self.options.force_turn
    }
}
