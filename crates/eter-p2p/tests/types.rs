//! Tests for shared types and wire formats

use eter_p2p::types::{EVENT_CONNECT, EVENT_WELCOME};
use eter_p2p::{
    AppMessage, BuiltinEvent, ConnectionType, CoordinatorConfig, CoordinatorOptions,
    EncryptedPayload, IceConfig, IceServer, PeerErrorKind, PeerStatus, RouteType, SignalingKind,
    SignalingMessage, Timing,
};
use std::time::Duration;

#[test]
fn test_status_strings() {
    assert_eq!(PeerStatus::default(), PeerStatus::Starting);
    assert_eq!(PeerStatus::Retry.to_string(), "retry");
    assert_eq!(
        serde_json::to_string(&PeerStatus::Inactive).unwrap(),
        "\"inactive\""
    );
}

#[test]
fn test_error_kind_strings() {
    assert_eq!(PeerErrorKind::IdInUse.to_string(), "id-in-use");
    assert_eq!(PeerErrorKind::BadBrowser.to_string(), "bad-browser");
    let parsed: PeerErrorKind = serde_json::from_str("\"no-signaling\"").unwrap();
    assert_eq!(parsed, PeerErrorKind::NoSignaling);
}

#[test]
fn test_connection_type_quality() {
    assert_eq!(ConnectionType::P2p.quality(), 3);
    assert_eq!(ConnectionType::Relay.quality(), 2);
    assert_eq!(ConnectionType::Server.quality(), 1);
    assert_eq!(ConnectionType::default(), ConnectionType::Server);
}

#[test]
fn test_signaling_message_wire_shape() {
    let key = SignalingMessage::key("alice", "bob", "{\"kty\":\"EC\"}");
    let json = serde_json::to_value(&key).unwrap();
    assert_eq!(json["type"], "KEY");
    assert_eq!(json["src"], "alice");
    assert_eq!(json["dst"], "bob");
    assert_eq!(json["payload"], "{\"kty\":\"EC\"}");

    let heartbeat = serde_json::to_string(&SignalingMessage::heartbeat()).unwrap();
    assert_eq!(heartbeat, r#"{"type":"HEARTBEAT"}"#);

    let data: SignalingMessage =
        serde_json::from_str(r#"{"type":"DATA","src":"bob","payload":"x"}"#).unwrap();
    assert_eq!(data.kind, SignalingKind::Data);
    assert_eq!(data.dst, "");
}

#[test]
fn test_encrypted_payload_fields() {
    let payload: EncryptedPayload =
        serde_json::from_str(r#"{"data":"AAAA","iv":"BBBB"}"#).unwrap();
    assert_eq!(payload.data, "AAAA");
    assert_eq!(payload.iv, "BBBB");
}

#[test]
fn test_app_message_flattens_fields() {
    let msg = AppMessage::new("chat").with("text", "hi").with("n", 3);
    let json = serde_json::to_value(&msg).unwrap();
    assert_eq!(json, serde_json::json!({"event": "chat", "text": "hi", "n": 3}));

    let parsed: AppMessage = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, msg);
}

#[test]
fn test_builtin_events() {
    assert_eq!(AppMessage::new(EVENT_WELCOME).builtin(), Some(BuiltinEvent::Welcome));
    assert_eq!(
        AppMessage::connect_to("g2").builtin(),
        Some(BuiltinEvent::Connect {
            code: "g2".to_string()
        })
    );
    assert_eq!(AppMessage::new(EVENT_CONNECT).builtin(), None);
    assert_eq!(AppMessage::ping().builtin(), Some(BuiltinEvent::Ping { ok: false }));
    assert_eq!(AppMessage::pong().builtin(), Some(BuiltinEvent::Ping { ok: true }));
    assert_eq!(AppMessage::new("chat").builtin(), None);
}

#[test]
fn test_ice_config_parse() {
    let json = r#"{
        "expiresOn": "2030-01-01T00:00:00Z",
        "iceServers": [
            {"urls": ["turn:a:3478"], "username": "u", "credential": "c", "routeType": "nearest"},
            {"urls": ["stun:b:3478"]}
        ]
    }"#;
    let config: IceConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.ice_servers.len(), 2);
    assert_eq!(config.ice_servers[0].route_type, RouteType::Nearest);
    assert_eq!(config.ice_servers[1], IceServer::stun("stun:b:3478"));
    assert_eq!(config.ice_servers[1].route_type, RouteType::Any);
}

#[test]
fn test_timing_backoff() {
    let timing = Timing::default();
    assert_eq!(timing.backoff(0), Duration::from_secs(1));
    assert_eq!(timing.backoff(3), Duration::from_secs(8));
    assert_eq!(timing.backoff(10), Duration::from_secs(16));
    assert_eq!(timing.wait_time(), Duration::from_secs(10));
    assert_eq!(timing.heartbeat_timeout(), Duration::from_secs(10));
}

#[test]
fn test_coordinator_config_defaults() {
    let config = CoordinatorConfig::new("alice", "signal.example.com");
    assert!(config.secure);
    assert_eq!(config.port, 443);
    assert_eq!(config.key, "peerjs");
    assert_eq!(config.path, "/");
    assert!(config.server.is_none());
    assert!(!config.relay_only());

    let forced = config.with_options(CoordinatorOptions {
        force_turn: true,
        ..Default::default()
    });
    assert!(forced.relay_only());
}

#[test]
fn test_coordinator_config_deserialize_minimal() {
    let config: CoordinatorConfig =
        serde_json::from_str(r#"{"code":"alice","host":"localhost","server":"host"}"#).unwrap();
    assert_eq!(config.server.as_deref(), Some("host"));
    assert_eq!(config.port, 443);
    assert_eq!(config.timing, Timing::default());
}
