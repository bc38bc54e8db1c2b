//! Direct channels backed by the `webrtc` crate
//!
//! One `RTCPeerConnection` with a single ordered data channel per link. Offers,
//! answers and candidates travel through the signaling session in the PeerJS
//! wire shape, so browsers on the other end can negotiate with us.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::events::{Emitter, Subscription};
use crate::transport::{
    CandidatePairState, CandidateType, ChannelEvent, DirectChannel, DirectChannelFactory,
    IceConnectionState, NegotiationMessage, SignalSender, StatsEntry, StatsReport,
    TransportError,
};
use crate::types::{AppMessage, IceServer};

/// Builds webrtc-backed direct channels
pub struct RtcChannelFactory {
    ice_servers: Vec<IceServer>,
    relay_only: bool,
    channels: Mutex<HashMap<String, Weak<RtcDirectChannel>>>,
}

impl RtcChannelFactory {
    pub fn new(ice_servers: Vec<IceServer>, relay_only: bool) -> Self {
        Self {
            ice_servers,
            relay_only,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_transport_policy: if self.relay_only {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        }
    }

    fn register(&self, channel: &Arc<RtcDirectChannel>) {
        let mut channels = self.channels.lock();
        channels.retain(|_, weak| weak.strong_count() > 0);
        channels.insert(channel.connection_id.clone(), Arc::downgrade(channel));
    }

    fn lookup(&self, connection_id: &str) -> Option<Arc<RtcDirectChannel>> {
        self.channels.lock().get(connection_id).and_then(Weak::upgrade)
    }

    fn spawn_channel(
        &self,
        peer: &str,
        connection_id: String,
        setup: Setup,
        signal: SignalSender,
    ) -> Arc<RtcDirectChannel> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(RtcDirectChannel {
            peer: peer.to_string(),
            connection_id,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: Emitter::new(),
            commands: tx,
            pc: Mutex::new(None),
            dc: Mutex::new(None),
        });
        self.register(&channel);
        tokio::spawn(drive(
            Arc::downgrade(&channel),
            self.rtc_configuration(),
            setup,
            signal,
            rx,
        ));
        channel
    }
}

impl DirectChannelFactory for RtcChannelFactory {
    fn connect(
        &self,
        _local_id: &str,
        peer: &str,
        signal: SignalSender,
    ) -> Result<Arc<dyn DirectChannel>, TransportError> {
        let connection_id = format!("dc_{}", uuid::Uuid::new_v4().simple());
        info!("Opening direct channel {} to {}", connection_id, peer);
        let channel = self.spawn_channel(peer, connection_id, Setup::Offer, signal);
        Ok(channel)
    }

    fn handle_signal(
        &self,
        _local_id: &str,
        msg: NegotiationMessage,
        signal: SignalSender,
    ) -> Option<Arc<dyn DirectChannel>> {
        let connection_id = msg
            .payload
            .get("connectionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match msg.kind.as_str() {
            "OFFER" => {
                let Some(sdp) = description_sdp(&msg.payload) else {
                    warn!("OFFER from {} without sdp", msg.src);
                    return None;
                };
                if connection_id.is_empty() {
                    warn!("OFFER from {} without connectionId", msg.src);
                    return None;
                }
                info!("Answering direct channel {} from {}", connection_id, msg.src);
                let channel =
                    self.spawn_channel(&msg.src, connection_id, Setup::Answer(sdp), signal);
                Some(channel)
            }
            "ANSWER" => {
                match (self.lookup(&connection_id), description_sdp(&msg.payload)) {
                    (Some(channel), Some(sdp)) => channel.command(Command::Answer(sdp)),
                    _ => debug!("Stray ANSWER for {}", connection_id),
                }
                None
            }
            "CANDIDATE" => {
                let candidate = msg
                    .payload
                    .get("candidate")
                    .cloned()
                    .and_then(|c| serde_json::from_value::<RTCIceCandidateInit>(c).ok());
                match (self.lookup(&connection_id), candidate) {
                    (Some(channel), Some(init)) => channel.command(Command::Candidate(init)),
                    _ => debug!("Stray CANDIDATE for {}", connection_id),
                }
                None
            }
            "LEAVE" => {
                let peers: Vec<Arc<RtcDirectChannel>> = self
                    .channels
                    .lock()
                    .values()
                    .filter_map(Weak::upgrade)
                    .filter(|channel| channel.peer == msg.src)
                    .collect();
                for channel in peers {
                    channel.close();
                }
                None
            }
            other => {
                debug!("Ignoring negotiation frame {}", other);
                None
            }
        }
    }

    fn close_all(&self) {
        let channels: Vec<Arc<RtcDirectChannel>> = self
            .channels
            .lock()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for channel in channels {
            channel.close();
        }
    }
}

// ============================================================================
// Wire shapes
// ============================================================================

fn description_sdp(payload: &Value) -> Option<String> {
    payload
        .get("sdp")
        .and_then(|sdp| sdp.get("sdp"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn offer_payload(connection_id: &str, sdp: &str) -> Value {
    json!({
        "sdp": { "type": "offer", "sdp": sdp },
        "type": "data",
        "connectionId": connection_id,
        "label": connection_id,
        "reliable": true,
        "serialization": "json",
    })
}

fn answer_payload(connection_id: &str, sdp: &str) -> Value {
    json!({
        "sdp": { "type": "answer", "sdp": sdp },
        "type": "data",
        "connectionId": connection_id,
    })
}

fn candidate_payload(connection_id: &str, candidate: &RTCIceCandidateInit) -> Value {
    json!({
        "candidate": candidate,
        "type": "data",
        "connectionId": connection_id,
    })
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn translate_stats(report: webrtc::stats::StatsReport) -> StatsReport {
    use webrtc::ice::candidate::{
        CandidatePairState as RtcPairState, CandidateType as RtcCandidateType,
    };

    let mut out = StatsReport::new();
    for (id, entry) in report.reports {
        let entry = match entry {
            StatsReportType::CandidatePair(pair) => StatsEntry::CandidatePair {
                state: match pair.state {
                    RtcPairState::Waiting => CandidatePairState::Waiting,
                    RtcPairState::InProgress => CandidatePairState::InProgress,
                    RtcPairState::Succeeded => CandidatePairState::Succeeded,
                    RtcPairState::Failed => CandidatePairState::Failed,
                    _ => CandidatePairState::Frozen,
                },
                remote_candidate_id: pair.remote_candidate_id,
            },
            StatsReportType::RemoteCandidate(candidate) => StatsEntry::RemoteCandidate {
                candidate_type: match candidate.candidate_type {
                    RtcCandidateType::Relay => CandidateType::Relay,
                    RtcCandidateType::ServerReflexive => CandidateType::Srflx,
                    RtcCandidateType::PeerReflexive => CandidateType::Prflx,
                    _ => CandidateType::Host,
                },
            },
            _ => StatsEntry::Other,
        };
        out.insert(id, entry);
    }
    out
}

// ============================================================================
// Channel
// ============================================================================

enum Setup {
    Offer,
    Answer(String),
}

enum Command {
    Answer(String),
    Candidate(RTCIceCandidateInit),
    Send(String),
    Close,
}

/// Data channel to one peer
pub struct RtcDirectChannel {
    peer: String,
    connection_id: String,
    open: AtomicBool,
    closed: AtomicBool,
    events: Emitter<ChannelEvent>,
    commands: mpsc::UnboundedSender<Command>,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    dc: Mutex<Option<Arc<RTCDataChannel>>>,
}

impl RtcDirectChannel {
    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Channel {} driver gone", self.connection_id);
        }
    }

    fn mark_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        self.command(Command::Close);
        self.events.emit(ChannelEvent::Close);
    }

    fn attach_data_channel(self: &Arc<Self>, dc: Arc<RTCDataChannel>) {
        let weak = Arc::downgrade(self);
        dc.on_open(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                if !channel.closed.load(Ordering::SeqCst)
                    && !channel.open.swap(true, Ordering::SeqCst)
                {
                    debug!("Direct channel {} open", channel.connection_id);
                    channel.events.emit(ChannelEvent::Open);
                }
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            if let Some(channel) = weak.upgrade() {
                match serde_json::from_slice::<AppMessage>(&msg.data) {
                    Ok(message) => channel.events.emit(ChannelEvent::Data(message)),
                    Err(e) => warn!("Malformed message from {}: {}", channel.peer, e),
                }
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        dc.on_close(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                channel.mark_closed();
            }
            Box::pin(async {})
        }));

        let weak = Arc::downgrade(self);
        dc.on_error(Box::new(move |e| {
            if let Some(channel) = weak.upgrade() {
                channel.events.emit(ChannelEvent::Error(e.to_string()));
            }
            Box::pin(async {})
        }));

        *self.dc.lock() = Some(dc);
    }
}

async fn create_peer_connection(
    config: RTCConfiguration,
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    Ok(Arc::new(api.new_peer_connection(config).await?))
}

fn wire_peer_connection(pc: &RTCPeerConnection, channel: &Arc<RtcDirectChannel>, signal: SignalSender) {
    let weak = Arc::downgrade(channel);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let (Some(channel), Some(candidate)) = (weak.upgrade(), candidate) {
            match candidate.to_json() {
                Ok(init) => {
                    let msg = NegotiationMessage {
                        kind: "CANDIDATE".to_string(),
                        src: String::new(),
                        dst: channel.peer.clone(),
                        payload: candidate_payload(&channel.connection_id, &init),
                    };
                    if let Err(e) = signal(msg) {
                        debug!("Failed to send candidate: {}", e);
                    }
                }
                Err(e) => warn!("Unserializable candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(channel);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if let (Some(channel), Some(state)) = (weak.upgrade(), ice_state(state)) {
            debug!("ICE {:?} on {}", state, channel.connection_id);
            channel.events.emit(ChannelEvent::IceStateChanged(state));
        }
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(channel);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        if let Some(channel) = weak.upgrade() {
            channel.attach_data_channel(dc);
        }
        Box::pin(async {})
    }));
}

async fn negotiate(
    channel: &Arc<RtcDirectChannel>,
    pc: &Arc<RTCPeerConnection>,
    setup: Setup,
    signal: &SignalSender,
) -> Result<(), webrtc::Error> {
    let (kind, payload) = match setup {
        Setup::Offer => {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(&channel.connection_id, Some(init))
                .await?;
            channel.attach_data_channel(dc);
            let offer = pc.create_offer(None).await?;
            pc.set_local_description(offer.clone()).await?;
            ("OFFER", offer_payload(&channel.connection_id, &offer.sdp))
        }
        Setup::Answer(sdp) => {
            pc.set_remote_description(RTCSessionDescription::offer(sdp)?)
                .await?;
            let answer = pc.create_answer(None).await?;
            pc.set_local_description(answer.clone()).await?;
            ("ANSWER", answer_payload(&channel.connection_id, &answer.sdp))
        }
    };
    let msg = NegotiationMessage {
        kind: kind.to_string(),
        src: String::new(),
        dst: channel.peer.clone(),
        payload,
    };
    signal(msg).map_err(|e| webrtc::Error::new(e.to_string()))
}

async fn drive(
    weak: Weak<RtcDirectChannel>,
    config: RTCConfiguration,
    setup: Setup,
    signal: SignalSender,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let Some(channel) = weak.upgrade() else {
        return;
    };
    let pc = match create_peer_connection(config).await {
        Ok(pc) => pc,
        Err(e) => {
            channel.events.emit(ChannelEvent::Error(e.to_string()));
            channel.mark_closed();
            return;
        }
    };
    wire_peer_connection(&pc, &channel, signal.clone());
    *channel.pc.lock() = Some(pc.clone());
    if let Err(e) = negotiate(&channel, &pc, setup, &signal).await {
        warn!("Negotiation with {} failed: {}", channel.peer, e);
        channel.events.emit(ChannelEvent::Error(e.to_string()));
        channel.mark_closed();
    }
    drop(channel);

    let mut pending_candidates: Vec<RTCIceCandidateInit> = Vec::new();
    while let Some(command) = commands.recv().await {
        let result = match command {
            Command::Answer(sdp) => {
                let result = match RTCSessionDescription::answer(sdp) {
                    Ok(answer) => pc.set_remote_description(answer).await,
                    Err(e) => Err(e),
                };
                for candidate in pending_candidates.drain(..) {
                    if let Err(e) = pc.add_ice_candidate(candidate).await {
                        debug!("Dropped queued candidate: {}", e);
                    }
                }
                result
            }
            Command::Candidate(init) => {
                if pc.remote_description().await.is_some() {
                    pc.add_ice_candidate(init).await
                } else {
                    pending_candidates.push(init);
                    Ok(())
                }
            }
            Command::Send(text) => {
                let dc = weak.upgrade().and_then(|channel| channel.dc.lock().clone());
                match dc {
                    Some(dc) => dc.send_text(text).await.map(|_| ()),
                    None => Ok(()),
                }
            }
            Command::Close => break,
        };
        if let Err(e) = result {
            if let Some(channel) = weak.upgrade() {
                warn!("Direct channel {} error: {}", channel.connection_id, e);
                channel.events.emit(ChannelEvent::Error(e.to_string()));
            }
        }
    }
    if let Err(e) = pc.close().await {
        debug!("Peer connection close failed: {}", e);
    }
}

#[async_trait]
impl DirectChannel for RtcDirectChannel {
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
        let text =
            serde_json::to_string(msg).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.commands
            .send(Command::Send(text))
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self) {
        self.mark_closed();
    }

    async fn stats(&self) -> Result<StatsReport, TransportError> {
        let pc = self.pc.lock().clone().ok_or(TransportError::NotConnected)?;
        Ok(translate_stats(pc.get_stats().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_payload_shape() {
        let payload = offer_payload("dc_1", "v=0");
        assert_eq!(payload["sdp"]["type"], "offer");
        assert_eq!(payload["connectionId"], "dc_1");
        assert_eq!(payload["serialization"], "json");
        assert_eq!(description_sdp(&payload).as_deref(), Some("v=0"));
    }

    #[test]
    fn test_answer_payload_shape() {
        let payload = answer_payload("dc_2", "v=0");
        assert_eq!(payload["sdp"]["type"], "answer");
        assert_eq!(payload["type"], "data");
        assert_eq!(description_sdp(&payload).as_deref(), Some("v=0"));
        assert_eq!(description_sdp(&json!({})), None);
    }

    #[test]
    fn test_candidate_payload_round_trips_init() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 127.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            ..Default::default()
        };
        let payload = candidate_payload("dc_3", &init);
        let parsed: RTCIceCandidateInit =
            serde_json::from_value(payload["candidate"].clone()).unwrap();
        assert_eq!(parsed.candidate, init.candidate);
        assert_eq!(parsed.sdp_mid, init.sdp_mid);
    }

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(
            ice_state(RTCIceConnectionState::Checking),
            Some(IceConnectionState::Checking)
        );
        assert_eq!(
            ice_state(RTCIceConnectionState::Disconnected),
            Some(IceConnectionState::Disconnected)
        );
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), None);
    }

    #[test]
    fn test_relay_only_policy() {
        let factory = RtcChannelFactory::new(vec![IceServer::stun("stun:stun.example.com")], true);
        let config = factory.rtc_configuration();
        assert_eq!(config.ice_transport_policy, RTCIceTransportPolicy::Relay);
        assert_eq!(config.ice_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_stray_answer_is_ignored() {
        let factory = RtcChannelFactory::new(Vec::new(), false);
        let signal: SignalSender = Arc::new(|_| Ok(()));
        let msg = NegotiationMessage {
            kind: "ANSWER".to_string(),
            src: "bob".to_string(),
            dst: "alice".to_string(),
            payload: answer_payload("dc_missing", "v=0"),
        };
        assert!(factory.handle_signal("alice", msg, signal).is_none());
    }
}
