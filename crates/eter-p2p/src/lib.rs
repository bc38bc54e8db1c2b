//! Peer connection manager for eter
//!
//! Keeps a peer reachable under a short code and maintains links to other
//! peers over the best available tier:
//!
//! - **p2p**: a direct data channel (quality 3)
//! - **relay**: a direct data channel routed through TURN (quality 2)
//! - **server**: messages relayed by the signaling server, end-to-end
//!   encrypted with P-384 ECDH + AES-256-GCM (quality 1)
//!
//! The [`PeerCoordinator`] owns the signaling session, reconnects with capped
//! exponential backoff and reports status, quality and errors as events.
//!
//! # Example
//!
//! ```rust,no_run
//! use eter_p2p::{AppMessage, CoordinatorConfig, CoordinatorEvent, PeerCoordinator, PeerJsSessionFactory};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CoordinatorConfig::new("guest-42", "signal.example.com").with_server("host-1");
//!     let coordinator = PeerCoordinator::new(config, Arc::new(PeerJsSessionFactory::new()));
//!
//!     let mut events = coordinator.subscribe();
//!     while let Some(event) = events.recv().await {
//!         if let CoordinatorEvent::Connect { peer, .. } = event {
//!             println!("connected to {}", peer);
//!             coordinator.send_all(&AppMessage::new("hello"), &[]);
//!         }
//!     }
//! }
//! ```

pub mod backoff;
pub mod connection;
pub mod coordinator;
pub mod crypto;
pub mod events;
pub mod ice;
pub mod incoming;
pub mod mock;
pub mod outgoing;
pub mod peerjs;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod session;
pub mod timer;
pub mod transport;
pub mod types;

pub use backoff::{exp_backoff, exp_backoff_capped, BASE_RETRY_TIME, MAX_BACKOFF};
pub use connection::{classify_path, Connection, ConnectionError, ConnectionEvent, ConnectionOptions};
pub use coordinator::{CoordinatorEvent, PeerCoordinator};
pub use crypto::{CryptoError, KeyExchange, SymmetricCipher};
pub use events::{Emitter, Subscription, SubscriptionId};
pub use ice::{IceConfigClient, IceError};
pub use incoming::IncomingSession;
pub use mock::{DirectMode, MockDirectChannel, MockSession, MockSessionFactory, MockSignalingServer};
pub use outgoing::{OutgoingOptions, OutgoingSession};
pub use peerjs::{PeerJsSession, PeerJsSessionFactory};
#[cfg(feature = "webrtc")]
pub use rtc::{RtcChannelFactory, RtcDirectChannel};
pub use session::{Direction, Link, SessionEvent, SessionStatus};
pub use transport::{
    ChannelEvent, DirectChannel, DirectChannelFactory, IceConnectionState, SessionFactory,
    SessionParams, SignalingErrorKind, SignalingEvent, SignalingSession, StatsReport,
    TransportError,
};
pub use types::{
    AppMessage, BuiltinEvent, ConnectionType, CoordinatorConfig, CoordinatorOptions,
    EncryptedPayload, IceConfig, IceServer, PeerErrorKind, PeerStatus, RouteType, SignalingKind,
    SignalingMessage, Timing,
};
