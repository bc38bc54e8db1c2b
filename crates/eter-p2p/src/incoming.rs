//! Links opened by a remote peer
//!
//! Passive: greets with `eter:welcome` once the connection opens, forwards
//! data, and tears down on close. It never reconnects.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionEvent};
use crate::events::{Emitter, Subscription, SubscriptionId};
use crate::session::{SessionEvent, SessionStatus};
use crate::types::AppMessage;

struct IncomingInner {
    connection: Connection,
    status: Mutex<SessionStatus>,
    closed: AtomicBool,
    events: Emitter<SessionEvent>,
    pump: Mutex<Option<AbortHandle>>,
}

#[derive(Clone)]
pub struct IncomingSession {
    inner: Arc<IncomingInner>,
}

impl fmt::Debug for IncomingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingSession")
            .field("connection", &self.inner.connection)
            .field("status", &self.status())
            .finish()
    }
}

impl IncomingSession {
    pub fn new(connection: Connection) -> Self {
        let mut connection_events = connection.subscribe();
        let inner = Arc::new(IncomingInner {
            connection,
            status: Mutex::new(SessionStatus::Connecting),
            closed: AtomicBool::new(false),
            events: Emitter::new(),
            pump: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let pump = tokio::spawn(async move {
            while let Some(event) = connection_events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.on_connection_event(event);
            }
        });
        *inner.pump.lock() = Some(pump.abort_handle());
        Self { inner }
    }

    pub fn peer(&self) -> &str {
        self.inner.connection.peer()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.lock()
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.events.unsubscribe(id);
    }

    pub fn close(&self) {
        self.inner.shutdown();
    }
}

impl IncomingInner {
    fn on_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => {
                if let Err(e) = self.connection.send(&AppMessage::welcome()) {
                    warn!("Failed to welcome {}: {}", self.connection.peer(), e);
                }
                *self.status.lock() = SessionStatus::Ready;
                self.events
                    .emit(SessionEvent::Connect(self.connection.clone()));
            }
            ConnectionEvent::Data(msg) => self.events.emit(SessionEvent::Data(msg)),
            ConnectionEvent::Error(e) => {
                error!("Incoming connection error from {}: {}", self.connection.peer(), e);
                self.events.emit(SessionEvent::Error(e));
            }
            ConnectionEvent::Close { .. } => {
                debug!("Incoming connection from {} closed", self.connection.peer());
                self.shutdown();
            }
            ConnectionEvent::CryptoReady | ConnectionEvent::Timeout => {}
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.connection.clear_listeners();
        self.connection.close();
        *self.status.lock() = SessionStatus::Failed;
        self.events.emit(SessionEvent::Close);
    }
}
