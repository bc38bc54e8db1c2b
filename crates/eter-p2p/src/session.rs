//! Session types shared by incoming and outgoing links

use std::fmt;

use crate::connection::Connection;
use crate::events::{Subscription, SubscriptionId};
use crate::incoming::IncomingSession;
use crate::outgoing::OutgoingSession;
use crate::types::AppMessage;

/// Who initiated the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Connecting,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The connection opened and the greeting was sent
    Connect(Connection),
    Data(AppMessage),
    /// Implicit close, a new attempt follows (outgoing only)
    Retry,
    Error(String),
    Close,
}

/// A registered link to one peer
#[derive(Debug, Clone)]
pub enum Link {
    Incoming(IncomingSession),
    Outgoing(OutgoingSession),
}

impl Link {
    pub fn direction(&self) -> Direction {
        match self {
            Link::Incoming(_) => Direction::Incoming,
            Link::Outgoing(_) => Direction::Outgoing,
        }
    }

    pub fn peer(&self) -> &str {
        match self {
            Link::Incoming(session) => session.peer(),
            Link::Outgoing(session) => session.peer(),
        }
    }

    /// Current connection (outgoing links swap it on retry)
    pub fn connection(&self) -> Connection {
        match self {
            Link::Incoming(session) => session.connection().clone(),
            Link::Outgoing(session) => session.connection(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self {
            Link::Incoming(session) => session.status(),
            Link::Outgoing(session) => session.status(),
        }
    }

    pub fn subscribe(&self) -> Subscription<SessionEvent> {
        match self {
            Link::Incoming(session) => session.subscribe(),
            Link::Outgoing(session) => session.subscribe(),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        match self {
            Link::Incoming(session) => session.unsubscribe(id),
            Link::Outgoing(session) => session.unsubscribe(id),
        }
    }

    pub fn close(&self) {
        match self {
            Link::Incoming(session) => session.close(),
            Link::Outgoing(session) => session.close(),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}
