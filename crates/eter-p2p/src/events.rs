//! Event subscription
//!
//! Components publish events through an [`Emitter`]; each subscriber gets its
//! own unbounded channel. Events emitted before anybody subscribed are kept
//! (up to [`BACKLOG_LIMIT`]) and handed to the first subscriber, so wiring a
//! listener right after construction never misses the initial open/close.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Max events buffered while nobody listens
pub const BACKLOG_LIMIT: usize = 256;

/// Identifies a subscription for [`Emitter::unsubscribe`]
pub type SubscriptionId = u64;

/// Receiving end of a subscription
#[derive(Debug)]
pub struct Subscription<E> {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once the emitter cleared or dropped us.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

struct EmitterState<E> {
    next_id: SubscriptionId,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<E>)>,
    backlog: Vec<E>,
    detached: bool,
}

pub struct Emitter<E> {
    state: Mutex<EmitterState<E>>,
}

impl<E: Clone> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Emitter<E> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EmitterState {
                next_id: 1,
                subscribers: Vec::new(),
                backlog: Vec::new(),
                detached: false,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        for event in state.backlog.drain(..) {
            let _ = tx.send(event);
        }
        state.detached = false;
        state.subscribers.push((id, tx));
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.state.lock().subscribers.retain(|(sid, _)| *sid != id);
    }

    /// Drop every subscriber. Later events are discarded until a new subscribe.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.subscribers.clear();
        state.backlog.clear();
        state.detached = true;
    }

    pub fn emit(&self, event: E) {
        let mut state = self.state.lock();
        if state.subscribers.is_empty() {
            if !state.detached {
                if state.backlog.len() >= BACKLOG_LIMIT {
                    state.backlog.remove(0);
                }
                state.backlog.push(event);
            }
            return;
        }
        state
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backlog_replayed_to_first_subscriber() {
        let emitter = Emitter::new();
        emitter.emit(1);
        emitter.emit(2);

        let mut first = emitter.subscribe();
        assert_eq!(first.try_recv(), Some(1));
        assert_eq!(first.try_recv(), Some(2));
        assert_eq!(first.try_recv(), None);

        let mut second = emitter.subscribe();
        emitter.emit(3);
        assert_eq!(first.try_recv(), Some(3));
        assert_eq!(second.try_recv(), Some(3));
    }

    #[test]
    fn test_unsubscribe() {
        let emitter = Emitter::new();
        let mut a = emitter.subscribe();
        let b = emitter.subscribe();
        emitter.unsubscribe(b.id());
        assert_eq!(emitter.listener_count(), 1);
        emitter.emit("x");
        assert_eq!(a.try_recv(), Some("x"));
    }

    #[tokio::test]
    async fn test_clear_ends_subscriptions_and_drops_events() {
        let emitter = Emitter::new();
        let mut sub = emitter.subscribe();
        emitter.clear();
        emitter.emit(1);
        assert_eq!(sub.recv().await, None);

        let mut late = emitter.subscribe();
        assert_eq!(late.try_recv(), None);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let emitter = Emitter::new();
        let sub = emitter.subscribe();
        drop(sub);
        emitter.emit(1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn test_backlog_is_bounded() {
        let emitter = Emitter::new();
        for i in 0..(BACKLOG_LIMIT + 10) {
            emitter.emit(i);
        }
        let mut sub = emitter.subscribe();
        assert_eq!(sub.try_recv(), Some(10));
    }
}
