use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    error::WebchatError,
    state::StateSnapshot,
    types::{ConnectionStatus, Message, SessionInfo},
};

/// Typed event surface exposed to the embedding application.
///
/// Variant payloads are structured; the stable wire-style name of each
/// event is available through [`WebchatEvent::name`].
#[derive(Debug, Clone, PartialEq)]
pub enum WebchatEvent {
    Initialized,
    Destroyed,
    Connected,
    Disconnected,
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    ConnectionStatusChanged {
        previous: ConnectionStatus,
        current: ConnectionStatus,
    },
    ContactTimeoutReached {
        last_message_sent_at: u64,
    },
    MessageReceived {
        message: Message,
    },
    MessageSent {
        message: Message,
    },
    MessageAdded {
        message: Message,
    },
    MessageUpdated {
        message: Message,
    },
    MessageRemoved {
        id: String,
    },
    MessageProcessed {
        message: Message,
    },
    MessageUnknown {
        raw: Value,
    },
    MessagesCleared,
    TypingStart,
    TypingStop,
    ThinkingStart,
    ThinkingStop,
    SessionRestored {
        session: SessionInfo,
    },
    SessionChanged {
        session: SessionInfo,
    },
    SessionCleared,
    StateChanged {
        previous: Box<StateSnapshot>,
        current: Box<StateSnapshot>,
    },
    StateReset,
    ContextChanged {
        context: String,
    },
    HistoryLoaded {
        history: Value,
    },
    Error {
        error: WebchatError,
    },
}

impl WebchatEvent {
    /// Stable consumer-facing event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Destroyed => "destroyed",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::ConnectionStatusChanged { .. } => "connection:status:changed",
            Self::ContactTimeoutReached { .. } => "contact:timeout:maximum_time_reached",
            Self::MessageReceived { .. } => "message:received",
            Self::MessageSent { .. } => "message:sent",
            Self::MessageAdded { .. } => "message:added",
            Self::MessageUpdated { .. } => "message:updated",
            Self::MessageRemoved { .. } => "message:removed",
            Self::MessageProcessed { .. } => "message:processed",
            Self::MessageUnknown { .. } => "message:unknown",
            Self::MessagesCleared => "messages:cleared",
            Self::TypingStart => "typing:start",
            Self::TypingStop => "typing:stop",
            Self::ThinkingStart => "thinking:start",
            Self::ThinkingStop => "thinking:stop",
            Self::SessionRestored { .. } => "session:restored",
            Self::SessionChanged { .. } => "session:changed",
            Self::SessionCleared => "session:cleared",
            Self::StateChanged { .. } => "state:changed",
            Self::StateReset => "state:reset",
            Self::ContextChanged { .. } => "context:changed",
            Self::HistoryLoaded { .. } => "history:loaded",
            Self::Error { .. } => "error",
        }
    }
}

/// Broadcast-based event bus.
///
/// Uses `tokio::broadcast` so multiple subscribers receive the same events;
/// slow subscribers lag rather than blocking the emitter.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WebchatEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WebchatEvent> {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; with no subscribers the event is dropped.
    /// Returns the number of subscribers reached.
    pub fn emit(&self, event: WebchatEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn emit_all(&self, events: impl IntoIterator<Item = WebchatEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        assert_eq!(bus.emit(WebchatEvent::Connected), 2);

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
        assert_eq!(event_a.name(), "connected");
    }

    #[test]
    fn emit_without_subscribers_is_best_effort() {
        let bus = EventBus::new(4);
        assert_eq!(bus.emit(WebchatEvent::Destroyed), 0);
    }

    #[test]
    fn exposes_stable_event_names() {
        assert_eq!(
            WebchatEvent::ContactTimeoutReached {
                last_message_sent_at: 0
            }
            .name(),
            "contact:timeout:maximum_time_reached"
        );
        assert_eq!(
            WebchatEvent::ConnectionStatusChanged {
                previous: ConnectionStatus::Disconnected,
                current: ConnectionStatus::Connecting,
            }
            .name(),
            "connection:status:changed"
        );
        assert_eq!(WebchatEvent::StateReset.name(), "state:reset");
    }
}
