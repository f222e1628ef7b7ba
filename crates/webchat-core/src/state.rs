use tracing::{debug, trace};

use crate::{
    error::WebchatError,
    events::WebchatEvent,
    types::{ConnectionStatus, Message, MessagePatch, SessionInfo},
};

/// Immutable view of the whole client state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub messages: Vec<Message>,
    pub session: Option<SessionInfo>,
    pub connection_status: ConnectionStatus,
    pub context: String,
    pub is_typing: bool,
    pub is_thinking: bool,
    pub last_error: Option<WebchatError>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            session: None,
            connection_status: ConnectionStatus::Disconnected,
            context: String::new(),
            is_typing: false,
            is_thinking: false,
            last_error: None,
        }
    }
}

/// Single materialized source of truth mediating between the engines and
/// the embedding application.
///
/// Every effective mutation returns the events to emit: a per-key event
/// plus `state:changed` carrying the old and new snapshots. Mutations that
/// change nothing return no events.
#[derive(Debug, Clone, Default)]
pub struct AggregateState {
    snapshot: StateSnapshot,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.snapshot.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.snapshot.messages
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.snapshot.messages.iter().find(|m| m.id == id)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.snapshot.connection_status
    }

    pub fn context(&self) -> &str {
        &self.snapshot.context
    }

    /// Append a message. A duplicate id is a no-op; ids are unique within
    /// the conversation view.
    pub fn add_message(&mut self, message: Message) -> Vec<WebchatEvent> {
        if self.message(&message.id).is_some() {
            debug!(id = %message.id, "ignoring duplicate message id");
            return Vec::new();
        }

        let previous = self.snapshot();
        self.snapshot.messages.push(message.clone());
        self.finish(previous, WebchatEvent::MessageAdded { message })
    }

    /// Patch a message in place. A no-op when no message matches the id or
    /// the patch changes nothing.
    pub fn update_message(&mut self, id: &str, patch: &MessagePatch) -> Vec<WebchatEvent> {
        let previous = self.snapshot();
        let Some(message) = self.snapshot.messages.iter_mut().find(|m| m.id == id) else {
            trace!(%id, "update for unknown message id ignored");
            return Vec::new();
        };

        if !message.apply_patch(patch) {
            return Vec::new();
        }

        let updated = message.clone();
        self.finish(previous, WebchatEvent::MessageUpdated { message: updated })
    }

    pub fn remove_message(&mut self, id: &str) -> Vec<WebchatEvent> {
        let Some(index) = self.snapshot.messages.iter().position(|m| m.id == id) else {
            return Vec::new();
        };

        let previous = self.snapshot();
        self.snapshot.messages.remove(index);
        self.finish(
            previous,
            WebchatEvent::MessageRemoved { id: id.to_owned() },
        )
    }

    /// Drop the conversation view. The session is preserved.
    pub fn clear_messages(&mut self) -> Vec<WebchatEvent> {
        if self.snapshot.messages.is_empty() {
            return Vec::new();
        }

        let previous = self.snapshot();
        self.snapshot.messages.clear();
        self.finish(previous, WebchatEvent::MessagesCleared)
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) -> Vec<WebchatEvent> {
        if self.snapshot.connection_status == status {
            return Vec::new();
        }

        let previous = self.snapshot();
        let previous_status = self.snapshot.connection_status;
        self.snapshot.connection_status = status;
        self.finish(
            previous,
            WebchatEvent::ConnectionStatusChanged {
                previous: previous_status,
                current: status,
            },
        )
    }

    pub fn set_session(&mut self, session: Option<SessionInfo>) -> Vec<WebchatEvent> {
        if self.snapshot.session == session {
            return Vec::new();
        }

        let previous = self.snapshot();
        self.snapshot.session = session;
        vec![self.state_changed(previous)]
    }

    pub fn set_context(&mut self, context: impl Into<String>) -> Vec<WebchatEvent> {
        let context = context.into();
        if self.snapshot.context == context {
            return Vec::new();
        }

        let previous = self.snapshot();
        self.snapshot.context = context.clone();
        self.finish(previous, WebchatEvent::ContextChanged { context })
    }

    pub fn set_typing(&mut self, active: bool) -> Vec<WebchatEvent> {
        if self.snapshot.is_typing == active {
            return Vec::new();
        }

        let previous = self.snapshot();
        self.snapshot.is_typing = active;
        let event = if active {
            WebchatEvent::TypingStart
        } else {
            WebchatEvent::TypingStop
        };
        self.finish(previous, event)
    }

    pub fn set_thinking(&mut self, active: bool) -> Vec<WebchatEvent> {
        if self.snapshot.is_thinking == active {
            return Vec::new();
        }

        let previous = self.snapshot();
        self.snapshot.is_thinking = active;
        let event = if active {
            WebchatEvent::ThinkingStart
        } else {
            WebchatEvent::ThinkingStop
        };
        self.finish(previous, event)
    }

    pub fn set_error(&mut self, error: WebchatError) -> Vec<WebchatEvent> {
        let previous = self.snapshot();
        self.snapshot.last_error = Some(error.clone());
        self.finish(previous, WebchatEvent::Error { error })
    }

    /// Drop everything back to defaults.
    pub fn reset(&mut self) -> Vec<WebchatEvent> {
        let previous = self.snapshot();
        self.snapshot = StateSnapshot::default();
        self.finish(previous, WebchatEvent::StateReset)
    }

    fn finish(&self, previous: StateSnapshot, event: WebchatEvent) -> Vec<WebchatEvent> {
        vec![event, self.state_changed(previous)]
    }

    fn state_changed(&self, previous: StateSnapshot) -> WebchatEvent {
        WebchatEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(self.snapshot()),
        }
    }
}
