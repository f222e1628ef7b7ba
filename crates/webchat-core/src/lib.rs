//! Core contract shared by the webchat transport, runtime, and consumers.
//!
//! This crate defines the message model, wire frame classification, retry
//! and dedup helpers, streaming assembly, the connection lifecycle state
//! machine, the aggregated client state view, and the typed event surface.

/// Client configuration and defaults.
pub mod config;
/// Connection lifecycle state machine.
pub mod connection;
/// Bounded window of recently finalized incoming texts.
pub mod dedup;
/// Stable error types crossing the event boundary.
pub mod error;
/// Typed event surface and broadcast event bus.
pub mod events;
/// Inbound frame classification and outbound frame types.
pub mod frame;
/// Backoff policy used by the reconnect loop.
pub mod retry;
/// Aggregated client state view.
pub mod state;
/// Streaming message assembly.
pub mod stream;
/// Message model and shared protocol types.
pub mod types;

pub use config::{ConnectOn, StorageKind, WebchatConfig};
pub use connection::{CloseOutcome, ConnectionStateMachine};
pub use dedup::DedupWindow;
pub use error::{ErrorCategory, WebchatError};
pub use events::{EventBus, WebchatEvent};
pub use frame::{
    CustomField, HistoryParams, InboundFrame, IncomingMessage, OutboundFrame, OutgoingPayload,
    SessionType, classify,
};
pub use retry::RetryPolicy;
pub use state::{AggregateState, StateSnapshot};
pub use stream::{STREAM_ID_PREFIX, StreamAssembler, StreamEffect};
pub use types::{
    ConnectionStatus, CtaUrl, Direction, InteractiveContent, ListContent, ListOption, Message,
    MessageContent, MessagePatch, MessageStatus, OrderContent, OrderItem, Session, SessionInfo,
    now_ms,
};
