//! Runtime layer of the webchat client.
//!
//! Wires the connection engine, session engine, and streaming message
//! processor into the single aggregated state view, and exposes the
//! consumer-facing [`WebchatClient`] API on top of the event bus.

/// Consumer-facing client and state aggregation.
pub mod client;
/// Streaming message processor task.
pub mod processor;
/// Session identity, freshness, and conversation persistence.
pub mod session;
/// Single-shot timer resources.
pub mod timer;

pub use client::WebchatClient;
pub use processor::{IndicatorKind, Processor, ProcessorOutput};
pub use session::{SessionEngine, generate_session_id, is_valid_session_id};
pub use timer::Timer;
