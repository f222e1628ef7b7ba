//! Transport layer for the webchat client.
//!
//! Defines the [`Transport`] contract with the production WebSocket
//! implementation, and the [`ConnectionEngine`] that drives registration,
//! keep-alive, reconnection, and inbound frame dispatch over it.

/// Async connection engine.
pub mod engine;
/// Transport contract and WebSocket implementation.
pub mod transport;

pub use engine::{ConnectionEngine, EngineEvent, RegistrationData};
pub use transport::{Connection, Transport, TransportError, WsTransport};
