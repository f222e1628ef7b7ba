//! Storage layer for the webchat client.
//!
//! This crate defines the raw [`StorageBackend`] contract with in-memory and
//! file-backed implementations, and the [`VersionedStore`] wrapper that
//! namespaces keys, wraps values in versioned envelopes, and recovers from
//! quota exhaustion.

/// Raw key/value backends.
pub mod backend;
/// Namespaced versioned envelope store.
pub mod versioned;

pub use backend::{FileBackend, MemoryBackend, StorageBackend, StorageError};
pub use versioned::{Envelope, MigrationHook, VersionedStore, SCHEMA_VERSION, STORE_PREFIX};
