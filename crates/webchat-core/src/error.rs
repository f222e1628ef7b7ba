use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Broad error category used for propagation decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Socket-level failure, parse failure, or closed-before-send.
    Transport,
    /// Malformed or out-of-contract inbound frame.
    Protocol,
    /// Bad configuration or malformed outbound payload.
    Validation,
    /// Persistent store failure.
    Storage,
    /// Operation not valid in the current client state.
    State,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct WebchatError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl WebchatError {
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Send attempted while the transport is closed or absent.
    pub fn transport_closed() -> Self {
        Self::new(
            ErrorCategory::Transport,
            "transport_closed",
            "transport is not open",
        )
    }

    /// An inbound frame was not valid JSON.
    pub fn parse_failure(detail: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, "parse_failure", detail.into())
    }

    /// A stream control frame arrived without a stream id.
    pub fn missing_stream_id(frame_kind: &str) -> Self {
        Self::new(
            ErrorCategory::Protocol,
            "missing_stream_id",
            format!("{frame_kind} frame carries no stream id"),
        )
    }

    /// The server reported an error frame.
    pub fn server_error(text: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transport, "server_error", text.into())
    }

    pub fn invalid_config(field: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCategory::Validation,
            "invalid_config",
            format!("invalid '{field}': {reason}"),
        )
    }

    /// The message content cannot be expressed as an outbound payload.
    pub fn unsupported_outbound(kind: &str) -> Self {
        Self::new(
            ErrorCategory::Validation,
            "unsupported_message_type",
            format!("'{kind}' messages cannot be sent"),
        )
    }

    pub fn storage(detail: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Storage, "storage_error", detail.into())
    }

    /// A second history request while one is pending.
    pub fn history_in_progress() -> Self {
        Self::new(
            ErrorCategory::State,
            "history_in_progress",
            "history request already in progress",
        )
    }

    pub fn history_timeout() -> Self {
        Self::new(
            ErrorCategory::Transport,
            "history_timeout",
            "history request timed out",
        )
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: impl std::fmt::Debug, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::State,
            "invalid_state_transition",
            format!("cannot run '{action}' while in state {current:?}"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_error_codes_stable() {
        assert_eq!(WebchatError::transport_closed().code, "transport_closed");
        assert_eq!(
            WebchatError::missing_stream_id("stream_start").code,
            "missing_stream_id"
        );
        assert_eq!(
            WebchatError::history_in_progress().code,
            "history_in_progress"
        );
        assert_eq!(
            WebchatError::history_in_progress().category,
            ErrorCategory::State
        );
    }

    #[test]
    fn formats_with_category_and_code() {
        let err = WebchatError::invalid_config("socket_url", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Validation:invalid_config: invalid 'socket_url': must not be empty"
        );
    }
}
