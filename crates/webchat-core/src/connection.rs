use crate::{error::WebchatError, types::ConnectionStatus};

/// Substrings in server error frames that invalidate the registration.
const REGISTRATION_RESET_MARKERS: [&str; 2] = ["unable to register", "already exists"];

/// Outcome of a transport close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Schedule a reconnect; `attempt` is the number of attempts already
    /// consumed.
    Reconnect { attempt: u32 },
    /// Stay down; no reconnect is eligible.
    Disconnected,
}

/// Deterministic connection lifecycle transition guard.
///
/// Owns the reconnect eligibility rules and the at-most-once registration
/// bookkeeping; the async engine drives it and performs the I/O.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    is_registered: bool,
    auto_reconnect: bool,
    max_reconnect_attempts: u32,
    in_reconnect_cycle: bool,
}

impl ConnectionStateMachine {
    pub fn new(auto_reconnect: bool, max_reconnect_attempts: u32) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            is_registered: false,
            auto_reconnect,
            max_reconnect_attempts,
            in_reconnect_cycle: false,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn is_registered(&self) -> bool {
        self.is_registered
    }

    /// Begin connecting from an idle state.
    pub fn on_connect_requested(&mut self) -> Result<(), WebchatError> {
        match self.status {
            ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                self.status = ConnectionStatus::Connecting;
                self.reconnect_attempts = 0;
                self.in_reconnect_cycle = false;
                Ok(())
            }
            current => Err(WebchatError::invalid_state(current, "connect")),
        }
    }

    /// The server sent `ready_for_message`; the handshake is complete.
    ///
    /// Returns whether a transition happened (a stray `ready_for_message`
    /// outside of connecting is ignored).
    pub fn on_handshake_complete(&mut self) -> bool {
        if self.status != ConnectionStatus::Connecting {
            return false;
        }
        self.status = ConnectionStatus::Connected;
        self.reconnect_attempts = 0;
        self.in_reconnect_cycle = false;
        true
    }

    /// The transport closed; decide whether a reconnect is eligible.
    pub fn on_transport_closed(&mut self) -> CloseOutcome {
        self.is_registered = false;

        let eligible = self.auto_reconnect
            && (self.status == ConnectionStatus::Connected || self.in_reconnect_cycle);

        if eligible && self.reconnect_attempts < self.max_reconnect_attempts {
            self.status = ConnectionStatus::Reconnecting;
            self.in_reconnect_cycle = true;
            CloseOutcome::Reconnect {
                attempt: self.reconnect_attempts,
            }
        } else {
            self.status = ConnectionStatus::Disconnected;
            self.in_reconnect_cycle = false;
            CloseOutcome::Disconnected
        }
    }

    /// The backoff delay elapsed; move back into connecting.
    pub fn on_reconnect_delay_elapsed(&mut self) {
        if self.status == ConnectionStatus::Reconnecting {
            self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
            self.status = ConnectionStatus::Connecting;
        }
    }

    /// Explicit disconnect. When `permanent`, auto-reconnect is forced off
    /// for the rest of this instance's life.
    pub fn on_disconnect(&mut self, permanent: bool) {
        if permanent {
            self.auto_reconnect = false;
        }
        self.status = ConnectionStatus::Disconnected;
        self.in_reconnect_cycle = false;
        self.is_registered = false;
    }

    /// A fatal, non-reconnectable failure.
    pub fn on_fatal(&mut self) {
        self.status = ConnectionStatus::Error;
        self.in_reconnect_cycle = false;
        self.is_registered = false;
    }

    /// Claim the one registration send allowed per open socket. Returns
    /// false when registration was already sent on this socket.
    pub fn claim_registration(&mut self) -> bool {
        if self.is_registered {
            return false;
        }
        self.is_registered = true;
        true
    }

    /// Force a fresh registration on the next opportunity.
    pub fn reset_registration(&mut self) {
        self.is_registered = false;
    }

    /// Whether a server error frame's text invalidates the registration.
    pub fn error_resets_registration(text: &str) -> bool {
        REGISTRATION_RESET_MARKERS
            .iter()
            .any(|marker| text.contains(marker))
    }
}
