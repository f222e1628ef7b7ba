use std::time::Duration;

use url::Url;

use crate::{error::WebchatError, frame::SessionType};

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 30;
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(50);
pub const DEFAULT_MESSAGE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_TYPING_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(50);
pub const DEFAULT_CACHE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_CONTACT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// When the client opens its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOn {
    /// Connect as soon as the client is initialized.
    Mount,
    /// Connect only when the embedding application asks.
    Manual,
    /// Connect lazily on the first outbound send.
    Demand,
}

/// Where the session (and its conversation) is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// Survives process restarts.
    Local,
    /// Lives only as long as the process.
    Session,
}

impl StorageKind {
    pub fn session_type(self) -> SessionType {
        match self {
            Self::Local => SessionType::Local,
            Self::Session => SessionType::Session,
        }
    }
}

/// Runtime configuration for the webchat client.
///
/// All timing knobs are typed durations; defaults follow the service
/// contract.
#[derive(Debug, Clone, PartialEq)]
pub struct WebchatConfig {
    pub socket_url: String,
    pub channel_uuid: String,
    /// Callback base used in the registration frame.
    pub host: String,
    /// Overrides the host part of generated session ids.
    pub client_id: Option<String>,
    pub session_token: Option<String>,
    /// Adopt a fixed session id instead of generating one.
    pub session_id: Option<String>,
    pub connect_on: ConnectOn,
    pub storage: StorageKind,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub ping_interval: Duration,
    pub message_delay: Duration,
    pub typing_delay: Duration,
    pub typing_timeout: Duration,
    pub enable_typing_indicator: bool,
    pub start_typing_on_message_sent: bool,
    pub auto_clear_cache: bool,
    pub cache_timeout: Duration,
    pub contact_timeout: Duration,
}

impl WebchatConfig {
    pub fn new(socket_url: impl Into<String>, channel_uuid: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            channel_uuid: channel_uuid.into(),
            host: String::new(),
            client_id: None,
            session_token: None,
            session_id: None,
            connect_on: ConnectOn::Mount,
            storage: StorageKind::Local,
            auto_reconnect: true,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            message_delay: DEFAULT_MESSAGE_DELAY,
            typing_delay: DEFAULT_TYPING_DELAY,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            enable_typing_indicator: true,
            start_typing_on_message_sent: false,
            auto_clear_cache: false,
            cache_timeout: DEFAULT_CACHE_TIMEOUT,
            contact_timeout: DEFAULT_CONTACT_TIMEOUT,
        }
    }

    /// Check required fields and endpoint shape.
    pub fn validate(&self) -> Result<(), WebchatError> {
        if self.socket_url.trim().is_empty() {
            return Err(WebchatError::invalid_config(
                "socket_url",
                "must not be empty",
            ));
        }
        if self.channel_uuid.trim().is_empty() {
            return Err(WebchatError::invalid_config(
                "channel_uuid",
                "must not be empty",
            ));
        }

        let url = Url::parse(&self.socket_url)
            .map_err(|err| WebchatError::invalid_config("socket_url", err.to_string()))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(WebchatError::invalid_config(
                "socket_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }

        Ok(())
    }

    /// Callback URL advertised during registration.
    pub fn callback_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        format!("{host}/c/wwc/{}/receive", self.channel_uuid)
    }

    /// Host component of generated session ids: `client_id` when set, else
    /// the authority of `host`, else a fixed fallback.
    pub fn identity_suffix(&self) -> String {
        if let Some(client_id) = &self.client_id
            && !client_id.trim().is_empty()
        {
            return client_id.clone();
        }

        if let Ok(url) = Url::parse(&self.host)
            && let Some(host) = url.host_str()
        {
            return host.to_owned();
        }

        "webchat".to_owned()
    }
}
