use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Delivery status of a message.
///
/// Transitions are monotone along pending → sent → delivered (outgoing) or
/// streaming → delivered (incoming); error is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Streaming,
    Error,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent | Self::Streaming => 1,
            Self::Delivered => 2,
            Self::Error => 3,
        }
    }

    /// Whether `next` is a legal forward step from this status.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        if self == next || self == Self::Error || self == Self::Delivered {
            return false;
        }
        next.rank() > self.rank()
    }
}

/// Lifecycle state of the transport connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Call-to-action URL button on an interactive message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CtaUrl {
    pub display_text: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListOption {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Option list attached to an interactive message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListContent {
    pub button: String,
    #[serde(default)]
    pub options: Vec<ListOption>,
}

/// Structured extensions of an interactive message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InteractiveContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cta_url: Option<CtaUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<ListContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderItem {
    pub product_retailer_id: String,
    pub quantity: u32,
    pub item_price: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderContent {
    pub product_items: Vec<OrderItem>,
}

/// Closed sum of message payloads. Normalization into this type happens
/// once, at the processor boundary; everything downstream consumes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        quick_replies: Option<Vec<String>>,
    },
    Image {
        media: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Video {
        media: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Audio {
        media: String,
    },
    File {
        media: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Interactive {
        interactive: InteractiveContent,
    },
    Order {
        order: OrderContent,
    },
    SetCustomField {
        key: String,
        value: String,
    },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            quick_replies: None,
        }
    }

    /// Stable name of the payload kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Audio { .. } => "audio",
            Self::File { .. } => "file",
            Self::Location { .. } => "location",
            Self::Interactive { .. } => "interactive",
            Self::Order { .. } => "order",
            Self::SetCustomField { .. } => "set_custom_field",
        }
    }
}

/// Patch applied to an existing message in the conversation view.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn streaming_text(text: impl Into<String>, timestamp: u64) -> Self {
        Self {
            text: Some(text.into()),
            status: Some(MessageStatus::Streaming),
            timestamp: Some(timestamp),
        }
    }
}

/// A single conversation entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    #[serde(flatten)]
    pub content: MessageContent,
    pub timestamp: u64,
    pub direction: Direction,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        content: MessageContent,
        direction: Direction,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: id.into(),
            content,
            timestamp: now_ms(),
            direction,
            status,
            metadata: None,
        }
    }

    /// Text body, for payload kinds that carry one.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text { text, .. } => Some(text),
            MessageContent::Image { text, .. }
            | MessageContent::Video { text, .. }
            | MessageContent::File { text, .. } => text.as_deref(),
            _ => None,
        }
    }

    /// Apply a patch, honoring the status lattice. Returns whether anything
    /// changed; status regressions are silently ignored.
    pub fn apply_patch(&mut self, patch: &MessagePatch) -> bool {
        let mut changed = false;

        if let Some(text) = &patch.text
            && self.text() != Some(text.as_str())
        {
            match &mut self.content {
                MessageContent::Text { text: current, .. } => {
                    *current = text.clone();
                    changed = true;
                }
                MessageContent::Image { text: current, .. }
                | MessageContent::Video { text: current, .. }
                | MessageContent::File { text: current, .. } => {
                    *current = Some(text.clone());
                    changed = true;
                }
                _ => {}
            }
        }

        if let Some(status) = patch.status
            && self.status.can_advance_to(status)
        {
            self.status = status;
            changed = true;
        }

        if let Some(timestamp) = patch.timestamp
            && self.timestamp != timestamp
        {
            self.timestamp = timestamp;
            changed = true;
        }

        changed
    }
}

/// Session identity and freshness bookkeeping, without the conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub created_at: u64,
    pub last_activity: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_sent_at: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// Persisted session: identity plus the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    #[serde(flatten)]
    pub info: SessionInfo,
    #[serde(default)]
    pub conversation: Vec<Message>,
}

impl Session {
    pub fn new(id: impl Into<String>, now: u64) -> Self {
        Self {
            info: SessionInfo {
                id: id.into(),
                created_at: now,
                last_activity: now,
                last_message_sent_at: None,
                metadata: serde_json::Map::new(),
            },
            conversation: Vec::new(),
        }
    }
}
