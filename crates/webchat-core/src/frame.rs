use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::{
    error::WebchatError,
    types::{CtaUrl, InteractiveContent, ListContent, OrderContent},
};

/// Session scope advertised during registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Local,
    Session,
}

/// Payload of an outbound `message` frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingPayload {
    Text { text: String },
    Image { media: String },
    Video { media: String },
    Audio { media: String },
    File { media: String },
    Location { latitude: f64, longitude: f64 },
    Order { timestamp: u64, order: OrderContent },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomField {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct HistoryParams {
    pub limit: u32,
    pub page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<u64>,
}

impl HistoryParams {
    pub fn page(limit: u32, page: u32) -> Self {
        Self {
            limit,
            page,
            ..Self::default()
        }
    }
}

/// Client → server frames.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Register {
        from: String,
        callback: String,
        session_type: SessionType,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Message {
        message: OutgoingPayload,
        from: String,
        context: String,
    },
    MessageWithFields {
        message: OutgoingPayload,
        from: String,
        context: String,
        data: BTreeMap<String, String>,
    },
    SetCustomField {
        data: CustomField,
    },
    Ping,
    GetHistory {
        params: HistoryParams,
    },
}

impl OutboundFrame {
    /// Wire encoding of the frame.
    pub fn encode(&self) -> Result<String, WebchatError> {
        serde_json::to_string(self).map_err(|err| {
            WebchatError::new(
                crate::error::ErrorCategory::Transport,
                "encode_failure",
                err.to_string(),
            )
        })
    }
}

/// Inner payload of an inbound `message` frame, before normalization.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct IncomingMessage {
    #[serde(default, rename = "messageId")]
    pub message_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub quick_replies: Option<Vec<String>>,
    #[serde(default)]
    pub list_message: Option<ListContent>,
    #[serde(default)]
    pub cta_message: Option<CtaUrl>,
    #[serde(default)]
    pub interactive: Option<InteractiveContent>,
}

/// Server → client frames after classification.
///
/// The inbound protocol allows `{type, ...}`, `{message: {type, ...}}`, and
/// type-less `{v, seq}` delta shapes; [`classify`] folds all of them into
/// this variant so downstream code never touches raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Pong,
    ReadyForMessage,
    ServerError {
        text: Option<String>,
    },
    Message {
        id: Option<String>,
        message: IncomingMessage,
        metadata: Option<Value>,
    },
    StreamStart {
        id: Option<String>,
    },
    Delta {
        id: Option<String>,
        seq: Number,
        v: String,
    },
    StreamEnd {
        id: Option<String>,
    },
    TypingStart {
        from: Option<String>,
    },
    History {
        history: Value,
    },
    Unknown(Value),
}

/// Parse one wire frame. JSON failures are reported, not fatal.
pub fn parse_frame(raw: &str) -> Result<InboundFrame, WebchatError> {
    let value = serde_json::from_str::<Value>(raw)
        .map_err(|err| WebchatError::parse_failure(err.to_string()))?;
    Ok(classify(value))
}

/// Fold a raw JSON frame into its tagged variant.
pub fn classify(value: Value) -> InboundFrame {
    let Some(object) = value.as_object() else {
        return InboundFrame::Unknown(value);
    };
    let kind = object.get("type").and_then(Value::as_str).map(str::to_owned);

    match kind.as_deref() {
        Some("pong") => InboundFrame::Pong,
        Some("ready_for_message") => InboundFrame::ReadyForMessage,
        Some("error") => InboundFrame::ServerError {
            text: object
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned),
        },
        Some("message") => classify_message(&value),
        Some("stream_start") => InboundFrame::StreamStart {
            id: stream_id(object),
        },
        Some("stream_end") => InboundFrame::StreamEnd {
            id: stream_id(object),
        },
        Some("typing_start") => InboundFrame::TypingStart {
            from: object
                .get("from")
                .and_then(Value::as_str)
                .map(str::to_owned),
        },
        Some("history") => InboundFrame::History {
            history: object.get("history").cloned().unwrap_or(Value::Null),
        },
        Some(_) => InboundFrame::Unknown(value),
        None => {
            // A `v` plus numeric `seq` with no `type` is a streamed delta.
            let seq = object.get("seq").and_then(Value::as_number);
            let v = object.get("v").and_then(Value::as_str);
            if let (Some(seq), Some(v)) = (seq, v) {
                return InboundFrame::Delta {
                    id: object
                        .get("id")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    seq: seq.clone(),
                    v: v.to_owned(),
                };
            }

            if object
                .get("message")
                .and_then(Value::as_object)
                .is_some_and(|inner| inner.contains_key("type"))
            {
                return classify_message(&value);
            }

            InboundFrame::Unknown(value)
        }
    }
}

fn classify_message(value: &Value) -> InboundFrame {
    let object = value.as_object().expect("caller checked for an object");
    let Some(inner) = object.get("message") else {
        return InboundFrame::Unknown(value.clone());
    };

    match serde_json::from_value::<IncomingMessage>(inner.clone()) {
        Ok(message) => InboundFrame::Message {
            id: object
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned),
            message,
            metadata: object.get("metadata").cloned(),
        },
        Err(_) => InboundFrame::Unknown(value.clone()),
    }
}

fn stream_id(object: &serde_json::Map<String, Value>) -> Option<String> {
    object
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| {
            object
                .get("message")
                .and_then(|inner| inner.get("messageId"))
                .and_then(Value::as_str)
                .map(str::to_owned)
        })
}
