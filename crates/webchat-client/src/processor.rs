use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use webchat_core::{
    DedupWindow, Direction, InboundFrame, IncomingMessage, InteractiveContent, Message,
    MessageContent, MessagePatch, MessageStatus, StreamAssembler, StreamEffect, WebchatConfig,
    WebchatError, now_ms,
};

use crate::timer::Timer;

/// `from` value that marks an indicator as AI thinking rather than human
/// typing.
const THINKING_SENDER: &str = "ai-assistant";

/// Which indicator a start/stop observation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorKind {
    Typing,
    Thinking,
}

/// Observations emitted by the processor for the aggregator to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutput {
    /// A fully formed incoming message, ready for the view. Non-streamed
    /// messages arrive here through the paced delivery queue.
    NewMessage(Message),
    /// Incremental update targeting an existing message.
    UpdateMessage { id: String, patch: MessagePatch },
    IndicatorStart(IndicatorKind),
    IndicatorStop(IndicatorKind),
    /// A frame nothing else could classify.
    UnknownFrame(Value),
    Error(WebchatError),
}

#[derive(Debug, Default)]
struct IndicatorFlags {
    typing: bool,
    thinking: bool,
}

/// Consumes classified inbound frames and emits processor observations.
///
/// Owns the active stream assembly, the dedup window, the indicator state
/// and its timers, and the paced delivery queue for non-streamed messages.
pub struct Processor {
    assembler: StreamAssembler,
    dedup: DedupWindow,
    indicators: Arc<Mutex<IndicatorFlags>>,
    typing_timer: Timer,
    thinking_timer: Timer,
    deferred_typing_timer: Timer,
    delivery_tx: mpsc::UnboundedSender<Message>,
    out_tx: mpsc::UnboundedSender<ProcessorOutput>,
    enable_typing_indicator: bool,
    start_typing_on_message_sent: bool,
    typing_timeout: Duration,
    typing_delay: Duration,
}

impl Processor {
    /// Build the processor and spawn its delivery pacer. Must be called
    /// from within a tokio runtime.
    pub fn new(config: &WebchatConfig, out_tx: mpsc::UnboundedSender<ProcessorOutput>) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_delivery_queue(
            delivery_rx,
            out_tx.clone(),
            config.message_delay,
        ));

        Self {
            assembler: StreamAssembler::new(),
            dedup: DedupWindow::default(),
            indicators: Arc::new(Mutex::new(IndicatorFlags::default())),
            typing_timer: Timer::new(),
            thinking_timer: Timer::new(),
            deferred_typing_timer: Timer::new(),
            delivery_tx,
            out_tx,
            enable_typing_indicator: config.enable_typing_indicator,
            start_typing_on_message_sent: config.start_typing_on_message_sent,
            typing_timeout: config.typing_timeout,
            typing_delay: config.typing_delay,
        }
    }

    /// Process one classified inbound frame.
    pub fn handle_frame(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::Message { id, message, metadata } => {
                self.handle_message(id, message, metadata);
            }
            InboundFrame::StreamStart { id } => {
                let effects = self.assembler.handle_start(id, now_ms());
                self.apply_effects(effects);
            }
            InboundFrame::Delta { id, seq, v } => {
                let effects = self.assembler.handle_delta(id, &seq, &v);
                self.apply_effects(effects);
            }
            InboundFrame::StreamEnd { id } => {
                let effects = self.assembler.handle_end(id);
                self.apply_effects(effects);
            }
            InboundFrame::TypingStart { from } => self.handle_typing_start(from.as_deref()),
            InboundFrame::Unknown(raw) => {
                let _ = self.out_tx.send(ProcessorOutput::UnknownFrame(raw));
            }
            // Connection-level frames are consumed by the engine and the
            // client; they carry nothing for the processor.
            InboundFrame::Pong
            | InboundFrame::ReadyForMessage
            | InboundFrame::ServerError { .. }
            | InboundFrame::History { .. } => {}
        }
    }

    /// An outbound message was sent; optionally schedule the deferred
    /// typing indicator.
    pub fn notify_message_sent(&mut self) {
        if !self.start_typing_on_message_sent || !self.enable_typing_indicator {
            return;
        }

        let indicators = Arc::clone(&self.indicators);
        let out_tx = self.out_tx.clone();
        self.deferred_typing_timer
            .arm(self.typing_delay, move || {
                let mut flags = indicators.lock().expect("indicator lock poisoned");
                // Suppressed when any indicator is already active.
                if flags.typing || flags.thinking {
                    return;
                }
                flags.typing = true;
                let _ = out_tx.send(ProcessorOutput::IndicatorStart(IndicatorKind::Typing));
            });
    }

    /// Explicitly stop any active indicator and cancel its timers.
    pub fn stop_indicators(&mut self) {
        self.typing_timer.cancel();
        self.thinking_timer.cancel();
        self.deferred_typing_timer.cancel();

        let mut flags = self.indicators.lock().expect("indicator lock poisoned");
        if flags.typing {
            flags.typing = false;
            let _ = self
                .out_tx
                .send(ProcessorOutput::IndicatorStop(IndicatorKind::Typing));
        }
        if flags.thinking {
            flags.thinking = false;
            let _ = self
                .out_tx
                .send(ProcessorOutput::IndicatorStop(IndicatorKind::Thinking));
        }
    }

    fn handle_message(
        &mut self,
        outer_id: Option<String>,
        message: IncomingMessage,
        metadata: Option<Value>,
    ) {
        let Some(normalized) = normalize_incoming(outer_id, message, metadata) else {
            let _ = self
                .out_tx
                .send(ProcessorOutput::UnknownFrame(json!({"type": "message"})));
            return;
        };

        // Exact-text echoes of recently finalized messages are dropped.
        if let Some(text) = normalized.text()
            && self.dedup.contains(text)
        {
            debug!(id = %normalized.id, "suppressing duplicate text");
            return;
        }

        if let Some(text) = normalized.text() {
            self.dedup.record(text.to_owned());
        }

        self.stop_indicators();
        let _ = self.delivery_tx.send(normalized);
    }

    fn handle_typing_start(&mut self, from: Option<&str>) {
        if !self.enable_typing_indicator {
            return;
        }
        // Content is already streaming in; the indicator would flicker
        // over visible text.
        if self.assembler.has_accepted_content() {
            trace!("typing_start dropped while stream content is live");
            return;
        }

        let kind = if from == Some(THINKING_SENDER) {
            IndicatorKind::Thinking
        } else {
            IndicatorKind::Typing
        };

        let started = {
            let mut flags = self.indicators.lock().expect("indicator lock poisoned");
            match kind {
                IndicatorKind::Typing if !flags.typing => {
                    flags.typing = true;
                    true
                }
                IndicatorKind::Thinking if !flags.thinking => {
                    flags.thinking = true;
                    true
                }
                _ => false,
            }
        };
        if started {
            let _ = self.out_tx.send(ProcessorOutput::IndicatorStart(kind));
        }

        // Rearm replaces the previous expiry timer.
        let indicators = Arc::clone(&self.indicators);
        let out_tx = self.out_tx.clone();
        let timer = match kind {
            IndicatorKind::Typing => &mut self.typing_timer,
            IndicatorKind::Thinking => &mut self.thinking_timer,
        };
        timer.arm(self.typing_timeout, move || {
            let mut flags = indicators.lock().expect("indicator lock poisoned");
            let stopped = match kind {
                IndicatorKind::Typing if flags.typing => {
                    flags.typing = false;
                    true
                }
                IndicatorKind::Thinking if flags.thinking => {
                    flags.thinking = false;
                    true
                }
                _ => false,
            };
            if stopped {
                let _ = out_tx.send(ProcessorOutput::IndicatorStop(kind));
            }
        });
    }

    fn apply_effects(&mut self, effects: Vec<StreamEffect>) {
        for effect in effects {
            match effect {
                StreamEffect::EmitInitial { id, timestamp } => {
                    let mut message = Message::new(
                        id,
                        MessageContent::text(""),
                        Direction::Incoming,
                        MessageStatus::Streaming,
                    );
                    message.timestamp = timestamp;
                    let _ = self.out_tx.send(ProcessorOutput::NewMessage(message));
                }
                StreamEffect::EmitUpdate { id, text } => {
                    let _ = self.out_tx.send(ProcessorOutput::UpdateMessage {
                        id,
                        patch: MessagePatch::streaming_text(text, now_ms()),
                    });
                }
                StreamEffect::EmitFinal { id, text } => {
                    let _ = self.out_tx.send(ProcessorOutput::UpdateMessage {
                        id,
                        patch: MessagePatch {
                            text: Some(text),
                            status: Some(MessageStatus::Delivered),
                            timestamp: Some(now_ms()),
                        },
                    });
                }
                StreamEffect::StopIndicators => self.stop_indicators(),
                StreamEffect::RecordDedup { text } => self.dedup.record(text),
                StreamEffect::Error(error) => {
                    let _ = self.out_tx.send(ProcessorOutput::Error(error));
                }
            }
        }
    }
}

/// Serialize non-streamed deliveries with a fixed spacing so bursts render
/// smoothly. FIFO order is preserved.
async fn run_delivery_queue(
    mut delivery_rx: mpsc::UnboundedReceiver<Message>,
    out_tx: mpsc::UnboundedSender<ProcessorOutput>,
    message_delay: Duration,
) {
    while let Some(message) = delivery_rx.recv().await {
        if out_tx.send(ProcessorOutput::NewMessage(message)).is_err() {
            return;
        }
        tokio::time::sleep(message_delay).await;
    }
}

/// Normalize an inbound message payload into the closed message type.
fn normalize_incoming(
    outer_id: Option<String>,
    message: IncomingMessage,
    metadata: Option<Value>,
) -> Option<Message> {
    let id = message
        .message_id
        .clone()
        .or(outer_id)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let content = match message.kind.as_deref() {
        None | Some("text") => {
            if let Some(text) = message.text.clone() {
                MessageContent::Text {
                    text,
                    quick_replies: message.quick_replies.clone(),
                }
            } else if message.cta_message.is_some()
                || message.list_message.is_some()
                || message.interactive.is_some()
            {
                interactive_content(&message)
            } else {
                return None;
            }
        }
        Some("image") => MessageContent::Image {
            media: message.media.clone()?,
            text: message.text.clone(),
        },
        Some("video") => MessageContent::Video {
            media: message.media.clone()?,
            text: message.text.clone(),
        },
        Some("audio") => MessageContent::Audio {
            media: message.media.clone()?,
        },
        Some("file") => MessageContent::File {
            media: message.media.clone()?,
            text: message.text.clone(),
        },
        Some("location") => MessageContent::Location {
            latitude: message.latitude?,
            longitude: message.longitude?,
        },
        Some("interactive") => interactive_content(&message),
        Some(_) => return None,
    };

    let mut normalized = Message::new(id, content, Direction::Incoming, MessageStatus::Delivered);
    normalized.metadata = metadata;
    Some(normalized)
}

/// Fold the loose interactive shapes (`interactive`, `cta_message`,
/// `list_message`) into one payload.
fn interactive_content(message: &IncomingMessage) -> MessageContent {
    let mut interactive = message
        .interactive
        .clone()
        .unwrap_or_else(InteractiveContent::default);
    if interactive.cta_url.is_none() {
        interactive.cta_url = message.cta_message.clone();
    }
    if interactive.list.is_none() {
        interactive.list = message.list_message.clone();
    }
    MessageContent::Interactive { interactive }
}
