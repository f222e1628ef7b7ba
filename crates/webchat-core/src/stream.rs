use std::collections::BTreeMap;

use serde_json::Number;
use tracing::{debug, trace};

use crate::error::WebchatError;

/// Prefix applied to raw stream ids when materializing messages.
pub const STREAM_ID_PREFIX: &str = "msg_";

/// Observations produced while assembling a stream.
///
/// The caller materializes these into messages, indicator changes, and
/// dedup-window entries; the assembler itself never touches shared state.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEffect {
    /// The deferred initial message: empty text, status streaming.
    EmitInitial { id: String, timestamp: u64 },
    /// The accumulated prefix grew; full text so far.
    EmitUpdate { id: String, text: String },
    /// Assembly finished; full (possibly empty) text, status delivered.
    EmitFinal { id: String, text: String },
    /// Any active typing/thinking indicator must stop.
    StopIndicators,
    /// Record a finalized text for echo suppression.
    RecordDedup { text: String },
    /// A recoverable protocol violation to surface on the error channel.
    Error(WebchatError),
}

#[derive(Debug, Clone)]
struct StreamRecord {
    id: String,
    text: String,
    started_at: u64,
    next_expected_seq: u64,
    pending: BTreeMap<u64, String>,
    message_emitted: bool,
}

impl StreamRecord {
    fn new(id: String, started_at: u64) -> Self {
        Self {
            id,
            text: String::new(),
            started_at,
            next_expected_seq: 1,
            pending: BTreeMap::new(),
            message_emitted: false,
        }
    }
}

/// Sequence-ordered assembly state for at most one active stream.
///
/// The invariant maintained is that the emitted prefix equals the
/// concatenation of accepted deltas in ascending seq order, with no gaps.
#[derive(Debug, Clone, Default)]
pub struct StreamAssembler {
    active: Option<StreamRecord>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefixed id of the active stream, if any.
    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|record| record.id.as_str())
    }

    /// Whether the active stream has already accepted content.
    ///
    /// Drives typing-indicator suppression: once any delta landed, new
    /// `typing_start` frames are dropped.
    pub fn has_accepted_content(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|record| record.next_expected_seq > 1)
    }

    /// Open a streamed assembly. The initial message emission is deferred
    /// until the first delta so an indicator can show in the meantime.
    pub fn handle_start(&mut self, id: Option<String>, now: u64) -> Vec<StreamEffect> {
        let Some(raw_id) = id else {
            return vec![StreamEffect::Error(WebchatError::missing_stream_id(
                "stream_start",
            ))];
        };

        if let Some(previous) = &self.active {
            debug!(previous = %previous.id, "replacing active stream; partial content discarded");
        }

        self.active = Some(StreamRecord::new(prefixed_id(&raw_id), now));
        Vec::new()
    }

    /// Apply one delta. Invalid sequence numbers are dropped silently;
    /// duplicates never mutate already-accepted text.
    pub fn handle_delta(&mut self, id: Option<String>, seq: &Number, v: &str) -> Vec<StreamEffect> {
        let Some(seq) = valid_seq(seq) else {
            trace!(?seq, "dropping delta with invalid seq");
            return Vec::new();
        };

        let mut effects = Vec::new();

        if self.active.is_none() {
            // Lost stream_start: open a synthetic stream and emit the
            // initial message immediately.
            let raw_id = id.unwrap_or_else(|| crate::types::now_ms().to_string());
            let mut record = StreamRecord::new(prefixed_id(&raw_id), crate::types::now_ms());
            record.message_emitted = true;
            effects.push(StreamEffect::EmitInitial {
                id: record.id.clone(),
                timestamp: record.started_at,
            });
            self.active = Some(record);
        }

        let record = self.active.as_mut().expect("active stream ensured above");

        if seq < record.next_expected_seq {
            trace!(seq, next = record.next_expected_seq, "ignoring duplicate delta");
            return effects;
        }

        if seq > record.next_expected_seq {
            record.pending.insert(seq, v.to_owned());
            return effects;
        }

        if !record.message_emitted {
            effects.push(StreamEffect::StopIndicators);
            effects.push(StreamEffect::EmitInitial {
                id: record.id.clone(),
                timestamp: record.started_at,
            });
            record.message_emitted = true;
        }

        record.text.push_str(v);
        record.next_expected_seq += 1;
        effects.push(StreamEffect::EmitUpdate {
            id: record.id.clone(),
            text: record.text.clone(),
        });

        // Greedily drain any buffered continuation.
        while let Some(chunk) = record.pending.remove(&record.next_expected_seq) {
            record.text.push_str(&chunk);
            record.next_expected_seq += 1;
            effects.push(StreamEffect::EmitUpdate {
                id: record.id.clone(),
                text: record.text.clone(),
            });
        }

        effects
    }

    /// Close an assembly. A `stream_end` for an id that never started still
    /// emits a final empty update without touching an unrelated stream.
    pub fn handle_end(&mut self, id: Option<String>) -> Vec<StreamEffect> {
        let Some(raw_id) = id else {
            return vec![StreamEffect::Error(WebchatError::missing_stream_id(
                "stream_end",
            ))];
        };

        let target = prefixed_id(&raw_id);
        let mut effects = Vec::new();

        let matches_active = self
            .active
            .as_ref()
            .is_some_and(|record| record.id == target);
        let text = if matches_active {
            self.active.take().expect("checked above").text
        } else {
            String::new()
        };

        effects.push(StreamEffect::EmitFinal {
            id: target,
            text: text.clone(),
        });
        effects.push(StreamEffect::StopIndicators);
        if !text.is_empty() {
            effects.push(StreamEffect::RecordDedup { text });
        }

        effects
    }
}

fn prefixed_id(raw: &str) -> String {
    format!("{STREAM_ID_PREFIX}{raw}")
}

/// Sequence numbers are strictly positive integers; everything else is
/// dropped.
fn valid_seq(seq: &Number) -> Option<u64> {
    seq.as_u64().filter(|seq| *seq >= 1)
}
