//! Incremental decoder for the newline-delimited event stream (`stream-json`).
//!
//! The launcher feeds raw stdout chunks as they arrive. Complete lines are
//! decoded independently; a trailing partial line is carried over to the next
//! chunk. Lines that are not JSON objects are skipped, never fatal.

use serde_json::Value;
use tracing::trace;

use crate::core::types::TokenUsage;

/// Event type that carries the final usage totals.
pub const TERMINAL_EVENT_TYPE: &str = "result";

/// One decoded line of the event stream. Only accounting-relevant fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamEvent {
    pub kind: Option<String>,
    /// Incremental text contributed by this event.
    pub text: Option<String>,
    pub usage: Option<TokenUsage>,
    pub turns: Option<u32>,
    pub session_id: Option<String>,
    /// Final answer carried by a terminal event.
    pub result: Option<String>,
}

impl StreamEvent {
    /// Decode a single line. Returns `None` unless the line is a JSON object.
    pub fn decode(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        value.is_object().then(|| Self::from_value(&value))
    }

    fn from_value(value: &Value) -> Self {
        // Partial-message wrappers nest the interesting event one level down.
        if let Some(inner) = value.get("event").filter(|v| v.is_object()) {
            let mut event = Self::from_value(inner);
            event.session_id = event.session_id.or_else(|| str_field(value, "session_id"));
            return event;
        }

        let message = value.get("message");
        Self {
            kind: str_field(value, "type"),
            text: delta_text(value).or_else(|| message.and_then(content_text)),
            usage: value
                .get("usage")
                .or_else(|| message.and_then(|m| m.get("usage")))
                .and_then(usage_block),
            turns: value
                .get("turns")
                .or_else(|| value.get("num_turns"))
                .and_then(Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
            session_id: str_field(value, "session_id"),
            result: str_field(value, "result"),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.as_deref() == Some(TERMINAL_EVENT_TYPE)
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn delta_text(value: &Value) -> Option<String> {
    match value.get("delta") {
        Some(Value::String(text)) => Some(text.clone()),
        Some(delta) => str_field(delta, "text"),
        None => str_field(value, "text"),
    }
}

fn content_text(message: &Value) -> Option<String> {
    let blocks = message.get("content")?.as_array()?;
    let text: String = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect();
    (!text.is_empty()).then_some(text)
}

fn usage_block(usage: &Value) -> Option<TokenUsage> {
    let input = usage.get("input_tokens").and_then(Value::as_u64);
    let output = usage.get("output_tokens").and_then(Value::as_u64);
    if input.is_none() && output.is_none() {
        return None;
    }
    Some(TokenUsage::new(input.unwrap_or(0), output.unwrap_or(0)))
}

/// Stateful line-buffering parser with a running token/turn aggregate.
#[derive(Debug, Default)]
pub struct MessageParser {
    carry: Vec<u8>,
    text: String,
    running_usage: TokenUsage,
    terminal_usage: Option<TokenUsage>,
    turns: u32,
    last_turns: Option<u32>,
    session_id: Option<String>,
    result: Option<String>,
    decoded: usize,
    skipped: usize,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a raw chunk. Returns the number of events decoded from it.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        self.carry.extend_from_slice(chunk);
        let mut decoded = 0;
        while let Some(pos) = self.carry.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            if self.consume_line(&line) {
                decoded += 1;
            }
        }
        decoded
    }

    /// Decode whatever remains buffered. Call once at stream end.
    pub fn flush(&mut self) -> usize {
        if self.carry.is_empty() {
            return 0;
        }
        let line = std::mem::take(&mut self.carry);
        usize::from(self.consume_line(&line))
    }

    fn consume_line(&mut self, line: &[u8]) -> bool {
        let line = String::from_utf8_lossy(line);
        if line.trim().is_empty() {
            return false;
        }
        match StreamEvent::decode(&line) {
            Some(event) => {
                self.apply(event);
                self.decoded += 1;
                true
            }
            None => {
                trace!(line = %line.trim(), "skipping undecodable stream line");
                self.skipped += 1;
                false
            }
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        let terminal = event.is_terminal();
        if let Some(text) = &event.text {
            self.text.push_str(text);
        }
        if let Some(usage) = event.usage {
            self.running_usage = self.running_usage.max(usage);
            if terminal {
                self.terminal_usage = Some(usage);
            }
        }
        if let Some(turns) = event.turns {
            self.turns = self.turns.max(turns);
            self.last_turns = Some(turns);
        }
        if event.session_id.is_some() {
            self.session_id = event.session_id;
        }
        if terminal && event.result.is_some() {
            self.result = event.result;
        }
    }

    /// Running token aggregate; never decreases.
    pub fn tokens_used(&self) -> TokenUsage {
        self.running_usage
    }

    /// Running turn aggregate; never decreases.
    pub fn turns_used(&self) -> u32 {
        self.turns
    }

    /// Usage from the last terminal event, falling back to the running aggregate.
    pub fn final_usage(&self) -> TokenUsage {
        self.terminal_usage.unwrap_or(self.running_usage)
    }

    /// Last explicit turn count seen.
    pub fn final_turns(&self) -> u32 {
        self.last_turns.unwrap_or(0)
    }

    /// Streamed text, or the terminal result when nothing was streamed.
    pub fn output(&self) -> &str {
        if self.text.is_empty() {
            self.result.as_deref().unwrap_or("")
        } else {
            &self.text
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn decoded_events(&self) -> usize {
        self.decoded
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }
}

/// Decodes UTF-8 across chunk boundaries.
///
/// A multi-byte character split between two chunks is held back until it is
/// complete. Invalid sequences become U+FFFD. Text beyond `limit` bytes is
/// dropped.
#[derive(Debug)]
pub struct TextAccumulator {
    text: String,
    pending: Vec<u8>,
    limit: usize,
}

impl TextAccumulator {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            pending: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.pending[consumed..]) {
                Ok(valid) => {
                    append_capped(&mut self.text, valid, self.limit);
                    consumed = self.pending.len();
                    break;
                }
                Err(err) => {
                    let valid_end = consumed + err.valid_up_to();
                    let valid = String::from_utf8_lossy(&self.pending[consumed..valid_end]);
                    append_capped(&mut self.text, &valid, self.limit);
                    match err.error_len() {
                        Some(len) => {
                            append_capped(&mut self.text, "\u{FFFD}", self.limit);
                            consumed = valid_end + len;
                        }
                        // Incomplete trailing sequence; wait for more bytes.
                        None => {
                            consumed = valid_end;
                            break;
                        }
                    }
                }
            }
        }
        self.pending.drain(..consumed);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn append_capped(text: &mut String, piece: &str, limit: usize) {
    let room = limit.saturating_sub(text.len());
    if piece.len() <= room {
        text.push_str(piece);
        return;
    }
    let mut end = room;
    while !piece.is_char_boundary(end) {
        end -= 1;
    }
    text.push_str(&piece[..end]);
}
