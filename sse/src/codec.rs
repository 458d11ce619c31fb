//! Wire framing for `text/event-stream`.
//!
//! An encoded event looks like:
//!
//! ```text
//! event: notification
//! id: 42
//! retry: 3000
//! data: first line
//! data: second line
//!
//! ```
//!
//! Every field is optional except `data`, which appears once per physical
//! line of the payload. A blank line terminates the event.

use crate::error::{Error, ErrorKind};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Comment frame written on idle connections. Decoders skip comment lines,
/// so it never surfaces as an event.
pub const HEARTBEAT_FRAME: &str = ": keep-alive\n\n";

/// One outgoing event.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub event: Option<String>,
    pub data: Value,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl Message {
    /// A bare `Value::String` is sent verbatim; anything else is sent as JSON.
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            event: None,
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    pub fn json<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_value(data)?))
    }

    pub fn with_event(mut self, name: impl Into<String>) -> Self {
        self.event = Some(name.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    /// The payload as it appears on the wire, before line splitting.
    pub fn data_text(&self) -> String {
        match &self.data {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        let mut frame = String::new();

        if let Some(event) = &self.event {
            check_single_line("event", event)?;
            frame.push_str("event: ");
            frame.push_str(event);
            frame.push('\n');
        }
        if let Some(id) = &self.id {
            check_single_line("id", id)?;
            if id.contains('\0') {
                return Err(Error::new(ErrorKind::InvalidField("id")));
            }
            frame.push_str("id: ");
            frame.push_str(id);
            frame.push('\n');
        }
        if let Some(retry) = self.retry {
            frame.push_str(&format!("retry: {retry}\n"));
        }
        for line in split_lines(&self.data_text()) {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');

        Ok(Bytes::from(frame))
    }
}

fn check_single_line(field: &'static str, value: &str) -> Result<(), Error> {
    if value.contains(['\r', '\n']) {
        return Err(Error::new(ErrorKind::InvalidField(field)));
    }
    Ok(())
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split("\r\n").flat_map(|l| l.split(['\r', '\n']))
}

/// One event reconstructed from the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl DecodedEvent {
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

#[derive(Debug, Default)]
struct PendingEvent {
    event: Option<String>,
    data: String,
    has_data: bool,
    id: Option<String>,
    retry: Option<u64>,
}

/// Incremental decoder that reassembles events from arbitrarily split input.
#[derive(Debug, Default)]
pub struct Decoder {
    /// Trailing bytes of an incomplete UTF-8 sequence.
    bytes: Vec<u8>,
    /// Text not yet terminated by a line break.
    buffer: String,
    pending: PendingEvent,
    last_event_id: Option<String>,
    started: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the most recent event that carried one; what a reconnecting
    /// client sends back as `Last-Event-ID`.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<DecodedEvent> {
        self.bytes.extend_from_slice(chunk);

        let mut text = String::new();
        loop {
            match std::str::from_utf8(&self.bytes) {
                Ok(valid) => {
                    text.push_str(valid);
                    self.bytes.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    text.push_str(std::str::from_utf8(&self.bytes[..valid_up_to]).unwrap_or_default());
                    match e.error_len() {
                        // Incomplete sequence at the end, wait for the rest
                        None => {
                            self.bytes.drain(..valid_up_to);
                            break;
                        }
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            self.bytes.drain(..valid_up_to + len);
                        }
                    }
                }
            }
        }

        self.feed(&text)
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<DecodedEvent> {
        if !self.started && !chunk.is_empty() {
            self.started = true;
            self.buffer
                .push_str(chunk.strip_prefix('\u{feff}').unwrap_or(chunk));
        } else {
            self.buffer.push_str(chunk);
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find(['\r', '\n']) {
            let terminator_len = if self.buffer.as_bytes()[pos] == b'\r' {
                match self.buffer.as_bytes().get(pos + 1) {
                    Some(b'\n') => 2,
                    Some(_) => 1,
                    // A lone `\r` may be the first half of `\r\n`
                    None => break,
                }
            } else {
                1
            };

            let line: String = self.buffer.drain(..pos + terminator_len).collect();
            if let Some(event) = self.process_line(&line[..pos]) {
                events.push(event);
            }
        }
        events
    }

    /// Signals end of input. A line held back because it ended in `\r` is
    /// processed; an unterminated event is discarded.
    pub fn finish(&mut self) -> Vec<DecodedEvent> {
        let mut events = Vec::new();
        if self.buffer.ends_with('\r') {
            let line: String = self.buffer.drain(..).collect();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        self.buffer.clear();
        self.pending = PendingEvent::default();
        events
    }

    fn process_line(&mut self, line: &str) -> Option<DecodedEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(colon) => {
                let value = &line[colon + 1..];
                (&line[..colon], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.pending.event = Some(value.to_string()),
            "data" => {
                if self.pending.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.pending.has_data = true;
            }
            "id" if !value.contains('\0') => self.pending.id = Some(value.to_string()),
            "retry" if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) => {
                self.pending.retry = value.parse().ok();
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<DecodedEvent> {
        let pending = std::mem::take(&mut self.pending);
        if let Some(id) = &pending.id {
            self.last_event_id = Some(id.clone());
        }
        if !pending.has_data {
            return None;
        }

        Some(DecodedEvent {
            event: pending.event,
            data: pending.data,
            id: pending.id,
            retry: pending.retry,
        })
    }
}
