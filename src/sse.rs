//! Incremental parser for OpenAI-style `text/event-stream` bodies.
//!
//! The parser owns all buffering state (undecoded UTF-8 tail, partial line),
//! so callers can hand it arbitrary byte chunks as they arrive off the wire.

use crate::constants::{MAX_PENDING_LINE_BYTES, SSE_DATA_PREFIX, SSE_DONE_SENTINEL};
use crate::specs::openai::ChatCompletionChunk;
use crate::types::{RelayError, StreamEvent};

#[derive(Debug, Default)]
pub struct SseParser {
    undecoded: Vec<u8>,
    partial_line: String,
    emitted: String,
    finished: bool,
    skipped: usize,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the end sentinel has been seen. Further input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of data payloads dropped because they could not be parsed.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        let text = self.decode(chunk);
        self.partial_line.push_str(&text);

        let mut events = Vec::new();
        while let Some(pos) = self.partial_line.find('\n') {
            let line: String = self.partial_line.drain(..=pos).collect();
            if let Some(event) = self.process_line(&line) {
                let terminal = matches!(event, StreamEvent::Done { .. });
                events.push(event);
                if terminal {
                    self.finished = true;
                    self.partial_line.clear();
                    self.undecoded.clear();
                    return events;
                }
            }
        }

        if self.partial_line.len() > MAX_PENDING_LINE_BYTES {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Dropping oversized partial line ({} bytes)",
                self.partial_line.len()
            );
            self.partial_line.clear();
            self.skipped += 1;
        }
        events
    }

    /// Flushes decoder state and any unterminated final line once the body ends.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        if !self.undecoded.is_empty() {
            self.undecoded.clear();
            self.partial_line.push(char::REPLACEMENT_CHARACTER);
        }
        let line = std::mem::take(&mut self.partial_line);
        let mut events = Vec::new();
        if let Some(event) = self.process_line(&line) {
            if matches!(event, StreamEvent::Done { .. }) {
                self.finished = true;
            }
            events.push(event);
        }
        events
    }

    /// Stateful UTF-8 decoding. An incomplete trailing sequence is held back for the
    /// next chunk; invalid bytes become U+FFFD.
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.undecoded.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.undecoded.len());

        loop {
            match std::str::from_utf8(&self.undecoded) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.undecoded.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.undecoded[..valid_up_to]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.undecoded.drain(..valid_up_to + bad);
                        }
                        None => {
                            self.undecoded.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    fn process_line(&mut self, raw: &str) -> Option<StreamEvent> {
        let line = raw.trim_end_matches(['\n', '\r']);
        let payload = line.strip_prefix(SSE_DATA_PREFIX)?.trim();

        if payload.is_empty() {
            return None;
        }
        if payload == SSE_DONE_SENTINEL {
            tracing::debug!("[☁️  -> ⚙️ ] Stream end marker {} received", SSE_DONE_SENTINEL);
            return Some(StreamEvent::Done {
                final_text: self.emitted.clone(),
            });
        }

        match parse_payload(payload) {
            Ok(Some(event)) => {
                if let StreamEvent::Token { content } = &event {
                    self.emitted.push_str(content);
                }
                Some(event)
            }
            Ok(None) => None,
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Skipping unparseable fragment: {} ({})",
                    crate::logging::preview(payload, 120),
                    e
                );
                None
            }
        }
    }
}

/// Parses one `data:` payload. `Ok(None)` means the record carried no text.
pub fn parse_payload(payload: &str) -> std::result::Result<Option<StreamEvent>, RelayError> {
    let chunk: ChatCompletionChunk =
        serde_json::from_str(payload).map_err(|e| RelayError::Parse(e.to_string()))?;

    if let Some(err) = chunk.error {
        return Ok(Some(StreamEvent::error(err.message)));
    }
    Ok(chunk.delta_content().map(StreamEvent::token))
}
