//! Frame decoding for both transports.
//!
//! Socket messages carry one JSON envelope each. The event stream carries
//! `field: value` blocks separated by a blank line; [`FrameDecoder`] buffers
//! partial blocks across reads and hands complete ones to [`Decoder`].

use serde_json::{Map, Value};
use storyloom_proto::{Envelope, EventKind};

#[derive(Debug, Clone, Copy)]
pub enum RawFrame<'a> {
    Socket(&'a str),
    EventBlock(&'a str),
}

/// Stateless decoder bound to the run a stream was opened for. Frames that omit
/// both ids are attributed to that run.
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    run_id: Option<String>,
}

impl Decoder {
    pub fn new(run_id: Option<String>) -> Self {
        Self { run_id }
    }

    pub fn decode(&self, raw: RawFrame<'_>) -> Option<Envelope> {
        match raw {
            RawFrame::Socket(text) => self.decode_socket(text),
            RawFrame::EventBlock(block) => self.decode_block(block),
        }
    }

    fn decode_socket(&self, text: &str) -> Option<Envelope> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(target = "stream.decoder", error = %err, "dropping malformed socket frame");
                return None;
            }
        };
        let Value::Object(root) = value else {
            tracing::debug!(target = "stream.decoder", "socket frame is not an object");
            return None;
        };
        self.finish_envelope(root, None)
    }

    fn decode_block(&self, block: &str) -> Option<Envelope> {
        let mut event_name: Option<&str> = None;
        let mut event_id: Option<&str> = None;
        let mut data: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event_name = Some(value.trim()),
                "data" => data.push(value),
                "id" => event_id = Some(value.trim()),
                _ => {}
            }
        }

        if data.is_empty() {
            tracing::trace!(target = "stream.decoder", "event block without data");
            return None;
        }
        if let Some(name) = event_name {
            if EventKind::parse(name).is_none() {
                tracing::trace!(target = "stream.decoder", event = name, "ignoring unsubscribed event");
                return None;
            }
        }

        let joined = data.join("\n");
        let value: Value = match serde_json::from_str(&joined) {
            Ok(value) => value,
            Err(err) => {
                tracing::debug!(
                    target = "stream.decoder",
                    event = event_name.unwrap_or_default(),
                    error = %err,
                    "dropping malformed event data"
                );
                return None;
            }
        };
        let Value::Object(mut root) = value else {
            tracing::debug!(target = "stream.decoder", "event data is not an object");
            return None;
        };

        // Data is either a full envelope or just its payload.
        if let Some(name) = event_name {
            if !root.contains_key("payload") {
                let mut wrapped = Map::new();
                wrapped.insert("payload".into(), Value::Object(root));
                root = wrapped;
            }
            root.insert("type".into(), Value::String(name.to_string()));
        }
        if !root.contains_key("event_id") {
            if let Some(id) = event_id.and_then(|id| id.parse::<u64>().ok()) {
                root.insert("event_id".into(), Value::from(id));
            }
        }
        self.finish_envelope(root, event_name)
    }

    fn finish_envelope(&self, mut root: Map<String, Value>, event: Option<&str>) -> Option<Envelope> {
        let has_ids = root.contains_key("run_id") || root.contains_key("session_id");
        if !has_ids {
            if let Some(run_id) = &self.run_id {
                root.insert("run_id".into(), Value::String(run_id.clone()));
            }
        }
        match Envelope::from_value(&Value::Object(root)) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                tracing::debug!(
                    target = "stream.decoder",
                    event = event.unwrap_or_default(),
                    error = %err,
                    "dropping undecodable frame"
                );
                None
            }
        }
    }
}

/// Incremental splitter for the event-stream body.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    decoder: Decoder,
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(decoder: Decoder) -> Self {
        Self {
            decoder,
            buffer: Vec::new(),
        }
    }

    /// Feeds one network read and returns every envelope completed by it, in
    /// arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Envelope> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some((end, delimiter)) = find_delimiter(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + delimiter).collect();
            if let Some(envelope) = self.decode_bytes(&block[..end]) {
                out.push(envelope);
            }
        }
        out
    }

    /// Parses whatever remains after the body ended without a final blank line.
    pub fn finish(&mut self) -> Option<Envelope> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        self.decode_bytes(&rest)
    }

    fn decode_bytes(&self, block: &[u8]) -> Option<Envelope> {
        match std::str::from_utf8(block) {
            Ok(text) => self.decoder.decode(RawFrame::EventBlock(text)),
            Err(err) => {
                tracing::debug!(target = "stream.decoder", error = %err, "event block is not utf-8");
                None
            }
        }
    }
}

/// Earliest blank-line delimiter as `(block_end, delimiter_len)`.
fn find_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find(buffer, b"\n\n").map(|at| (at, 2));
    let crlf = find(buffer, b"\r\n\r\n").map(|at| (at, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
