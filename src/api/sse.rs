//! Minimal server-sent-events framing.

use tracing::warn;

/// Largest line or event payload kept, in bytes.
const MAX_EVENT_BYTES: usize = 1 << 20;

/// Incremental decoder turning byte chunks into event payloads.
///
/// Only `data:` fields are kept; comments (`:` lines), `event:`, `id:` and
/// `retry:` fields are skipped. Multiple `data:` lines in one event are joined
/// with `\n`, and an event is emitted on the blank line that ends it. Lines
/// end in `\n`, `\r\n` or a bare `\r`.
///
/// A line or event larger than the limit is dropped whole and decoding
/// resumes at the next line.
#[derive(Debug)]
pub struct SseDecoder {
  buffer: Vec<u8>,
  data: Vec<String>,
  data_len: usize,
  limit: usize,
  /// The buffer ended on `\r`; a `\n` opening the next chunk belongs to it
  after_cr: bool,
  /// Skipping the tail of an oversized line
  skip_line: bool,
  /// Skipping the rest of an oversized event
  skip_event: bool,
}

impl Default for SseDecoder {
  fn default() -> Self {
    Self::with_limit(MAX_EVENT_BYTES)
  }
}

impl SseDecoder {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_limit(limit: usize) -> Self {
    Self {
      buffer: Vec::new(),
      data: Vec::new(),
      data_len: 0,
      limit,
      after_cr: false,
      skip_line: false,
      skip_event: false,
    }
  }

  /// Feed a chunk and return every event it completes.
  pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
    let mut chunk = chunk;
    if self.after_cr && !chunk.is_empty() {
      self.after_cr = false;
      if chunk[0] == b'\n' {
        chunk = &chunk[1..];
      }
    }
    self.buffer.extend_from_slice(chunk);
    let mut events = Vec::new();

    while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n' || *b == b'\r') {
      let mut end = pos + 1;
      if self.buffer[pos] == b'\r' {
        match self.buffer.get(end) {
          Some(b'\n') => end += 1,
          Some(_) => {}
          None => self.after_cr = true,
        }
      }
      let line = String::from_utf8_lossy(&self.buffer[..pos]).into_owned();
      self.buffer.drain(..end);

      if std::mem::take(&mut self.skip_line) {
        continue;
      }
      if let Some(event) = self.line(&line) {
        events.push(event);
      }
    }

    if self.buffer.len() > self.limit {
      warn!(bytes = self.buffer.len(), "oversized event stream line dropped");
      self.buffer.clear();
      self.skip_line = true;
      self.drop_event();
    }
    events
  }

  fn line(&mut self, line: &str) -> Option<String> {
    if line.is_empty() {
      let skipped = std::mem::take(&mut self.skip_event);
      if self.data.is_empty() || skipped {
        self.drop_event();
        return None;
      }
      let event = self.data.join("\n");
      self.drop_event();
      return Some(event);
    }
    if line.starts_with(':') || self.skip_event {
      return None;
    }

    let (field, value) = match line.split_once(':') {
      Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
      None => (line, ""),
    };
    if field == "data" {
      self.data_len += value.len();
      if self.data_len > self.limit {
        warn!(bytes = self.data_len, "oversized event dropped");
        self.drop_event();
        self.skip_event = true;
        return None;
      }
      self.data.push(value.to_string());
    }
    None
  }

  fn drop_event(&mut self) {
    self.data.clear();
    self.data_len = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_events_split_across_chunks() {
    let mut decoder = SseDecoder::new();
    assert!(decoder.push(b"data: {\"type\":").is_empty());
    assert_eq!(
      decoder.push(b"\"hello\"}\n\ndata: {\"type\":\"heartbeat\"}\r\n\r\n"),
      vec![r#"{"type":"hello"}"#.to_string(), r#"{"type":"heartbeat"}"#.to_string()]
    );
  }

  #[test]
  fn test_comments_and_other_fields_skipped() {
    let mut decoder = SseDecoder::new();
    let events = decoder.push(b": keepalive\n\nretry: 3000\nevent: ready\nid: 4\ndata: a\ndata: b\n\n");
    assert_eq!(events, vec!["a\nb".to_string()]);
  }

  #[test]
  fn test_bare_carriage_returns_end_lines() {
    let mut decoder = SseDecoder::new();
    assert_eq!(decoder.push(b"data: a\r\rdata: b\r"), vec!["a".to_string()]);
    // CRLF split across chunks is one line break, not two.
    assert!(decoder.push(b"\ndata: c\r").is_empty());
    assert_eq!(decoder.push(b"\r"), vec!["b\nc".to_string()]);
  }

  #[test]
  fn test_oversized_line_is_dropped() {
    let mut decoder = SseDecoder::with_limit(16);
    assert!(decoder.push(b"data: 0123456789abcdefghij").is_empty());
    assert!(decoder.buffer.is_empty());
    assert_eq!(decoder.push(b"klmnop\n\ndata: ok\n\n"), vec!["ok".to_string()]);
  }

  #[test]
  fn test_oversized_event_is_dropped() {
    let mut decoder = SseDecoder::with_limit(16);
    let events = decoder.push(b"data: 0123456789\ndata: 0123456789\ndata: x\n\ndata: ok\n\n");
    assert_eq!(events, vec!["ok".to_string()]);
  }
}
