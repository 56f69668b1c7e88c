//! Plaintext observability for relayed traffic
//!
//! Forwarding works on raw byte chunks. Line framing exists only here, for the
//! sink, so a stream without newlines is still relayed byte for byte.

use bytes::{Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Longest line buffered for the sink before a partial line is emitted (16 KiB)
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Direction of one half of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
  /// Upstream server to intercepted client
  ServerToClient,
  /// Intercepted client to upstream server
  ClientToServer,
}

impl Direction {
  /// Arrow used in labels
  pub fn arrow(self) -> char {
    match self {
      Direction::ServerToClient => '>',
      Direction::ClientToServer => '<',
    }
  }

  /// Label of this direction for session `session`, e.g. `#3 >`.
  pub fn label(self, session: u64) -> String {
    format!("#{} {}", session, self.arrow())
  }
}

impl fmt::Display for Direction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Direction::ServerToClient => f.write_str("server->client"),
      Direction::ClientToServer => f.write_str("client->server"),
    }
  }
}

/// One line of relayed plaintext
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficRecord {
  /// Session identifier
  pub session: u64,
  /// Direction the bytes travelled
  pub direction: Direction,
  /// Raw line, including its newline if one was seen
  pub line: Bytes,
}

impl TrafficRecord {
  /// Direction label, e.g. `#0 <`
  pub fn label(&self) -> String {
    self.direction.label(self.session)
  }

  /// Line as text without its line terminator
  pub fn text(&self) -> Cow<'_, str> {
    let mut line = self.line.as_ref();
    if let Some(rest) = line.strip_suffix(b"\n") {
      line = rest;
    }
    if let Some(rest) = line.strip_suffix(b"\r") {
      line = rest;
    }
    String::from_utf8_lossy(line)
  }
}

impl fmt::Display for TrafficRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.label(), self.text())
  }
}

/// Destination for relayed plaintext
///
/// Shared by every session; implementations must emit each record as a single
/// unit so lines from concurrent directions never interleave.
pub trait TrafficSink: Send + Sync {
  /// Emit one record
  fn record(&self, record: TrafficRecord);
}

/// Writes each record as one line on standard output
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl TrafficSink for StdoutSink {
  fn record(&self, record: TrafficRecord) {
    let line = format!("{}\n", record);
    // the stdout lock serializes writers, one write_all per record
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = stdout.write_all(line.as_bytes()).and_then(|_| stdout.flush()) {
      tracing::warn!("failed to write traffic line: {}", e);
    }
  }
}

/// Forwards records to a channel, for embedding the relay
#[derive(Clone, Debug)]
pub struct ChannelSink {
  tx: UnboundedSender<TrafficRecord>,
}

impl ChannelSink {
  /// Create a sink and the receiving end of its channel
  pub fn new() -> (Self, UnboundedReceiver<TrafficRecord>) {
    let (tx, rx) = unbounded_channel();
    (Self { tx }, rx)
  }
}

impl TrafficSink for ChannelSink {
  fn record(&self, record: TrafficRecord) {
    // a dropped receiver just means nobody is watching anymore
    let _ = self.tx.send(record);
  }
}

/// Splits a byte stream into lines for the sink
///
/// Partial lines are buffered across chunks. Once `max_len` bytes accumulate
/// without a newline they are emitted as they are.
#[derive(Debug)]
pub struct LineFramer {
  buf: BytesMut,
  max_len: usize,
}

impl LineFramer {
  /// Create a framer emitting lines of at most `max_len` bytes
  pub fn new(max_len: usize) -> Self {
    Self {
      buf: BytesMut::new(),
      max_len: max_len.max(1),
    }
  }

  /// Feed a chunk and collect every line it completes
  pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
    self.buf.extend_from_slice(chunk);
    let mut lines = Vec::new();
    loop {
      let window = self.buf.len().min(self.max_len);
      match self.buf[..window].iter().position(|&b| b == b'\n') {
        Some(pos) => lines.push(self.buf.split_to(pos + 1).freeze()),
        None if self.buf.len() >= self.max_len => {
          lines.push(self.buf.split_to(self.max_len).freeze())
        }
        None => break,
      }
    }
    lines
  }

  /// Take whatever is left at end of stream
  pub fn finish(&mut self) -> Option<Bytes> {
    if self.buf.is_empty() {
      None
    } else {
      Some(self.buf.split().freeze())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_labels() {
    assert_eq!(Direction::ServerToClient.label(0), "#0 >");
    assert_eq!(Direction::ClientToServer.label(12), "#12 <");
  }

  #[test]
  fn test_record_text_strips_terminator() {
    let record = TrafficRecord {
      session: 4,
      direction: Direction::ClientToServer,
      line: Bytes::from_static(b"GET / HTTP/1.1\r\n"),
    };
    assert_eq!(record.text(), "GET / HTTP/1.1");
    assert_eq!(record.to_string(), "#4 < GET / HTTP/1.1");
  }

  #[test]
  fn test_framer_buffers_partial_lines() {
    let mut framer = LineFramer::new(MAX_LINE_LEN);
    assert!(framer.push(b"pi").is_empty());
    assert_eq!(framer.push(b"ng\npo"), vec![Bytes::from_static(b"ping\n")]);
    assert_eq!(
      framer.push(b"ng\n\nx"),
      vec![Bytes::from_static(b"pong\n"), Bytes::from_static(b"\n")]
    );
    assert_eq!(framer.finish(), Some(Bytes::from_static(b"x")));
    assert_eq!(framer.finish(), None);
  }

  #[test]
  fn test_framer_bounds_lines_without_newline() {
    let mut framer = LineFramer::new(4);
    let lines = framer.push(b"abcdefghij\nk");
    assert_eq!(
      lines,
      vec![
        Bytes::from_static(b"abcd"),
        Bytes::from_static(b"efgh"),
        Bytes::from_static(b"ij\n"),
      ]
    );
    assert_eq!(framer.finish(), Some(Bytes::from_static(b"k")));
  }

  #[test]
  fn test_framer_preserves_every_byte() {
    let input: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let mut framer = LineFramer::new(64);
    let mut output = Vec::new();
    for chunk in input.chunks(37) {
      for line in framer.push(chunk) {
        output.extend_from_slice(&line);
      }
    }
    if let Some(rest) = framer.finish() {
      output.extend_from_slice(&rest);
    }
    assert_eq!(output, input);
  }

  #[tokio::test]
  async fn test_channel_sink() {
    let (sink, mut rx) = ChannelSink::new();
    sink.record(TrafficRecord {
      session: 1,
      direction: Direction::ServerToClient,
      line: Bytes::from_static(b"hello\n"),
    });
    let record = rx.recv().await.unwrap();
    assert_eq!(record.to_string(), "#1 > hello");
  }
}
