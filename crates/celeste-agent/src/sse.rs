//! Server-sent events decoding shared by both backends.

use celeste_core::{CelesteError, CelesteResult};
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// A decoded `data:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line.
    Data(String),
    /// The `[DONE]` sentinel used by chat-completion providers.
    Done,
}

/// Splits a byte stream into SSE data lines.
///
/// Lines are cut on raw bytes before UTF-8 decoding, so a multi-byte
/// character split across network reads is never mangled.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// An empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes, returning every complete event they finish.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing line that had no newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&line))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(data.to_string()))
    }
}

/// Pull-based SSE reader over a response body that honours cancellation.
pub struct SseStream<S> {
    inner: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<SseEvent>,
    exhausted: bool,
}

impl<S, B, E> SseStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    /// Wraps a response body stream.
    pub fn new(inner: S) -> Self {
        Self {
            inner: Box::pin(inner),
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Next event, `None` at end of body, or `Cancelled` as soon as the
    /// token fires.
    pub async fn next_event(
        &mut self,
        cancel: &CancellationToken,
    ) -> CelesteResult<Option<SseEvent>> {
        loop {
            if cancel.is_cancelled() {
                return Err(CelesteError::Cancelled);
            }
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.exhausted {
                return Ok(None);
            }

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CelesteError::Cancelled),
                item = self.inner.next() => item,
            };

            match item {
                Some(Ok(bytes)) => self.pending.extend(self.decoder.push(bytes.as_ref())),
                Some(Err(e)) => {
                    return Err(CelesteError::Http(format!("Stream read error: {e}")));
                }
                None => {
                    self.exhausted = true;
                    self.pending.extend(self.decoder.finish());
                }
            }
        }
    }
}
