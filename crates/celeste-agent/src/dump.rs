//! Detection of "dumped" responses and typing simulation for replaying them.
//!
//! Some providers buffer the whole answer and deliver it in one event. The
//! CLI uses [`StreamState`] to notice this and [`SimulatedStream`] to pace the
//! text out as if it had been streamed.

use crate::stream::StreamChunk;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Share of the content that must arrive in the first chunk.
const DUMP_RATIO: f64 = 0.8;
/// First chunk must arrive this soon after the request started.
const DUMP_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct StreamInner {
    content: String,
    chunk_sizes: Vec<usize>,
    first_chunk_at: Option<Instant>,
    last_chunk_at: Option<Instant>,
    is_dump: bool,
    is_complete: bool,
}

/// Thread-safe record of one stream's arrival pattern.
#[derive(Debug)]
pub struct StreamState {
    started_at: Instant,
    inner: Mutex<StreamInner>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamState {
    /// State for a request starting now.
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    /// State for a request that started at `start`.
    pub fn started_at(start: Instant) -> Self {
        Self {
            started_at: start,
            inner: Mutex::new(StreamInner {
                content: String::new(),
                chunk_sizes: Vec::new(),
                first_chunk_at: None,
                last_chunk_at: None,
                is_dump: false,
                is_complete: false,
            }),
        }
    }

    /// Records one non-empty content chunk.
    pub fn add_chunk(&self, content: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.content.push_str(content);
        inner.chunk_sizes.push(content.len());
        inner.first_chunk_at.get_or_insert(now);
        inner.last_chunk_at = Some(now);
    }

    /// Feeds a streamed chunk: non-empty deltas are recorded and the
    /// terminal chunk completes the stream.
    pub fn observe(&self, chunk: &StreamChunk) {
        if !chunk.content_delta.is_empty() {
            self.add_chunk(&chunk.content_delta);
        }
        if chunk.is_final {
            self.mark_complete();
        }
    }

    /// Everything received so far.
    pub fn content(&self) -> String {
        self.inner.lock().content.clone()
    }

    /// Completes the stream and classifies it.
    pub fn mark_complete(&self) {
        let mut inner = self.inner.lock();
        inner.is_complete = true;

        let total = inner.content.len();
        let (Some(&first), Some(first_at)) = (inner.chunk_sizes.first(), inner.first_chunk_at)
        else {
            return;
        };
        if total == 0 {
            return;
        }

        let ratio = first as f64 / total as f64;
        let elapsed = first_at.saturating_duration_since(self.started_at);
        inner.is_dump = ratio > DUMP_RATIO && elapsed < DUMP_WINDOW;
    }

    /// Whether the reply arrived in one early chunk.
    pub fn is_dump(&self) -> bool {
        self.inner.lock().is_dump
    }

    /// Whether the terminal chunk was seen.
    pub fn is_complete(&self) -> bool {
        self.inner.lock().is_complete
    }

    /// Non-empty chunks received.
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunk_sizes.len()
    }

    /// Time from request start to the last chunk, zero before any chunk.
    pub fn duration(&self) -> Duration {
        self.inner
            .lock()
            .last_chunk_at
            .map(|t| t.saturating_duration_since(self.started_at))
            .unwrap_or_default()
    }
}

/// Pacing for [`SimulatedStream`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedStreamConfig {
    /// Characters per second.
    pub typing_speed: u32,
    /// Shortest pause between ticks.
    pub min_delay: Duration,
    /// Longest pause between ticks.
    pub max_delay: Duration,
}

impl Default for SimulatedStreamConfig {
    fn default() -> Self {
        Self {
            typing_speed: 40,
            min_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
        }
    }
}

impl SimulatedStreamConfig {
    /// Default delays at `typing_speed` characters per second.
    pub fn with_speed(typing_speed: u32) -> Self {
        Self {
            typing_speed,
            ..Self::default()
        }
    }
}

/// Replays already-received text a few characters at a time.
#[derive(Debug, Clone)]
pub struct SimulatedStream {
    chars: Vec<char>,
    position: usize,
    config: SimulatedStreamConfig,
}

/// One tick of a [`SimulatedStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedTick {
    /// Characters to show.
    pub chunk: String,
    /// Pause before showing the next tick.
    pub delay: Duration,
    /// Set on the tick that ends the replay.
    pub done: bool,
}

impl SimulatedStream {
    /// Replay of `content` paced by `config`.
    pub fn new(content: &str, config: SimulatedStreamConfig) -> Self {
        Self {
            chars: content.chars().collect(),
            position: 0,
            config,
        }
    }

    fn chars_per_tick(&self) -> usize {
        match self.config.typing_speed {
            s if s > 60 => 3,
            s if s > 30 => 2,
            _ => 1,
        }
    }

    /// Next few characters and the pause after them.
    pub fn next_tick(&mut self) -> SimulatedTick {
        if self.position >= self.chars.len() {
            return SimulatedTick {
                chunk: String::new(),
                delay: Duration::ZERO,
                done: true,
            };
        }

        let count = self.chars_per_tick();
        let end = (self.position + count).min(self.chars.len());
        let chunk: String = self.chars[self.position..end].iter().collect();
        self.position = end;

        let speed = f64::from(self.config.typing_speed.max(1));
        let delay = Duration::from_secs_f64(count as f64 / speed)
            .clamp(self.config.min_delay, self.config.max_delay);

        SimulatedTick {
            chunk,
            delay,
            done: self.position >= self.chars.len(),
        }
    }

    /// Fraction replayed so far; an empty stream counts as finished.
    pub fn progress(&self) -> f64 {
        if self.chars.is_empty() {
            return 1.0;
        }
        self.position as f64 / self.chars.len() as f64
    }

    /// Rewinds to the start.
    pub fn reset(&mut self) {
        self.position = 0;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_single_fast_chunk_is_dump() {
        let state = StreamState::new();
        state.add_chunk("The whole answer arrived at once.");
        state.mark_complete();
        assert!(state.is_dump());
        assert!(state.is_complete());
        assert_eq!(state.chunk_count(), 1);
    }

    #[test]
    fn test_incremental_stream_is_not_dump() {
        let state = StreamState::new();
        for word in ["The ", "answer ", "trickled ", "in."] {
            state.add_chunk(word);
        }
        state.mark_complete();
        assert!(!state.is_dump());
        assert_eq!(state.content(), "The answer trickled in.");
    }

    #[test]
    fn test_slow_first_chunk_is_not_dump() {
        let start = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .unwrap();
        let state = StreamState::started_at(start);
        state.add_chunk("everything");
        state.mark_complete();
        assert!(!state.is_dump());
        assert!(state.duration() >= Duration::from_secs(2));
    }

    #[test]
    fn test_empty_stream() {
        let state = StreamState::new();
        state.mark_complete();
        assert!(!state.is_dump());
        assert_eq!(state.duration(), Duration::ZERO);
    }

    #[test]
    fn test_observe_skips_empty_deltas() {
        let state = StreamState::new();
        state.observe(&StreamChunk {
            is_first: true,
            ..StreamChunk::default()
        });
        state.observe(&StreamChunk {
            content_delta: "hello".into(),
            ..StreamChunk::default()
        });
        state.observe(&StreamChunk {
            is_final: true,
            ..StreamChunk::default()
        });
        assert_eq!(state.chunk_count(), 1);
        assert!(state.is_complete());
        assert!(state.is_dump());
    }

    #[test]
    fn test_simulated_stream_pacing() {
        let mut sim = SimulatedStream::new("abcde", SimulatedStreamConfig::with_speed(40));
        let tick = sim.next_tick();
        assert_eq!(tick.chunk, "ab");
        assert_eq!(tick.delay, Duration::from_millis(50));
        assert!(!tick.done);
        assert_eq!(sim.next_tick().chunk, "cd");
        let last = sim.next_tick();
        assert_eq!(last.chunk, "e");
        assert!(last.done);
        assert!((sim.progress() - 1.0).abs() < f64::EPSILON);
        assert!(sim.next_tick().done);
    }

    #[test]
    fn test_simulated_stream_delay_clamped() {
        let mut slow = SimulatedStream::new("abc", SimulatedStreamConfig::with_speed(5));
        let tick = slow.next_tick();
        assert_eq!(tick.chunk, "a");
        assert_eq!(tick.delay, Duration::from_millis(100));

        let mut fast = SimulatedStream::new("abcdef", SimulatedStreamConfig::with_speed(500));
        let tick = fast.next_tick();
        assert_eq!(tick.chunk, "abc");
        assert_eq!(tick.delay, Duration::from_millis(20));
    }

    #[test]
    fn test_simulated_stream_multibyte_and_reset() {
        let mut sim = SimulatedStream::new("✨🌙", SimulatedStreamConfig::with_speed(10));
        assert_eq!(sim.next_tick().chunk, "✨");
        assert!((sim.progress() - 0.5).abs() < f64::EPSILON);
        sim.reset();
        assert_eq!(sim.progress(), 0.0);

        let empty = SimulatedStream::new("", SimulatedStreamConfig::default());
        assert!((empty.progress() - 1.0).abs() < f64::EPSILON);
    }
}
