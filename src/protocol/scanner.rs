//! Frame scanner for reassembling frames out of a raw byte stream.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements an explicit state machine:
//! - `SeekHeader`: discard (and report) bytes until a header marker
//! - `ReadingBody`: header found, need the sequence digit and 16 body bytes
//! - `SeekTail`: walk the extension looking for the tail marker
//! - `Emit`: tail found, split the frame off the buffer
//!
//! A frame that never terminates is abandoned with a [`FramingError`] and the
//! scanner resynchronizes at the next header marker. Nothing is dropped
//! without an event saying so.
//!
//! # Example
//!
//! ```
//! use mirwire::protocol::{FrameScanner, ScanEvent};
//!
//! let mut scanner = FrameScanner::new();
//! let mut wire = vec![0x23, b'4'];
//! wire.extend_from_slice(&[0x3C; 16]);
//! wire.push(0x21);
//!
//! // Data arrives in chunks from the transport
//! assert!(scanner.push(&wire[..7]).is_empty());
//! let events = scanner.push(&wire[7..]);
//!
//! assert!(matches!(events.as_slice(), [ScanEvent::Frame(_)]));
//! ```

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::frame::Frame;
use super::wire_format::{
    Sequence, DEFAULT_MAX_FRAME_LEN, EXTENSION_OFFSET, HEADER_MARKER, MIN_FRAME_SIZE, TAIL_MARKER,
};
use crate::error::FramingError;

/// Default initial buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4 * 1024;

/// Scanner configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Longest frame accepted before an open frame is abandoned.
    pub max_frame_len: usize,
    /// Initial buffer capacity.
    pub buffer_capacity: usize,
}

impl ScannerConfig {
    /// Set the maximum frame length (never below the 19-byte minimum frame).
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.max(MIN_FRAME_SIZE);
        self
    }

    /// Set the initial buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    fn effective_max(&self) -> usize {
        self.max_frame_len.max(MIN_FRAME_SIZE)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// State machine for frame reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Looking for a header marker.
    SeekHeader,
    /// Header at buffer start, waiting for sequence digit and body.
    ReadingBody,
    /// Body complete, tail search resumes at `searched`.
    SeekTail {
        /// Buffer index where the next tail search starts.
        searched: usize,
    },
    /// Tail found; frame occupies `..end`.
    Emit {
        /// Exclusive end of the frame in the buffer.
        end: usize,
    },
}

/// One step of scanner output, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// A complete, well-formed frame.
    Frame(Frame),
    /// Bytes outside any frame.
    Skipped {
        /// Stream offset of the first skipped byte.
        offset: u64,
        /// The skipped bytes.
        bytes: Bytes,
    },
    /// A frame was abandoned; the scanner has already resynchronized.
    Error(FramingError),
}

/// Running counters for one scanning session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerStats {
    /// Bytes consumed from the stream so far (offset of the buffer start).
    pub offset: u64,
    /// Frames emitted.
    pub frames: u64,
    /// Framing errors that forced a resynchronization.
    pub resyncs: u64,
    /// Bytes reported as skipped or discarded.
    pub skipped_bytes: u64,
}

/// Persisted scanner position, for restarting across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerSnapshot {
    /// Counters at the time of the snapshot.
    pub stats: ScannerStats,
    /// Buffered bytes not yet emitted.
    #[serde(with = "hex_bytes")]
    pub buffer: Vec<u8>,
}

/// Streaming frame scanner.
///
/// All data is stored in a single `BytesMut` buffer. While a frame is open the
/// buffer always starts at its header marker.
pub struct FrameScanner {
    buffer: BytesMut,
    state: ScanState,
    config: ScannerConfig,
    stats: ScannerStats,
}

impl FrameScanner {
    /// Create a scanner with default settings (max frame 1024 bytes).
    pub fn new() -> Self {
        Self::with_config(ScannerConfig::default())
    }

    /// Create a scanner with a custom configuration.
    pub fn with_config(config: ScannerConfig) -> Self {
        Self {
            buffer: BytesMut::with_capacity(config.buffer_capacity),
            state: ScanState::SeekHeader,
            config,
            stats: ScannerStats::default(),
        }
    }

    /// Resume from a snapshot taken by [`FrameScanner::snapshot`].
    pub fn restore(snapshot: ScannerSnapshot, config: ScannerConfig) -> Self {
        let mut scanner = Self::with_config(config);
        scanner.buffer.extend_from_slice(&snapshot.buffer);
        scanner.stats = snapshot.stats;
        scanner
    }

    /// Push data and drain every event it completes.
    ///
    /// Partial frames stay buffered for the next push.
    pub fn push(&mut self, data: &[u8]) -> Vec<ScanEvent> {
        self.extend(data);
        self.drain()
    }

    /// Append data without scanning.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drain every event currently available.
    pub fn drain(&mut self) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        events
    }

    /// Pull the next event, or `None` if more bytes are needed.
    pub fn next_event(&mut self) -> Option<ScanEvent> {
        loop {
            match self.state {
                ScanState::SeekHeader => {
                    if self.buffer.is_empty() {
                        return None;
                    }
                    match self.buffer.iter().position(|&b| b == HEADER_MARKER) {
                        Some(0) => self.state = ScanState::ReadingBody,
                        Some(start) => return Some(self.skip(start)),
                        None => return Some(self.skip(self.buffer.len())),
                    }
                }

                ScanState::ReadingBody => {
                    if self.buffer.len() < 2 {
                        return None;
                    }
                    let byte = self.buffer[1];
                    if Sequence::from_wire(byte).is_none() {
                        let err = FramingError::InvalidSequence {
                            offset: self.stats.offset,
                            byte,
                        };
                        // Only the marker goes; what follows is rescanned as garbage.
                        self.discard(1);
                        return Some(self.fail(err));
                    }
                    if self.buffer.len() < EXTENSION_OFFSET {
                        return None;
                    }
                    self.state = ScanState::SeekTail {
                        searched: EXTENSION_OFFSET,
                    };
                }

                ScanState::SeekTail { searched } => {
                    let max_len = self.config.effective_max();
                    let limit = self.buffer.len().min(max_len);

                    let hit = self.buffer[searched..limit]
                        .iter()
                        .position(|&b| b == TAIL_MARKER || b == HEADER_MARKER)
                        .map(|i| searched + i);

                    match hit {
                        Some(i) if self.buffer[i] == TAIL_MARKER => {
                            self.state = ScanState::Emit { end: i + 1 };
                        }
                        Some(i) => {
                            let offset = self.stats.offset;
                            let discarded = self.discard(i);
                            return Some(self.fail(FramingError::Interrupted {
                                offset,
                                discarded,
                            }));
                        }
                        None if self.buffer.len() >= max_len => {
                            let offset = self.stats.offset;
                            let resume = self.buffer[1..]
                                .iter()
                                .position(|&b| b == HEADER_MARKER)
                                .map_or(self.buffer.len(), |i| i + 1);
                            let discarded = self.discard(resume);
                            return Some(self.fail(FramingError::Unterminated {
                                offset,
                                max_len,
                                discarded,
                            }));
                        }
                        None => {
                            self.state = ScanState::SeekTail { searched: limit };
                            return None;
                        }
                    }
                }

                ScanState::Emit { end } => {
                    let raw = self.buffer.split_to(end).freeze();
                    self.stats.offset += end as u64;
                    self.state = ScanState::SeekHeader;

                    return Some(match Frame::from_raw(raw) {
                        Ok(frame) => {
                            self.stats.frames += 1;
                            tracing::trace!(
                                sequence = %frame.sequence(),
                                len = frame.len(),
                                "frame emitted"
                            );
                            ScanEvent::Frame(frame)
                        }
                        Err(err) => self.fail(err),
                    });
                }
            }
        }
    }

    /// Close the stream: drain what is complete, then report any open frame.
    ///
    /// The scanner is reset afterwards and can start a new session.
    pub fn close(&mut self) -> Vec<ScanEvent> {
        let mut events = self.drain();

        if !self.buffer.is_empty() {
            let offset = self.stats.offset;
            let len = self.buffer.len();
            let discarded = self.discard(len);
            tracing::warn!(offset, len, "stream closed mid-frame, partial frame dropped");
            events.push(self.fail(FramingError::TruncatedAtClose { offset, discarded }));
        }

        self.state = ScanState::SeekHeader;
        events
    }

    /// Capture buffered bytes and counters so a later session can resume.
    pub fn snapshot(&self) -> ScannerSnapshot {
        ScannerSnapshot {
            stats: self.stats,
            buffer: self.buffer.to_vec(),
        }
    }

    /// Drop buffered bytes and counters.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ScanState::SeekHeader;
        self.stats = ScannerStats::default();
    }

    /// Counters for this session.
    pub fn stats(&self) -> ScannerStats {
        self.stats
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Active configuration.
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn skip(&mut self, count: usize) -> ScanEvent {
        let offset = self.stats.offset;
        let bytes = self.buffer.split_to(count).freeze();
        self.stats.offset += count as u64;
        self.stats.skipped_bytes += count as u64;
        tracing::debug!(offset, count, "skipped bytes outside any frame");
        ScanEvent::Skipped { offset, bytes }
    }

    fn discard(&mut self, count: usize) -> Vec<u8> {
        let dropped = self.buffer.split_to(count).to_vec();
        self.stats.offset += count as u64;
        self.stats.skipped_bytes += count as u64;
        self.state = ScanState::SeekHeader;
        dropped
    }

    fn fail(&mut self, err: FramingError) -> ScanEvent {
        self.stats.resyncs += 1;
        tracing::warn!(error = %err, "framing error, resynchronizing");
        ScanEvent::Error(err)
    }
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
