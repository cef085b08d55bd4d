//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary frame layer:
//! - Marker and size constants, cyclic sequence identifier
//! - Frame scanner for reassembling frames from a raw byte stream
//! - Frame struct with typed accessors

mod frame;
mod scanner;
mod wire_format;

pub use frame::{spaced_hex, Frame};
pub use scanner::{
    FrameScanner, ScanEvent, ScanState, ScannerConfig, ScannerSnapshot, ScannerStats,
    DEFAULT_BUFFER_CAPACITY,
};
pub use wire_format::{
    Sequence, SequenceCounter, BODY_OFFSET, BODY_SIZE, CRAFTED_EXTENSION, DEFAULT_MAX_FRAME_LEN,
    EXTENSION_OFFSET, HEADER_MARKER, MIN_FRAME_SIZE, SEQUENCE_MAX, SEQUENCE_MIN, TAIL_MARKER,
};
