//! Frame struct with typed accessors.
//!
//! A frame is immutable once built: the raw wire bytes are kept alongside the
//! split-out sequence, body, and extension so incidents and exports can always
//! reproduce exactly what was seen on the wire.
//!
//! # Example
//!
//! ```
//! use mirwire::protocol::{Frame, Sequence};
//!
//! let seq = Sequence::new(4).unwrap();
//! let frame = Frame::build(seq, [0x3C; 16], &[0x3C; 6]);
//!
//! assert_eq!(frame.sequence(), seq);
//! assert_eq!(frame.len(), 25);
//! assert_eq!(Frame::parse(frame.raw()).unwrap(), frame);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    Sequence, BODY_OFFSET, BODY_SIZE, EXTENSION_OFFSET, HEADER_MARKER, MIN_FRAME_SIZE,
    TAIL_MARKER,
};
use crate::error::FramingError;

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    sequence: Sequence,
    body: [u8; BODY_SIZE],
    /// Full wire bytes, header through tail (zero-copy via `bytes::Bytes`).
    raw: Bytes,
}

impl Frame {
    /// Build a frame from its parts.
    pub fn build(sequence: Sequence, body: [u8; BODY_SIZE], extension: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(MIN_FRAME_SIZE + extension.len());
        buf.put_u8(HEADER_MARKER);
        buf.put_u8(sequence.to_wire());
        buf.put_slice(&body);
        buf.put_slice(extension);
        buf.put_u8(TAIL_MARKER);
        Self {
            sequence,
            body,
            raw: buf.freeze(),
        }
    }

    /// Parse a buffer holding exactly one frame.
    ///
    /// Only markers, the sequence digit, and the minimum length are checked;
    /// extension bytes are opaque.
    pub fn parse(bytes: &[u8]) -> Result<Self, FramingError> {
        Self::from_raw(Bytes::copy_from_slice(bytes))
    }

    /// Like [`Frame::parse`], but takes ownership without copying.
    pub(crate) fn from_raw(raw: Bytes) -> Result<Self, FramingError> {
        if raw.len() < MIN_FRAME_SIZE {
            return Err(FramingError::Malformed(format!(
                "{} bytes, need at least {MIN_FRAME_SIZE}",
                raw.len()
            )));
        }
        if raw[0] != HEADER_MARKER {
            return Err(FramingError::Malformed(format!(
                "header byte 0x{:02X}, expected 0x{HEADER_MARKER:02X}",
                raw[0]
            )));
        }
        if raw[raw.len() - 1] != TAIL_MARKER {
            return Err(FramingError::Malformed(format!(
                "tail byte 0x{:02X}, expected 0x{TAIL_MARKER:02X}",
                raw[raw.len() - 1]
            )));
        }
        let sequence = Sequence::from_wire(raw[1]).ok_or(FramingError::InvalidSequence {
            offset: 0,
            byte: raw[1],
        })?;

        let mut body = [0u8; BODY_SIZE];
        body.copy_from_slice(&raw[BODY_OFFSET..EXTENSION_OFFSET]);

        Ok(Self {
            sequence,
            body,
            raw,
        })
    }

    /// Parse a hex string (whitespace ignored) holding exactly one frame.
    pub fn from_hex(text: &str) -> crate::error::Result<Self> {
        let compact: String = text.split_whitespace().collect();
        let bytes = hex::decode(compact)?;
        Ok(Self::parse(&bytes)?)
    }

    /// Sequence identifier.
    #[inline]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    /// Encrypted 16-byte core body.
    #[inline]
    pub fn body(&self) -> &[u8; BODY_SIZE] {
        &self.body
    }

    /// Extension region between body and tail.
    #[inline]
    pub fn extension(&self) -> &[u8] {
        &self.raw[EXTENSION_OFFSET..self.raw.len() - 1]
    }

    /// Full wire bytes.
    #[inline]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Cheap clone of the wire bytes.
    #[inline]
    pub fn raw_bytes(&self) -> Bytes {
        self.raw.clone()
    }

    /// Total frame length.
    #[inline]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false; a frame holds at least its markers and body.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Upper-case hex of the wire bytes, space separated.
    pub fn to_hex(&self) -> String {
        spaced_hex(&self.raw)
    }

    /// Same frame with a different body, extension kept as-is.
    pub fn with_body(&self, sequence: Sequence, body: [u8; BODY_SIZE]) -> Self {
        Self::build(sequence, body, self.extension())
    }
}

/// Render bytes as `AA BB CC` upper-case hex.
pub fn spaced_hex(bytes: &[u8]) -> String {
    let compact = hex::encode_upper(bytes);
    let mut out = String::with_capacity(compact.len() + compact.len() / 2);
    for (i, pair) in compact.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push(pair[0] as char);
        out.push(pair[1] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOVE_FRAME: &str =
        "23 34 3C 3C 3C 3C 3C 3C 3C 3C 3C 3C 3F 41 3E 72 58 3C 3C 6C 3D 52 3C 3C 21";

    #[test]
    fn test_parse_captured_move_frame() {
        let frame = Frame::from_hex(MOVE_FRAME).unwrap();

        assert_eq!(frame.sequence().get(), 4);
        assert_eq!(frame.len(), 25);
        assert_eq!(frame.body()[10..], [0x3F, 0x41, 0x3E, 0x72, 0x58, 0x3C]);
        assert_eq!(frame.extension(), &[0x3C, 0x6C, 0x3D, 0x52, 0x3C, 0x3C]);
        assert_eq!(frame.to_hex(), MOVE_FRAME);
    }

    #[test]
    fn test_build_minimal_frame() {
        let seq = Sequence::new(1).unwrap();
        let frame = Frame::build(seq, [0xAB; BODY_SIZE], &[]);

        assert_eq!(frame.len(), MIN_FRAME_SIZE);
        assert_eq!(frame.raw()[0], HEADER_MARKER);
        assert_eq!(frame.raw()[1], b'1');
        assert_eq!(frame.raw()[MIN_FRAME_SIZE - 1], TAIL_MARKER);
        assert!(frame.extension().is_empty());
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_parse_rejects_short_buffer() {
        let err = Frame::parse(&[HEADER_MARKER, b'1', TAIL_MARKER]).unwrap_err();
        assert!(matches!(err, FramingError::Malformed(_)));
    }

    #[test]
    fn test_parse_rejects_bad_markers() {
        let mut bytes = Frame::build(Sequence::new(2).unwrap(), [0; 16], &[]).raw().to_vec();
        bytes[0] = 0x24;
        assert!(Frame::parse(&bytes).is_err());

        let mut bytes = Frame::build(Sequence::new(2).unwrap(), [0; 16], &[]).raw().to_vec();
        let last = bytes.len() - 1;
        bytes[last] = 0x3C;
        assert!(Frame::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_sequence() {
        let mut bytes = Frame::build(Sequence::new(2).unwrap(), [0; 16], &[]).raw().to_vec();
        bytes[1] = b'0';
        let err = Frame::parse(&bytes).unwrap_err();
        assert_eq!(
            err,
            FramingError::InvalidSequence {
                offset: 0,
                byte: b'0'
            }
        );
    }

    #[test]
    fn test_with_body_keeps_extension() {
        let frame = Frame::from_hex(MOVE_FRAME).unwrap();
        let seq = Sequence::new(5).unwrap();
        let rebuilt = frame.with_body(seq, [0x11; BODY_SIZE]);

        assert_eq!(rebuilt.sequence(), seq);
        assert_eq!(rebuilt.body(), &[0x11; BODY_SIZE]);
        assert_eq!(rebuilt.extension(), frame.extension());
    }

    #[test]
    fn test_spaced_hex() {
        assert_eq!(spaced_hex(&[0x0a, 0xff, 0x00]), "0A FF 00");
        assert_eq!(spaced_hex(&[]), "");
    }
}
