//! Key material with per-byte confidence.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{spaced_hex, BODY_SIZE};

/// Byte filler for positions no observation covers.
///
/// Zero bytes encrypt to `0x3C` across every capture seen so far.
pub const FILLER_KEY_BYTE: u8 = 0x3C;

/// Mask with every body position verified.
pub const ALL_VERIFIED: u16 = u16::MAX;

/// How far a whole key can be trusted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyConfidence {
    /// Every byte confirmed by a fixture.
    Verified,
    /// Observed pair, some bytes confirmed.
    Partial {
        /// Number of confirmed bytes.
        verified: u8,
    },
    /// No byte confirmed for this pair; best effort.
    Inferred {
        /// Where the bytes were borrowed from.
        source: String,
    },
}

impl fmt::Display for KeyConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verified => f.write_str("verified"),
            Self::Partial { verified } => write!(f, "partial ({verified}/{BODY_SIZE} bytes)"),
            Self::Inferred { source } => write!(f, "inferred from {source}"),
        }
    }
}

/// Confidence of a single key byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteConfidence {
    Verified,
    Inferred,
}

/// Extra key-schedule input beyond sequence and function code.
///
/// Captures show keys varying between frames with the same sequence and
/// function code, so the schedule takes an open-ended context. Strategies
/// that do not use a slot ignore it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyContext {
    /// Per-connection rolling counter, when the transport can supply one.
    pub rolling_counter: Option<u32>,
}

impl KeyContext {
    /// Context carrying a rolling counter.
    pub fn with_rolling_counter(counter: u32) -> Self {
        Self {
            rolling_counter: Some(counter),
        }
    }
}

/// A 16-byte body key and which of its bytes are confirmed.
///
/// Extension key bytes run on from the body key. Only the known prefix is
/// stored; past it every extension byte is keyed with [`FILLER_KEY_BYTE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyMaterial {
    bytes: [u8; BODY_SIZE],
    verified: u16,
    confidence: KeyConfidence,
    extension: Vec<u8>,
}

impl KeyMaterial {
    /// Key for an observed pair. Confidence follows the verified mask.
    pub fn observed(bytes: [u8; BODY_SIZE], verified: u16) -> Self {
        let confidence = match verified.count_ones() {
            16 => KeyConfidence::Verified,
            n => KeyConfidence::Partial { verified: n as u8 },
        };
        Self {
            bytes,
            verified,
            confidence,
            extension: Vec::new(),
        }
    }

    /// Best-effort key; no byte counts as verified.
    pub fn inferred(bytes: [u8; BODY_SIZE], source: impl Into<String>) -> Self {
        Self {
            bytes,
            verified: 0,
            confidence: KeyConfidence::Inferred {
                source: source.into(),
            },
            extension: Vec::new(),
        }
    }

    /// Reassemble a key from exported parts.
    pub fn from_parts(bytes: [u8; BODY_SIZE], verified: u16, confidence: KeyConfidence) -> Self {
        Self {
            bytes,
            verified,
            confidence,
            extension: Vec::new(),
        }
    }

    /// Attach the known extension key prefix.
    pub fn with_extension(mut self, extension: Vec<u8>) -> Self {
        self.extension = extension;
        self
    }

    /// Same bytes, demoted to inferred.
    pub fn into_inferred(self, source: impl Into<String>) -> Self {
        Self {
            verified: 0,
            confidence: KeyConfidence::Inferred {
                source: source.into(),
            },
            ..self
        }
    }

    /// Key bytes.
    #[inline]
    pub fn bytes(&self) -> &[u8; BODY_SIZE] {
        &self.bytes
    }

    /// Bit `i` set when byte `i` is confirmed.
    #[inline]
    pub fn verified_mask(&self) -> u16 {
        self.verified
    }

    /// Number of confirmed bytes.
    #[inline]
    pub fn verified_count(&self) -> u32 {
        self.verified.count_ones()
    }

    /// Whole-key confidence.
    #[inline]
    pub fn confidence(&self) -> &KeyConfidence {
        &self.confidence
    }

    /// Confidence of byte `position`.
    pub fn byte_confidence(&self, position: usize) -> ByteConfidence {
        if position < BODY_SIZE && self.verified & (1 << position) != 0 {
            ByteConfidence::Verified
        } else {
            ByteConfidence::Inferred
        }
    }

    /// True when no byte of this key is confirmed for its pair.
    pub fn is_inferred(&self) -> bool {
        matches!(self.confidence, KeyConfidence::Inferred { .. })
    }

    /// Known extension key bytes.
    #[inline]
    pub fn extension(&self) -> &[u8] {
        &self.extension
    }

    /// Key byte for extension offset `position`.
    #[inline]
    pub fn extension_byte(&self, position: usize) -> u8 {
        self.extension.get(position).copied().unwrap_or(FILLER_KEY_BYTE)
    }

    /// Upper-case spaced hex of the key bytes.
    pub fn to_hex(&self) -> String {
        spaced_hex(&self.bytes)
    }
}

/// Build a verified mask from known positions.
pub fn mask_of(known: &[Option<u8>; BODY_SIZE]) -> u16 {
    known
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_some())
        .fold(0, |mask, (i, _)| mask | (1 << i))
}
