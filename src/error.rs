//! Error types for mirwire.
//!
//! Every frame-local failure has its own type so the pipeline can contain it
//! to that frame. Only [`ConsistencyError`] stops decoding altogether.

use thiserror::Error;

use crate::codec::Field;
use crate::protocol::Sequence;

/// Main error type for all mirwire operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// Malformed or unterminated frame.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// No usable key for a (sequence, function code) pair under the active policy.
    #[error(transparent)]
    UnknownKey(#[from] UnknownKeyError),

    /// Function-code detection is ambiguous or contradicts the encoded packet.
    #[error(transparent)]
    Detection(#[from] DetectionError),

    /// The key schedule failed fixture re-validation.
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    /// Body or field shape rejected by the field codec.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Fixture corpus could not be loaded.
    #[error("fixture error: {0}")]
    Fixture(#[from] FixtureError),

    /// Harness baseline gate failed.
    #[error(transparent)]
    Harness(#[from] HarnessError),

    /// I/O error while reading or writing exported data.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (fixtures, session logs, config).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Hexadecimal decoding error.
    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// An imported session record does not agree with its own raw frame.
    #[error("session log error: {0}")]
    SessionLog(String),
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;

/// Malformed or unterminated frame in the byte stream.
///
/// Offsets are absolute positions in the scanned stream. Discarded bytes are
/// carried so the incident can be turned into a fixture later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Byte after the header marker is not an ASCII digit 1..9.
    #[error("invalid sequence byte 0x{byte:02X} at offset {offset}")]
    InvalidSequence {
        /// Stream offset of the header marker.
        offset: u64,
        /// The offending byte.
        byte: u8,
    },

    /// No tail marker within the configured maximum frame length.
    #[error("no tail marker within {max_len} bytes at offset {offset} ({} bytes discarded)", discarded.len())]
    Unterminated {
        /// Stream offset of the header marker.
        offset: u64,
        /// Configured maximum frame length.
        max_len: usize,
        /// Bytes dropped during resynchronization.
        discarded: Vec<u8>,
    },

    /// A new header marker appeared before the tail marker.
    #[error("frame at offset {offset} interrupted by header marker ({} bytes discarded)", discarded.len())]
    Interrupted {
        /// Stream offset of the abandoned header marker.
        offset: u64,
        /// Bytes dropped during resynchronization.
        discarded: Vec<u8>,
    },

    /// Stream closed while a frame was still open.
    #[error("stream closed mid-frame at offset {offset} ({} bytes discarded)", discarded.len())]
    TruncatedAtClose {
        /// Stream offset of the header marker.
        offset: u64,
        /// The partial frame.
        discarded: Vec<u8>,
    },

    /// A standalone buffer is not exactly one well-formed frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl FramingError {
    /// Raw bytes dropped with this incident, if any.
    pub fn discarded(&self) -> &[u8] {
        match self {
            Self::Unterminated { discarded, .. }
            | Self::Interrupted { discarded, .. }
            | Self::TruncatedAtClose { discarded, .. } => discarded,
            Self::InvalidSequence { .. } | Self::Malformed(_) => &[],
        }
    }
}

/// No verified key derivation for a frame under strict policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no verified key for sequence {sequence}, function code {}", display_code(*function_code))]
pub struct UnknownKeyError {
    /// Sequence identifier of the frame.
    pub sequence: Sequence,
    /// Requested function code; `None` when detection found no candidate.
    pub function_code: Option<u16>,
}

fn display_code(code: Option<u16>) -> String {
    match code {
        Some(code) => format!("0x{code:04X}"),
        None => "undetected".to_string(),
    }
}

fn code_list(codes: &[u16]) -> String {
    codes
        .iter()
        .map(|code| format!("0x{code:04X}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Detection cannot stand behind a decode.
///
/// Sibling function codes have keys that differ at body bytes 8..10 by the
/// XOR of the two codes, so several candidates can echo themselves back
/// from the same frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    /// Several candidates decode the frame with the same plausibility.
    #[error("sequence {sequence}: frame decodes equally well as {}", code_list(candidates))]
    Ambiguous {
        /// Sequence identifier of the frame.
        sequence: Sequence,
        /// Tied function codes, best key first.
        candidates: Vec<u16>,
    },

    /// A frame built for one packet is detected as something else.
    #[error("sequence {sequence}: frame built as 0x{requested:04X} is read back as {}", display_code(*detected))]
    Mismatch {
        /// Sequence identifier of the frame.
        sequence: Sequence,
        /// Function code the frame was built for.
        requested: u16,
        /// Function code detection settled on, if any.
        detected: Option<u16>,
    },
}

/// Fixture re-validation failed when building a key schedule engine.
///
/// Fatal for the engine instance: once recorded, every decode request on
/// that instance returns this error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    /// Derived key differs from a fixture at a verified position.
    #[error(
        "fixture '{label}' (seq {sequence}, fc 0x{function_code:04X}) diverges at byte {position}: expected 0x{expected:02X}, derived 0x{derived:02X}"
    )]
    Divergence {
        /// Fixture label.
        label: String,
        /// Fixture sequence.
        sequence: Sequence,
        /// Fixture function code.
        function_code: u16,
        /// Key offset of the first mismatch; extension bytes follow the body.
        position: usize,
        /// Key byte implied by the fixture.
        expected: u8,
        /// Key byte produced by the strategy.
        derived: u8,
    },

    /// Strategy produced no key at all for a fixture pair.
    #[error("strategy '{strategy}' cannot derive fixture '{label}' (seq {sequence}, fc 0x{function_code:04X})")]
    Underivable {
        /// Strategy name.
        strategy: String,
        /// Fixture label.
        label: String,
        /// Fixture sequence.
        sequence: Sequence,
        /// Fixture function code.
        function_code: u16,
    },

    /// Not enough fixtures to validate against.
    #[error("need at least {required} fixtures across {required_sequences} sequences, got {found} across {sequences}")]
    InsufficientFixtures {
        /// Fixtures supplied.
        found: usize,
        /// Distinct sequences among them.
        sequences: usize,
        /// Minimum fixture count.
        required: usize,
        /// Minimum distinct sequences.
        required_sequences: usize,
    },
}

/// Field codec rejected its input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Body was not exactly 16 bytes.
    #[error("body length {actual}, expected {expected}")]
    BodyLength {
        /// Required length.
        expected: usize,
        /// Supplied length.
        actual: usize,
    },

    /// Edited value does not fit the field width.
    #[error("value {value} does not fit {field} (max {max})")]
    FieldRange {
        /// Target field.
        field: Field,
        /// Requested value.
        value: u64,
        /// Largest value the field holds.
        max: u64,
    },

    /// Text has characters GBK cannot represent.
    #[error("text {0:?} is not representable in GBK")]
    TextEncoding(String),

    /// Encoded text runs past the extension key bytes that are known.
    #[error("text needs {len} extension bytes, key covers {known}")]
    TextTooLong {
        /// GBK length of the text.
        len: usize,
        /// Known extension key bytes.
        known: usize,
    },

    /// Plaintext command line could not be parsed.
    #[error("plaintext: {0}")]
    Plaintext(String),
}

/// Fixture corpus entry is unusable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FixtureError {
    /// Hex text could not be parsed.
    #[error("fixture '{label}': bad hex: {reason}")]
    Hex {
        /// Fixture label.
        label: String,
        /// Parser message.
        reason: String,
    },

    /// Encrypted frame is not a single well-formed frame.
    #[error("fixture '{label}': {source}")]
    Frame {
        /// Fixture label.
        label: String,
        /// Framing failure.
        source: FramingError,
    },

    /// Declared sequence differs from the one carried by the frame.
    #[error("fixture '{label}': declared sequence {declared}, frame carries {framed}")]
    SequenceMismatch {
        /// Fixture label.
        label: String,
        /// Declared sequence.
        declared: u8,
        /// Sequence in the frame.
        framed: Sequence,
    },

    /// Expected body bytes 8..10 are not both known.
    #[error("fixture '{label}': function code bytes 8..10 must be known")]
    FunctionCodeUnknown {
        /// Fixture label.
        label: String,
    },

    /// Known extension text is unusable.
    #[error("fixture '{label}': text {reason}")]
    Text {
        /// Fixture label.
        label: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Declared function code differs from the expected body bytes 8..10.
    #[error("fixture '{label}': declared function code 0x{declared:04X}, expected body says 0x{body:04X}")]
    FunctionCodeMismatch {
        /// Fixture label.
        label: String,
        /// Declared function code.
        declared: u16,
        /// Function code in the expected body.
        body: u16,
    },
}

/// Validation harness gate failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HarnessError {
    /// Candidate accuracy fell below the accepted baseline.
    #[error("accuracy {accuracy:.2}% regressed below baseline {baseline:.2}%")]
    Regression {
        /// Candidate accuracy in percent.
        accuracy: f64,
        /// Accepted baseline in percent.
        baseline: f64,
    },

    /// Corpus had no frames to score.
    #[error("empty fixture corpus")]
    EmptyCorpus,
}
