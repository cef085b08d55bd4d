//! Verified (encrypted frame, decrypted body) pairs.
//!
//! Corpus JSON:
//!
//! ```json
//! { "fixtures": [ {
//!     "label": "move",
//!     "sequence": 4,
//!     "function_code": 3013,
//!     "frame": "23 34 3C ... 21",
//!     "expected": "00 00 00 00 00 00 00 00 C5 0B 67 00 03 00 56 00"
//! } ] }
//! ```
//!
//! `??` in `expected` marks a byte nobody has confirmed yet. An optional
//! `"text"` gives the GBK text the extension is known to start with; it
//! pins the extension key over those bytes.

use serde::{Deserialize, Serialize};

use crate::codec::encode_gbk;
use crate::error::{FixtureError, Result};
use crate::protocol::{Frame, Sequence, BODY_SIZE};

const BUILTIN_CORPUS: &str = include_str!("../../fixtures/corpus.json");

/// One verified capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixture {
    label: String,
    frame: Frame,
    expected: [Option<u8>; BODY_SIZE],
    function_code: u16,
    text: Option<String>,
    text_bytes: Vec<u8>,
}

impl Fixture {
    /// Build a fixture. The function code is read from expected bytes 8..10,
    /// which must both be known.
    pub fn new(
        label: impl Into<String>,
        frame: Frame,
        expected: [Option<u8>; BODY_SIZE],
    ) -> std::result::Result<Self, FixtureError> {
        let label = label.into();
        let function_code = match (expected[8], expected[9]) {
            (Some(lo), Some(hi)) => u16::from_le_bytes([lo, hi]),
            _ => return Err(FixtureError::FunctionCodeUnknown { label }),
        };
        Ok(Self {
            label,
            frame,
            expected,
            function_code,
            text: None,
            text_bytes: Vec::new(),
        })
    }

    /// Attach the text the extension is known to start with.
    pub fn with_text(mut self, text: impl Into<String>) -> std::result::Result<Self, FixtureError> {
        let text = text.into();
        let bytes = encode_gbk(&text).map_err(|e| FixtureError::Text {
            label: self.label.clone(),
            reason: e.to_string(),
        })?;
        if bytes.len() > self.frame.extension().len() {
            return Err(FixtureError::Text {
                label: self.label,
                reason: format!(
                    "{text:?} needs {} bytes, extension has {}",
                    bytes.len(),
                    self.frame.extension().len()
                ),
            });
        }
        self.text = Some(text);
        self.text_bytes = bytes;
        Ok(self)
    }

    /// Fixture label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Captured frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Sequence carried by the frame.
    pub fn sequence(&self) -> Sequence {
        self.frame.sequence()
    }

    /// Function code of the decrypted body.
    pub fn function_code(&self) -> u16 {
        self.function_code
    }

    /// Expected decrypted body; `None` where unconfirmed.
    pub fn expected(&self) -> &[Option<u8>; BODY_SIZE] {
        &self.expected
    }

    /// Key implied by the capture (encrypted XOR expected) at known positions.
    pub fn key(&self) -> [Option<u8>; BODY_SIZE] {
        let body = self.frame.body();
        std::array::from_fn(|i| self.expected[i].map(|plain| plain ^ body[i]))
    }

    /// Known extension text.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Extension key implied by the known text; empty without one.
    pub fn extension_key(&self) -> Vec<u8> {
        self.frame
            .extension()
            .iter()
            .zip(&self.text_bytes)
            .map(|(enc, plain)| enc ^ plain)
            .collect()
    }

    /// Number of confirmed body bytes.
    pub fn known_count(&self) -> usize {
        self.expected.iter().filter(|b| b.is_some()).count()
    }

    fn from_entry(entry: FixtureEntry) -> std::result::Result<Self, FixtureError> {
        let label = entry.label;

        let frame = decode_hex(&label, &entry.frame).and_then(|bytes| {
            Frame::parse(&bytes).map_err(|source| FixtureError::Frame {
                label: label.clone(),
                source,
            })
        })?;

        let expected = parse_masked_hex(&entry.expected).map_err(|reason| FixtureError::Hex {
            label: label.clone(),
            reason,
        })?;
        let expected: [Option<u8>; BODY_SIZE] =
            expected.try_into().map_err(|v: Vec<Option<u8>>| FixtureError::Hex {
                label: label.clone(),
                reason: format!("expected body has {} bytes, need {BODY_SIZE}", v.len()),
            })?;

        if frame.sequence().get() != entry.sequence {
            return Err(FixtureError::SequenceMismatch {
                label,
                declared: entry.sequence,
                framed: frame.sequence(),
            });
        }

        let mut fixture = Self::new(label, frame, expected)?;
        if let Some(text) = entry.text {
            fixture = fixture.with_text(text)?;
        }
        if fixture.function_code != entry.function_code {
            return Err(FixtureError::FunctionCodeMismatch {
                label: fixture.label,
                declared: entry.function_code,
                body: fixture.function_code,
            });
        }
        Ok(fixture)
    }

    fn to_entry(&self) -> FixtureEntry {
        FixtureEntry {
            label: self.label.clone(),
            sequence: self.sequence().get(),
            function_code: self.function_code,
            frame: self.frame.to_hex(),
            expected: masked_hex(&self.expected),
            text: self.text.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FixtureEntry {
    label: String,
    sequence: u8,
    function_code: u16,
    frame: String,
    expected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CorpusFile {
    fixtures: Vec<FixtureEntry>,
}

/// Ordered set of fixtures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixtureTable {
    fixtures: Vec<Fixture>,
}

impl FixtureTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bundled corpus of verified captures.
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CORPUS)
    }

    /// Parse and check a corpus document.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: CorpusFile = serde_json::from_str(text)?;
        let fixtures = file
            .fixtures
            .into_iter()
            .map(Fixture::from_entry)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        tracing::debug!(count = fixtures.len(), "fixture corpus loaded");
        Ok(Self { fixtures })
    }

    /// Render as a corpus document.
    pub fn to_json(&self) -> Result<String> {
        let file = CorpusFile {
            fixtures: self.fixtures.iter().map(Fixture::to_entry).collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Append a fixture.
    pub fn push(&mut self, fixture: Fixture) {
        self.fixtures.push(fixture);
    }

    /// Builder form of [`FixtureTable::push`].
    pub fn with(mut self, fixture: Fixture) -> Self {
        self.push(fixture);
        self
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Fixture> {
        self.fixtures.iter()
    }

    /// Fixture by label.
    pub fn get(&self, label: &str) -> Option<&Fixture> {
        self.fixtures.iter().find(|f| f.label == label)
    }

    /// Number of fixtures.
    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    /// Number of distinct sequences covered.
    pub fn distinct_sequences(&self) -> usize {
        let mut seen: Vec<Sequence> = self.fixtures.iter().map(Fixture::sequence).collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }

    /// Fixture closest to `sequence`: same sequence first, then by cyclic
    /// distance. Ties keep table order.
    pub fn nearest(&self, sequence: Sequence) -> Option<&Fixture> {
        self.fixtures
            .iter()
            .min_by_key(|f| sequence.cyclic_distance(f.sequence()))
    }
}

impl<'a> IntoIterator for &'a FixtureTable {
    type Item = &'a Fixture;
    type IntoIter = std::slice::Iter<'a, Fixture>;

    fn into_iter(self) -> Self::IntoIter {
        self.fixtures.iter()
    }
}

fn decode_hex(label: &str, text: &str) -> std::result::Result<Vec<u8>, FixtureError> {
    let compact: String = text.split_whitespace().collect();
    hex::decode(compact).map_err(|e| FixtureError::Hex {
        label: label.to_string(),
        reason: e.to_string(),
    })
}

/// Parse hex where `??` stands for an unknown byte. Whitespace is ignored.
pub fn parse_masked_hex(text: &str) -> std::result::Result<Vec<Option<u8>>, String> {
    let compact: String = text.split_whitespace().collect();
    if compact.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", compact.len()));
    }
    compact
        .as_bytes()
        .chunks(2)
        .map(|pair| match pair {
            b"??" => Ok(None),
            _ => hex::decode(pair)
                .map(|byte| Some(byte[0]))
                .map_err(|e| e.to_string()),
        })
        .collect()
}

/// Render bytes as spaced upper-case hex with `??` for unknown bytes.
pub fn masked_hex(bytes: &[Option<u8>]) -> String {
    bytes
        .iter()
        .map(|b| match b {
            Some(b) => format!("{b:02X}"),
            None => "??".to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
