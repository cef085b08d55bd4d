//! Ordered session log with JSON export/import for regression replay.
//!
//! Each exported record is self-checking: on import the raw frame is parsed
//! again and decoded with the recorded key, and the result must equal the
//! recorded parameters and text. That only proves the document is
//! consistent with itself, so [`SessionLog::import_json`] marks every key
//! inferred. [`SessionLog::import_verified`] instead re-resolves each frame
//! through an engine and keeps the engine's key.

use std::collections::VecDeque;
use std::io::Write;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::packet_record::{Detection, Direction, PacketRecord};
use crate::codec::{DecodedPacket, FieldCodec};
use crate::error::{Result, WireError};
use crate::protocol::{Frame, BODY_SIZE};
use crate::schedule::{KeyConfidence, KeyContext, KeyMaterial, KeyScheduleEngine};

/// Export format version.
pub const SESSION_LOG_VERSION: u32 = 1;

/// One exported record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub sequence: u8,
    pub function_code: u16,
    pub params: DecodedPacket,
    pub raw_hex: String,
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub key_hex: String,
    pub key_verified_mask: u16,
    pub key_confidence: KeyConfidence,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_extension_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub detection: Detection,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument {
    version: u32,
    records: Vec<SessionEntry>,
}

impl From<&PacketRecord> for SessionEntry {
    fn from(record: &PacketRecord) -> Self {
        Self {
            sequence: record.sequence().get(),
            function_code: record.function_code(),
            params: *record.packet(),
            raw_hex: record.frame().to_hex(),
            direction: record.direction(),
            timestamp: record.timestamp(),
            key_hex: record.key().to_hex(),
            key_verified_mask: record.key().verified_mask(),
            key_confidence: record.confidence().clone(),
            key_extension_hex: hex::encode_upper(record.key().extension()),
            text: record.text().map(str::to_owned),
            detection: record.detection().clone(),
        }
    }
}

impl SessionEntry {
    /// Rebuild the record with its recorded key, checking every recorded
    /// field against the raw frame.
    fn into_record(self, index: usize) -> Result<PacketRecord> {
        let frame = Frame::from_hex(&self.raw_hex)?;
        if frame.sequence().get() != self.sequence {
            return Err(mismatch(index, "sequence differs from raw frame"));
        }
        if self.params.function_code != self.function_code {
            return Err(mismatch(index, "function code differs from params"));
        }

        let compact: String = self.key_hex.split_whitespace().collect();
        let key: [u8; BODY_SIZE] = hex::decode(compact)?
            .try_into()
            .map_err(|_| mismatch(index, "key is not 16 bytes"))?;

        if FieldCodec::decode(frame.body(), &key) != self.params {
            return Err(mismatch(index, "params do not decode from raw frame"));
        }

        let key = KeyMaterial::from_parts(key, self.key_verified_mask, self.key_confidence)
            .with_extension(hex::decode(&self.key_extension_hex)?);
        let record = PacketRecord::new(frame, self.params, key, self.direction, self.timestamp)
            .with_detection(self.detection);
        if record.text() != self.text.as_deref() {
            return Err(mismatch(index, "text does not decode from raw frame"));
        }
        Ok(record)
    }

    /// Like [`SessionEntry::into_record`], then resolve the frame through
    /// `engine` and require the same function code and parameters.
    fn into_verified(self, index: usize, engine: &KeyScheduleEngine, ctx: &KeyContext) -> Result<PacketRecord> {
        let recorded = self.into_record(index)?;
        let resolved = engine.resolve(recorded.frame(), ctx)?;
        if FieldCodec::decode(recorded.frame().body(), resolved.key.bytes()) != *recorded.packet() {
            return Err(mismatch(
                index,
                &format!(
                    "engine reads 0x{:04X} from raw frame, recorded 0x{:04X}",
                    resolved.function_code,
                    recorded.function_code()
                ),
            ));
        }

        let detection = if resolved.alternatives.is_empty() {
            Detection::Unique
        } else {
            Detection::Ambiguous {
                alternatives: resolved.alternatives,
            }
        };
        let record = PacketRecord::new(
            recorded.frame().clone(),
            *recorded.packet(),
            resolved.key,
            recorded.direction(),
            recorded.timestamp(),
        )
        .with_detection(detection);
        if record.text() != recorded.text() {
            return Err(mismatch(index, "engine key reads different text"));
        }
        Ok(record)
    }
}

fn mismatch(index: usize, reason: &str) -> WireError {
    WireError::SessionLog(format!("record {index}: {reason}"))
}

/// Records in capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionLog {
    records: VecDeque<PacketRecord>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: PacketRecord) {
        self.records.push_back(record);
    }

    pub fn records(&self) -> &VecDeque<PacketRecord> {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &PacketRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove and return the oldest record.
    pub fn evict_oldest(&mut self) -> Option<PacketRecord> {
        self.records.pop_front()
    }

    /// Export as a pretty-printed JSON document.
    pub fn export_json(&self) -> Result<String> {
        let doc = SessionDocument {
            version: SESSION_LOG_VERSION,
            records: self.records.iter().map(SessionEntry::from).collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Export to any writer.
    pub fn write_json<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(self.export_json()?.as_bytes())?;
        Ok(())
    }

    /// Import a document produced by [`SessionLog::export_json`].
    ///
    /// Records are checked against their raw frames, but no engine confirms
    /// the keys, so every key comes back inferred and every detection
    /// unchecked.
    pub fn import_json(text: &str) -> Result<Self> {
        let records = parse_document(text)?
            .into_iter()
            .enumerate()
            .map(|(i, entry)| {
                let source = format!("session log import, recorded as {}", entry.key_confidence);
                entry.into_record(i).map(|record| record.demote(source))
            })
            .collect::<Result<VecDeque<_>>>()?;
        tracing::debug!(count = records.len(), "session log imported unverified");
        Ok(Self { records })
    }

    /// Import and re-derive every key through `engine`.
    ///
    /// Fails on the first frame the engine does not read as recorded.
    pub fn import_verified(text: &str, engine: &KeyScheduleEngine, ctx: &KeyContext) -> Result<Self> {
        let records = parse_document(text)?
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.into_verified(i, engine, ctx))
            .collect::<Result<VecDeque<_>>>()?;
        tracing::debug!(count = records.len(), strategy = engine.strategy_name(), "session log imported and verified");
        Ok(Self { records })
    }
}

fn parse_document(text: &str) -> Result<Vec<SessionEntry>> {
    let doc: SessionDocument = serde_json::from_str(text)?;
    if doc.version != SESSION_LOG_VERSION {
        return Err(WireError::SessionLog(format!(
            "unsupported version {} (expected {SESSION_LOG_VERSION})",
            doc.version
        )));
    }
    Ok(doc.records)
}

impl FromIterator<PacketRecord> for SessionLog {
    fn from_iter<I: IntoIterator<Item = PacketRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl Extend<PacketRecord> for SessionLog {
    fn extend<I: IntoIterator<Item = PacketRecord>>(&mut self, iter: I) {
        self.records.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::KeyChoice;
    use crate::schedule::{EngineConfig, FixtureTable, KeyPolicy, ObservedKeySchedule};

    fn engine() -> KeyScheduleEngine {
        KeyScheduleEngine::try_new(
            ObservedKeySchedule::builtin(),
            FixtureTable::builtin().unwrap(),
            EngineConfig::default(),
        )
        .unwrap()
    }

    fn captured_log() -> SessionLog {
        let engine = engine();
        engine
            .fixtures()
            .iter()
            .map(|f| PacketRecord::capture(f.frame().clone(), &engine, &KeyContext::default()).unwrap())
            .collect()
    }

    #[test]
    fn test_verified_import_preserves_records() {
        let log = captured_log();
        let json = log.export_json().unwrap();
        let back = SessionLog::import_verified(&json, &engine(), &KeyContext::default()).unwrap();

        assert_eq!(back, log);
        assert_eq!(back.len(), 7);
    }

    #[test]
    fn test_plain_import_marks_keys_unverified() {
        let log = captured_log();
        let back = SessionLog::import_json(&log.export_json().unwrap()).unwrap();

        assert_eq!(back.len(), 7);
        for (imported, original) in back.iter().zip(log.iter()) {
            assert!(imported.key().is_inferred());
            assert_eq!(imported.detection(), &Detection::Unchecked);
            assert_eq!(imported.packet(), original.packet());
            assert_eq!(imported.text(), original.text());
            assert_eq!(imported.key().bytes(), original.key().bytes());
        }
        assert_eq!(
            back.records()[0].confidence(),
            &KeyConfidence::Inferred {
                source: "session log import, recorded as verified".to_string()
            }
        );
    }

    #[test]
    fn test_verified_import_rejects_forged_key() {
        // Self-consistent entry whose key and params no engine would produce.
        let mut log = captured_log();
        let first = log.records()[0].clone();
        let forged_key = KeyMaterial::observed([0x00; BODY_SIZE], crate::schedule::ALL_VERIFIED);
        let forged_packet = FieldCodec::decode(first.frame().body(), forged_key.bytes());
        log.push(PacketRecord::new(
            first.frame().clone(),
            forged_packet,
            forged_key,
            Direction::Captured,
            first.timestamp(),
        ));
        let json = log.export_json().unwrap();

        assert!(SessionLog::import_json(&json).is_ok());
        let err = SessionLog::import_verified(&json, &engine(), &KeyContext::default()).unwrap_err();
        assert!(err.to_string().contains("record 7: engine reads 0x0BC5"), "{err}");
    }

    #[test]
    fn test_import_rejects_tampered_text() {
        let log = captured_log();
        let json = log.export_json().unwrap().replacen("修复神水", "修复神木", 1);

        let err = SessionLog::import_json(&json).unwrap_err();
        assert!(err.to_string().contains("text does not decode"), "{err}");
    }

    #[test]
    fn test_verified_import_under_other_policy() {
        let log = captured_log();
        let lenient = KeyScheduleEngine::try_new(
            ObservedKeySchedule::builtin(),
            FixtureTable::builtin().unwrap(),
            EngineConfig::default().with_policy(KeyPolicy::Lenient),
        )
        .unwrap();
        let back = SessionLog::import_verified(&log.export_json().unwrap(), &lenient, &KeyContext::default()).unwrap();

        let packets: Vec<_> = back.iter().map(|r| *r.packet()).collect();
        let expected: Vec<_> = log.iter().map(|r| *r.packet()).collect();
        assert_eq!(packets, expected);
    }

    #[test]
    fn test_export_is_human_inspectable() {
        let log = captured_log();
        let json = log.export_json().unwrap();

        assert!(json.contains(r#""raw_hex": "23 34 3C 3C"#));
        assert!(json.contains(r#""direction": "captured""#));
        assert!(json.contains(r#""kind": "partial""#));
        assert!(json.contains(r#""param3": 103"#));
    }

    #[test]
    fn test_import_rejects_tampered_params() {
        let log = captured_log();
        let json = log.export_json().unwrap().replacen(r#""param3": 103"#, r#""param3": 104"#, 1);

        let err = SessionLog::import_json(&json).unwrap_err();
        assert!(err.to_string().contains("record 0: params do not decode"));
    }

    #[test]
    fn test_import_rejects_unknown_version() {
        let err = SessionLog::import_json(r#"{"version":9,"records":[]}"#).unwrap_err();
        assert!(matches!(err, WireError::SessionLog(_)));
    }

    #[test]
    fn test_outgoing_records_round_trip_through_export() {
        let mut log = captured_log();
        let first = log.records()[0].clone();
        let edited = first.edit(crate::codec::Field::Param3, 120).unwrap();
        log.push(first.reencode(&edited, KeyChoice::Recorded).unwrap());

        let back = SessionLog::import_json(&log.export_json().unwrap()).unwrap();
        assert_eq!(back.records()[7].direction(), Direction::Outgoing);
        assert_eq!(back.records()[7].packet().param3, 120);
    }

    #[test]
    fn test_evict_oldest() {
        let mut log = captured_log();
        let oldest = log.evict_oldest().unwrap();
        assert_eq!(oldest.function_code(), 0x0BC5);
        assert_eq!(log.len(), 6);
        assert_eq!(log.records()[0].function_code(), 0x0BC3);

        let mut empty = SessionLog::new();
        assert!(empty.evict_oldest().is_none());
    }

    #[test]
    fn test_write_json_to_buffer() {
        let log = captured_log();
        let mut buf = Vec::new();
        log.write_json(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), log.export_json().unwrap());
    }
}
