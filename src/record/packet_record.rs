//! Packet record: one frame with its decoded view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{DecodedPacket, ExtensionCodec, Field, FieldCodec, Plaintext};
use crate::error::{CodecError, DetectionError, Result};
use crate::protocol::{Frame, Sequence};
use crate::schedule::{KeyConfidence, KeyContext, KeyMaterial, KeyPolicy, KeyScheduleEngine};

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Seen on the wire.
    Captured,
    /// Built locally for sending.
    Outgoing,
}

/// How a receiver detecting function codes reads this record's frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Detection {
    /// Only the record's own function code reads the frame this way.
    Unique,
    /// Other codes read the frame just as plausibly.
    Ambiguous { alternatives: Vec<u16> },
    /// The frame reads back as something else, or as nothing.
    Mismatch { detected: Option<u16> },
    /// Never read back: built with a recorded key or assembled by hand.
    #[default]
    Unchecked,
}

/// Key to use when re-encoding an edited packet.
#[derive(Debug, Clone, Copy)]
pub enum KeyChoice<'a> {
    /// The key that decoded the original frame.
    Recorded,
    /// Ask the engine again, optionally under a new sequence. The new frame
    /// is read back through the same engine.
    Rederive {
        engine: &'a KeyScheduleEngine,
        sequence: Option<Sequence>,
        ctx: KeyContext,
    },
}

/// A frame, its decoded fields, the key used, and capture metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    frame: Frame,
    packet: DecodedPacket,
    text: Option<String>,
    key: KeyMaterial,
    direction: Direction,
    timestamp: DateTime<Utc>,
    detection: Detection,
}

impl PacketRecord {
    /// Assemble a record from its parts. The extension text is decrypted
    /// with the key; detection starts out [`Detection::Unchecked`].
    pub fn new(
        frame: Frame,
        packet: DecodedPacket,
        key: KeyMaterial,
        direction: Direction,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let text = ExtensionCodec::decode_text(frame.extension(), key.extension());
        Self {
            frame,
            packet,
            text,
            key,
            direction,
            timestamp,
            detection: Detection::Unchecked,
        }
    }

    pub fn with_detection(mut self, detection: Detection) -> Self {
        self.detection = detection;
        self
    }

    /// Mark the key as unconfirmed by any engine.
    pub(super) fn demote(mut self, source: impl Into<String>) -> Self {
        self.key = self.key.into_inferred(source);
        self.detection = Detection::Unchecked;
        self
    }

    /// Resolve the key for a captured frame and decode it, stamped now.
    pub fn capture(frame: Frame, engine: &KeyScheduleEngine, ctx: &KeyContext) -> Result<Self> {
        let resolved = engine.resolve(&frame, ctx)?;
        let packet = FieldCodec::decode(frame.body(), resolved.key.bytes());
        let detection = if resolved.alternatives.is_empty() {
            Detection::Unique
        } else {
            Detection::Ambiguous {
                alternatives: resolved.alternatives,
            }
        };
        Ok(Self::new(frame, packet, resolved.key, Direction::Captured, Utc::now()).with_detection(detection))
    }

    /// Build an outgoing frame from scratch, without extension text.
    pub fn craft(
        packet: DecodedPacket,
        sequence: Sequence,
        engine: &KeyScheduleEngine,
        ctx: &KeyContext,
    ) -> Result<Self> {
        Self::craft_with_text(packet, None, sequence, engine, ctx)
    }

    /// Build an outgoing frame from a command line.
    pub fn from_plaintext(
        line: &Plaintext,
        sequence: Sequence,
        engine: &KeyScheduleEngine,
        ctx: &KeyContext,
    ) -> Result<Self> {
        Self::craft_with_text(line.packet, line.text.as_deref(), sequence, engine, ctx)
    }

    /// Build an outgoing frame from scratch.
    ///
    /// The key is derived for `sequence` and the packet's function code.
    /// The text is encrypted into the extension, which is at least six
    /// bytes long. The finished frame is then read back through the engine;
    /// see [`PacketRecord::confirm`].
    pub fn craft_with_text(
        packet: DecodedPacket,
        text: Option<&str>,
        sequence: Sequence,
        engine: &KeyScheduleEngine,
        ctx: &KeyContext,
    ) -> Result<Self> {
        let key = engine.schedule(sequence, packet.function_code, ctx)?;
        let body = FieldCodec::encode(&packet, key.bytes());
        let extension = ExtensionCodec::encode_text(text, key.extension())?;
        let frame = Frame::build(sequence, body, &extension);
        let record = Self::new(frame, packet, key, Direction::Outgoing, Utc::now()).carrying(text)?;
        record.confirm(engine, ctx)
    }

    /// Decoded packet with one field changed. The record itself is untouched.
    pub fn edit(&self, field: Field, value: u32) -> Result<DecodedPacket> {
        Ok(self.packet.with_field(field, value)?)
    }

    /// Encode `packet` into a new outgoing record, keeping the extension
    /// plaintext.
    pub fn reencode(&self, packet: &DecodedPacket, choice: KeyChoice<'_>) -> Result<Self> {
        let plain = ExtensionCodec::apply(self.frame.extension(), self.key.extension());
        self.rebuild(packet, choice, |key| Ok(ExtensionCodec::apply(&plain, key.extension())))
    }

    /// Encode `packet` into a new outgoing record with new extension text.
    pub fn reencode_with_text(&self, packet: &DecodedPacket, text: Option<&str>, choice: KeyChoice<'_>) -> Result<Self> {
        self.rebuild(packet, choice, |key| Ok(ExtensionCodec::encode_text(text, key.extension())?))?
            .carrying(text)
    }

    fn rebuild<F>(&self, packet: &DecodedPacket, choice: KeyChoice<'_>, extension: F) -> Result<Self>
    where
        F: FnOnce(&KeyMaterial) -> Result<Vec<u8>>,
    {
        let (sequence, key, engine) = match choice {
            KeyChoice::Recorded => (self.frame.sequence(), self.key.clone(), None),
            KeyChoice::Rederive {
                engine,
                sequence,
                ctx,
            } => {
                let sequence = sequence.unwrap_or(self.frame.sequence());
                let key = engine.schedule(sequence, packet.function_code, &ctx)?;
                (sequence, key, Some((engine, ctx)))
            }
        };
        let body = FieldCodec::encode(packet, key.bytes());
        let frame = Frame::build(sequence, body, &extension(&key)?);
        let record = Self::new(frame, *packet, key, Direction::Outgoing, Utc::now());
        match engine {
            Some((engine, ctx)) => record.confirm(engine, &ctx),
            None => Ok(record),
        }
    }

    /// Fail unless the extension decrypts back to `text`.
    fn carrying(self, text: Option<&str>) -> Result<Self> {
        let wanted = text.filter(|t| !t.is_empty());
        if self.text.as_deref() != wanted {
            return Err(CodecError::TextEncoding(format!(
                "{wanted:?} reads back as {:?}",
                self.text
            ))
            .into());
        }
        Ok(self)
    }

    /// Read the frame back through `engine` the way a receiver would.
    ///
    /// A strict engine refuses a frame that reads back ambiguously or as a
    /// different packet. A lenient engine logs it and records the outcome
    /// in [`PacketRecord::detection`].
    pub fn confirm(mut self, engine: &KeyScheduleEngine, ctx: &KeyContext) -> Result<Self> {
        let strict = engine.policy() == KeyPolicy::Strict;
        let sequence = self.sequence();
        let requested = self.packet.function_code;

        let detection = match engine.resolve(&self.frame, ctx) {
            Ok(resolved) => {
                let packet = FieldCodec::decode(self.frame.body(), resolved.key.bytes());
                let text = ExtensionCodec::decode_text(self.frame.extension(), resolved.key.extension());
                if packet != self.packet || text != self.text {
                    Detection::Mismatch {
                        detected: Some(resolved.function_code),
                    }
                } else if resolved.alternatives.is_empty() {
                    Detection::Unique
                } else {
                    Detection::Ambiguous {
                        alternatives: resolved.alternatives,
                    }
                }
            }
            Err(err) if strict => return Err(err),
            Err(_) => Detection::Mismatch { detected: None },
        };

        match &detection {
            Detection::Unique => {}
            Detection::Mismatch { detected } if strict => {
                return Err(DetectionError::Mismatch {
                    sequence,
                    requested,
                    detected: *detected,
                }
                .into());
            }
            other => tracing::warn!(
                %sequence,
                function_code = format_args!("0x{requested:04X}"),
                detection = ?other,
                "built frame does not read back uniquely"
            ),
        }
        self.detection = detection;
        Ok(self)
    }

    /// Wire frame.
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Decoded fields.
    pub fn packet(&self) -> &DecodedPacket {
        &self.packet
    }

    /// Extension text, when the key covers it and it decodes cleanly.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Packet and text as a command line.
    pub fn plaintext(&self) -> Plaintext {
        Plaintext::new(self.packet, self.text.clone())
    }

    /// Key that encodes/decodes this frame.
    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    pub fn confidence(&self) -> &KeyConfidence {
        self.key.confidence()
    }

    pub fn detection(&self) -> &Detection {
        &self.detection
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn sequence(&self) -> Sequence {
        self.frame.sequence()
    }

    pub fn function_code(&self) -> u16 {
        self.packet.function_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WireError;
    use crate::protocol::CRAFTED_EXTENSION;
    use crate::schedule::{EngineConfig, FixtureTable, ObservedKeySchedule, MOVE, USE_ITEM};

    fn engine(policy: KeyPolicy) -> KeyScheduleEngine {
        KeyScheduleEngine::try_new(
            ObservedKeySchedule::builtin(),
            FixtureTable::builtin().unwrap(),
            EngineConfig::default().with_policy(policy),
        )
        .unwrap()
    }

    fn move_record(engine: &KeyScheduleEngine) -> PacketRecord {
        let fixtures = FixtureTable::builtin().unwrap();
        let frame = fixtures.get("move").unwrap().frame().clone();
        PacketRecord::capture(frame, engine, &KeyContext::default()).unwrap()
    }

    #[test]
    fn test_capture_decodes_move() {
        let engine = engine(KeyPolicy::Strict);
        let record = move_record(&engine);

        assert_eq!(record.direction(), Direction::Captured);
        assert_eq!(record.function_code(), MOVE);
        assert_eq!(record.packet().param3, 103);
        assert_eq!(record.packet().param4, 3);
        assert_eq!(record.packet().param5, 86);
        assert_eq!(record.confidence(), &KeyConfidence::Verified);
    }

    #[test]
    fn test_edit_leaves_record_unchanged() {
        let engine = engine(KeyPolicy::Strict);
        let record = move_record(&engine);

        let edited = record.edit(Field::Param3, 110).unwrap();
        assert_eq!(edited.param3, 110);
        assert_eq!(record.packet().param3, 103);

        let err = record.edit(Field::Param3, 70_000).unwrap_err();
        assert!(matches!(err, WireError::Codec(_)));
    }

    #[test]
    fn test_reencode_with_recorded_key() {
        let engine = engine(KeyPolicy::Strict);
        let record = move_record(&engine);
        let edited = record.edit(Field::Param4, 7).unwrap();

        let outgoing = record.reencode(&edited, KeyChoice::Recorded).unwrap();

        assert_eq!(outgoing.direction(), Direction::Outgoing);
        assert_eq!(outgoing.sequence(), record.sequence());
        assert_eq!(outgoing.frame().extension(), record.frame().extension());
        assert_eq!(
            FieldCodec::decode(outgoing.frame().body(), record.key().bytes()),
            edited
        );
    }

    #[test]
    fn test_reencode_unchanged_reproduces_frame() {
        let engine = engine(KeyPolicy::Strict);
        let record = move_record(&engine);

        let outgoing = record.reencode(record.packet(), KeyChoice::Recorded).unwrap();
        assert_eq!(outgoing.frame().raw(), record.frame().raw());
    }

    #[test]
    fn test_reencode_rederive_under_new_sequence() {
        let engine = engine(KeyPolicy::Strict);
        let record = move_record(&engine);
        let as_legacy = record
            .edit(Field::FunctionCode, crate::schedule::MOVE_LEGACY as u32)
            .unwrap();

        let outgoing = record
            .reencode(
                &as_legacy,
                KeyChoice::Rederive {
                    engine: &engine,
                    sequence: Sequence::new(3),
                    ctx: KeyContext::default(),
                },
            )
            .unwrap();

        assert_eq!(outgoing.sequence().get(), 3);
        assert_eq!(outgoing.key().bytes()[8], 0xFF);
        assert_eq!(outgoing.confidence(), &KeyConfidence::Verified);
        assert_eq!(outgoing.detection(), &Detection::Unique);
    }

    #[test]
    fn test_rederive_respects_strict_policy() {
        let engine = engine(KeyPolicy::Strict);
        let record = move_record(&engine);

        let err = record
            .reencode(
                record.packet(),
                KeyChoice::Rederive {
                    engine: &engine,
                    sequence: Sequence::new(6),
                    ctx: KeyContext::default(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownKey(_)));
    }

    #[test]
    fn test_craft_move() {
        let engine = engine(KeyPolicy::Strict);
        let packet = DecodedPacket {
            function_code: MOVE,
            param3: 100,
            param4: 200,
            ..Default::default()
        };

        let record = PacketRecord::craft(packet, Sequence::new(4).unwrap(), &engine, &KeyContext::default())
            .unwrap();

        assert_eq!(record.frame().len(), 25);
        assert_eq!(record.frame().extension(), &CRAFTED_EXTENSION);
        let back = PacketRecord::capture(record.frame().clone(), &engine, &KeyContext::default()).unwrap();
        assert_eq!(back.packet(), &packet);
    }

    fn potion(engine: &KeyScheduleEngine) -> PacketRecord {
        let fixtures = FixtureTable::builtin().unwrap();
        let frame = fixtures.get("use item (repair potion)").unwrap().frame().clone();
        PacketRecord::capture(frame, engine, &KeyContext::default()).unwrap()
    }

    #[test]
    fn test_capture_reads_extension_text() {
        let engine = engine(KeyPolicy::Strict);
        let record = potion(&engine);

        assert_eq!(record.function_code(), USE_ITEM);
        assert_eq!(record.text(), Some("修复神水"));
        assert_eq!(record.detection(), &Detection::Unique);
        let line = record.plaintext().to_string();
        assert!(line.starts_with("发送封包（4243548，0，1006，79，94，"), "{line}");
        assert!(line.ends_with("，修复神水，）"), "{line}");
        assert_eq!(move_record(&engine).text(), None);
    }

    #[test]
    fn test_craft_with_text_reads_back() {
        let engine = engine(KeyPolicy::Strict);
        let original = potion(&engine);
        let ctx = KeyContext::default();

        let line: Plaintext = original.plaintext().to_string().parse().unwrap();
        let crafted = PacketRecord::from_plaintext(&line, original.sequence(), &engine, &ctx).unwrap();
        assert_eq!(crafted.detection(), &Detection::Unique);
        assert_eq!(crafted.frame().extension()[..8], original.frame().extension()[..8]);

        let back = PacketRecord::capture(crafted.frame().clone(), &engine, &ctx).unwrap();
        assert_eq!(back.packet(), original.packet());
        assert_eq!(back.text(), Some("修复神水"));
    }

    #[test]
    fn test_craft_text_past_known_key() {
        let engine = engine(KeyPolicy::Strict);
        let packet = DecodedPacket {
            param1: 7,
            function_code: USE_ITEM,
            ..Default::default()
        };
        let err = PacketRecord::craft_with_text(
            packet,
            Some("修复神水修复神水"),
            Sequence::new(4).unwrap(),
            &engine,
            &KeyContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, WireError::Codec(CodecError::TextTooLong { len: 16, known: 8 })));
    }

    #[test]
    fn test_reencode_with_new_text() {
        let engine = engine(KeyPolicy::Strict);
        let record = potion(&engine);

        let outgoing = record
            .reencode_with_text(record.packet(), Some("修复"), KeyChoice::Recorded)
            .unwrap();
        assert_eq!(outgoing.text(), Some("修复"));
        assert_eq!(outgoing.detection(), &Detection::Unchecked);

        let kept = record.reencode(record.packet(), KeyChoice::Recorded).unwrap();
        assert_eq!(kept.text(), Some("修复神水"));
    }

    /// A use-item packet with param1 = 0 reads the same as a move at sequence 4.
    fn blank_item() -> DecodedPacket {
        DecodedPacket {
            function_code: USE_ITEM,
            ..Default::default()
        }
    }

    #[test]
    fn test_strict_craft_refuses_ambiguous_frame() {
        let engine = engine(KeyPolicy::Strict);
        let err = PacketRecord::craft(blank_item(), Sequence::new(4).unwrap(), &engine, &KeyContext::default())
            .unwrap_err();

        match err {
            WireError::Detection(DetectionError::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates, vec![MOVE, USE_ITEM]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_lenient_craft_marks_misread_frame() {
        let engine = engine(KeyPolicy::Lenient);
        let record = PacketRecord::craft(blank_item(), Sequence::new(4).unwrap(), &engine, &KeyContext::default())
            .unwrap();

        assert_ne!(record.detection(), &Detection::Unique);
        let back = PacketRecord::capture(record.frame().clone(), &engine, &KeyContext::default()).unwrap();
        if let Detection::Mismatch { detected } = record.detection() {
            assert_eq!(*detected, Some(back.function_code()));
        }
    }
}
