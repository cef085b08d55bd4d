//! Decode pipeline: scanner events → packet records or incidents.
//!
//! Every failure is local to its frame. It becomes an [`Incident`] carrying
//! the raw bytes, so the frame can later be turned into a fixture.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{DetectionError, FramingError, WireError};
use crate::protocol::{spaced_hex, Frame, FrameScanner, ScanEvent, ScannerConfig, Sequence};
use crate::record::PacketRecord;
use crate::schedule::{KeyContext, KeyScheduleEngine};

/// Why a stretch of input produced no record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    /// Bytes outside any frame.
    Skipped,
    /// Frame abandoned by the scanner.
    Framing,
    /// No acceptable key under the active policy.
    UnknownKey,
    /// Several function codes read the frame equally well.
    Ambiguous,
    /// The engine failed startup validation.
    Consistency,
    /// Body rejected by the codec.
    Codec,
    /// Any other failure; the message says which.
    Other,
}

/// A reported drop, with enough raw data to reproduce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Incident {
    pub kind: IncidentKind,
    /// Stream offset, when known.
    pub offset: Option<u64>,
    pub sequence: Option<Sequence>,
    pub function_code: Option<u16>,
    pub raw_hex: String,
    pub message: String,
}

impl Incident {
    fn skipped(offset: u64, bytes: &[u8]) -> Self {
        Self {
            kind: IncidentKind::Skipped,
            offset: Some(offset),
            sequence: None,
            function_code: None,
            raw_hex: spaced_hex(bytes),
            message: format!("{} bytes outside any frame", bytes.len()),
        }
    }

    fn framing(err: &FramingError) -> Self {
        let offset = match err {
            FramingError::InvalidSequence { offset, .. }
            | FramingError::Unterminated { offset, .. }
            | FramingError::Interrupted { offset, .. }
            | FramingError::TruncatedAtClose { offset, .. } => Some(*offset),
            FramingError::Malformed(_) => None,
        };
        Self {
            kind: IncidentKind::Framing,
            offset,
            sequence: None,
            function_code: None,
            raw_hex: spaced_hex(err.discarded()),
            message: err.to_string(),
        }
    }

    fn decode(frame: &Frame, err: &WireError) -> Self {
        let (kind, function_code) = match err {
            WireError::UnknownKey(e) => (IncidentKind::UnknownKey, e.function_code),
            WireError::Detection(DetectionError::Ambiguous { candidates, .. }) => {
                (IncidentKind::Ambiguous, candidates.first().copied())
            }
            WireError::Detection(DetectionError::Mismatch { requested, .. }) => {
                (IncidentKind::Ambiguous, Some(*requested))
            }
            WireError::Consistency(_) => (IncidentKind::Consistency, None),
            WireError::Framing(_) => (IncidentKind::Framing, None),
            WireError::Codec(_) => (IncidentKind::Codec, None),
            WireError::Fixture(_)
            | WireError::Harness(_)
            | WireError::Io(_)
            | WireError::Json(_)
            | WireError::Hex(_)
            | WireError::SessionLog(_) => (IncidentKind::Other, None),
        };
        Self {
            kind,
            offset: None,
            sequence: Some(frame.sequence()),
            function_code,
            raw_hex: frame.to_hex(),
            message: err.to_string(),
        }
    }
}

/// Output of the pipeline, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Record(PacketRecord),
    Incident(Incident),
}

impl CaptureEvent {
    /// The record, if this event carries one.
    pub fn record(&self) -> Option<&PacketRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Incident(_) => None,
        }
    }

    /// The incident, if this event carries one.
    pub fn incident(&self) -> Option<&Incident> {
        match self {
            Self::Incident(incident) => Some(incident),
            Self::Record(_) => None,
        }
    }
}

/// Frame → key → fields → record.
#[derive(Debug, Clone)]
pub struct PacketPipeline {
    engine: Arc<KeyScheduleEngine>,
    ctx: KeyContext,
}

impl PacketPipeline {
    /// Pipeline over a shared engine.
    pub fn new(engine: Arc<KeyScheduleEngine>) -> Self {
        Self {
            engine,
            ctx: KeyContext::default(),
        }
    }

    /// Supply extra key-schedule context for subsequent frames.
    pub fn with_context(mut self, ctx: KeyContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn engine(&self) -> &Arc<KeyScheduleEngine> {
        &self.engine
    }

    /// Decode one frame.
    pub fn process(&self, frame: Frame) -> Result<PacketRecord, Incident> {
        match PacketRecord::capture(frame.clone(), &self.engine, &self.ctx) {
            Ok(record) => {
                if record.key().is_inferred() {
                    tracing::warn!(
                        sequence = %record.sequence(),
                        function_code = format_args!("0x{:04X}", record.function_code()),
                        raw = %record.frame().to_hex(),
                        "frame decoded with inferred key"
                    );
                }
                Ok(record)
            }
            Err(err) => {
                let incident = Incident::decode(&frame, &err);
                tracing::warn!(
                    kind = ?incident.kind,
                    sequence = %frame.sequence(),
                    raw = %incident.raw_hex,
                    error = %err,
                    "frame dropped"
                );
                Err(incident)
            }
        }
    }

    /// Turn one scanner event into a capture event.
    pub fn handle(&self, event: ScanEvent) -> CaptureEvent {
        match event {
            ScanEvent::Frame(frame) => match self.process(frame) {
                Ok(record) => CaptureEvent::Record(record),
                Err(incident) => CaptureEvent::Incident(incident),
            },
            ScanEvent::Skipped { offset, bytes } => {
                CaptureEvent::Incident(Incident::skipped(offset, &bytes))
            }
            ScanEvent::Error(err) => CaptureEvent::Incident(Incident::framing(&err)),
        }
    }

    /// Decode a complete, already-buffered stream in one go.
    pub fn decode_stream(&self, data: &[u8], config: ScannerConfig) -> Vec<CaptureEvent> {
        let mut scanner = FrameScanner::with_config(config);
        scanner.extend(data);
        scanner
            .close()
            .into_iter()
            .map(|event| self.handle(event))
            .collect()
    }
}
