//! Frame sinks.
//!
//! # Example
//!
//! ```
//! use mirwire::protocol::{Frame, Sequence};
//! use mirwire::transport::{DeliveryReport, FrameSink, MemorySink};
//!
//! let mut sink = MemorySink::new();
//! let frame = Frame::build(Sequence::new(1).unwrap(), [0x3C; 16], &[]);
//!
//! assert!(sink.deliver(&frame).is_delivered());
//! assert_eq!(sink.sent().len(), 1);
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::record::PacketRecord;

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    Delivered {
        /// Bytes handed to the transport.
        bytes: usize,
    },
    Failed {
        reason: String,
    },
}

impl DeliveryReport {
    /// Check if the frame went out.
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Accepts complete outgoing frames.
pub trait FrameSink: Send {
    /// Hand one frame to the transport.
    fn deliver(&mut self, frame: &Frame) -> DeliveryReport;
}

/// Deliver a record's frame once and log the outcome.
pub fn send_record<S: FrameSink + ?Sized>(sink: &mut S, record: &PacketRecord) -> DeliveryReport {
    let report = sink.deliver(record.frame());
    match &report {
        DeliveryReport::Delivered { bytes } => tracing::debug!(
            sequence = %record.sequence(),
            function_code = format_args!("0x{:04X}", record.function_code()),
            bytes,
            "frame delivered"
        ),
        DeliveryReport::Failed { reason } => tracing::warn!(
            sequence = %record.sequence(),
            function_code = format_args!("0x{:04X}", record.function_code()),
            raw = %record.frame().to_hex(),
            reason = %reason,
            "frame delivery failed"
        ),
    }
    report
}

/// Sink that forwards raw frame bytes onto a channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    /// Create a sink and the receiver the transport reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&mut self, frame: &Frame) -> DeliveryReport {
        match self.tx.send(frame.raw_bytes()) {
            Ok(()) => DeliveryReport::Delivered { bytes: frame.len() },
            Err(_) => DeliveryReport::Failed {
                reason: "transport channel closed".to_string(),
            },
        }
    }
}

/// In-memory sink for tests; can be told to fail upcoming deliveries.
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Vec<Frame>,
    failures: usize,
    attempts: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` deliveries.
    pub fn fail_next(&mut self, count: usize) {
        self.failures = count;
    }

    /// Frames delivered so far.
    pub fn sent(&self) -> &[Frame] {
        &self.sent
    }

    /// Delivery attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl FrameSink for MemorySink {
    fn deliver(&mut self, frame: &Frame) -> DeliveryReport {
        self.attempts += 1;
        if self.failures > 0 {
            self.failures -= 1;
            return DeliveryReport::Failed {
                reason: "simulated failure".to_string(),
            };
        }
        self.sent.push(frame.clone());
        DeliveryReport::Delivered { bytes: frame.len() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodedPacket;
    use crate::protocol::Sequence;
    use crate::schedule::{EngineConfig, FixtureTable, KeyContext, KeyScheduleEngine, ObservedKeySchedule, MOVE};

    fn crafted() -> PacketRecord {
        let engine = KeyScheduleEngine::try_new(
            ObservedKeySchedule::builtin(),
            FixtureTable::builtin().unwrap(),
            EngineConfig::default(),
        )
        .unwrap();
        let packet = DecodedPacket {
            function_code: MOVE,
            param3: 101,
            param4: 201,
            ..Default::default()
        };
        PacketRecord::craft(packet, Sequence::new(4).unwrap(), &engine, &KeyContext::default()).unwrap()
    }

    #[test]
    fn test_send_record_single_attempt_on_failure() {
        let mut sink = MemorySink::new();
        sink.fail_next(1);

        let report = send_record(&mut sink, &crafted());

        assert_eq!(
            report,
            DeliveryReport::Failed {
                reason: "simulated failure".to_string()
            }
        );
        assert_eq!(sink.attempts(), 1);
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn test_send_record_delivers_frame() {
        let mut sink = MemorySink::new();
        let record = crafted();

        let report = send_record(&mut sink, &record);

        assert_eq!(report, DeliveryReport::Delivered { bytes: 25 });
        assert_eq!(sink.sent(), &[record.frame().clone()]);
    }

    #[test]
    fn test_channel_sink() {
        let (mut sink, mut rx) = ChannelSink::channel();
        let record = crafted();

        assert!(send_record(&mut sink, &record).is_delivered());
        assert_eq!(rx.try_recv().unwrap(), record.frame().raw_bytes());

        drop(rx);
        assert!(!sink.deliver(record.frame()).is_delivered());
    }
}
