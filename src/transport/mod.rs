//! Transport module - outgoing side of the packet transport.
//!
//! Capture/injection lives outside this crate. The inbound side hands raw
//! chunks to the capture worker's channel; the outbound side implements
//! [`FrameSink`]. Delivery is attempted exactly once: failures are reported
//! to the caller, never retried here.

mod sink;

pub use sink::{send_record, ChannelSink, DeliveryReport, FrameSink, MemorySink};
