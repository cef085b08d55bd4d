//! # mirwire
//!
//! Codec for the Mir client/server packet protocol: frames delimited by
//! `#` and `!`, a 16-byte body XOR-encrypted under a key that depends on
//! both the frame's sequence digit and the packet's function code.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): reassembles frames from an arbitrary byte
//!   stream and resynchronizes on garbage
//! - **Key schedule** ([`schedule`]): derives keys, validates the strategy
//!   against known captures at startup and enforces the strict/lenient policy
//! - **Fields** ([`codec`]): the fixed little-endian body layout, extension
//!   text and the plaintext command line
//! - **Records** ([`record`]): decoded packets, editing and JSON session logs
//! - **Harness** ([`harness`]): scores a key strategy against the fixtures
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use mirwire::pipeline::PacketPipeline;
//! use mirwire::protocol::ScannerConfig;
//! use mirwire::schedule::{EngineConfig, FixtureTable, KeyScheduleEngine, ObservedKeySchedule};
//!
//! let fixtures = FixtureTable::builtin().unwrap();
//! let stream: Vec<u8> = fixtures.iter().flat_map(|f| f.frame().raw().to_vec()).collect();
//!
//! let engine = KeyScheduleEngine::try_new(ObservedKeySchedule::builtin(), fixtures, EngineConfig::default())
//!     .unwrap();
//! let pipeline = PacketPipeline::new(Arc::new(engine));
//!
//! let events = pipeline.decode_stream(&stream, ScannerConfig::default());
//! assert!(events.iter().all(|e| e.record().is_some()));
//! ```

pub mod codec;
pub mod error;
pub mod harness;
pub mod pipeline;
pub mod protocol;
pub mod record;
pub mod schedule;
pub mod transport;
pub mod worker;

pub use codec::{DecodedPacket, ExtensionCodec, Field, FieldCodec, Plaintext};
pub use error::{Result, WireError};
pub use harness::{HarnessReport, ValidationHarness};
pub use pipeline::{CaptureEvent, PacketPipeline};
pub use protocol::{Frame, FrameScanner, Sequence};
pub use record::{PacketRecord, SessionLog};
pub use schedule::{KeyPolicy, KeyScheduleEngine, ObservedKeySchedule};
pub use worker::spawn_capture_worker;
