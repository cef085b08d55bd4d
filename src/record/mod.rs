//! Packet records and the session log.
//!
//! A [`PacketRecord`] is what editors and senders exchange: the wire frame,
//! its decoded fields, the key that links the two, and where it came from.

mod packet_record;
mod session_log;

pub use packet_record::{Detection, Direction, KeyChoice, PacketRecord};
pub use session_log::{SessionEntry, SessionLog, SESSION_LOG_VERSION};
