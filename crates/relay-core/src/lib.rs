//! relay-core: Session and liveness logic for the KVM sync relay.
//!
//! This crate provides the transport-free parts of the relay:
//! - Classifying UDP datagrams (SYNC, Heartbeat, device output)
//! - Validating bridge commands
//! - The single-peer `Session` and its output accumulator
//! - The missed-heartbeat `HeartbeatMonitor`

pub mod command;
pub mod heartbeat;
pub mod message;
pub mod session;

pub use command::CommandError;
pub use heartbeat::{HeartbeatConfig, HeartbeatMonitor, HeartbeatSnapshot, MonitorState, TickOutcome};
pub use message::{classify, MessageKind, HEARTBEAT_KEYWORD, MAX_DATAGRAM_SIZE, SYNC_KEYWORD};
pub use session::{DataOutcome, Forward, RequestId, Session, SessionSnapshot};
