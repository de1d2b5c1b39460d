//! UDP wire messages.
//!
//! The device speaks newline-free UTF-8 text. Two payloads are reserved
//! keywords (`SYNC` and `Heartbeat`); everything else is device output.

/// Handshake keyword. Echoed back verbatim to register the sender as the peer.
pub const SYNC_KEYWORD: &str = "SYNC";

/// Liveness keyword. Resets the missed-heartbeat counter, never answered.
pub const HEARTBEAT_KEYWORD: &str = "Heartbeat";

/// Largest UDP payload over IPv4 (65535 - 8 byte UDP header - 20 byte IP header).
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Kind of an inbound datagram, decided by exact match on the trimmed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    /// Peer handshake
    Sync,
    /// Liveness ping
    Heartbeat,
    /// Device output, carried untrimmed
    Data(String),
}

/// Classify a raw datagram.
///
/// Invalid UTF-8 is decoded lossily rather than rejected. Keyword matching
/// ignores surrounding whitespace, but data payloads keep it.
pub fn classify(data: &[u8]) -> MessageKind {
    let text = String::from_utf8_lossy(data);

    match text.trim() {
        SYNC_KEYWORD => MessageKind::Sync,
        HEARTBEAT_KEYWORD => MessageKind::Heartbeat,
        _ => MessageKind::Data(text.into_owned()),
    }
}
