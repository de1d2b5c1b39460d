//! Validation of commands forwarded from the HTTP bridge.

use crate::message::SYNC_KEYWORD;
use std::net::SocketAddr;
use thiserror::Error;

/// Reasons a command cannot be forwarded. All of them are client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("No command provided or SYNC message ignored")]
    MissingCommand,

    #[error("No command provided or SYNC message ignored")]
    ReservedCommand,

    #[error("Invalid port or address")]
    NoPeer,

    #[error("Invalid port or address")]
    InvalidPort(u32),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Trim a raw `reqcmd` value and reject empty or reserved commands.
///
/// Clients may not trigger a handshake through the bridge, so `SYNC` is refused.
pub fn validate_command(raw: Option<&str>) -> Result<String> {
    let command = raw.map(str::trim).unwrap_or_default();

    if command.is_empty() {
        return Err(CommandError::MissingCommand);
    }
    if command == SYNC_KEYWORD {
        return Err(CommandError::ReservedCommand);
    }

    Ok(command.to_string())
}

/// Check that a port lies in the open range (0, 65536).
pub fn check_port(port: u32) -> Result<()> {
    if port > 0 && port < 65_536 {
        Ok(())
    } else {
        Err(CommandError::InvalidPort(port))
    }
}

/// Resolve the forward target from the tracked peer.
pub fn forward_target(peer: Option<SocketAddr>) -> Result<SocketAddr> {
    let peer = peer.ok_or(CommandError::NoPeer)?;
    check_port(u32::from(peer.port()))?;
    Ok(peer)
}
