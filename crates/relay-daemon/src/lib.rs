//! relay-daemon library: Exposes the relay components for testing.
//!
//! This is a thin library layer over the daemon binary,
//! allowing integration tests to run the relay in-process.

pub mod config;
pub mod http;
pub mod relay;
pub mod udp;

// Re-export key types for convenience
pub use config::Config;
pub use relay::{Relay, RelayError, RelayHandle, RelayOptions, RelayStatus};
pub use udp::{SendPurpose, SendReport, UdpEndpoint};
