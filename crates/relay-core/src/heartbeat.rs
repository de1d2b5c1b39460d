//! Heartbeat liveness monitoring.
//!
//! The device sends `Heartbeat` datagrams. The monitor counts ticks without
//! one and reports the target as not ready once the count reaches
//! `max_wait_count`. It never evicts the peer or stops itself.
//!
//! State machine: `Idle -> Listening -> Monitoring`, back to `Idle` when the
//! socket closes. The caller owns the timer: it calls `tick()` every
//! `interval` while `is_monitoring()` holds.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for heartbeat monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between ticks (default: 1s)
    pub interval: Duration,
    /// Ticks without a heartbeat before the target counts as not ready (default: 1000)
    pub max_wait_count: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait_count: 1000,
        }
    }
}

/// Monitor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    /// No socket, no timer
    Idle,
    /// Socket bind in progress
    Listening,
    /// Socket bound, timer running
    Monitoring,
}

/// Result of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not monitoring, tick ignored
    Inactive,
    /// Counter incremented, still within the cap
    Waiting { wait_count: u32 },
    /// Counter at the cap
    NotReady { wait_count: u32 },
}

/// Serializable view of the monitor for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatSnapshot {
    pub state: MonitorState,
    pub wait_count: u32,
    pub max_wait_count: u32,
    pub target_ready: bool,
}

/// Missed-heartbeat counter with its lifecycle.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    state: MonitorState,
    wait_count: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            state: MonitorState::Idle,
            wait_count: 0,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(HeartbeatConfig::default())
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn wait_count(&self) -> u32 {
        self.wait_count
    }

    pub fn is_monitoring(&self) -> bool {
        self.state == MonitorState::Monitoring
    }

    /// Whether the target has sent a heartbeat recently enough.
    pub fn target_ready(&self) -> bool {
        self.wait_count < self.config.max_wait_count
    }

    /// The socket is being bound.
    pub fn start_listening(&mut self) {
        if self.state == MonitorState::Idle {
            self.state = MonitorState::Listening;
        }
    }

    /// The socket is bound.
    ///
    /// Returns true when monitoring starts, i.e. the caller should start its
    /// timer. Only the first bind after `Idle` starts it.
    pub fn on_bound(&mut self) -> bool {
        match self.state {
            MonitorState::Listening => {
                self.state = MonitorState::Monitoring;
                info!(
                    "Heartbeat monitoring started (interval: {:?}, max wait count: {})",
                    self.config.interval, self.config.max_wait_count
                );
                true
            }
            MonitorState::Idle | MonitorState::Monitoring => false,
        }
    }

    /// A heartbeat arrived.
    pub fn on_heartbeat(&mut self) {
        self.wait_count = 0;
    }

    /// Advance the counter by one interval.
    pub fn tick(&mut self) -> TickOutcome {
        if !self.is_monitoring() {
            return TickOutcome::Inactive;
        }

        if self.wait_count >= self.config.max_wait_count {
            warn!(
                "Target is not ready. Exceeded maximum wait count ({}) for heartbeat",
                self.config.max_wait_count
            );
            TickOutcome::NotReady {
                wait_count: self.wait_count,
            }
        } else {
            self.wait_count += 1;
            debug!("Waiting for heartbeat... ({})", self.wait_count);
            TickOutcome::Waiting {
                wait_count: self.wait_count,
            }
        }
    }

    /// The socket closed. The timer must stop.
    pub fn on_closed(&mut self) {
        if self.state != MonitorState::Idle {
            info!("Heartbeat monitoring stopped");
        }
        self.state = MonitorState::Idle;
    }

    pub fn snapshot(&self) -> HeartbeatSnapshot {
        HeartbeatSnapshot {
            state: self.state,
            wait_count: self.wait_count,
            max_wait_count: self.config.max_wait_count,
            target_ready: self.target_ready(),
        }
    }
}
