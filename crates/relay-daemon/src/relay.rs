//! The relay event loop.
//!
//! A single task owns the `Session` and the `HeartbeatMonitor` and processes,
//! one at a time:
//! - datagrams from the UDP endpoint
//! - requests from HTTP handlers (via `RelayHandle`)
//! - reports from detached sends
//! - expired collection windows
//! - heartbeat ticks
//!
//! The collection window belongs to the loop, not to the HTTP handler. Once a
//! command is accepted its window always closes and flushes, even if the
//! client has gone away.

use crate::udp::{SendPurpose, SendReport, UdpEndpoint};
use anyhow::Result;
use relay_core::{
    classify, CommandError, DataOutcome, HeartbeatConfig, HeartbeatMonitor, HeartbeatSnapshot,
    MessageKind, RequestId, Session, SessionSnapshot, MAX_DATAGRAM_SIZE, SYNC_KEYWORD,
};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Errors seen by callers of `RelayHandle`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Relay is not running")]
    Unavailable,
}

/// Combined session and heartbeat status.
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub heartbeat: HeartbeatSnapshot,
}

/// Request from an HTTP handler to the relay loop.
#[derive(Debug)]
enum RelayRequest {
    Command {
        command: Option<String>,
        /// Answered right away with the request id or the rejection
        accepted: oneshot::Sender<Result<RequestId, CommandError>>,
        /// Answered when the collection window closes
        output: oneshot::Sender<String>,
    },
    Status {
        reply: oneshot::Sender<RelayStatus>,
    },
}

/// A collection window that has run out.
#[derive(Debug)]
struct WindowClosed {
    request_id: RequestId,
    output: oneshot::Sender<String>,
}

/// Cloneable handle for talking to the relay loop.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    request_tx: mpsc::UnboundedSender<RelayRequest>,
}

impl RelayHandle {
    /// Forward `command` to the peer and wait for the output collected during
    /// its window.
    ///
    /// Dropping the returned future does not cancel the window.
    pub async fn command(&self, command: Option<String>) -> Result<String, RelayError> {
        let (accepted, accepted_rx) = oneshot::channel();
        let (output, output_rx) = oneshot::channel();
        self.request(RelayRequest::Command {
            command,
            accepted,
            output,
        })?;

        let request_id = accepted_rx.await.map_err(|_| RelayError::Unavailable)??;
        debug!("Request {} accepted, waiting for its window", request_id);

        output_rx.await.map_err(|_| RelayError::Unavailable)
    }

    pub async fn status(&self) -> Result<RelayStatus, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.request(RelayRequest::Status { reply })?;
        rx.await.map_err(|_| RelayError::Unavailable)
    }

    fn request(&self, request: RelayRequest) -> Result<(), RelayError> {
        self.request_tx
            .send(request)
            .map_err(|_| RelayError::Unavailable)
    }
}

/// Tunables for the relay loop.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub heartbeat: HeartbeatConfig,
    pub collection_window: Duration,
    pub max_datagram_size: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            collection_window: Duration::from_secs(1),
            max_datagram_size: MAX_DATAGRAM_SIZE,
        }
    }
}

/// Relay state owned by the event loop.
pub struct Relay {
    session: Session,
    monitor: HeartbeatMonitor,
    udp: UdpEndpoint,
    report_rx: mpsc::UnboundedReceiver<SendReport>,
    request_rx: mpsc::UnboundedReceiver<RelayRequest>,
    window_tx: mpsc::UnboundedSender<WindowClosed>,
    window_rx: mpsc::UnboundedReceiver<WindowClosed>,
    collection_window: Duration,
    max_datagram_size: usize,
}

impl Relay {
    /// Bind the UDP endpoint and create the relay with its handle.
    ///
    /// Bind failure is returned to the caller; the relay cannot run without
    /// its socket.
    pub async fn bind(udp_bind: &str, options: RelayOptions) -> Result<(Self, RelayHandle)> {
        let mut monitor = HeartbeatMonitor::new(options.heartbeat);
        monitor.start_listening();

        let (udp, report_rx) = UdpEndpoint::bind(udp_bind).await?;
        monitor.on_bound();

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (window_tx, window_rx) = mpsc::unbounded_channel();

        let relay = Self {
            session: Session::new(),
            monitor,
            udp,
            report_rx,
            request_rx,
            window_tx,
            window_rx,
            collection_window: options.collection_window,
            max_datagram_size: options.max_datagram_size,
        };

        Ok((relay, RelayHandle { request_tx }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    /// Run until `shutdown` fires or every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.monitor.config().interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut buf = vec![0u8; self.max_datagram_size];

        info!("Relay running on {}", self.udp.local_addr());

        loop {
            tokio::select! {
                // Inbound datagrams
                result = self.udp.recv(&mut buf), if !self.udp.is_closed() => {
                    match result {
                        Ok((len, from)) => self.on_datagram(&buf[..len], from),
                        Err(e) => self.on_receive_error(e),
                    }
                }

                // Outcomes of detached sends
                Some(report) = self.report_rx.recv() => {
                    self.on_send_report(report);
                }

                // Windows of accepted commands
                Some(closed) = self.window_rx.recv() => {
                    self.on_window_closed(closed);
                }

                // Requests from HTTP handlers
                request = self.request_rx.recv() => {
                    match request {
                        Some(request) => self.on_request(request),
                        None => {
                            info!("All relay handles dropped");
                            break;
                        }
                    }
                }

                _ = ticker.tick(), if self.monitor.is_monitoring() => {
                    self.monitor.tick();
                }

                _ = shutdown.changed() => {
                    info!("Relay shutting down");
                    break;
                }
            }
        }
    }

    /// Route one inbound datagram.
    fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        debug!("Received {} bytes from {}", data.len(), from);

        match classify(data) {
            MessageKind::Sync => {
                info!("SYNC received from {}", from);
                self.session.register_peer(from);
                self.udp
                    .send_detached(SYNC_KEYWORD.to_string(), from, SendPurpose::HandshakeReply);
            }
            MessageKind::Heartbeat => {
                self.monitor.on_heartbeat();
                info!(
                    "Heartbeat received from {} at {}",
                    from,
                    chrono::Utc::now().to_rfc3339()
                );
            }
            MessageKind::Data(payload) => match self.session.append_data(&payload, data.len()) {
                DataOutcome::Accumulated { buffered } => {
                    debug!("Buffered {} bytes from {} ({} total)", data.len(), from, buffered);
                }
                DataOutcome::Discarded => {
                    warn!(
                        "No pending HTTP request, discarding {} bytes from {}",
                        data.len(),
                        from
                    );
                }
            },
        }
    }

    /// A receive error closes the endpoint for good and stops the monitor.
    fn on_receive_error(&mut self, e: io::Error) {
        error!("UDP receive error: {}", e);
        self.udp.close();
        self.monitor.on_closed();
    }

    fn on_request(&mut self, request: RelayRequest) {
        match request {
            RelayRequest::Command {
                command,
                accepted,
                output,
            } => {
                let result = match self.session.begin_request(command.as_deref()) {
                    Ok(forward) => {
                        info!(
                            "Forwarding request {} ({:?}) to {}",
                            forward.request_id, forward.command, forward.target
                        );
                        self.udp.send_detached(
                            forward.command,
                            forward.target,
                            SendPurpose::Forward(forward.request_id),
                        );
                        self.schedule_window(forward.request_id, output);
                        Ok(forward.request_id)
                    }
                    Err(e) => {
                        match e {
                            CommandError::InvalidPort(port) => warn!(
                                "Rejected command: port should be > 0 and < 65536, got {}",
                                port
                            ),
                            CommandError::NoPeer => warn!("Rejected command: no peer has sent SYNC"),
                            _ => warn!("Rejected command: {}", e),
                        }
                        Err(e)
                    }
                };
                // The handler may have gone away; the window runs regardless
                let _ = accepted.send(result);
            }
            RelayRequest::Status { reply } => {
                let _ = reply.send(RelayStatus {
                    session: self.session.snapshot(),
                    heartbeat: self.monitor.snapshot(),
                });
            }
        }
    }

    /// Start the timer that closes a request's collection window.
    fn schedule_window(&self, request_id: RequestId, output: oneshot::Sender<String>) {
        let window_tx = self.window_tx.clone();
        let window = self.collection_window;

        tokio::spawn(async move {
            sleep(window).await;
            // Receiver is gone only when the relay loop has exited
            let _ = window_tx.send(WindowClosed { request_id, output });
        });
    }

    fn on_window_closed(&mut self, closed: WindowClosed) {
        let output = self.session.flush(closed.request_id);
        debug!(
            "Window of request {} closed ({} bytes)",
            closed.request_id,
            output.len()
        );
        if closed.output.send(output).is_err() {
            debug!("Client of request {} went away before its flush", closed.request_id);
        }
    }

    fn on_send_report(&mut self, report: SendReport) {
        match report.result {
            Ok(len) => {
                debug!("Sent {} bytes to {} ({:?})", len, report.target, report.purpose);
                if let SendPurpose::Forward(request_id) = report.purpose {
                    self.session.forward_sent(request_id);
                }
            }
            Err(e) => {
                error!(
                    "Failed to send {:?} to {}: {}",
                    report.purpose, report.target, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MonitorState;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    fn short_window() -> RelayOptions {
        RelayOptions {
            collection_window: Duration::from_millis(100),
            ..RelayOptions::default()
        }
    }

    #[tokio::test]
    async fn test_bind_starts_monitoring() {
        let (relay, _handle) = Relay::bind("127.0.0.1:0", RelayOptions::default())
            .await
            .unwrap();
        assert!(relay.local_addr().port() > 0);
        assert_eq!(relay.monitor.state(), MonitorState::Monitoring);
    }

    #[tokio::test]
    async fn test_handle_without_loop_is_unavailable() {
        let (relay, handle) = Relay::bind("127.0.0.1:0", RelayOptions::default())
            .await
            .unwrap();
        drop(relay);

        assert!(matches!(
            handle.command(Some("DIR".into())).await,
            Err(RelayError::Unavailable)
        ));
        assert!(matches!(handle.status().await, Err(RelayError::Unavailable)));
    }

    #[tokio::test]
    async fn test_loop_exits_on_shutdown() {
        let (relay, _handle) = Relay::bind("127.0.0.1:0", RelayOptions::default())
            .await
            .unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(relay.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), task)
            .await
            .expect("Relay did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_through_loop() {
        let (relay, handle) = Relay::bind("127.0.0.1:0", RelayOptions::default())
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(relay.run(shutdown_rx));

        let status = handle.status().await.unwrap();
        assert!(status.session.peer.is_none());
        assert!(status.session.pending_request.is_none());
        assert_eq!(status.heartbeat.state, MonitorState::Monitoring);
        assert!(status.heartbeat.target_ready);
    }

    #[tokio::test]
    async fn test_command_without_peer_is_rejected() {
        let (relay, handle) = Relay::bind("127.0.0.1:0", RelayOptions::default())
            .await
            .unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(relay.run(shutdown_rx));

        assert!(matches!(
            handle.command(Some("DIR".into())).await,
            Err(RelayError::Command(CommandError::NoPeer))
        ));
    }

    #[tokio::test]
    async fn test_abandoned_command_still_closes_window() {
        let (mut relay, handle) = Relay::bind("127.0.0.1:0", short_window()).await.unwrap();
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        relay.session.register_peer(device.local_addr().unwrap());

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(relay.run(shutdown_rx));

        // Caller gives up long before the window closes
        let abandoned = timeout(Duration::from_millis(10), handle.command(Some("DIR".into()))).await;
        assert!(abandoned.is_err());

        sleep(Duration::from_millis(300)).await;
        let status = handle.status().await.unwrap();
        assert!(status.session.pending_request.is_none());
    }

    #[tokio::test]
    async fn test_receive_error_closes_endpoint() {
        let (mut relay, handle) = Relay::bind("127.0.0.1:0", short_window()).await.unwrap();
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        relay.session.register_peer(device.local_addr().unwrap());

        relay.on_receive_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(relay.udp.is_closed());
        assert_eq!(relay.monitor.state(), MonitorState::Idle);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(relay.run(shutdown_rx));

        // Forward fails, the window still answers
        assert_eq!(handle.command(Some("DIR".into())).await.unwrap(), "");

        let mut buf = [0u8; 16];
        assert!(timeout(Duration::from_millis(200), device.recv_from(&mut buf))
            .await
            .is_err());

        let status = handle.status().await.unwrap();
        assert_eq!(status.heartbeat.state, MonitorState::Idle);
        assert!(status.session.pending_request.is_none());
    }
}
