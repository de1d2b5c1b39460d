//! UDP endpoint shared by the receive loop and detached senders.
//!
//! Sends never run on the receive loop. Each one is spawned as its own task
//! and reports its outcome back over a channel, so the loop can react to a
//! completed forward without ever waiting on the socket.

use anyhow::{Context, Result};
use relay_core::RequestId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Why a datagram was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPurpose {
    /// `SYNC` echo to a handshaking peer
    HandshakeReply,
    /// Bridge command for a request
    Forward(RequestId),
}

/// Outcome of a detached send.
#[derive(Debug)]
pub struct SendReport {
    pub purpose: SendPurpose,
    pub target: SocketAddr,
    /// Bytes written, or the send error
    pub result: io::Result<usize>,
}

/// Bound UDP socket of the relay.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    report_tx: mpsc::UnboundedSender<SendReport>,
    /// Set after a receive error; sends are refused from then on
    closed: bool,
}

impl UdpEndpoint {
    /// Bind the relay socket.
    ///
    /// Returns the endpoint and the receiver for send reports.
    pub async fn bind(addr: &str) -> Result<(Self, mpsc::UnboundedReceiver<SendReport>)> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", addr))?;
        let local_addr = socket.local_addr()?;
        info!("UDP endpoint listening on {}", local_addr);

        let (report_tx, report_rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                socket: Arc::new(socket),
                local_addr,
                report_tx,
                closed: false,
            },
            report_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stop using the endpoint. Later sends report `NotConnected`.
    pub fn close(&mut self) {
        if !self.closed {
            info!("UDP endpoint on {} closed", self.local_addr);
        }
        self.closed = true;
    }

    /// Receive one datagram into `buf`.
    ///
    /// Datagrams longer than `buf` are truncated by the OS.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Send `payload` to `target` without waiting for completion.
    pub fn send_detached(&self, payload: String, target: SocketAddr, purpose: SendPurpose) {
        if self.closed {
            let _ = self.report_tx.send(SendReport {
                purpose,
                target,
                result: Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "UDP endpoint is closed",
                )),
            });
            return;
        }

        let socket = Arc::clone(&self.socket);
        let report_tx = self.report_tx.clone();

        debug!("Sending {:?} ({} bytes) to {}", purpose, payload.len(), target);
        tokio::spawn(async move {
            let result = socket.send_to(payload.as_bytes(), target).await;
            // Receiver is gone only when the relay loop has exited
            let _ = report_tx.send(SendReport {
                purpose,
                target,
                result,
            });
        });
    }
}
