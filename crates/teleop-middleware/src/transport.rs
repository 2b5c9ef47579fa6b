//! Real-time channel abstractions between the core and a robot.
//!
//! A control session rides on two channels:
//!
//! * a [`DataChannel`] – unordered, unreliable, no-retransmit delivery of
//!   small binary frames (control frames outbound, JSON status/ack frames
//!   inbound);
//! * a [`MediaChannel`] – the camera stream.  Only its lifecycle is modelled
//!   here; the media bytes never pass through the core.
//!
//! [`DataChannel::try_send`] must never wait on backpressure.  When the
//! channel cannot take a frame right now the call fails and the caller drops
//! the frame: a stale control frame is worth nothing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use teleop_types::TeleopError;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

/// Largest datagram accepted on the inbound side.
const MAX_DATAGRAM: usize = 1400;

/// The unreliable data half of a session's transport.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Channel label, e.g. `"robot-control"`.
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Hand `frame` to the transport without waiting.
    ///
    /// # Errors
    ///
    /// [`TeleopError::ChannelClosed`] once closed, [`TeleopError::Transport`]
    /// when the transport cannot accept the frame right now.
    fn try_send(&self, frame: &[u8]) -> Result<(), TeleopError>;

    /// Wait for the next inbound frame. `None` once the channel is closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Close the channel and release its resources. Idempotent.
    fn close(&self);
}

/// The media half of a session's transport.
pub trait MediaChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Close the stream and release its resources. Idempotent.
    fn close(&self);
}

// ────────────────────────────────────────────────────────────────────────────
// UDP
// ────────────────────────────────────────────────────────────────────────────

/// [`DataChannel`] over a connected UDP socket.
pub struct UdpDataChannel {
    label: String,
    socket: UdpSocket,
    closed_tx: watch::Sender<bool>,
}

impl UdpDataChannel {
    /// Bind `local` and connect the socket to the robot at `peer`.
    pub async fn connect(
        label: impl Into<String>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Self, TeleopError> {
        let label = label.into();
        let socket = UdpSocket::bind(local).await.map_err(|e| TeleopError::Transport {
            channel: label.clone(),
            details: format!("bind {local}: {e}"),
        })?;
        socket.connect(peer).await.map_err(|e| TeleopError::Transport {
            channel: label.clone(),
            details: format!("connect {peer}: {e}"),
        })?;
        debug!(channel = %label, %local, %peer, "udp data channel connected");
        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            label,
            socket,
            closed_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TeleopError> {
        self.socket.local_addr().map_err(|e| TeleopError::Transport {
            channel: self.label.clone(),
            details: e.to_string(),
        })
    }
}

#[async_trait]
impl DataChannel for UdpDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        !*self.closed_tx.borrow()
    }

    fn try_send(&self, frame: &[u8]) -> Result<(), TeleopError> {
        if !self.is_open() {
            return Err(TeleopError::ChannelClosed(self.label.clone()));
        }
        self.socket
            .try_send(frame)
            .map(|_| ())
            .map_err(|e| TeleopError::Transport {
                channel: self.label.clone(),
                details: e.to_string(),
            })
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut closed = self.closed_tx.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = closed.wait_for(|c| *c) => return None,
                result = self.socket.recv(&mut buf) => match result {
                    Ok(n) => return Some(buf[..n].to_vec()),
                    // ICMP unreachable and friends surface here; keep listening.
                    Err(e) => debug!(channel = %self.label, error = %e, "udp recv error"),
                },
            }
        }
    }

    fn close(&self) {
        self.closed_tx.send_replace(true);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-process loopback
// ────────────────────────────────────────────────────────────────────────────

/// One end of an in-process [`DataChannel`] pair.
///
/// Each direction is a bounded queue; when it is full `try_send` fails and
/// the frame is dropped, mimicking a congested unreliable link.  Closing
/// either end closes both.
pub struct LoopbackDataChannel {
    label: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed_tx: Arc<watch::Sender<bool>>,
}

/// Build a connected pair of loopback channels with `capacity` frames of
/// buffering per direction.
pub fn loopback_pair(
    label: &str,
    capacity: usize,
) -> (LoopbackDataChannel, LoopbackDataChannel) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, _) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    (
        LoopbackDataChannel {
            label: label.to_string(),
            tx: a_tx,
            rx: Mutex::new(a_rx),
            closed_tx: Arc::clone(&closed_tx),
        },
        LoopbackDataChannel {
            label: label.to_string(),
            tx: b_tx,
            rx: Mutex::new(b_rx),
            closed_tx,
        },
    )
}

#[async_trait]
impl DataChannel for LoopbackDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        !*self.closed_tx.borrow()
    }

    fn try_send(&self, frame: &[u8]) -> Result<(), TeleopError> {
        if !self.is_open() {
            return Err(TeleopError::ChannelClosed(self.label.clone()));
        }
        self.tx.try_send(frame.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TeleopError::Transport {
                channel: self.label.clone(),
                details: "channel full".to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => TeleopError::ChannelClosed(self.label.clone()),
        })
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut closed = self.closed_tx.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|c| *c) => None,
            frame = rx.recv() => frame,
        }
    }

    fn close(&self) {
        self.closed_tx.send_replace(true);
    }
}

/// In-process [`MediaChannel`] that only tracks whether it is open.
#[derive(Debug)]
pub struct LoopbackMediaChannel {
    label: String,
    open: AtomicBool,
}

impl LoopbackMediaChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            open: AtomicBool::new(true),
        }
    }
}

impl MediaChannel for LoopbackMediaChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn loopback_delivers_frames_both_ways() {
        let (core, robot) = loopback_pair("robot-control", 4);
        core.try_send(&[1, 2, 3]).unwrap();
        robot.try_send(b"ack").unwrap();

        assert_eq!(robot.recv().await, Some(vec![1, 2, 3]));
        assert_eq!(core.recv().await, Some(b"ack".to_vec()));
    }

    #[tokio::test]
    async fn loopback_full_channel_rejects_instead_of_blocking() {
        let (core, _robot) = loopback_pair("robot-control", 1);
        core.try_send(&[1]).unwrap();
        let err = core.try_send(&[2]).unwrap_err();
        assert!(matches!(err, TeleopError::Transport { .. }));
    }

    #[tokio::test]
    async fn closing_one_end_closes_both_and_wakes_receivers() {
        let (core, robot) = loopback_pair("robot-control", 4);
        let robot = Arc::new(robot);
        let waiter = {
            let robot = Arc::clone(&robot);
            tokio::spawn(async move { robot.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        core.close();
        assert!(!robot.is_open());
        assert_eq!(waiter.await.unwrap(), None);
        assert!(matches!(
            core.try_send(&[0]),
            Err(TeleopError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn udp_channel_roundtrip_on_localhost() {
        let robot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let robot_addr = robot.local_addr().unwrap();
        let channel = UdpDataChannel::connect(
            "robot-control",
            "127.0.0.1:0".parse().unwrap(),
            robot_addr,
        )
        .await
        .unwrap();
        let core_addr = channel.local_addr().unwrap();

        channel.try_send(&[0xAB; 15]).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = robot.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, 15);
        assert_eq!(from, core_addr);

        robot.send_to(b"{\"type\":\"disconnect_ack\"}", core_addr).await.unwrap();
        let inbound = channel.recv().await.unwrap();
        assert_eq!(inbound, b"{\"type\":\"disconnect_ack\"}".to_vec());

        channel.close();
        assert!(!channel.is_open());
        assert_eq!(channel.recv().await, None);
        assert!(channel.try_send(&[0]).is_err());
    }

    #[test]
    fn media_channel_close_is_idempotent() {
        let media = LoopbackMediaChannel::new("video-a");
        assert!(media.is_open());
        media.close();
        media.close();
        assert!(!media.is_open());
        assert_eq!(media.label(), "video-a");
    }
}
