//! [`TransportBridge`] – the per-session channel pair between the core and
//! one robot.
//!
//! Outbound, the bridge hands encoded control frames to the data channel
//! without ever waiting: a frame the transport cannot take right now is
//! counted and dropped. Inbound, it parses the robot's JSON frames and
//! routes them to the stores.
//!
//! The bridge owns the channels' lifetime. Any path that ends the session
//! in `DISCONNECTED` ends in [`TransportBridge::teardown`], which closes
//! both channels exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use teleop_middleware::{DataChannel, MediaChannel, Notifier, TopicReceiver};
use teleop_store::{StoreError, Stores};
use teleop_types::{
    CameraSpec, ControlSession, EventPayload, Notice, NoticeLevel, SessionStatus, TelemetryReport,
};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Label of the control data channel.
pub const DATA_CHANNEL_LABEL: &str = "robot-control";

/// A JSON frame sent by the robot over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Status report. The `robot_id` in the frame is replaced by the id of
    /// the robot this bridge is bound to.
    Telemetry(TelemetryReport),
    /// The robot finished tearing down after a disconnect request.
    DisconnectAck,
    /// The robot's full camera list.
    Cameras { cameras: Vec<CameraSpec> },
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Malformed inbound frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outbound frame counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub sent: u64,
    pub dropped: u64,
}

pub struct TransportBridge {
    robot_id: String,
    session_id: Uuid,
    data: Arc<dyn DataChannel>,
    media: Arc<dyn MediaChannel>,
    stores: Stores,
    notifier: Arc<dyn Notifier>,
    sent: AtomicU64,
    dropped: AtomicU64,
    torn_down: AtomicBool,
}

impl TransportBridge {
    pub fn new(
        session: &ControlSession,
        data: Arc<dyn DataChannel>,
        media: Arc<dyn MediaChannel>,
        stores: Stores,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            robot_id: session.robot_id.clone(),
            session_id: session.id,
            data,
            media,
            stores,
            notifier,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn robot_id(&self) -> &str {
        &self.robot_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// `true` until teardown, and while the data channel is up.
    pub fn is_open(&self) -> bool {
        !self.is_torn_down() && self.data.is_open()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Hand one encoded frame to the data channel. Returns `false` when the
    /// frame was dropped.
    pub fn send_frame(&self, frame: &[u8]) -> bool {
        if self.is_torn_down() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.data.try_send(frame) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(robot_id = %self.robot_id, error = %e, "control frame dropped");
                false
            }
        }
    }

    /// Close both channels. Only the first call has an effect.
    pub fn teardown(&self, reason: &str) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.data.close();
        self.media.close();
        let stats = self.stats();
        info!(
            robot_id = %self.robot_id,
            session_id = %self.session_id,
            reason,
            sent = stats.sent,
            dropped = stats.dropped,
            "transport torn down"
        );
    }

    /// The media channel came up: the session moves to `ACTIVE_WEBRTC`.
    pub fn on_media_connected(&self) -> Result<ControlSession, StoreError> {
        debug!(robot_id = %self.robot_id, channel = self.media.label(), "media connected");
        self.stores.sessions.activate_media(&self.robot_id)
    }

    /// The media channel dropped: the session falls back to `ACTIVE`.
    pub fn on_media_lost(&self) -> Result<ControlSession, StoreError> {
        self.notifier.notify(Notice::new(
            NoticeLevel::Warning,
            Some(&self.robot_id),
            "Video stream lost",
        ));
        self.stores.sessions.deactivate_media(&self.robot_id)
    }

    /// Parse and route one inbound frame.
    pub fn handle_inbound(&self, raw: &[u8]) -> Result<(), BridgeError> {
        match serde_json::from_slice::<InboundFrame>(raw)? {
            InboundFrame::Telemetry(mut report) => {
                report.robot_id = self.robot_id.clone();
                self.stores.telemetry.report_status(&report)?;
            }
            InboundFrame::DisconnectAck => {
                self.stores.sessions.confirm_disconnect(&self.robot_id)?;
                self.teardown("disconnect acknowledged by robot");
            }
            InboundFrame::Cameras { cameras } => {
                self.stores.cameras.sync(&self.robot_id, &cameras)?;
            }
        }
        Ok(())
    }

    /// Spawn a task that routes inbound frames until the data channel
    /// closes.
    pub fn pump_inbound(self: &Arc<Self>) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(raw) = bridge.data.recv().await {
                if let Err(e) = bridge.handle_inbound(&raw) {
                    warn!(robot_id = %bridge.robot_id, error = %e, "inbound frame rejected");
                }
            }
            debug!(robot_id = %bridge.robot_id, "inbound pump finished");
        })
    }

    /// Spawn a task that tears the bridge down once its session reaches
    /// `DISCONNECTED`, whichever path got it there.
    pub fn supervise(self: &Arc<Self>, mut sessions: TopicReceiver) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            while !bridge.is_torn_down() {
                match sessions.recv().await {
                    Ok(event) => {
                        if let EventPayload::SessionTransition {
                            session_id,
                            to: SessionStatus::Disconnected,
                            ..
                        } = event.payload
                            && session_id == bridge.session_id
                        {
                            bridge.notifier.notify(Notice::new(
                                NoticeLevel::Info,
                                Some(&bridge.robot_id),
                                "Control session ended",
                            ));
                            bridge.teardown("session disconnected");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(robot_id = %bridge.robot_id, missed, "session events lagged; resyncing");
                        if !bridge.session_still_open() {
                            bridge.teardown("session no longer open");
                        }
                    }
                    Err(RecvError::Closed) => bridge.teardown("event bus closed"),
                }
            }
        })
    }

    /// Ask the registry whether this bridge's session still occupies the
    /// robot. Storage errors count as open so a transient failure does not
    /// drop a live session.
    pub(crate) fn session_still_open(&self) -> bool {
        match self.stores.sessions.current(&self.robot_id) {
            Ok(Some(current)) => current.id == self.session_id,
            Ok(None) => false,
            Err(e) => {
                warn!(robot_id = %self.robot_id, error = %e, "session lookup failed");
                true
            }
        }
    }

    /// Status of this bridge's session, `None` once it is no longer the
    /// occupying one.
    pub(crate) fn session_status(&self) -> Option<SessionStatus> {
        match self.stores.sessions.current(&self.robot_id) {
            Ok(Some(current)) if current.id == self.session_id => Some(current.status),
            _ => None,
        }
    }
}
