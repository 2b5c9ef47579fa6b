//! The periodic control-frame loop.
//!
//! Each tick samples the operator's input device, applies the deadzone
//! filter, packs the channels and hands the frame to the bridge. The loop
//! listens to session transitions at the same time and stops as soon as its
//! session leaves the two active states, at the latest one tick later.

use std::sync::Arc;
use std::time::Duration;

use teleop_hal::{ChannelCodec, InputFilter, InputSource};
use teleop_middleware::{Notifier, TopicReceiver};
use teleop_types::{Event, EventPayload, Notice, NoticeLevel, SessionStatus};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bridge::TransportBridge;

/// Recommended frame period.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    pub tick: Duration,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self { tick: DEFAULT_TICK }
    }
}

/// Why [`ControlLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The session moved to a status that halts control.
    Halted(SessionStatus),
    /// The session is no longer the robot's occupying session.
    SessionGone,
    /// The bridge was torn down underneath the loop.
    TransportClosed,
    /// The event bus shut down.
    BusClosed,
}

pub struct ControlLoop {
    input: Box<dyn InputSource>,
    filter: InputFilter,
    codec: ChannelCodec,
    bridge: Arc<TransportBridge>,
    notifier: Arc<dyn Notifier>,
    config: ControlLoopConfig,
}

impl ControlLoop {
    pub fn new(
        input: Box<dyn InputSource>,
        bridge: Arc<TransportBridge>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            input,
            filter: InputFilter::default(),
            codec: ChannelCodec::default(),
            bridge,
            notifier,
            config: ControlLoopConfig::default(),
        }
    }

    pub fn with_filter(mut self, filter: InputFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_codec(mut self, codec: ChannelCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_config(mut self, config: ControlLoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Sample, filter, encode and send one frame. Returns `false` when the
    /// frame was dropped.
    pub fn tick_once(&mut self) -> bool {
        let mut channels = match self.input.sample() {
            Some(raw) => self.filter.apply(&raw),
            None => Vec::new(),
        };
        // Absent channels are neutral. A longer sample is left for the codec
        // to reject rather than silently cut.
        if channels.len() < self.codec.channel_count() {
            channels.resize(self.codec.channel_count(), 0.0);
        }
        match self.codec.encode(&channels) {
            Ok(frame) => self.bridge.send_frame(&frame),
            Err(e) => {
                warn!(robot_id = %self.bridge.robot_id(), error = %e, "control frame not encodable");
                false
            }
        }
    }

    /// Run until the session halts, the bridge closes or the bus shuts
    /// down. `sessions` must be subscribed to the sessions topic.
    pub async fn run(mut self, mut sessions: TopicReceiver) -> LoopExit {
        info!(
            robot_id = %self.bridge.robot_id(),
            session_id = %self.bridge.session_id(),
            input = self.input.id(),
            tick_ms = self.config.tick.as_millis() as u64,
            "control loop started"
        );
        // The session may have moved before we subscribed.
        if let Some(exit) = self.check_registry() {
            return exit;
        }

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                received = sessions.recv() => match received {
                    Ok(event) => {
                        if let Some(exit) = self.on_event(&event) {
                            return exit;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "session events lagged; checking registry");
                        if let Some(exit) = self.check_registry() {
                            return exit;
                        }
                    }
                    Err(RecvError::Closed) => {
                        self.bridge.teardown("event bus closed");
                        return LoopExit::BusClosed;
                    }
                },
                _ = ticker.tick() => {
                    if self.bridge.is_torn_down() {
                        return LoopExit::TransportClosed;
                    }
                    self.tick_once();
                }
            }
        }
    }

    fn on_event(&self, event: &Event) -> Option<LoopExit> {
        match &event.payload {
            EventPayload::SessionTransition { session_id, to, .. }
                if *session_id == self.bridge.session_id() && to.halts_control() =>
            {
                Some(self.halt(*to))
            }
            _ => None,
        }
    }

    fn check_registry(&self) -> Option<LoopExit> {
        match self.bridge.session_status() {
            Some(status) if !status.halts_control() => None,
            Some(status) => Some(self.halt(status)),
            None => {
                self.bridge.teardown("session no longer open");
                Some(LoopExit::SessionGone)
            }
        }
    }

    fn halt(&self, status: SessionStatus) -> LoopExit {
        let robot_id = self.bridge.robot_id();
        let (level, message) = match status {
            SessionStatus::RebootDisconnectRequested => (NoticeLevel::Warning, "Robot is rebooting"),
            SessionStatus::DisconnectRequested => {
                (NoticeLevel::Info, "Disconnect requested, waiting for the robot")
            }
            _ => (NoticeLevel::Info, "Control released"),
        };
        self.notifier.notify(Notice::new(level, Some(robot_id), message));
        // Graceful statuses keep the channel up for the robot's ack.
        if status == SessionStatus::Disconnected {
            self.bridge.teardown("session disconnected");
        }
        let stats = self.bridge.stats();
        info!(robot_id, %status, sent = stats.sent, dropped = stats.dropped, "control loop halted");
        LoopExit::Halted(status)
    }
}
