//! [`Notifier`] – how components surface messages to the human operator.
//!
//! Components that need to tell the operator something ("control released
//! by administrator", "robot is rebooting") take an `Arc<dyn Notifier>` at
//! construction time instead of reaching for a process-wide callback.

use std::sync::{Arc, Mutex};

use teleop_types::{Event, EventPayload, Notice, NoticeLevel};
use tracing::{error, info, warn};

use crate::bus::{EventBus, Topic};

/// Sink for user-facing notices.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the `tracing` log. The default for headless runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        let robot_id = notice.robot_id.as_deref().unwrap_or("-");
        match notice.level {
            NoticeLevel::Info => info!(robot_id, message = %notice.message, "notice"),
            NoticeLevel::Warning => warn!(robot_id, message = %notice.message, "notice"),
            NoticeLevel::Error => error!(robot_id, message = %notice.message, "notice"),
        }
    }
}

/// Publishes notices on [`Topic::SystemAlerts`] so that connected operator
/// clients receive them.
#[derive(Debug, Clone)]
pub struct BusNotifier {
    bus: Arc<EventBus>,
}

impl BusNotifier {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl Notifier for BusNotifier {
    fn notify(&self, notice: Notice) {
        let event = Event::new("teleop-middleware::notifier", EventPayload::Notice(notice));
        self.bus.publish_to(Topic::SystemAlerts, event);
    }
}

/// Keeps every notice in memory. Useful for tests and for UIs that render a
/// backlog.
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all notices received so far.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notice);
    }
}
