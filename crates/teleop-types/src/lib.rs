use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Number of continuous analog axes in a control frame.
pub const AXIS_COUNT: usize = 8;

/// Number of button channels in a control frame.
pub const BUTTON_COUNT: usize = 4;

/// Total channel count of a full control frame.
pub const CHANNEL_COUNT: usize = AXIS_COUNT + BUTTON_COUNT;

// ────────────────────────────────────────────────────────────────────────────
// Robots & telemetry
// ────────────────────────────────────────────────────────────────────────────

/// A geographic position reported by a robot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
}

impl Position {
    /// `true` when latitude lies in `[-90, 90]` and longitude in `[-180, 180]`.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Latest known state of one physical robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub robot_id: String,
    pub name: Option<String>,
    /// Free-form status string reported by the robot (e.g. `"armed"`).
    pub status: Option<String>,
    pub battery: Option<f64>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub disk: Option<f64>,
    pub temperature: Option<f64>,
    pub position: Option<Position>,
    /// `None` for robots registered administratively but never heard from.
    pub last_update: Option<DateTime<Utc>>,
}

/// Inbound status report sent by a robot.
///
/// Every field except `robot_id` is optional; absent fields leave the
/// previously stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TelemetryReport {
    /// Required. A missing id deserializes as empty and is rejected by the
    /// store.
    #[serde(default)]
    pub robot_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub battery: Option<f64>,
    #[serde(default)]
    pub cpu: Option<f64>,
    #[serde(default)]
    pub memory: Option<f64>,
    #[serde(default)]
    pub disk: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub position: Option<Position>,
}

impl TelemetryReport {
    /// An otherwise empty report for `robot_id`.
    pub fn new(robot_id: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            ..Self::default()
        }
    }
}

/// Derived liveness view of a robot. Never exposes raw internal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    pub online: bool,
    pub last_update: Option<DateTime<Utc>>,
}

// ────────────────────────────────────────────────────────────────────────────
// Cameras
// ────────────────────────────────────────────────────────────────────────────

/// A camera as announced by the robot during a sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CameraSpec {
    pub name: String,
    /// Network locator of the video source (port or address).
    pub port: String,
}

/// A stored video source of a robot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub id: String,
    pub robot_id: String,
    pub name: String,
    pub port: String,
    pub active: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Control sessions
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a [`ControlSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// The operator holds control; only the data channel is up.
    Active,
    /// The operator holds control and the media channel is live.
    ActiveWebrtc,
    /// Graceful teardown requested; waiting for the peer to acknowledge.
    DisconnectRequested,
    /// Teardown requested ahead of a robot reboot.
    RebootDisconnectRequested,
    /// Terminal. The session is immutable history.
    Disconnected,
}

impl SessionStatus {
    /// All statuses that hold, or are in the process of releasing, exclusive
    /// control of a robot.
    pub const OCCUPYING: [SessionStatus; 4] = [
        SessionStatus::Active,
        SessionStatus::ActiveWebrtc,
        SessionStatus::DisconnectRequested,
        SessionStatus::RebootDisconnectRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::ActiveWebrtc => "active_webrtc",
            SessionStatus::DisconnectRequested => "disconnect_requested",
            SessionStatus::RebootDisconnectRequested => "reboot_disconnect_requested",
            SessionStatus::Disconnected => "disconnected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "active_webrtc" => Some(SessionStatus::ActiveWebrtc),
            "disconnect_requested" => Some(SessionStatus::DisconnectRequested),
            "reboot_disconnect_requested" => Some(SessionStatus::RebootDisconnectRequested),
            "disconnected" => Some(SessionStatus::Disconnected),
            _ => None,
        }
    }

    pub fn is_occupying(&self) -> bool {
        !matches!(self, SessionStatus::Disconnected)
    }

    /// `true` when the control loop must stop emitting frames.
    ///
    /// Any status past the two active ones means teardown has begun.
    pub fn halts_control(&self) -> bool {
        !matches!(self, SessionStatus::Active | SessionStatus::ActiveWebrtc)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operator's claim on one robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSession {
    pub id: Uuid,
    pub robot_id: String,
    pub operator_id: i64,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub disconnect_reason: Option<String>,
    pub disconnected_by: Option<String>,
    pub disconnect_at: Option<DateTime<Utc>>,
}

// ────────────────────────────────────────────────────────────────────────────
// Event bus payloads
// ────────────────────────────────────────────────────────────────────────────

/// Severity of a user-facing [`Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A message meant for the human operator (e.g. "connection terminated by
/// administrator").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub robot_id: Option<String>,
    pub message: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, robot_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level,
            robot_id: robot_id.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "teleop-store::sessions"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A control session changed status. `from` is `None` on creation.
    SessionTransition {
        session_id: Uuid,
        robot_id: String,
        from: Option<SessionStatus>,
        to: SessionStatus,
    },
    /// A robot's telemetry was accepted.
    TelemetryUpdated { robot_id: String },
    /// A robot's camera set was replaced or its active camera changed.
    CamerasChanged { robot_id: String },
    /// User-facing message routed through the injected notifier.
    Notice(Notice),
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Cross-cutting error type for transport and bus plumbing.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TeleopError {
    #[error("Transport error on {channel}: {details}")]
    Transport { channel: String, details: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl TeleopError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TeleopError::Transport { .. } => "TRANSPORT_ERROR",
            TeleopError::ChannelClosed(_) => "CHANNEL_CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_string_roundtrip() {
        for status in SessionStatus::OCCUPYING
            .into_iter()
            .chain([SessionStatus::Disconnected])
        {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn only_disconnected_is_not_occupying() {
        assert!(SessionStatus::OCCUPYING.iter().all(|s| s.is_occupying()));
        assert!(!SessionStatus::Disconnected.is_occupying());
    }

    #[test]
    fn teardown_statuses_halt_control() {
        assert!(!SessionStatus::Active.halts_control());
        assert!(!SessionStatus::ActiveWebrtc.halts_control());
        assert!(SessionStatus::DisconnectRequested.halts_control());
        assert!(SessionStatus::RebootDisconnectRequested.halts_control());
        assert!(SessionStatus::Disconnected.halts_control());
    }

    #[test]
    fn position_bounds() {
        assert!(Position { lat: 90.0, lng: -180.0 }.is_valid());
        assert!(!Position { lat: 91.0, lng: 0.0 }.is_valid());
        assert!(!Position { lat: 0.0, lng: 180.5 }.is_valid());
        assert!(!Position { lat: f64::NAN, lng: 0.0 }.is_valid());
    }

    #[test]
    fn telemetry_report_missing_fields_deserialize_as_none() {
        let report: TelemetryReport =
            serde_json::from_str(r#"{"robot_id":"R1","battery":87.5}"#).unwrap();
        assert_eq!(report.robot_id, "R1");
        assert_eq!(report.battery, Some(87.5));
        assert!(report.position.is_none());
        assert!(report.name.is_none());
    }

    #[test]
    fn session_transition_event_serializes_with_kind_tag() {
        let event = Event::new(
            "teleop-store::sessions",
            EventPayload::SessionTransition {
                session_id: Uuid::new_v4(),
                robot_id: "R1".to_string(),
                from: Some(SessionStatus::Active),
                to: SessionStatus::DisconnectRequested,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""kind":"session_transition""#));
        assert!(json.contains("disconnect_requested"));
    }

    #[test]
    fn teleop_error_display() {
        let err = TeleopError::Transport {
            channel: "robot-control".to_string(),
            details: "socket closed".to_string(),
        };
        assert!(err.to_string().contains("robot-control"));
        assert_eq!(err.code(), "TRANSPORT_ERROR");
        assert_eq!(TeleopError::ChannelClosed("video".into()).code(), "CHANNEL_CLOSED");
    }

    #[test]
    fn frame_layout_is_axes_then_buttons() {
        assert_eq!(CHANNEL_COUNT, AXIS_COUNT + BUTTON_COUNT);
        assert_eq!((AXIS_COUNT, BUTTON_COUNT), (8, 4));
    }
}
