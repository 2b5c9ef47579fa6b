//! Request/response protocol spoken over the gateway's WebSocket.
//!
//! One JSON request per text message, tagged by `op`:
//!
//! ```json
//! {"op":"create_session","robot_id":"R1","operator_id":7}
//! ```
//!
//! Every request gets exactly one response, either
//! `{"ok":true,"result":...}` or
//! `{"ok":false,"error":{"code":"SESSION_CONFLICT","message":"..."}}`.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use teleop_store::{StoreError, Stores, validate_robot_id};
use teleop_types::{CameraSpec, TelemetryReport};
use thiserror::Error;
use tracing::{debug, warn};

/// Default per-robot ceiling on accepted status reports.
pub const DEFAULT_TELEMETRY_RATE_PER_SEC: u32 = 20;

/// Idle robots are dropped from the rate limiter once every this many
/// status reports.
const LIMITER_PRUNE_EVERY: u64 = 1024;

/// Operations accepted by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    CreateSession {
        robot_id: String,
        operator_id: i64,
    },
    DisconnectSession {
        robot_id: String,
        #[serde(default)]
        reason: Option<String>,
        disconnected_by: String,
        #[serde(default)]
        force: bool,
    },
    ConfirmDisconnect {
        robot_id: String,
    },
    RequestReboot {
        robot_id: String,
        #[serde(default)]
        reason: Option<String>,
        requested_by: String,
    },
    ActivateMedia {
        robot_id: String,
    },
    DeactivateMedia {
        robot_id: String,
    },
    ReportStatus(TelemetryReport),
    SyncCameras {
        robot_id: String,
        cameras: Vec<CameraSpec>,
    },
    ActivateCamera {
        robot_id: String,
        camera_id: String,
    },
    ListCameras {
        robot_id: String,
    },
    RobotLiveness {
        robot_id: String,
    },
    ListRobots,
    /// JSON Schema of [`Request`].
    Schema,
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::CreateSession { .. } => "create_session",
            Request::DisconnectSession { .. } => "disconnect_session",
            Request::ConfirmDisconnect { .. } => "confirm_disconnect",
            Request::RequestReboot { .. } => "request_reboot",
            Request::ActivateMedia { .. } => "activate_media",
            Request::DeactivateMedia { .. } => "deactivate_media",
            Request::ReportStatus(_) => "report_status",
            Request::SyncCameras { .. } => "sync_cameras",
            Request::ActivateCamera { .. } => "activate_camera",
            Request::ListCameras { .. } => "list_cameras",
            Request::RobotLiveness { .. } => "robot_liveness",
            Request::ListRobots => "list_robots",
            Request::Schema => "schema",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(err: &GatewayError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Too many status reports from robot {0}")]
    RateLimited(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "BAD_REQUEST",
            GatewayError::RateLimited(_) => "RATE_LIMITED",
            GatewayError::Store(e) => e.code(),
            GatewayError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Executes requests against the stores.
#[derive(Clone)]
pub struct Dispatcher {
    stores: Stores,
    telemetry_limiter: Arc<DefaultKeyedRateLimiter<String>>,
    limiter_checks: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(stores: Stores) -> Self {
        Self::with_telemetry_rate(stores, DEFAULT_TELEMETRY_RATE_PER_SEC)
    }

    /// A rate of zero is raised to one report per second.
    pub fn with_telemetry_rate(stores: Stores, per_second: u32) -> Self {
        let rate = NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            stores,
            telemetry_limiter: Arc::new(RateLimiter::keyed(Quota::per_second(rate))),
            limiter_checks: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Parse and execute one text message.
    pub fn handle_text(&self, text: &str) -> Response {
        let request = match serde_json::from_str::<Request>(text) {
            Ok(request) => request,
            Err(e) => return Response::failure(&GatewayError::BadRequest(e.to_string())),
        };
        let op = request.op();
        match self.dispatch(request) {
            Ok(result) => Response::success(result),
            Err(e) => {
                debug!(op, code = e.code(), error = %e, "request failed");
                Response::failure(&e)
            }
        }
    }

    fn admit_status_report(&self, robot_id: &str) -> bool {
        let checks = self.limiter_checks.fetch_add(1, Ordering::Relaxed) + 1;
        if checks % LIMITER_PRUNE_EVERY == 0 {
            self.prune_idle_robots();
        }
        self.telemetry_limiter.check_key(&robot_id.to_string()).is_ok()
    }

    /// Forget robots whose report budget has fully refilled.
    fn prune_idle_robots(&self) {
        self.telemetry_limiter.retain_recent();
        self.telemetry_limiter.shrink_to_fit();
        debug!(tracked = self.telemetry_limiter.len(), "telemetry limiter pruned");
    }

    pub fn dispatch(&self, request: Request) -> Result<Value, GatewayError> {
        let s = &self.stores;
        let value = match request {
            Request::CreateSession {
                robot_id,
                operator_id,
            } => serde_json::to_value(s.sessions.create_session(&robot_id, operator_id)?)?,
            Request::DisconnectSession {
                robot_id,
                reason,
                disconnected_by,
                force,
            } => serde_json::to_value(s.sessions.disconnect_session(
                &robot_id,
                reason.as_deref(),
                &disconnected_by,
                force,
            )?)?,
            Request::ConfirmDisconnect { robot_id } => {
                serde_json::to_value(s.sessions.confirm_disconnect(&robot_id)?)?
            }
            Request::RequestReboot {
                robot_id,
                reason,
                requested_by,
            } => serde_json::to_value(s.sessions.request_reboot(
                &robot_id,
                reason.as_deref(),
                &requested_by,
            )?)?,
            Request::ActivateMedia { robot_id } => {
                serde_json::to_value(s.sessions.activate_media(&robot_id)?)?
            }
            Request::DeactivateMedia { robot_id } => {
                serde_json::to_value(s.sessions.deactivate_media(&robot_id)?)?
            }
            Request::ReportStatus(report) => {
                // Only ids the store would accept get a limiter slot.
                validate_robot_id(&report.robot_id)?;
                if !self.admit_status_report(&report.robot_id) {
                    warn!(robot_id = %report.robot_id, "status report rate limited");
                    return Err(GatewayError::RateLimited(report.robot_id));
                }
                serde_json::to_value(s.telemetry.report_status(&report)?)?
            }
            Request::SyncCameras { robot_id, cameras } => {
                serde_json::to_value(s.cameras.sync(&robot_id, &cameras)?)?
            }
            Request::ActivateCamera {
                robot_id,
                camera_id,
            } => serde_json::to_value(s.cameras.activate(&robot_id, &camera_id)?)?,
            Request::ListCameras { robot_id } => serde_json::to_value(s.cameras.list(&robot_id)?)?,
            Request::RobotLiveness { robot_id } => {
                serde_json::to_value(s.telemetry.liveness(&robot_id)?)?
            }
            Request::ListRobots => serde_json::to_value(s.telemetry.list()?)?,
            Request::Schema => serde_json::to_value(schema_for!(Request))?,
        };
        Ok(value)
    }
}
