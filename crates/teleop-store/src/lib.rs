//! `teleop-store` – The Knowledge Base.
//!
//! Holds everything the core remembers about robots and who controls them,
//! on a local SQLite substrate.
//!
//! # Modules
//!
//! - [`db`] – [`Database`][db::Database]: the shared connection handle and
//!   schema.
//! - [`clock`] – [`Clock`][clock::Clock]: injectable time source so that
//!   liveness and session timestamps can be tested deterministically.
//! - [`telemetry`] – [`TelemetryStore`][telemetry::TelemetryStore]: latest
//!   reported state per robot and the derived online/offline view.
//! - [`cameras`] – [`CameraRegistry`][cameras::CameraRegistry]: per-robot
//!   video sources, replaced wholesale on sync, with one exclusive active
//!   camera.
//! - [`sessions`] – [`SessionRegistry`][sessions::SessionRegistry]: the
//!   control-session state machine enforcing at most one occupying session
//!   per robot.
//!
//! [`Stores`] bundles the three registries over one database so callers can
//! wire them in one place.

use std::sync::Arc;
use std::time::Duration;

use teleop_middleware::EventBus;

pub mod cameras;
pub mod clock;
pub mod db;
pub mod error;
pub mod sessions;
pub mod telemetry;

pub use cameras::CameraRegistry;
pub use clock::{Clock, ManualClock, SystemClock};
pub use db::Database;
pub use error::StoreError;
pub use sessions::SessionRegistry;
pub use telemetry::{DEFAULT_OFFLINE_TIMEOUT, TelemetryStore, validate_robot_id};

/// Telemetry, camera and session registries sharing one [`Database`], one
/// [`Clock`] and, optionally, one [`EventBus`].
#[derive(Clone)]
pub struct Stores {
    pub telemetry: TelemetryStore,
    pub cameras: CameraRegistry,
    pub sessions: SessionRegistry,
}

impl Stores {
    pub fn new(db: Database) -> Self {
        Self::with_parts(db, Arc::new(SystemClock), DEFAULT_OFFLINE_TIMEOUT, None)
    }

    pub fn with_parts(
        db: Database,
        clock: Arc<dyn Clock>,
        offline_timeout: Duration,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let mut telemetry = TelemetryStore::new(db.clone())
            .with_clock(Arc::clone(&clock))
            .with_offline_timeout(offline_timeout);
        let mut cameras = CameraRegistry::new(db.clone());
        let mut sessions = SessionRegistry::new(db).with_clock(clock);
        if let Some(bus) = bus {
            telemetry = telemetry.with_bus(Arc::clone(&bus));
            cameras = cameras.with_bus(Arc::clone(&bus));
            sessions = sessions.with_bus(bus);
        }
        Self {
            telemetry,
            cameras,
            sessions,
        }
    }
}
