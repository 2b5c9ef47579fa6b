//! Latest reported state per robot and the derived liveness view.
//!
//! Reports are upserts: the first report for an unknown robot registers it,
//! later reports overwrite only the fields they carry. Liveness is computed
//! at read time from `last_update`; nothing sweeps in the background.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use teleop_middleware::{EventBus, Topic};
use teleop_types::{Event, EventPayload, Liveness, Position, RobotState, TelemetryReport};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::db::{Database, fmt_ts, parse_opt_ts, stamp};
use crate::error::StoreError;

/// A robot is offline once its last report is older than this.
pub const DEFAULT_OFFLINE_TIMEOUT: Duration = Duration::from_secs(10);

const SOURCE: &str = "teleop-store::telemetry";

const SELECT_ROBOT: &str = "SELECT robot_id, name, status, battery, cpu, memory, disk,
        temperature, lat, lng, last_update
   FROM robots";

/// Read/write access to robot telemetry.
#[derive(Clone)]
pub struct TelemetryStore {
    db: Database,
    clock: Arc<dyn Clock>,
    offline_timeout: Duration,
    bus: Option<Arc<EventBus>>,
}

impl TelemetryStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
            offline_timeout: DEFAULT_OFFLINE_TIMEOUT,
            bus: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_offline_timeout(mut self, timeout: Duration) -> Self {
        self.offline_timeout = timeout;
        self
    }

    /// Publish [`EventPayload::TelemetryUpdated`] on [`Topic::Telemetry`]
    /// after every accepted report.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn offline_timeout(&self) -> Duration {
        self.offline_timeout
    }

    /// Upsert the fields carried by `report` and stamp `last_update = now`.
    ///
    /// Validation happens before any write, so a rejected report leaves the
    /// stored state untouched.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidRobotId`] for a blank or padded id,
    /// [`StoreError::InvalidCoordinate`] for an out-of-range position.
    pub fn report_status(&self, report: &TelemetryReport) -> Result<RobotState, StoreError> {
        let robot_id = validate_robot_id(&report.robot_id)?;
        if let Some(pos) = report.position
            && !pos.is_valid()
        {
            warn!(robot_id, lat = pos.lat, lng = pos.lng, "rejected report with invalid position");
            return Err(StoreError::InvalidCoordinate {
                lat: pos.lat,
                lng: pos.lng,
            });
        }

        let now = fmt_ts(stamp(self.clock.as_ref()));
        let state = {
            let conn = self.db.lock();
            conn.execute(
                "INSERT INTO robots (robot_id, name, status, battery, cpu, memory, disk,
                                     temperature, lat, lng, last_update, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
                 ON CONFLICT(robot_id) DO UPDATE SET
                    name        = COALESCE(excluded.name, robots.name),
                    status      = COALESCE(excluded.status, robots.status),
                    battery     = COALESCE(excluded.battery, robots.battery),
                    cpu         = COALESCE(excluded.cpu, robots.cpu),
                    memory      = COALESCE(excluded.memory, robots.memory),
                    disk        = COALESCE(excluded.disk, robots.disk),
                    temperature = COALESCE(excluded.temperature, robots.temperature),
                    lat         = COALESCE(excluded.lat, robots.lat),
                    lng         = COALESCE(excluded.lng, robots.lng),
                    last_update = excluded.last_update",
                params![
                    robot_id,
                    report.name,
                    report.status,
                    report.battery,
                    report.cpu,
                    report.memory,
                    report.disk,
                    report.temperature,
                    report.position.map(|p| p.lat),
                    report.position.map(|p| p.lng),
                    now,
                ],
            )?;
            fetch(&conn, robot_id)?.ok_or_else(|| StoreError::RobotNotFound(robot_id.to_string()))?
        };
        debug!(robot_id, "telemetry report accepted");

        if let Some(bus) = &self.bus {
            let event = Event::new(
                SOURCE,
                EventPayload::TelemetryUpdated {
                    robot_id: robot_id.to_string(),
                },
            );
            bus.publish_to(Topic::Telemetry, event);
        }
        Ok(state)
    }

    /// Register a robot administratively. An existing robot keeps its
    /// telemetry; its name is replaced when `name` is given.
    pub fn register(&self, robot_id: &str, name: Option<&str>) -> Result<RobotState, StoreError> {
        let robot_id = validate_robot_id(robot_id)?;
        let now = fmt_ts(stamp(self.clock.as_ref()));
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO robots (robot_id, name, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(robot_id) DO UPDATE SET name = COALESCE(excluded.name, robots.name)",
            params![robot_id, name, now],
        )?;
        info!(robot_id, "robot registered");
        fetch(&conn, robot_id)?.ok_or_else(|| StoreError::RobotNotFound(robot_id.to_string()))
    }

    pub fn get(&self, robot_id: &str) -> Result<Option<RobotState>, StoreError> {
        let conn = self.db.lock();
        Ok(fetch(&conn, robot_id)?)
    }

    pub fn contains(&self, robot_id: &str) -> Result<bool, StoreError> {
        let conn = self.db.lock();
        Ok(robot_exists(&conn, robot_id)?)
    }

    /// All robots, most recently heard from first. Robots that never
    /// reported come last, ordered by id.
    pub fn list(&self) -> Result<Vec<RobotState>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_ROBOT} ORDER BY last_update IS NULL, last_update DESC, robot_id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_state)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn edit_name(&self, robot_id: &str, name: &str) -> Result<RobotState, StoreError> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE robots SET name = ?2 WHERE robot_id = ?1",
            params![robot_id, name],
        )?;
        if changed == 0 {
            return Err(StoreError::RobotNotFound(robot_id.to_string()));
        }
        fetch(&conn, robot_id)?.ok_or_else(|| StoreError::RobotNotFound(robot_id.to_string()))
    }

    /// Delete a robot and its camera descriptors. Session history is kept.
    pub fn remove(&self, robot_id: &str) -> Result<(), StoreError> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM robot_cameras WHERE robot_id = ?1", params![robot_id])?;
        let removed = tx.execute("DELETE FROM robots WHERE robot_id = ?1", params![robot_id])?;
        if removed == 0 {
            return Err(StoreError::RobotNotFound(robot_id.to_string()));
        }
        tx.commit()?;
        info!(robot_id, "robot removed");
        Ok(())
    }

    /// `true` iff the robot reported within the offline timeout. Robots that
    /// never reported, or are unknown, are offline.
    pub fn is_online(&self, robot_id: &str) -> Result<bool, StoreError> {
        Ok(self.liveness(robot_id)?.online)
    }

    pub fn liveness(&self, robot_id: &str) -> Result<Liveness, StoreError> {
        let last_update = self.get(robot_id)?.and_then(|s| s.last_update);
        let online = match last_update {
            None => false,
            Some(at) => {
                let elapsed = self.clock.now() - at;
                // A report stamped in the future (clock step) counts as fresh.
                elapsed
                    .to_std()
                    .map(|e| e <= self.offline_timeout)
                    .unwrap_or(true)
            }
        };
        Ok(Liveness {
            online,
            last_update,
        })
    }
}

/// Accept a robot id as stored: non-empty, with no surrounding whitespace.
///
/// Padded ids are rejected rather than trimmed so every lookup sees the same
/// key the writer stored.
pub fn validate_robot_id(robot_id: &str) -> Result<&str, StoreError> {
    if robot_id.trim().is_empty() || robot_id.trim() != robot_id {
        return Err(StoreError::InvalidRobotId);
    }
    Ok(robot_id)
}

pub(crate) fn robot_exists(conn: &Connection, robot_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM robots WHERE robot_id = ?1)",
        params![robot_id],
        |row| row.get(0),
    )
}

fn fetch(conn: &Connection, robot_id: &str) -> rusqlite::Result<Option<RobotState>> {
    conn.query_row(
        &format!("{SELECT_ROBOT} WHERE robot_id = ?1"),
        params![robot_id],
        row_to_state,
    )
    .optional()
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<RobotState> {
    let lat: Option<f64> = row.get(8)?;
    let lng: Option<f64> = row.get(9)?;
    Ok(RobotState {
        robot_id: row.get(0)?,
        name: row.get(1)?,
        status: row.get(2)?,
        battery: row.get(3)?,
        cpu: row.get(4)?,
        memory: row.get(5)?,
        disk: row.get(6)?,
        temperature: row.get(7)?,
        position: lat.zip(lng).map(|(lat, lng)| Position { lat, lng }),
        last_update: parse_opt_ts(10, row.get(10)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (TelemetryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = TelemetryStore::new(Database::open_in_memory().unwrap())
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        (store, clock)
    }

    #[test]
    fn liveness_follows_reports_and_timeout() {
        let (store, clock) = store_with_clock();
        assert!(!store.is_online("R1").unwrap());

        store.report_status(&TelemetryReport::new("R1")).unwrap();
        assert!(store.is_online("R1").unwrap());

        clock.advance(Duration::from_secs(10));
        assert!(store.is_online("R1").unwrap(), "exactly at the timeout is still online");

        clock.advance(Duration::from_secs(1));
        let liveness = store.liveness("R1").unwrap();
        assert!(!liveness.online);
        assert!(liveness.last_update.is_some());
    }

    #[test]
    fn registered_but_silent_robot_is_offline() {
        let (store, _clock) = store_with_clock();
        store.register("R1", Some("Rover")).unwrap();
        assert!(!store.is_online("R1").unwrap());
        assert_eq!(store.liveness("R1").unwrap().last_update, None);
    }

    #[test]
    fn invalid_latitude_rejects_whole_report() {
        let (store, _clock) = store_with_clock();
        let mut first = TelemetryReport::new("R1");
        first.battery = Some(80.0);
        store.report_status(&first).unwrap();

        let mut bad = TelemetryReport::new("R1");
        bad.battery = Some(10.0);
        bad.status = Some("armed".into());
        bad.position = Some(Position { lat: 91.0, lng: 0.0 });
        let err = store.report_status(&bad).unwrap_err();
        assert_eq!(err.code(), "INVALID_COORDINATE");

        let state = store.get("R1").unwrap().unwrap();
        assert_eq!(state.battery, Some(80.0));
        assert_eq!(state.status, None);
        assert_eq!(state.position, None);
    }

    #[test]
    fn invalid_report_for_unknown_robot_registers_nothing() {
        let (store, _clock) = store_with_clock();
        let mut bad = TelemetryReport::new("ghost");
        bad.position = Some(Position { lat: 0.0, lng: 200.0 });
        assert!(store.report_status(&bad).is_err());
        assert!(!store.contains("ghost").unwrap());
    }

    #[test]
    fn missing_fields_keep_previous_values() {
        let (store, clock) = store_with_clock();
        let mut first = TelemetryReport::new("R1");
        first.name = Some("Rover".into());
        first.battery = Some(90.0);
        first.position = Some(Position { lat: 40.4, lng: -3.7 });
        let before = store.report_status(&first).unwrap();

        clock.advance(Duration::from_secs(2));
        let mut second = TelemetryReport::new("R1");
        second.cpu = Some(35.0);
        let after = store.report_status(&second).unwrap();

        assert_eq!(after.name.as_deref(), Some("Rover"));
        assert_eq!(after.battery, Some(90.0));
        assert_eq!(after.cpu, Some(35.0));
        assert_eq!(after.position, Some(Position { lat: 40.4, lng: -3.7 }));
        assert!(after.last_update > before.last_update);
    }

    #[test]
    fn blank_robot_id_is_rejected() {
        let (store, _clock) = store_with_clock();
        let err = store.report_status(&TelemetryReport::new("   ")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRobotId));
        assert!(store.register("", None).is_err());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn padded_robot_id_is_rejected_not_trimmed() {
        let (store, _clock) = store_with_clock();
        for padded in [" R1", "R1 ", "\tR1\n"] {
            let err = store.report_status(&TelemetryReport::new(padded)).unwrap_err();
            assert!(matches!(err, StoreError::InvalidRobotId), "{padded:?}");
            assert!(matches!(store.register(padded, None), Err(StoreError::InvalidRobotId)));
        }
        assert!(store.list().unwrap().is_empty());

        // The id that is stored is the id every lookup uses.
        store.report_status(&TelemetryReport::new("R1")).unwrap();
        assert!(store.is_online("R1").unwrap());
        assert!(store.get("R1").unwrap().is_some());
        assert!(!store.is_online(" R1").unwrap());
    }

    #[test]
    fn list_orders_by_most_recent_report() {
        let (store, clock) = store_with_clock();
        store.register("idle", None).unwrap();
        store.report_status(&TelemetryReport::new("old")).unwrap();
        clock.advance(Duration::from_secs(1));
        store.report_status(&TelemetryReport::new("new")).unwrap();

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|r| r.robot_id).collect();
        assert_eq!(ids, vec!["new", "old", "idle"]);
    }

    #[test]
    fn edit_name_and_remove() {
        let (store, _clock) = store_with_clock();
        store.register("R1", None).unwrap();
        assert_eq!(
            store.edit_name("R1", "Scout").unwrap().name.as_deref(),
            Some("Scout")
        );
        assert!(matches!(
            store.edit_name("R9", "x"),
            Err(StoreError::RobotNotFound(_))
        ));

        store.remove("R1").unwrap();
        assert!(store.get("R1").unwrap().is_none());
        assert!(matches!(store.remove("R1"), Err(StoreError::RobotNotFound(_))));
    }

    #[tokio::test]
    async fn accepted_report_is_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe_to(Topic::Telemetry);
        let store = TelemetryStore::new(Database::open_in_memory().unwrap()).with_bus(bus);

        store.report_status(&TelemetryReport::new("R1")).unwrap();
        match rx.recv().await.unwrap().payload {
            EventPayload::TelemetryUpdated { robot_id } => assert_eq!(robot_id, "R1"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
