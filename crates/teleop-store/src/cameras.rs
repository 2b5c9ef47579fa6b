//! Per-robot camera descriptors.
//!
//! A sync from the robot replaces the whole set in one transaction, so no
//! reader ever sees a robot with its cameras half-deleted. Activation clears
//! every other descriptor of the robot before setting the chosen one.

use std::sync::Arc;

use rusqlite::{Connection, Row, TransactionBehavior, params};
use teleop_middleware::{EventBus, Topic};
use teleop_types::{CameraDescriptor, CameraSpec, Event, EventPayload};
use tracing::info;
use uuid::Uuid;

use crate::db::Database;
use crate::error::StoreError;
use crate::telemetry::robot_exists;

const SOURCE: &str = "teleop-store::cameras";

#[derive(Clone)]
pub struct CameraRegistry {
    db: Database,
    bus: Option<Arc<EventBus>>,
}

impl CameraRegistry {
    pub fn new(db: Database) -> Self {
        Self { db, bus: None }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Replace the camera set of `robot_id` with `cameras`. Every new
    /// descriptor starts inactive.
    pub fn sync(
        &self,
        robot_id: &str,
        cameras: &[CameraSpec],
    ) -> Result<Vec<CameraDescriptor>, StoreError> {
        let descriptors = {
            let mut conn = self.db.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !robot_exists(&tx, robot_id)? {
                return Err(StoreError::RobotNotFound(robot_id.to_string()));
            }
            tx.execute("DELETE FROM robot_cameras WHERE robot_id = ?1", params![robot_id])?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO robot_cameras (id, robot_id, name, port, active)
                     VALUES (?1, ?2, ?3, ?4, 0)",
                )?;
                for spec in cameras {
                    insert.execute(params![
                        Uuid::new_v4().to_string(),
                        robot_id,
                        spec.name,
                        spec.port
                    ])?;
                }
            }
            let descriptors = fetch_all(&tx, robot_id)?;
            tx.commit()?;
            descriptors
        };
        info!(robot_id, count = descriptors.len(), "camera set replaced");
        self.publish(robot_id);
        Ok(descriptors)
    }

    /// Cameras of `robot_id`, ordered by port.
    pub fn list(&self, robot_id: &str) -> Result<Vec<CameraDescriptor>, StoreError> {
        let conn = self.db.lock();
        Ok(fetch_all(&conn, robot_id)?)
    }

    /// Make `camera_id` the single active camera of `robot_id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::CameraNotFound`] when the camera does not belong to the
    /// robot; the previous active camera is left as it was.
    pub fn activate(&self, robot_id: &str, camera_id: &str) -> Result<CameraDescriptor, StoreError> {
        let activated = {
            let mut conn = self.db.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE robot_cameras SET active = 0 WHERE robot_id = ?1",
                params![robot_id],
            )?;
            let changed = tx.execute(
                "UPDATE robot_cameras SET active = 1 WHERE robot_id = ?1 AND id = ?2",
                params![robot_id, camera_id],
            )?;
            if changed == 0 {
                return Err(StoreError::CameraNotFound {
                    robot_id: robot_id.to_string(),
                    camera_id: camera_id.to_string(),
                });
            }
            let activated = tx.query_row(
                "SELECT id, robot_id, name, port, active FROM robot_cameras WHERE id = ?1",
                params![camera_id],
                row_to_descriptor,
            )?;
            tx.commit()?;
            activated
        };
        info!(robot_id, camera_id, "camera activated");
        self.publish(robot_id);
        Ok(activated)
    }

    /// The active camera of `robot_id`, if one is selected.
    pub fn active(&self, robot_id: &str) -> Result<Option<CameraDescriptor>, StoreError> {
        Ok(self.list(robot_id)?.into_iter().find(|c| c.active))
    }

    fn publish(&self, robot_id: &str) {
        if let Some(bus) = &self.bus {
            let event = Event::new(
                SOURCE,
                EventPayload::CamerasChanged {
                    robot_id: robot_id.to_string(),
                },
            );
            bus.publish_to(Topic::Cameras, event);
        }
    }
}

fn fetch_all(conn: &Connection, robot_id: &str) -> rusqlite::Result<Vec<CameraDescriptor>> {
    let mut stmt = conn.prepare(
        "SELECT id, robot_id, name, port, active FROM robot_cameras
          WHERE robot_id = ?1
          ORDER BY port ASC, name ASC",
    )?;
    let rows = stmt.query_map(params![robot_id], row_to_descriptor)?;
    rows.collect()
}

fn row_to_descriptor(row: &Row<'_>) -> rusqlite::Result<CameraDescriptor> {
    Ok(CameraDescriptor {
        id: row.get(0)?,
        robot_id: row.get(1)?,
        name: row.get(2)?,
        port: row.get(3)?,
        active: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryStore;

    fn spec(name: &str, port: &str) -> CameraSpec {
        CameraSpec {
            name: name.to_string(),
            port: port.to_string(),
        }
    }

    fn registry_with_robot(robot_id: &str) -> CameraRegistry {
        let db = Database::open_in_memory().unwrap();
        TelemetryStore::new(db.clone()).register(robot_id, None).unwrap();
        CameraRegistry::new(db)
    }

    #[test]
    fn sync_replaces_the_whole_set() {
        let cameras = registry_with_robot("R1");
        cameras
            .sync("R1", &[spec("front", "5002"), spec("rear", "5001")])
            .unwrap();
        let listed = cameras.list("R1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].port, "5001", "listing is ordered by port");
        assert!(listed.iter().all(|c| !c.active));

        let replaced = cameras.sync("R1", &[spec("belly", "6000")]).unwrap();
        assert_eq!(replaced.len(), 1);
        assert_eq!(cameras.list("R1").unwrap(), replaced);
    }

    #[test]
    fn sync_with_empty_list_clears_cameras() {
        let cameras = registry_with_robot("R1");
        cameras.sync("R1", &[spec("front", "5000")]).unwrap();
        assert!(cameras.sync("R1", &[]).unwrap().is_empty());
    }

    #[test]
    fn sync_for_unknown_robot_fails() {
        let cameras = registry_with_robot("R1");
        let err = cameras.sync("R2", &[spec("front", "5000")]).unwrap_err();
        assert!(matches!(err, StoreError::RobotNotFound(_)));
        assert!(cameras.list("R2").unwrap().is_empty());
    }

    #[test]
    fn activation_is_exclusive() {
        let cameras = registry_with_robot("R1");
        let set = cameras
            .sync("R1", &[spec("front", "5000"), spec("rear", "5001")])
            .unwrap();

        cameras.activate("R1", &set[0].id).unwrap();
        let active = cameras.activate("R1", &set[1].id).unwrap();
        assert!(active.active);

        let listed = cameras.list("R1").unwrap();
        assert_eq!(listed.iter().filter(|c| c.active).count(), 1);
        assert_eq!(cameras.active("R1").unwrap().unwrap().id, set[1].id);
    }

    #[test]
    fn activating_unknown_camera_keeps_previous_selection() {
        let cameras = registry_with_robot("R1");
        let set = cameras.sync("R1", &[spec("front", "5000")]).unwrap();
        cameras.activate("R1", &set[0].id).unwrap();

        let err = cameras.activate("R1", "nope").unwrap_err();
        assert_eq!(err.code(), "CAMERA_NOT_FOUND");
        assert_eq!(cameras.active("R1").unwrap().unwrap().id, set[0].id);
    }

    #[test]
    fn camera_ids_are_scoped_to_their_robot() {
        let db = Database::open_in_memory().unwrap();
        let robots = TelemetryStore::new(db.clone());
        robots.register("R1", None).unwrap();
        robots.register("R2", None).unwrap();
        let cameras = CameraRegistry::new(db);
        let r1 = cameras.sync("R1", &[spec("front", "5000")]).unwrap();
        cameras.sync("R2", &[spec("front", "5000")]).unwrap();

        assert!(cameras.activate("R2", &r1[0].id).is_err());
        assert!(cameras.active("R2").unwrap().is_none());
    }
}
