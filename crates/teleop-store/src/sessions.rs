//! Control-session state machine.
//!
//! ```text
//!                 create
//!                   │
//!                   ▼
//!   ┌────────── ACTIVE ◄──── deactivate ────┐
//!   │  reboot     │   └──── activate ───► ACTIVE_WEBRTC
//!   ▼             │ disconnect                 │ disconnect
//! REBOOT_DISCONNECT_REQUESTED   ▼              ▼
//!   │          DISCONNECT_REQUESTED ◄──────────┘
//!   │ confirm           │ confirm
//!   └──────► DISCONNECTED ◄┘   (forced disconnect jumps here from any state)
//! ```
//!
//! At most one session per robot may be in an occupying status. Every
//! mutation runs in a `BEGIN IMMEDIATE` transaction on the shared
//! connection, and a partial unique index on `control_sessions` backs the
//! rule at the storage level.
//!
//! Transitions are published on [`Topic::Sessions`] after commit so the
//! control loop can halt without polling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use teleop_middleware::{EventBus, Topic};
use teleop_types::{ControlSession, Event, EventPayload, SessionStatus};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::db::{Database, fmt_ts, is_constraint_violation, parse_opt_ts, parse_ts, stamp};
use crate::error::StoreError;
use crate::telemetry::robot_exists;

const SOURCE: &str = "teleop-store::sessions";

const SELECT_SESSION: &str = "SELECT id, robot_id, operator_id, status, created_at,
        last_heartbeat_at, disconnect_reason, disconnected_by, disconnect_at
   FROM control_sessions";

/// Requests that move an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    ActivateMedia,
    DeactivateMedia,
    Disconnect { force: bool },
    Confirm,
    Reboot,
}

/// Outcome of applying a [`Command`] to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Move(SessionStatus),
    /// Already where the command leads; return the session unchanged.
    Stay,
    /// Not eligible; surfaces as [`StoreError::SessionNotFound`].
    Reject,
}

fn step(status: SessionStatus, command: Command) -> Step {
    use SessionStatus::*;
    match (command, status) {
        (_, Disconnected) => Step::Reject,

        (Command::ActivateMedia, Active) => Step::Move(ActiveWebrtc),
        (Command::ActivateMedia, ActiveWebrtc) => Step::Stay,
        (Command::ActivateMedia, _) => Step::Reject,

        (Command::DeactivateMedia, ActiveWebrtc) => Step::Move(Active),
        (Command::DeactivateMedia, Active) => Step::Stay,
        (Command::DeactivateMedia, _) => Step::Reject,

        (Command::Disconnect { force: true }, _) => Step::Move(Disconnected),
        (Command::Disconnect { force: false }, Active | ActiveWebrtc) => {
            Step::Move(DisconnectRequested)
        }
        (Command::Disconnect { force: false }, _) => Step::Stay,

        (Command::Confirm, DisconnectRequested | RebootDisconnectRequested) => {
            Step::Move(Disconnected)
        }
        (Command::Confirm, _) => Step::Reject,

        (Command::Reboot, Active) => Step::Move(RebootDisconnectRequested),
        (Command::Reboot, RebootDisconnectRequested) => Step::Stay,
        (Command::Reboot, _) => Step::Reject,
    }
}

/// Who asked for a teardown and why. Stored on the session.
#[derive(Debug, Clone, Copy, Default)]
struct Attribution<'a> {
    reason: Option<&'a str>,
    by: Option<&'a str>,
}

struct Transition {
    session: ControlSession,
    from: Option<SessionStatus>,
}

/// Arbitrates exclusive control of robots.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Database,
    clock: Arc<dyn Clock>,
    bus: Option<Arc<EventBus>>,
}

impl SessionRegistry {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
            bus: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Open a new `ACTIVE` session for `operator_id` on `robot_id`.
    ///
    /// The occupancy check and the insert share one immediate transaction:
    /// concurrent callers racing on the same robot get exactly one success.
    ///
    /// # Errors
    ///
    /// [`StoreError::RobotNotFound`] for an unregistered robot,
    /// [`StoreError::SessionConflict`] when the robot is already occupied.
    pub fn create_session(&self, robot_id: &str, operator_id: i64) -> Result<ControlSession, StoreError> {
        let now = stamp(self.clock.as_ref());
        let session = ControlSession {
            id: Uuid::new_v4(),
            robot_id: robot_id.to_string(),
            operator_id,
            status: SessionStatus::Active,
            created_at: now,
            last_heartbeat_at: now,
            disconnect_reason: None,
            disconnected_by: None,
            disconnect_at: None,
        };
        {
            let mut conn = self.db.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if !robot_exists(&tx, robot_id)? {
                return Err(StoreError::RobotNotFound(robot_id.to_string()));
            }
            if occupying(&tx, robot_id)?.is_some() {
                debug!(robot_id, operator_id, "create_session refused: robot occupied");
                return Err(StoreError::SessionConflict(robot_id.to_string()));
            }
            let ts = fmt_ts(now);
            tx.execute(
                "INSERT INTO control_sessions
                    (id, robot_id, operator_id, status, created_at, last_heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    session.id.to_string(),
                    robot_id,
                    operator_id,
                    SessionStatus::Active.as_str(),
                    ts
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::SessionConflict(robot_id.to_string())
                } else {
                    StoreError::Sqlite(e)
                }
            })?;
            tx.commit()?;
        }
        self.announce(&Transition {
            session: session.clone(),
            from: None,
        });
        Ok(session)
    }

    /// Release control of `robot_id`.
    ///
    /// `force = false` requests a graceful teardown (`DISCONNECT_REQUESTED`)
    /// that the robot confirms later; `force = true` ends the session now.
    /// Repeating the call on a session that is already past that point
    /// returns it unchanged, including one that is already `DISCONNECTED`.
    pub fn disconnect_session(
        &self,
        robot_id: &str,
        reason: Option<&str>,
        disconnected_by: &str,
        force: bool,
    ) -> Result<ControlSession, StoreError> {
        self.apply(
            robot_id,
            Command::Disconnect { force },
            Attribution {
                reason,
                by: Some(disconnected_by),
            },
        )
    }

    /// The robot acknowledged teardown.
    pub fn confirm_disconnect(&self, robot_id: &str) -> Result<ControlSession, StoreError> {
        self.apply(robot_id, Command::Confirm, Attribution::default())
    }

    /// Ask the robot to drop the session ahead of a reboot.
    pub fn request_reboot(
        &self,
        robot_id: &str,
        reason: Option<&str>,
        requested_by: &str,
    ) -> Result<ControlSession, StoreError> {
        self.apply(
            robot_id,
            Command::Reboot,
            Attribution {
                reason,
                by: Some(requested_by),
            },
        )
    }

    pub fn activate_media(&self, robot_id: &str) -> Result<ControlSession, StoreError> {
        self.apply(robot_id, Command::ActivateMedia, Attribution::default())
    }

    pub fn deactivate_media(&self, robot_id: &str) -> Result<ControlSession, StoreError> {
        self.apply(robot_id, Command::DeactivateMedia, Attribution::default())
    }

    /// The occupying session of `robot_id`, if any.
    pub fn current(&self, robot_id: &str) -> Result<Option<ControlSession>, StoreError> {
        let conn = self.db.lock();
        Ok(occupying(&conn, robot_id)?)
    }

    /// Every session ever opened on `robot_id`, newest first.
    pub fn history(&self, robot_id: &str) -> Result<Vec<ControlSession>, StoreError> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_SESSION} WHERE robot_id = ?1 ORDER BY created_at DESC, rowid DESC"
        ))?;
        let rows = stmt.query_map(params![robot_id], row_to_session)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Refresh `last_heartbeat_at` of the occupying session.
    pub fn heartbeat(&self, robot_id: &str) -> Result<ControlSession, StoreError> {
        let now = fmt_ts(stamp(self.clock.as_ref()));
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE control_sessions SET last_heartbeat_at = ?2
              WHERE robot_id = ?1 AND status <> 'disconnected'",
            params![robot_id, now],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionNotFound(robot_id.to_string()));
        }
        occupying(&conn, robot_id)?.ok_or_else(|| StoreError::SessionNotFound(robot_id.to_string()))
    }

    /// Force-disconnect every occupying session. Used at shutdown.
    pub fn disconnect_all(&self, reason: &str, disconnected_by: &str) -> Result<Vec<ControlSession>, StoreError> {
        let now = stamp(self.clock.as_ref());
        let transitions = {
            let mut conn = self.db.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let open = {
                let mut stmt = tx.prepare(&format!(
                    "{SELECT_SESSION} WHERE status <> 'disconnected' ORDER BY robot_id"
                ))?;
                let rows = stmt.query_map([], row_to_session)?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            let attribution = Attribution {
                reason: Some(reason),
                by: Some(disconnected_by),
            };
            let mut transitions = Vec::with_capacity(open.len());
            for session in open {
                transitions.push(move_session(&tx, session, SessionStatus::Disconnected, attribution, now)?);
            }
            tx.commit()?;
            transitions
        };
        for t in &transitions {
            self.announce(t);
        }
        Ok(transitions.into_iter().map(|t| t.session).collect())
    }

    fn apply(
        &self,
        robot_id: &str,
        command: Command,
        attribution: Attribution<'_>,
    ) -> Result<ControlSession, StoreError> {
        let now = stamp(self.clock.as_ref());
        let transition = {
            let mut conn = self.db.lock();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(session) = occupying(&tx, robot_id)? else {
                // A disconnect that already completed is answered with the
                // finished session.
                if matches!(command, Command::Disconnect { .. })
                    && let Some(last) = latest(&tx, robot_id)?
                {
                    return Ok(last);
                }
                return Err(StoreError::SessionNotFound(robot_id.to_string()));
            };
            match step(session.status, command) {
                Step::Reject => {
                    debug!(robot_id, status = %session.status, ?command, "transition refused");
                    return Err(StoreError::SessionNotFound(robot_id.to_string()));
                }
                Step::Stay => return Ok(session),
                Step::Move(to) => {
                    let transition = move_session(&tx, session, to, attribution, now)?;
                    tx.commit()?;
                    transition
                }
            }
        };
        self.announce(&transition);
        Ok(transition.session)
    }

    fn announce(&self, transition: &Transition) {
        let session = &transition.session;
        info!(
            robot_id = %session.robot_id,
            session_id = %session.id,
            from = transition.from.map(|s| s.as_str()).unwrap_or("none"),
            to = %session.status,
            "session transition"
        );
        if let Some(bus) = &self.bus {
            let event = Event::new(
                SOURCE,
                EventPayload::SessionTransition {
                    session_id: session.id,
                    robot_id: session.robot_id.clone(),
                    from: transition.from,
                    to: session.status,
                },
            );
            bus.publish_to(Topic::Sessions, event);
        }
    }
}

fn move_session(
    conn: &Connection,
    mut session: ControlSession,
    to: SessionStatus,
    attribution: Attribution<'_>,
    now: DateTime<Utc>,
) -> rusqlite::Result<Transition> {
    let from = session.status;
    session.status = to;
    if let Some(reason) = attribution.reason {
        session.disconnect_reason = Some(reason.to_string());
    }
    if let Some(by) = attribution.by {
        session.disconnected_by = Some(by.to_string());
    }
    if to == SessionStatus::Disconnected {
        session.disconnect_at = Some(now);
    }
    conn.execute(
        "UPDATE control_sessions
            SET status = ?2, disconnect_reason = ?3, disconnected_by = ?4, disconnect_at = ?5
          WHERE id = ?1",
        params![
            session.id.to_string(),
            to.as_str(),
            session.disconnect_reason,
            session.disconnected_by,
            session.disconnect_at.map(fmt_ts),
        ],
    )?;
    Ok(Transition {
        session,
        from: Some(from),
    })
}

fn occupying(conn: &Connection, robot_id: &str) -> rusqlite::Result<Option<ControlSession>> {
    conn.query_row(
        &format!("{SELECT_SESSION} WHERE robot_id = ?1 AND status <> 'disconnected'"),
        params![robot_id],
        row_to_session,
    )
    .optional()
}

fn latest(conn: &Connection, robot_id: &str) -> rusqlite::Result<Option<ControlSession>> {
    conn.query_row(
        &format!("{SELECT_SESSION} WHERE robot_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1"),
        params![robot_id],
        row_to_session,
    )
    .optional()
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<ControlSession> {
    let id: String = row.get(0)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let last_heartbeat_at: String = row.get(5)?;
    Ok(ControlSession {
        id: Uuid::parse_str(&id)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
        robot_id: row.get(1)?,
        operator_id: row.get(2)?,
        status: SessionStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                3,
                Type::Text,
                format!("unknown session status {status:?}").into(),
            )
        })?,
        created_at: parse_ts(4, &created_at)?,
        last_heartbeat_at: parse_ts(5, &last_heartbeat_at)?,
        disconnect_reason: row.get(6)?,
        disconnected_by: row.get(7)?,
        disconnect_at: parse_opt_ts(8, row.get(8)?)?,
    })
}
