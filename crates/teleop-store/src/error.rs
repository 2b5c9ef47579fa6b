use thiserror::Error;

/// Errors that can arise from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Robot {0} is already under control")]
    SessionConflict(String),
    #[error("No eligible control session for robot {0}")]
    SessionNotFound(String),
    #[error("Robot not found: {0}")]
    RobotNotFound(String),
    #[error("Camera {camera_id} not found on robot {robot_id}")]
    CameraNotFound { robot_id: String, camera_id: String },
    #[error("Invalid coordinate: lat {lat}, lng {lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },
    #[error("Robot ID is required")]
    InvalidRobotId,
}

impl StoreError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Sqlite(_) => "STORAGE_ERROR",
            StoreError::SessionConflict(_) => "SESSION_CONFLICT",
            StoreError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            StoreError::RobotNotFound(_) => "ROBOT_NOT_FOUND",
            StoreError::CameraNotFound { .. } => "CAMERA_NOT_FOUND",
            StoreError::InvalidCoordinate { .. } => "INVALID_COORDINATE",
            StoreError::InvalidRobotId => "INVALID_ROBOT_ID",
        }
    }
}
