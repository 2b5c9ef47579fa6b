//! Reads and writes `~/.teleop/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persisted settings of the `teleop` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Port of the WebSocket gateway.
    #[serde(default = "default_gateway_port")]
    pub gateway_port: u16,

    /// SQLite file. Empty means an in-memory database.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// A robot silent for longer than this is offline.
    #[serde(default = "default_offline_timeout_secs")]
    pub offline_timeout_secs: u64,

    /// Control frame period.
    #[serde(default = "default_control_tick_ms")]
    pub control_tick_ms: u64,

    /// Input device polling period.
    #[serde(default = "default_input_poll_ms")]
    pub input_poll_ms: u64,

    #[serde(default = "default_deadzone")]
    pub deadzone: f64,

    /// Stored and validated; not applied to emitted frames.
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,

    #[serde(default = "default_channel_count")]
    pub channel_count: usize,

    /// Per-robot ceiling on status reports accepted by the gateway.
    #[serde(default = "default_telemetry_rate_per_sec")]
    pub telemetry_rate_per_sec: u32,

    /// Output axis `i` reads device axis `axis_map[i]`. Empty keeps the
    /// device order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub axis_map: Vec<usize>,
}

impl Config {
    pub fn offline_timeout(&self) -> Duration {
        Duration::from_secs(self.offline_timeout_secs)
    }

    pub fn control_tick(&self) -> Duration {
        Duration::from_millis(self.control_tick_ms.max(1))
    }
}

fn default_gateway_port() -> u16 {
    8080
}
fn default_database_path() -> String {
    config_dir_for_home(&home_dir())
        .join("teleop.db")
        .to_string_lossy()
        .into_owned()
}
fn default_offline_timeout_secs() -> u64 {
    10
}
fn default_control_tick_ms() -> u64 {
    100
}
fn default_input_poll_ms() -> u64 {
    10
}
fn default_deadzone() -> f64 {
    0.03
}
fn default_smoothing() -> f64 {
    0.25
}
fn default_channel_count() -> usize {
    12
}
fn default_telemetry_rate_per_sec() -> u32 {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway_port: default_gateway_port(),
            database_path: default_database_path(),
            offline_timeout_secs: default_offline_timeout_secs(),
            control_tick_ms: default_control_tick_ms(),
            input_poll_ms: default_input_poll_ms(),
            deadzone: default_deadzone(),
            smoothing: default_smoothing(),
            channel_count: default_channel_count(),
            telemetry_rate_per_sec: default_telemetry_rate_per_sec(),
            axis_map: Vec::new(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn config_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".teleop")
}

/// `~/.teleop/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    config_dir_for_home(home).join("config.toml")
}

/// Load the config, `None` when the file does not exist yet.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TELEOP_*` environment overrides. Unparsable numbers are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `TELEOP_GATEWAY_PORT` | `gateway_port` |
/// | `TELEOP_DATABASE_PATH` | `database_path` |
/// | `TELEOP_OFFLINE_TIMEOUT_SECS` | `offline_timeout_secs` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TELEOP_GATEWAY_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.gateway_port = port;
    }
    if let Ok(v) = std::env::var("TELEOP_DATABASE_PATH") {
        cfg.database_path = v;
    }
    if let Ok(v) = std::env::var("TELEOP_OFFLINE_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.offline_timeout_secs = secs;
    }
}

pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

/// Write `cfg` owner-only: `0700` directory, `0600` file on Unix.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let mut cfg = Config::default();
        cfg.deadzone = 0.05;
        cfg.axis_map = vec![1, 0, 2, 3, 4, 5, 6, 7];
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.deadzone, 0.05);
        assert_eq!(loaded.axis_map, vec![1, 0, 2, 3, 4, 5, 6, 7]);
        assert_eq!(loaded.channel_count, 12);
        assert_eq!(loaded.offline_timeout(), Duration::from_secs(10));
        assert_eq!(loaded.control_tick(), Duration::from_millis(100));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "gateway_port = 9000\n").unwrap();
        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.telemetry_rate_per_sec, 20);
        assert_eq!(loaded.smoothing, 0.25);
        assert!(loaded.axis_map.is_empty());
    }

    #[test]
    fn unknown_keys_in_older_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "gateway_port = 9001\nsignaling_url = \"wss://old\"\n").unwrap();
        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.gateway_port, 9001);

        let rewritten = toml::to_string_pretty(&loaded).unwrap();
        assert!(!rewritten.contains("signaling"));
        assert!(!rewritten.contains("axis_map"));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
        assert!(path.to_string_lossy().contains(".teleop"));
    }

    // Env overrides share process state, so they are exercised in one test.
    #[test]
    fn env_overrides() {
        // SAFETY: the only test in this crate that touches TELEOP_* variables.
        unsafe {
            std::env::set_var("TELEOP_GATEWAY_PORT", "9999");
            std::env::set_var("TELEOP_OFFLINE_TIMEOUT_SECS", "not-a-number");
            std::env::set_var("TELEOP_DATABASE_PATH", "");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.gateway_port, 9999);
        assert_eq!(cfg.offline_timeout_secs, 10);
        assert_eq!(cfg.database_path, "");
        unsafe {
            std::env::remove_var("TELEOP_GATEWAY_PORT");
            std::env::remove_var("TELEOP_OFFLINE_TIMEOUT_SECS");
            std::env::remove_var("TELEOP_DATABASE_PATH");
        }
    }
}
