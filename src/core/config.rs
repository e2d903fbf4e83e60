//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::errors::{Result, WatchdogError};

/// Namespace for ids derived from application names when a config file omits them.
const APP_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6a1c_5f0e_9b7d_4c3a_8e21_d4f7_b05c_93e8);

/// Stable identity of one supervised application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(Uuid);

impl AppId {
    /// Fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id for an application name.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&APP_ID_NAMESPACE, name.as_bytes()))
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Full watchdog configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub liveness: LivenessConfig,
    pub paths: PathsConfig,
    pub display: DisplayConfig,
    pub applications: Vec<AppConfig>,
}

/// Reconciliation cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
}

/// Heartbeat / kill-request socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LivenessConfig {
    pub enabled: bool,
    pub socket_path: PathBuf,
    /// Capacity of the heartbeat signal queue drained by the scheduler each tick.
    pub signal_capacity: usize,
}

/// On-disk locations used by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub state_file: PathBuf,
    pub jsonl_log: PathBuf,
}

/// Presentation preferences carried for front-ends; the daemon does not act on them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DisplayConfig {
    pub show_tray_icon: bool,
    pub show_main_form: bool,
    pub show_log_form: bool,
}

/// Policy for one supervised application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Nil in a config file means "derive from the application name".
    pub id: AppId,
    /// OS process name used for enumeration.
    pub application_name: String,
    /// Executable to launch.
    pub application_path: PathBuf,
    pub arguments: Vec<String>,
    pub non_responsive_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub min_processes: u32,
    pub max_processes: u32,
    /// Relaunch a replaced process whenever the count is below `max_processes`.
    pub keep_existing_no_processes: bool,
    pub use_heartbeat: bool,
    pub grant_kill_request: bool,
    pub startup_monitor_delay_secs: u64,
    pub active: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: default_socket_path(),
            signal_capacity: 1_024,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[WD-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("appwd").join("config.toml");
        let data = home_dir.join(".local").join("share").join("appwd");
        Self {
            config_file: cfg,
            state_file: data.join("state.json"),
            jsonl_log: data.join("activity.jsonl"),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            show_tray_icon: true,
            show_main_form: true,
            show_log_form: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            id: AppId::default(),
            application_name: String::new(),
            application_path: PathBuf::new(),
            arguments: Vec::new(),
            non_responsive_interval_secs: 20,
            heartbeat_interval_secs: 20,
            min_processes: 1,
            max_processes: 1,
            keep_existing_no_processes: true,
            use_heartbeat: false,
            grant_kill_request: true,
            startup_monitor_delay_secs: 20,
            active: true,
        }
    }
}

impl AppConfig {
    /// New application with a random id and default policy.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: AppId::new(),
            application_name: name.into(),
            application_path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn non_responsive_interval(&self) -> Duration {
        Duration::from_secs(self.non_responsive_interval_secs)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn startup_monitor_delay(&self) -> Duration {
        Duration::from_secs(self.startup_monitor_delay_secs)
    }

    fn validate(&self) -> Result<()> {
        let label = if self.application_name.is_empty() {
            self.id.to_string()
        } else {
            self.application_name.clone()
        };
        if self.application_name.trim().is_empty() {
            return Err(invalid(format!("application {label}: application_name is empty")));
        }
        if self.application_path.as_os_str().is_empty() {
            return Err(invalid(format!("application {label}: application_path is empty")));
        }
        if self.max_processes == 0 {
            return Err(invalid(format!("application {label}: max_processes must be >= 1")));
        }
        if self.min_processes > self.max_processes {
            return Err(invalid(format!(
                "application {label}: min_processes ({}) exceeds max_processes ({})",
                self.min_processes, self.max_processes
            )));
        }
        if self.use_heartbeat && self.heartbeat_interval_secs == 0 {
            return Err(invalid(format!(
                "application {label}: heartbeat_interval_secs must be > 0 when use_heartbeat is set"
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| WatchdogError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(WatchdogError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a so the value is stable across processes and toolchains.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_interval_ms)
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("WD_TICK_INTERVAL_MS") {
            self.scheduler.tick_interval_ms = parse_env_u64("WD_TICK_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("WD_LIVENESS_ENABLED") {
            self.liveness.enabled = parse_env_bool("WD_LIVENESS_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("WD_LIVENESS_SOCKET") {
            self.liveness.socket_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("WD_STATE_FILE") {
            self.paths.state_file = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("WD_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Fill derived ids and tidy names so reloads compare equal.
    fn normalize(&mut self) {
        for app in &mut self.applications {
            app.application_name = app.application_name.trim().to_string();
            if app.id.is_nil() {
                app.id = AppId::from_name(&app.application_name);
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(100..=60_000).contains(&self.scheduler.tick_interval_ms) {
            return Err(invalid(format!(
                "scheduler.tick_interval_ms must be in [100, 60000], got {}",
                self.scheduler.tick_interval_ms
            )));
        }
        if self.liveness.enabled && self.liveness.socket_path.as_os_str().is_empty() {
            return Err(invalid("liveness.socket_path is empty".to_string()));
        }
        if self.liveness.signal_capacity == 0 {
            return Err(invalid("liveness.signal_capacity must be > 0".to_string()));
        }

        let mut seen = HashSet::new();
        for app in &self.applications {
            app.validate()?;
            if !seen.insert(app.id) {
                return Err(invalid(format!(
                    "duplicate application id {} ({})",
                    app.id, app.application_name
                )));
            }
        }
        Ok(())
    }
}

fn default_socket_path() -> PathBuf {
    env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map_or_else(
            || PathBuf::from(format!("/tmp/appwd-{}", current_uid())),
            |dir| PathBuf::from(dir).join("appwd"),
        )
        .join("liveness.sock")
}

#[cfg(unix)]
fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

fn invalid(details: String) -> WatchdogError {
    WatchdogError::InvalidConfig { details }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| WatchdogError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|error| WatchdogError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

#[cfg(test)]
mod tests {
    use super::{AppConfig, AppId, Config, WatchdogError};
    use std::collections::HashMap;
    use std::path::Path;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.applications.is_empty());
    }

    #[test]
    fn app_defaults_follow_policy_defaults() {
        let app = AppConfig::new("worker", "/usr/bin/worker");
        assert_eq!(app.non_responsive_interval_secs, 20);
        assert_eq!(app.heartbeat_interval_secs, 20);
        assert_eq!(app.startup_monitor_delay_secs, 20);
        assert_eq!((app.min_processes, app.max_processes), (1, 1));
        assert!(app.keep_existing_no_processes);
        assert!(!app.use_heartbeat);
        assert!(app.grant_kill_request);
        assert!(app.active);
        assert!(!app.id.is_nil());
    }

    #[test]
    fn min_above_max_rejected() {
        let mut cfg = Config::default();
        let mut app = AppConfig::new("worker", "/usr/bin/worker");
        app.min_processes = 3;
        app.max_processes = 2;
        cfg.applications.push(app);
        let err = cfg.validate().expect_err("expected invalid counts");
        match err {
            WatchdogError::InvalidConfig { details } => {
                assert!(details.contains("exceeds max_processes"), "{details}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_heartbeat_interval_rejected_only_when_used() {
        let mut cfg = Config::default();
        let mut app = AppConfig::new("worker", "/usr/bin/worker");
        app.heartbeat_interval_secs = 0;
        cfg.applications.push(app);
        assert!(cfg.validate().is_ok());

        cfg.applications[0].use_heartbeat = true;
        let err = cfg.validate().expect_err("expected invalid heartbeat");
        assert!(err.to_string().contains("heartbeat_interval_secs"));
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut cfg = Config::default();
        let app = AppConfig::new("worker", "/usr/bin/worker");
        let mut twin = AppConfig::new("other", "/usr/bin/other");
        twin.id = app.id;
        cfg.applications = vec![app, twin];
        let err = cfg.validate().expect_err("expected duplicate id");
        assert!(err.to_string().contains("duplicate application id"));
    }

    #[test]
    fn tick_interval_range_enforced() {
        let mut cfg = Config::default();
        cfg.scheduler.tick_interval_ms = 50;
        assert!(cfg.validate().is_err());
        cfg.scheduler.tick_interval_ms = 60_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn normalize_derives_ids_from_names() {
        let raw = r#"
            [[applications]]
            application_name = " worker "
            application_path = "/usr/bin/worker"
            max_processes = 2
        "#;
        let mut cfg: Config = toml::from_str(raw).expect("parse");
        cfg.normalize();
        let app = &cfg.applications[0];
        assert_eq!(app.application_name, "worker");
        assert_eq!(app.id, AppId::from_name("worker"));
        assert_eq!(app.max_processes, 2);
        assert_eq!(app.min_processes, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn explicit_id_survives_normalize() {
        let raw = r#"
            [[applications]]
            id = "4f1b8c2e-0d6a-4e57-9a3b-2c1d0e9f8a7b"
            application_name = "worker"
            application_path = "/usr/bin/worker"
        "#;
        let mut cfg: Config = toml::from_str(raw).expect("parse");
        cfg.normalize();
        assert_eq!(
            cfg.applications[0].id.to_string(),
            "4f1b8c2e-0d6a-4e57-9a3b-2c1d0e9f8a7b"
        );
    }

    #[test]
    fn env_overrides_apply() {
        let env = vars(&[
            ("WD_TICK_INTERVAL_MS", "250"),
            ("WD_LIVENESS_ENABLED", "false"),
            ("WD_LIVENESS_SOCKET", "/run/test/live.sock"),
            ("WD_STATE_FILE", "/var/tmp/state.json"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .expect("overrides");
        assert_eq!(cfg.scheduler.tick_interval_ms, 250);
        assert!(!cfg.liveness.enabled);
        assert_eq!(cfg.liveness.socket_path, Path::new("/run/test/live.sock"));
        assert_eq!(cfg.paths.state_file, Path::new("/var/tmp/state.json"));
    }

    #[test]
    fn env_invalid_boolean_rejected() {
        let env = vars(&[("WD_LIVENESS_ENABLED", "sometimes")]);
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .expect_err("expected parse error");
        assert_eq!(err.code(), "WD-1003");
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/appwd/config.toml")));
        assert!(matches!(result, Err(WatchdogError::MissingConfig { .. })));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
                [scheduler]
                tick_interval_ms = 500

                [display]
                show_tray_icon = false

                [[applications]]
                application_name = "worker"
                application_path = "/usr/bin/worker"
                use_heartbeat = true
            "#,
        )
        .expect("write");
        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.paths.config_file, path);
        assert_eq!(cfg.applications.len(), 1);
        assert!(cfg.applications[0].use_heartbeat);
        assert!(!cfg.display.show_tray_icon);
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let hash_before = cfg.stable_hash().expect("hash should compute");
        let mut modified = Config::default();
        modified.scheduler.tick_interval_ms += 1;
        let hash_after = modified.stable_hash().expect("hash should compute");
        assert_ne!(hash_before, hash_after);
        assert_eq!(hash_before, cfg.stable_hash().expect("hash"));
    }
}
