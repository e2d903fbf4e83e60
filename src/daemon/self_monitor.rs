//! Daemon self-monitoring: event counters, RSS, and the `state.json` snapshot
//! read by `appwd status`.
//!
//! The state file is written atomically (write `.tmp`, then `rename()`) every
//! `DAEMON_STATE_WRITE_INTERVAL_SECS` seconds so readers always see a
//! consistent document.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, WatchdogError};
use crate::daemon::scheduler::SchedulerState;
use crate::supervisor::application::ApplicationStatus;
use crate::supervisor::events::WatchdogEvent;

// ──────────────────── constants ────────────────────

pub const DAEMON_STATE_WRITE_INTERVAL_SECS: u64 = 5;

/// A state file older than this means the daemon is gone or stalled.
pub const DAEMON_STATE_STALE_THRESHOLD_SECS: u64 = 3 * DAEMON_STATE_WRITE_INTERVAL_SECS;

// ──────────────────── state file schema ────────────────────

/// Top-level document written to `state.json`.
///
/// Every field defaults so that a newer or older daemon's file still parses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonState {
    pub version: String,
    pub pid: u32,
    pub started_at: String,
    pub uptime_seconds: u64,
    pub last_updated: String,
    pub scheduler: SchedulerState,
    pub liveness_clients: usize,
    pub applications: Vec<ApplicationStatus>,
    pub counters: Counters,
    pub memory_rss_bytes: u64,
}

/// Cumulative counters since daemon start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub processes_started: u64,
    pub processes_exited: u64,
    pub processes_killed: u64,
    pub launch_failures: u64,
    pub check_failures: u64,
    pub heartbeats_relayed: u64,
    pub liveness_messages: u64,
    /// Log events dropped due to channel back-pressure.
    pub dropped_log_events: u64,
    /// Watchdog events dropped because the consumer fell behind.
    pub dropped_events: u64,
}

/// Values sampled from other components at write time.
#[derive(Debug, Clone, Default)]
pub struct StateInputs {
    pub scheduler: SchedulerState,
    pub applications: Vec<ApplicationStatus>,
    pub liveness_clients: usize,
    pub liveness_messages: u64,
    pub dropped_log_events: u64,
    pub dropped_events: u64,
}

// ──────────────────── self-monitor ────────────────────

pub struct SelfMonitor {
    state_file_path: PathBuf,
    start_time: Instant,
    started_at_iso: String,
    write_interval: Duration,
    last_write: Option<Instant>,
    rss_limit_bytes: u64,
    counters: Counters,
}

impl SelfMonitor {
    pub fn new(state_file_path: PathBuf) -> Self {
        Self {
            state_file_path,
            start_time: Instant::now(),
            started_at_iso: now_iso(),
            write_interval: Duration::from_secs(DAEMON_STATE_WRITE_INTERVAL_SECS),
            last_write: None,
            rss_limit_bytes: 128 * 1024 * 1024,
            counters: Counters::default(),
        }
    }

    /// Point future writes at `path`; counters and uptime carry over.
    pub fn set_state_file(&mut self, path: PathBuf) {
        if path != self.state_file_path {
            self.state_file_path = path;
            self.last_write = None;
        }
    }

    #[must_use]
    pub const fn counters(&self) -> &Counters {
        &self.counters
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_event(&mut self, event: &WatchdogEvent) {
        let counter = match event {
            WatchdogEvent::LivenessReceived { .. } => &mut self.counters.heartbeats_relayed,
            WatchdogEvent::CheckFailed { .. } => &mut self.counters.check_failures,
            WatchdogEvent::ProcessStarted { .. } => &mut self.counters.processes_started,
            WatchdogEvent::ProcessExited { .. } => &mut self.counters.processes_exited,
            WatchdogEvent::ProcessKilled { .. } => &mut self.counters.processes_killed,
            WatchdogEvent::LaunchFailed { .. } => &mut self.counters.launch_failures,
        };
        *counter += 1;
    }

    /// True when the next `maybe_write_state` call would write.
    #[must_use]
    pub fn write_due(&self) -> bool {
        self.last_write
            .is_none_or(|last| last.elapsed() >= self.write_interval)
    }

    /// Write `state.json` if the interval has elapsed. Returns `true` on a write.
    pub fn maybe_write_state(&mut self, inputs: StateInputs) -> bool {
        if !self.write_due() {
            return false;
        }
        self.write_state(inputs)
    }

    /// Write unconditionally (used on shutdown so the final state is visible).
    pub fn write_state(&mut self, inputs: StateInputs) -> bool {
        let rss = read_rss_bytes();
        if rss > self.rss_limit_bytes {
            eprintln!(
                "[WD-SELFMON] WARNING: RSS {} MB exceeds limit {} MB",
                rss / (1024 * 1024),
                self.rss_limit_bytes / (1024 * 1024),
            );
        }

        self.counters.liveness_messages = inputs.liveness_messages;
        self.counters.dropped_log_events = inputs.dropped_log_events;
        self.counters.dropped_events = inputs.dropped_events;

        let state = DaemonState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            started_at: self.started_at_iso.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            last_updated: now_iso(),
            scheduler: inputs.scheduler,
            liveness_clients: inputs.liveness_clients,
            applications: inputs.applications,
            counters: self.counters.clone(),
            memory_rss_bytes: rss,
        };

        // Interval is honored even on failure so a bad path does not spam stderr.
        self.last_write = Some(Instant::now());
        match write_state_atomic(&self.state_file_path, &state) {
            Ok(()) => true,
            Err(e) => {
                eprintln!("[WD-SELFMON] failed to write state file: {e}");
                false
            }
        }
    }

    /// One-line summary for sd_notify STATUS.
    #[must_use]
    pub fn status_line(&self, scheduler: SchedulerState, applications: usize) -> String {
        format!(
            "{scheduler} | {applications} apps | {started} started, {killed} killed, {exited} exited",
            started = self.counters.processes_started,
            killed = self.counters.processes_killed,
            exited = self.counters.processes_exited,
        )
    }

    /// Read a state file written by a running daemon.
    pub fn read_state(path: &Path) -> Result<DaemonState> {
        let raw = fs::read_to_string(path).map_err(|source| WatchdogError::io(path, source))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Whether `state` is older than the stale threshold (or undated).
#[must_use]
pub fn is_stale(state: &DaemonState) -> bool {
    chrono::DateTime::parse_from_rfc3339(&state.last_updated).map_or(true, |updated| {
        let age = chrono::Utc::now().signed_duration_since(updated);
        age.num_seconds() > i64::try_from(DAEMON_STATE_STALE_THRESHOLD_SECS).unwrap_or(i64::MAX)
    })
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────── atomic state file write ────────────────────

/// Write to `.tmp` then rename. The file is `0644`: it holds only
/// operational telemetry and `appwd status` may run as another user.
fn write_state_atomic(path: &Path, state: &DaemonState) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;

    let result = (|| {
        {
            use std::io::Write;
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o644);
            }
            let mut file = opts.open(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

// ──────────────────── RSS ────────────────────

/// Current RSS in bytes, 0 when unavailable.
fn read_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find(|line| line.starts_with("VmRSS:"))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
            })
            .map_or(0, |kb| kb * 1024)
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}
