//! Activity logger: a dedicated thread owns the `JsonlWriter`.
//!
//! All other threads send `ActivityEvent` via a bounded crossbeam channel. Non-blocking
//! `try_send()` ensures the reconciliation tick is never blocked by logging back-pressure.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::core::config::AppId;
use crate::core::errors::{Result, WatchdogError};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

// ──────────────────── channel capacity ────────────────────

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 4096;

/// How often a degraded writer retries its primary path.
const RECOVER_INTERVAL: Duration = Duration::from_secs(60);

// ──────────────────── public event type ────────────────────

/// Events that can be logged through the activity logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
        applications: usize,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    ConfigReloaded {
        details: String,
    },
    ApplicationAdded {
        app_id: AppId,
        app: String,
    },
    ApplicationUpdated {
        app_id: AppId,
        app: String,
    },
    ApplicationRemoved {
        app_id: AppId,
        app: String,
    },
    ProcessStarted {
        app: String,
        pid: u32,
    },
    ProcessAdopted {
        app: String,
        pid: u32,
    },
    ProcessExited {
        app: String,
        pid: Option<u32>,
        exit_code: Option<i32>,
    },
    ProcessKilled {
        app: String,
        pid: u32,
        reason: String,
    },
    KillFailed {
        app: String,
        pid: u32,
        reason: String,
        error: String,
    },
    LaunchFailed {
        app: String,
        code: String,
        message: String,
        /// Configuration problem (e.g. missing executable) rather than a transient failure.
        critical: bool,
    },
    DuplicatesDetected {
        app: String,
        running: usize,
        max_processes: u32,
    },
    HeartbeatSoftTimeout {
        app: String,
        pid: u32,
    },
    LivenessConnected {
        client: String,
    },
    LivenessDisconnected {
        client: String,
    },
    KillRequested {
        client: String,
        pid: u32,
        delay_secs: u64,
    },
    ProtocolError {
        client: String,
        message: String,
    },
    ProcessOutput {
        app: String,
        pid: u32,
        stream: &'static str,
        line: String,
    },
    CheckFailed {
        app_id: AppId,
        app: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

// ──────────────────── public handle ────────────────────

/// Thread-safe, cheaply-cloneable handle for sending log events.
///
/// Internally wraps a bounded crossbeam `Sender`. The `send()` method uses
/// `try_send()` so callers are never blocked by logging back-pressure.
#[derive(Debug, Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Handle plus its raw receiver, without a logger thread.
    ///
    /// Used by tests and embedders that want to observe events directly.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, Receiver<ActivityEvent>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped_events: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Handle whose events go nowhere.
    #[must_use]
    pub fn discard() -> Self {
        Self::channel(1).0
    }

    /// Send an event to the logger thread. Non-blocking.
    ///
    /// If the channel is full the event is dropped and the dropped-events counter
    /// is incremented.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
        // Disconnected is fine during shutdown.
    }

    /// Log a typed error with its stable code.
    pub fn error(&self, err: &WatchdogError) {
        self.send(ActivityEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }

    /// Total events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Request graceful shutdown of the logger thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

// ──────────────────── spawn ────────────────────

/// Options for building the activity logger.
#[derive(Debug, Clone)]
pub struct ActivityLoggerConfig {
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl Default for ActivityLoggerConfig {
    fn default() -> Self {
        Self {
            jsonl_config: JsonlConfig::default(),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread and return a handle.
///
/// The logger thread runs until `handle.shutdown()` is called or all senders
/// are dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (handle, rx) = ActivityLoggerHandle::channel(config.channel_capacity);
    let dropped = Arc::clone(&handle.dropped_events);

    let join = thread::Builder::new()
        .name("appwd-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl_config, &dropped))
        .map_err(|e| WatchdogError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

// ──────────────────── logger thread ────────────────────

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl_config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(jsonl_config);
    let mut last_recover = Instant::now();
    let mut reported_drops = 0;

    loop {
        let event = match rx.recv_timeout(RECOVER_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => {
                jsonl.flush();
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // The counter stays cumulative for the state file; only the delta is logged.
        let total = dropped.load(Ordering::Relaxed);
        if total > reported_drops {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!(
                "{} log events dropped due to back-pressure",
                total - reported_drops
            ));
            jsonl.write_entry(&warn);
            reported_drops = total;
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }

        if jsonl.state() != "normal" && last_recover.elapsed() >= RECOVER_INTERVAL {
            jsonl.try_recover();
            last_recover = Instant::now();
        }

        if let Some(entry) = event_to_log_entry(&event) {
            jsonl.write_entry(&entry);
        }
        // Keep the file tail-able without waiting on the fsync interval.
        if rx.is_empty() {
            jsonl.flush();
        }
    }

    jsonl.flush();
    jsonl.fsync();
}

// ──────────────────── event conversion ────────────────────

fn app_entry(event: EventType, severity: Severity, app: &str) -> LogEntry {
    let mut e = LogEntry::new(event, severity);
    e.app = Some(app.to_string());
    e
}

#[allow(clippy::too_many_lines)]
fn event_to_log_entry(event: &ActivityEvent) -> Option<LogEntry> {
    let entry = match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
            applications,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStart, Severity::Info);
            e.details = Some(format!(
                "version={version} config_hash={config_hash} applications={applications}"
            ));
            e.ok = Some(true);
            e
        }
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
        } => {
            let mut e = LogEntry::new(EventType::DaemonStop, Severity::Info);
            e.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            e.ok = Some(true);
            e
        }
        ActivityEvent::ConfigReloaded { details } => {
            let mut e = LogEntry::new(EventType::ConfigReload, Severity::Info);
            e.details = Some(details.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::ApplicationAdded { app_id, app } => {
            let mut e = app_entry(EventType::AppAdded, Severity::Info, app);
            e.app_id = Some(app_id.to_string());
            e
        }
        ActivityEvent::ApplicationUpdated { app_id, app } => {
            let mut e = app_entry(EventType::AppUpdated, Severity::Info, app);
            e.app_id = Some(app_id.to_string());
            e
        }
        ActivityEvent::ApplicationRemoved { app_id, app } => {
            let mut e = app_entry(EventType::AppRemoved, Severity::Info, app);
            e.app_id = Some(app_id.to_string());
            e
        }
        ActivityEvent::ProcessStarted { app, pid } => {
            let mut e = app_entry(EventType::ProcessStart, Severity::Info, app);
            e.pid = Some(*pid);
            e.ok = Some(true);
            e
        }
        ActivityEvent::ProcessAdopted { app, pid } => {
            let mut e = app_entry(EventType::ProcessAdopt, Severity::Info, app);
            e.pid = Some(*pid);
            e
        }
        ActivityEvent::ProcessExited {
            app,
            pid,
            exit_code,
        } => {
            let mut e = app_entry(EventType::ProcessExit, Severity::Warning, app);
            e.pid = *pid;
            e.exit_code = *exit_code;
            e
        }
        ActivityEvent::ProcessKilled { app, pid, reason } => {
            let mut e = app_entry(EventType::ProcessKill, Severity::Warning, app);
            e.pid = Some(*pid);
            e.reason = Some(reason.clone());
            e.ok = Some(true);
            e
        }
        ActivityEvent::KillFailed {
            app,
            pid,
            reason,
            error,
        } => {
            let mut e = app_entry(EventType::KillFailed, Severity::Critical, app);
            e.pid = Some(*pid);
            e.reason = Some(reason.clone());
            e.ok = Some(false);
            e.error_message = Some(error.clone());
            e
        }
        ActivityEvent::LaunchFailed {
            app,
            code,
            message,
            critical,
        } => {
            let severity = if *critical {
                Severity::Critical
            } else {
                Severity::Warning
            };
            let mut e = app_entry(EventType::LaunchFailed, severity, app);
            e.ok = Some(false);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::DuplicatesDetected {
            app,
            running,
            max_processes,
        } => {
            let mut e = app_entry(EventType::DuplicateDetected, Severity::Warning, app);
            e.details = Some(format!("running={running} max_processes={max_processes}"));
            e
        }
        ActivityEvent::HeartbeatSoftTimeout { app, pid } => {
            let mut e = app_entry(EventType::HeartbeatSoftTimeout, Severity::Warning, app);
            e.pid = Some(*pid);
            e
        }
        ActivityEvent::LivenessConnected { client } => {
            let mut e = LogEntry::new(EventType::LivenessConnect, Severity::Info);
            e.client = Some(client.clone());
            e
        }
        ActivityEvent::LivenessDisconnected { client } => {
            let mut e = LogEntry::new(EventType::LivenessDisconnect, Severity::Info);
            e.client = Some(client.clone());
            e
        }
        ActivityEvent::KillRequested {
            client,
            pid,
            delay_secs,
        } => {
            let mut e = LogEntry::new(EventType::KillRequest, Severity::Info);
            e.client = Some(client.clone());
            e.pid = Some(*pid);
            e.details = Some(format!("delay={delay_secs}s"));
            e
        }
        ActivityEvent::ProtocolError { client, message } => {
            let mut e = LogEntry::new(EventType::ProtocolError, Severity::Warning);
            e.client = Some(client.clone());
            e.error_code = Some("WD-2201".to_string());
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::ProcessOutput {
            app,
            pid,
            stream,
            line,
        } => {
            let mut e = app_entry(EventType::ProcessOutput, Severity::Info, app);
            e.pid = Some(*pid);
            e.stream = Some((*stream).to_string());
            e.details = Some(line.clone());
            e
        }
        ActivityEvent::CheckFailed {
            app_id,
            app,
            message,
        } => {
            let mut e = app_entry(EventType::CheckFailed, Severity::Critical, app);
            e.app_id = Some(app_id.to_string());
            e.ok = Some(false);
            e.error_message = Some(message.clone());
            e
        }
        ActivityEvent::Error { code, message } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.error_code = Some(code.clone());
            e.error_message = Some(message.clone());
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => return None,
    };
    Some(entry)
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> ActivityLoggerConfig {
        ActivityLoggerConfig {
            jsonl_config: JsonlConfig {
                path: dir.join("test.jsonl"),
                fallback_path: None,
                max_size_bytes: 10 * 1024 * 1024,
                max_rotated_files: 3,
                fsync_interval_secs: 60,
            },
            channel_capacity: 64,
        }
    }

    #[test]
    fn spawn_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        handle.send(ActivityEvent::DaemonStarted {
            version: "0.1.0".to_string(),
            config_hash: "abc".to_string(),
            applications: 2,
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        assert!(contents.contains("daemon_start"));
        assert!(contents.contains("applications=2"));
    }

    #[test]
    fn supervision_events_logged_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, join) = spawn_logger(test_config(dir.path())).unwrap();
        let h2 = handle.clone();

        handle.send(ActivityEvent::ProcessStarted {
            app: "worker".to_string(),
            pid: 10,
        });
        h2.send(ActivityEvent::ProcessKilled {
            app: "worker".to_string(),
            pid: 10,
            reason: "heartbeat_timeout".to_string(),
        });
        h2.send(ActivityEvent::ProcessOutput {
            app: "worker".to_string(),
            pid: 11,
            stream: "stderr",
            line: "boom".to_string(),
        });
        handle.shutdown();
        join.join().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("test.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1]["event"], "process_kill");
        assert_eq!(lines[1]["reason"], "heartbeat_timeout");
        assert_eq!(lines[2]["stream"], "stderr");
        assert_eq!(lines[2]["details"], "boom");
    }

    #[test]
    fn critical_launch_failure_severity() {
        let entry = event_to_log_entry(&ActivityEvent::LaunchFailed {
            app: "worker".to_string(),
            code: "WD-1201".to_string(),
            message: "missing".to_string(),
            critical: true,
        })
        .unwrap();
        assert_eq!(entry.severity, Severity::Critical);
        assert!(event_to_log_entry(&ActivityEvent::Shutdown).is_none());
    }

    #[test]
    fn error_helper_carries_code() {
        let (handle, rx) = ActivityLoggerHandle::channel(4);
        handle.error(&WatchdogError::Protocol {
            details: "bad".to_string(),
        });
        match rx.try_recv().unwrap() {
            ActivityEvent::Error { code, message } => {
                assert_eq!(code, "WD-2201");
                assert!(message.contains("bad"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn dropped_events_counted_when_full() {
        let (handle, _rx) = ActivityLoggerHandle::channel(1);
        handle.send(ActivityEvent::ConfigReloaded {
            details: "a".to_string(),
        });
        handle.send(ActivityEvent::ConfigReloaded {
            details: "b".to_string(),
        });
        assert_eq!(handle.dropped_events(), 1);
    }

    #[test]
    fn discard_handle_never_counts_drops() {
        let handle = ActivityLoggerHandle::discard();
        for _ in 0..10 {
            handle.send(ActivityEvent::ConfigReloaded {
                details: String::new(),
            });
        }
        assert_eq!(handle.dropped_events(), 0);
    }
}
