//! Shared heartbeat / kill-request state for all liveness clients.
//!
//! Connection threads write records; the scheduler thread reads them during
//! reconciliation. Heartbeats are also pushed onto a bounded signal queue
//! that the scheduler drains once per tick.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::RwLock;

use crate::liveness::protocol::{LivenessCommand, ProtocolError};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

/// Per-connection liveness state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    pub client: String,
    /// Unknown until the first message carrying a pid.
    pub pid: Option<u32>,
    pub last_heartbeat: Instant,
    pub kill_requested: bool,
    pub kill_not_before: Option<Instant>,
}

impl LivenessRecord {
    fn new(client: &str, now: Instant) -> Self {
        Self {
            client: client.to_string(),
            pid: None,
            last_heartbeat: now,
            kill_requested: false,
            kill_not_before: None,
        }
    }
}

/// A heartbeat received from a monitored process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessSignal {
    pub client: String,
    pub pid: u32,
    pub at: Instant,
}

/// Heartbeat and kill-request bookkeeping shared between the liveness server and
/// the scheduler.
#[derive(Debug)]
pub struct LivenessChannel {
    records: RwLock<HashMap<String, LivenessRecord>>,
    started_at: Instant,
    signals: Sender<LivenessSignal>,
    dropped_signals: AtomicU64,
    messages: AtomicU64,
    logger: ActivityLoggerHandle,
}

impl LivenessChannel {
    /// Channel whose start-up grace period begins now.
    #[must_use]
    pub fn new(
        signal_capacity: usize,
        logger: ActivityLoggerHandle,
    ) -> (Self, Receiver<LivenessSignal>) {
        Self::with_start(Instant::now(), signal_capacity, logger)
    }

    #[must_use]
    pub fn with_start(
        started_at: Instant,
        signal_capacity: usize,
        logger: ActivityLoggerHandle,
    ) -> (Self, Receiver<LivenessSignal>) {
        let (tx, rx) = bounded(signal_capacity.max(1));
        (
            Self {
                records: RwLock::new(HashMap::new()),
                started_at,
                signals: tx,
                dropped_signals: AtomicU64::new(0),
                messages: AtomicU64::new(0),
                logger,
            },
            rx,
        )
    }

    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn client_connected(&self, client: &str) {
        self.client_connected_at(client, Instant::now());
    }

    pub fn client_connected_at(&self, client: &str, now: Instant) {
        let inserted = {
            let mut records = self.records.write();
            if records.contains_key(client) {
                false
            } else {
                records.insert(client.to_string(), LivenessRecord::new(client, now));
                true
            }
        };
        if inserted {
            self.logger.send(ActivityEvent::LivenessConnected {
                client: client.to_string(),
            });
        }
    }

    /// Forget the client along with any pending heartbeat or kill state.
    pub fn client_disconnected(&self, client: &str) {
        if self.records.write().remove(client).is_some() {
            self.logger.send(ActivityEvent::LivenessDisconnected {
                client: client.to_string(),
            });
        }
    }

    pub fn handle_message(&self, client: &str, raw: &str) -> Result<LivenessCommand, ProtocolError> {
        self.handle_message_at(client, raw, Instant::now())
    }

    /// Apply one protocol line from `client`. Bad lines are logged and dropped.
    pub fn handle_message_at(
        &self,
        client: &str,
        raw: &str,
        now: Instant,
    ) -> Result<LivenessCommand, ProtocolError> {
        let parsed = LivenessCommand::parse(raw).and_then(|command| match command {
            LivenessCommand::RequestKill {
                delay: Some(delay), ..
            } if now.checked_add(delay).is_none() => {
                Err(ProtocolError::InvalidDelay(delay.as_secs().to_string()))
            }
            command => Ok(command),
        });
        let command = match parsed {
            Ok(command) => command,
            Err(err) => {
                self.logger.send(ActivityEvent::ProtocolError {
                    client: client.to_string(),
                    message: format!("{err} (raw={:?})", raw.trim_end()),
                });
                return Err(err);
            }
        };
        self.messages.fetch_add(1, Ordering::Relaxed);

        {
            let mut records = self.records.write();
            let record = records
                .entry(client.to_string())
                .or_insert_with(|| LivenessRecord::new(client, now));
            match command {
                LivenessCommand::Heartbeat { pid } => {
                    record.pid = Some(pid);
                    record.last_heartbeat = now;
                }
                LivenessCommand::RequestKill { pid, delay } => {
                    record.pid = Some(pid);
                    record.kill_requested = true;
                    // Overflowing delays were rejected above.
                    record.kill_not_before = Some(delay.map_or(now, |delay| now + delay));
                }
            }
        }

        match command {
            LivenessCommand::Heartbeat { pid } => {
                let signal = LivenessSignal {
                    client: client.to_string(),
                    pid,
                    at: now,
                };
                if let Err(TrySendError::Full(_)) = self.signals.try_send(signal) {
                    self.dropped_signals.fetch_add(1, Ordering::Relaxed);
                }
            }
            LivenessCommand::RequestKill { pid, delay } => {
                self.logger.send(ActivityEvent::KillRequested {
                    client: client.to_string(),
                    pid,
                    delay_secs: delay.map_or(0, |delay| delay.as_secs()),
                });
            }
        }
        Ok(command)
    }

    pub fn timed_out(&self, pid: u32, timeout: Duration) -> bool {
        self.timed_out_at(pid, timeout, Instant::now())
    }

    /// True once a known client for `pid` has been silent for longer than `timeout`.
    ///
    /// Always false for unknown pids and during the first `2 × timeout` after the
    /// channel started.
    pub fn timed_out_at(&self, pid: u32, timeout: Duration, now: Instant) -> bool {
        let records = self.records.read();
        let Some(record) = freshest(&records, pid) else {
            return false;
        };
        if now.saturating_duration_since(self.started_at) < timeout.saturating_mul(2) {
            return false;
        }
        now.saturating_duration_since(record.last_heartbeat) > timeout
    }

    pub fn kill_requested(&self, pid: u32) -> bool {
        self.kill_requested_at(pid, Instant::now())
    }

    /// One-shot: a true result clears the request.
    pub fn kill_requested_at(&self, pid: u32, now: Instant) -> bool {
        let mut records = self.records.write();
        let Some(record) = records.values_mut().find(|record| {
            record.pid == Some(pid)
                && record.kill_requested
                && record.kill_not_before.is_none_or(|at| now >= at)
        }) else {
            return false;
        };
        record.kill_requested = false;
        record.kill_not_before = None;
        true
    }

    /// Whether any client currently reports for `pid`.
    pub fn connected(&self, pid: u32) -> bool {
        self.records
            .read()
            .values()
            .any(|record| record.pid == Some(pid))
    }

    pub fn client_count(&self) -> usize {
        self.records.read().len()
    }

    /// Copy of the record currently answering for `pid`.
    pub fn record_for(&self, pid: u32) -> Option<LivenessRecord> {
        freshest(&self.records.read(), pid).cloned()
    }

    /// Total well-formed messages handled.
    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn dropped_signals(&self) -> u64 {
        self.dropped_signals.load(Ordering::Relaxed)
    }
}

/// A reconnecting client may briefly leave two records for the same pid.
fn freshest(records: &HashMap<String, LivenessRecord>, pid: u32) -> Option<&LivenessRecord> {
    records
        .values()
        .filter(|record| record.pid == Some(pid))
        .max_by_key(|record| record.last_heartbeat)
}
