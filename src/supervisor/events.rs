//! Fire-and-forget events raised by the supervision core for external consumers.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};

use crate::core::config::AppId;

/// Why the watchdog terminated a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillReason {
    NotResponding,
    HeartbeatTimeout,
    KillRequested,
    Duplicate,
}

impl KillReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotResponding => "not_responding",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::KillRequested => "kill_requested",
            Self::Duplicate => "duplicate",
        }
    }
}

impl std::fmt::Display for KillReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatchdogEvent {
    /// A heartbeat arrived from a process tracked by `app_id`.
    LivenessReceived {
        app_id: AppId,
        app_name: String,
        pid: u32,
    },
    /// A reconciliation pass failed or panicked.
    CheckFailed {
        app_id: AppId,
        app_name: String,
        message: String,
    },
    ProcessStarted {
        app_name: String,
        pid: u32,
    },
    /// `exit_code` is `-1` when a launch failed and nothing with the name is running.
    ProcessExited {
        app_name: String,
        pid: Option<u32>,
        exit_code: Option<i32>,
    },
    ProcessKilled {
        app_name: String,
        pid: u32,
        reason: KillReason,
    },
    LaunchFailed {
        app_name: String,
        message: String,
    },
}

/// Non-blocking event publisher. Events are dropped (and counted) when the
/// consumer falls behind.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<Sender<WatchdogEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, Receiver<WatchdogEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Sink with no consumer.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn emit(&self, event: WatchdogEvent) {
        if let Some(tx) = &self.tx
            && let Err(TrySendError::Full(_)) = tx.try_send(event)
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
