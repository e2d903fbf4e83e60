//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use app_watchdog::prelude::*;
//! ```

// Core
pub use crate::core::config::{AppConfig, AppId, Config};
pub use crate::core::errors::{Result, WatchdogError};

// Platform
pub use crate::platform::pal::{MockPlatform, Platform, ProcessInfo, detect_platform};

// Liveness
pub use crate::liveness::channel::LivenessChannel;
pub use crate::liveness::protocol::LivenessCommand;

// Logging
pub use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};

// Supervision
pub use crate::supervisor::SupervisionContext;
pub use crate::supervisor::application::{ApplicationStatus, ApplicationSupervisor};
pub use crate::supervisor::events::{EventSink, KillReason, WatchdogEvent};
pub use crate::supervisor::lifecycle::{ProcessLifecycle, ProcessPhase};

// Scheduling
pub use crate::daemon::scheduler::{SchedulerHandle, SchedulerState, WatchdogScheduler};
