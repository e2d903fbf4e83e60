//! Supervision core: per-process lifecycles and per-application reconciliation.

pub mod application;
pub mod events;
pub mod lifecycle;

use std::sync::Arc;

use crate::liveness::channel::LivenessChannel;
use crate::logger::activity::ActivityLoggerHandle;
use crate::platform::pal::Platform;
use events::EventSink;

/// Collaborators shared by every reconciliation pass.
#[derive(Clone)]
pub struct SupervisionContext {
    pub platform: Arc<dyn Platform>,
    pub liveness: Arc<LivenessChannel>,
    pub logger: ActivityLoggerHandle,
    pub events: EventSink,
}

impl SupervisionContext {
    #[must_use]
    pub fn new(
        platform: Arc<dyn Platform>,
        liveness: Arc<LivenessChannel>,
        logger: ActivityLoggerHandle,
        events: EventSink,
    ) -> Self {
        Self {
            platform,
            liveness,
            logger,
            events,
        }
    }
}
