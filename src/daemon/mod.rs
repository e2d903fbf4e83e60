//! Daemon subsystem: tick scheduler, main loop, signal handling and
//! self-monitoring.

#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod scheduler;
pub mod self_monitor;
#[cfg(feature = "daemon")]
pub mod signals;
