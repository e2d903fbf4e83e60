#![forbid(unsafe_code)]

//! Application watchdog (appwd): a host-local supervisor that keeps configured
//! programs running, responsive and within their instance limits.
//!
//! Each tick, every active application is reconciled against the live process
//! table:
//! 1. **Duplicates**: instances beyond `max_processes` are killed, non-responding first
//! 2. **Liveness**: hung or heartbeat-silent processes are killed and relaunched
//! 3. **Population**: exited processes are replaced and missing instances launched
//!
//! Monitored processes may report heartbeats or ask to be killed over a local
//! datagram socket (see [`liveness`]).
//!
//! # Library usage
//!
//! ```rust,no_run
//! use app_watchdog::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use app_watchdog::core::config::Config;
//! use app_watchdog::supervisor::application::ApplicationSupervisor;
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod liveness;
pub mod logger;
pub mod platform;
pub mod supervisor;
