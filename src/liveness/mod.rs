//! Liveness channel: heartbeats and self-kill requests from monitored processes.

pub mod channel;
#[cfg(unix)]
pub mod client;
pub mod protocol;
#[cfg(unix)]
pub mod server;
