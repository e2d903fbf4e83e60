//! Client side of the liveness protocol, for monitored applications and the CLI.

#![allow(missing_docs)]

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::errors::{Result, WatchdogError};
use crate::liveness::protocol::LivenessCommand;

/// A connection to the watchdog's liveness socket.
///
/// Keep one client open for the lifetime of the process: the server forgets a
/// client's heartbeat and kill state when its connection closes.
#[derive(Debug)]
pub struct LivenessClient {
    stream: UnixStream,
    socket_path: PathBuf,
}

impl LivenessClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream =
            UnixStream::connect(socket_path).map_err(|source| WatchdogError::io(socket_path, source))?;
        Ok(Self {
            stream,
            socket_path: socket_path.to_path_buf(),
        })
    }

    pub fn heartbeat(&mut self, pid: u32) -> Result<()> {
        self.send(LivenessCommand::Heartbeat { pid })
    }

    /// Ask the watchdog to kill `pid`, optionally no sooner than `delay` from now.
    pub fn request_kill(&mut self, pid: u32, delay: Option<Duration>) -> Result<()> {
        self.send(LivenessCommand::RequestKill { pid, delay })
    }

    pub fn send(&mut self, command: LivenessCommand) -> Result<()> {
        let line = format!("{command}\n");
        self.stream
            .write_all(line.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|source| WatchdogError::io(&self.socket_path, source))
    }
}
