//! Liveness wire protocol: newline-delimited `code,pid[,delaySeconds]` messages.

#![allow(missing_docs)]

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Longest line accepted from a client before the buffer is discarded.
pub const MAX_LINE_BYTES: usize = 4096;

/// Numeric command codes. `SetTimeout` flows server → client only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    SetTimeout = 0,
    Heartbeat = 1,
    RequestKill = 2,
}

/// A message sent by a monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessCommand {
    Heartbeat { pid: u32 },
    /// Kill becomes eligible once `delay` has elapsed (immediately when `None`).
    RequestKill { pid: u32, delay: Option<Duration> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("command code is not an integer: {0:?}")]
    InvalidCode(String),
    #[error("unrecognized command {0}")]
    Unrecognized(i64),
    #[error("missing pid argument")]
    MissingPid,
    #[error("invalid pid: {0:?}")]
    InvalidPid(String),
    #[error("invalid delay: {0:?}")]
    InvalidDelay(String),
}

impl LivenessCommand {
    #[must_use]
    pub const fn pid(&self) -> u32 {
        match self {
            Self::Heartbeat { pid } | Self::RequestKill { pid, .. } => *pid,
        }
    }

    #[must_use]
    pub const fn code(&self) -> CommandCode {
        match self {
            Self::Heartbeat { .. } => CommandCode::Heartbeat,
            Self::RequestKill { .. } => CommandCode::RequestKill,
        }
    }

    /// Parse one line received from a client. Trailing fields are ignored.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut fields = line.split(',').map(str::trim);
        let raw_code = fields.next().unwrap_or_default();
        let code: i64 = raw_code
            .parse()
            .map_err(|_| ProtocolError::InvalidCode(raw_code.to_string()))?;

        match code {
            1 => Ok(Self::Heartbeat {
                pid: parse_pid(fields.next())?,
            }),
            2 => {
                let pid = parse_pid(fields.next())?;
                let delay = match fields.next().filter(|raw| !raw.is_empty()) {
                    None => None,
                    Some(raw) => Some(Duration::from_secs(
                        raw.parse::<u64>()
                            .map_err(|_| ProtocolError::InvalidDelay(raw.to_string()))?,
                    )),
                };
                Ok(Self::RequestKill { pid, delay })
            }
            // SetTimeout is never valid from a client.
            other => Err(ProtocolError::Unrecognized(other)),
        }
    }
}

impl fmt::Display for LivenessCommand {
    /// Wire form without the trailing newline.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heartbeat { pid } => write!(f, "{},{pid}", CommandCode::Heartbeat as u8),
            Self::RequestKill { pid, delay: None } => {
                write!(f, "{},{pid}", CommandCode::RequestKill as u8)
            }
            Self::RequestKill {
                pid,
                delay: Some(delay),
            } => write!(
                f,
                "{},{pid},{}",
                CommandCode::RequestKill as u8,
                delay.as_secs()
            ),
        }
    }
}

fn parse_pid(raw: Option<&str>) -> Result<u32, ProtocolError> {
    let raw = raw.filter(|raw| !raw.is_empty()).ok_or(ProtocolError::MissingPid)?;
    match raw.parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ProtocolError::InvalidPid(raw.to_string())),
    }
}
