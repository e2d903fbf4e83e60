//! WD-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, WatchdogError>;

/// Top-level error type for the application watchdog.
#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("[WD-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[WD-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[WD-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[WD-1101] unsupported platform: {details}")]
    UnsupportedPlatform { details: String },

    #[error("[WD-1201] executable not found: {path}")]
    MissingExecutable { path: PathBuf },

    #[error("[WD-2001] process enumeration failure for {name}: {details}")]
    ProcessEnumeration { name: String, details: String },

    #[error("[WD-2002] failed to launch {path}: {details}")]
    Launch { path: PathBuf, details: String },

    #[error("[WD-2003] failed to kill pid {pid}: {details}")]
    Kill { pid: u32, details: String },

    #[error("[WD-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[WD-2201] liveness protocol error: {details}")]
    Protocol { details: String },

    #[error("[WD-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[WD-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[WD-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl WatchdogError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "WD-1001",
            Self::MissingConfig { .. } => "WD-1002",
            Self::ConfigParse { .. } => "WD-1003",
            Self::UnsupportedPlatform { .. } => "WD-1101",
            Self::MissingExecutable { .. } => "WD-1201",
            Self::ProcessEnumeration { .. } => "WD-2001",
            Self::Launch { .. } => "WD-2002",
            Self::Kill { .. } => "WD-2003",
            Self::Serialization { .. } => "WD-2101",
            Self::Protocol { .. } => "WD-2201",
            Self::Io { .. } => "WD-3002",
            Self::ChannelClosed { .. } => "WD-3003",
            Self::Runtime { .. } => "WD-3900",
        }
    }

    /// Whether retrying (typically on the next tick) might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::ProcessEnumeration { .. }
                | Self::Launch { .. }
                | Self::Kill { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for WatchdogError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for WatchdogError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
