//! Error types surfaced at the library boundary.
//!
//! Step implementations inside the lifecycle machines use `anyhow` and are
//! converted into terminal status values; only failures that happen before an
//! operation starts (bad parameters, busy engine, spawn failures) reach callers
//! as `EngineError`.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Missing or invalid parameters. Nothing has been touched.
    #[error("Invalid usage: {0}")]
    Usage(String),

    /// Another lifecycle operation holds the orchestrator.
    #[error("Another operation is already running: {0}")]
    Busy(String),

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        EngineError::Usage(msg.into())
    }

    /// True for errors caused by the caller rather than the system.
    pub fn is_usage(&self) -> bool {
        matches!(self, EngineError::Usage(_))
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
