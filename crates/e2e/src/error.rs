//! Error types for E2E test orchestration

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    /// A test file misused the registration API. Never retried.
    #[error("[stagehand][Wrong Usage] {0}")]
    Usage(String),

    /// An internal invariant of the runner itself was violated.
    #[error("[stagehand][Bug] You stumbled upon a bug in the test runner: {0}")]
    Bug(String),

    #[error("Command `{cmd}` not ready after {elapsed}.{expected}")]
    ServerNotReady {
        cmd: String,
        elapsed: String,
        /// Pre-rendered hint about the readiness text, empty when unknown.
        expected: String,
    },

    #[error("Port conflict? Port already in use EADDRINUSE.")]
    PortConflict,

    #[error("{0}")]
    UnexpectedExit(String),

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("[test] Timeout after {0}")]
    StepTimeout(String),

    #[error("Couldn't connect to server. See `Connection Error` log for more details.")]
    Connection,

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Command `{cmd}` failed [cwd: {}]: {reason}", cwd.display())]
    Command {
        cmd: String,
        cwd: PathBuf,
        reason: String,
    },

    #[error("Expected log not found: {0}")]
    ExpectLog(String),

    #[error("Invalid configuration in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Test file not found: {0}")]
    TestFileNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl E2eError {
    pub fn usage(msg: impl Into<String>) -> Self {
        E2eError::Usage(msg.into())
    }

    pub fn bug(msg: impl Into<String>) -> Self {
        E2eError::Bug(msg.into())
    }

    pub fn is_bug(&self) -> bool {
        matches!(self, E2eError::Bug(_))
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, E2eError::Usage(_))
    }
}

pub type E2eResult<T> = Result<T, E2eError>;

/// Fails with a usage error unless `condition` holds.
pub fn ensure_usage(condition: bool, msg: impl FnOnce() -> String) -> E2eResult<()> {
    if condition {
        Ok(())
    } else {
        Err(E2eError::Usage(msg()))
    }
}

/// Fails with a bug error unless `condition` holds.
pub fn ensure_invariant(condition: bool, debug_info: impl FnOnce() -> String) -> E2eResult<()> {
    if condition {
        Ok(())
    } else {
        Err(E2eError::Bug(debug_info()))
    }
}
