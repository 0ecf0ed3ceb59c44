//! Error taxonomy.
//!
//! Two layers, mirroring how failures propagate through a run:
//!
//! - [`Error`] aborts a command. Only configuration problems (and an
//!   unusable input root) land here; `main` maps them to exit code 2.
//! - [`ItemError`] is attached to a single path. It is recorded in the
//!   manifest or the run summary and never unwinds the pipeline.
//!
//! Everything else at command level travels as `anyhow::Error` with context.

use std::fmt::Display;
use std::time::Duration;

use thiserror::Error;

/// Command-aborting errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration, or an unreadable input root.
    #[error("config error: {0}")]
    FatalConfig(String),

    /// Another pipeline already holds the state directory.
    #[error("state directory is locked by another run: {0}")]
    Locked(String),
}

/// Per-path failure raised by the scanner, the conversion driver or the
/// sync reconciler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// Local file could not be read or written.
    #[error("I/O error on {path}: {reason}")]
    Io { path: String, reason: String },

    /// A collaborator call exceeded its time budget.
    #[error("{backend} timed out after {secs}s")]
    Timeout { backend: &'static str, secs: u64 },

    /// Collaborator unreachable or answered with a server error.
    #[error("{backend} error: {reason}")]
    Backend { backend: &'static str, reason: String },

    /// Collaborator answered, but not with anything usable.
    #[error("malformed {backend} response: {reason}")]
    Malformed { backend: &'static str, reason: String },

    /// Remote store refused the payload.
    #[error("rejected by remote store (HTTP {status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// Image captioning failed. Only ever stored as a warning.
    #[error("captioning failed: {0}")]
    Captioning(String),
}

impl ItemError {
    pub fn io(path: impl Display, err: impl Display) -> Self {
        ItemError::Io {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn backend(backend: &'static str, reason: impl Display) -> Self {
        ItemError::Backend {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn malformed(backend: &'static str, reason: impl Display) -> Self {
        ItemError::Malformed {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn timeout(backend: &'static str, budget: Duration) -> Self {
        ItemError::Timeout {
            backend,
            secs: budget.as_secs(),
        }
    }

    /// Map a transport error from `reqwest`, keeping timeouts distinguishable.
    pub fn from_http(backend: &'static str, err: reqwest::Error, budget: Duration) -> Self {
        if err.is_timeout() {
            ItemError::timeout(backend, budget)
        } else if err.is_decode() {
            ItemError::malformed(backend, err)
        } else {
            ItemError::backend(backend, err)
        }
    }

    /// Whether re-running the pipeline may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ItemError::Rejected { .. })
    }
}

/// Returns `true` when `err` (or anything in its chain) is a fatal
/// configuration error.
pub fn is_fatal_config(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<Error>(), Some(Error::FatalConfig(_))))
}

/// `bail!` for configuration problems.
macro_rules! bail_config {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::FatalConfig(format!($($arg)*)).into())
    };
}

pub(crate) use bail_config;
