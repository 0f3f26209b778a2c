//! Error types for arenabridge.

use thiserror::Error;

/// Which relay deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// No event at all arrived after dispatch.
    FirstEvent,
    /// The stream went quiet after at least one event.
    Idle,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstEvent => write!(f, "first-event"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("No session mapping for model '{0}'")]
    NoMapping(String),

    #[error("No browser worker is connected")]
    NoWorkerAvailable,

    #[error("All connected browser workers are busy")]
    WorkerBusy,

    #[error("Browser worker disconnected before the response completed")]
    WorkerLost,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timed out waiting for the browser worker ({0})")]
    Timeout(TimeoutPhase),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("No session identifiers were captured")]
    NotCaptured,

    #[error("{0} is already in progress")]
    CoordinatorBusy(&'static str),

    #[error("Malformed page content: {0}")]
    MalformedContent(String),

    #[error("Relay protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid API key")]
    Unauthorized,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
