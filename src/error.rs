//! Error types for Pocketclaw
//!
//! This module defines the error taxonomy shared by every component,
//! using `thiserror` for ergonomic error handling. Adapter contracts
//! (inference backends, capabilities) return their own narrow enums so
//! callers can branch on the failure class without string matching.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Main error type for Pocketclaw operations
///
/// Each variant corresponds to one failure class of the runtime. Only
/// `Config` is fatal, and only at startup; everything else is either
/// retried by its owning component or converted into a reply at the turn
/// boundary.
#[derive(Error, Debug)]
pub enum PocketclawError {
    /// Configuration-related errors (fatal at startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection-level failure on a messaging surface
    #[error("Transport error on {surface}: {message}")]
    Transport {
        /// Surface that failed
        surface: String,
        /// Description of the failure
        message: String,
    },

    /// A single inference backend failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Every backend in the fallback chain failed
    #[error("All inference backends failed: {}", summarize_failures(.0))]
    InferenceExhausted(Vec<BackendFailure>),

    /// No backend was eligible for the request (all cooling down or parked)
    #[error("No inference backend available")]
    NoBackendAvailable,

    /// A capability invocation failed
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Persistence-level failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// A turn exceeded its time budget
    #[error("Turn timed out after {0:?}")]
    TurnTimeout(Duration),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failure reported by an inference backend adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend rejected the request because of rate limiting
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Hinted wait before retrying, when the backend supplied one
        retry_after: Option<Duration>,
    },

    /// The backend could not be reached or failed transiently
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the request and retrying will not help
    #[error("rejected: {0}")]
    Permanent(String),
}

impl BackendError {
    /// Returns true for the rate-limited variant
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, BackendError::RateLimited { .. })
    }
}

/// One failed attempt recorded while walking the fallback chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    /// Backend name
    pub backend: String,
    /// Last error returned by that backend
    pub error: BackendError,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.error)
    }
}

fn summarize_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(|failure| failure.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failure reported by the capability dispatcher or a capability adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// No capability is registered under the requested name
    #[error("unknown capability: {0}")]
    NotFound(String),

    /// Admission checks rejected the invocation before any side effect
    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    /// The capability ran and failed
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The capability exceeded its deadline and was terminated
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

impl CapabilityError {
    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityError::NotFound(_) => "not_found",
            CapabilityError::ValidationRejected(_) => "rejected",
            CapabilityError::ExecutionFailed(_) => "failed",
            CapabilityError::TimedOut(_) => "timed_out",
        }
    }
}

/// Result type alias for Pocketclaw operations
pub type Result<T> = anyhow::Result<T>;
