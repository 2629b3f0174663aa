//! Error types for Leadflow.
//!
//! Library crates use [`LeadflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Leadflow operations.
#[derive(Debug, thiserror::Error)]
pub enum LeadflowError {
    /// Upstream provider could not be reached or answered with a server error.
    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    /// Upstream refused the call because of rate limiting.
    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    /// The call did not complete within its deadline.
    #[error("{provider} timed out after {elapsed_ms}ms")]
    Timeout { provider: String, elapsed_ms: u64 },

    /// Upstream answered, but the payload failed the schema sniff.
    #[error("malformed response from {provider}: {message}")]
    MalformedResponse { provider: String, message: String },

    /// Upstream answered that it has no record for the identifier.
    #[error("{provider} has no data for '{identifier}'")]
    NoData { provider: String, identifier: String },

    /// Any other text-service failure (auth, bad request, unexpected status).
    #[error("text service error: {0}")]
    Service(String),

    /// Every configured source failed for an identifier.
    #[error("all sources exhausted for '{identifier}' ({attempted} attempted)")]
    AllSourcesExhausted { identifier: String, attempted: usize },

    /// The caller cancelled the run.
    #[error("cancelled")]
    Cancelled,

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invariant violated, invalid input).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LeadflowError>;

impl LeadflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a malformed-response error for `provider`.
    pub fn malformed(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedResponse {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create a provider-unavailable error for `provider`.
    pub fn unavailable(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Stable snake_case name of the error kind, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Timeout { .. } => "timeout",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::NoData { .. } => "no_data",
            Self::Service(_) => "service_error",
            Self::AllSourcesExhausted { .. } => "all_sources_exhausted",
            Self::Cancelled => "cancelled",
            Self::Config { .. } => "config",
            Self::Storage(_) => "storage",
            Self::Io { .. } => "io",
            Self::Validation { .. } => "validation",
        }
    }

    /// Whether a retry after backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}
