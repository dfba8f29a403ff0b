//! Crate-wide error type and retry-category classification.

use thiserror::Error;

/// Result type alias using this crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// How the retry engine should treat an error (§9: "exception-driven control
/// flow -> typed results"). The retry engine dispatches on this accessor
/// alone; it never pattern-matches on `Display` text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable,
    NonRetryable,
    Unknown,
}

/// Errors that can occur while orchestrating a solve run.
#[derive(Error, Debug)]
pub enum Error {
    /// Task/config file malformed. Fatal; never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// Provider call failed in a way known to be safe to retry (rate limit,
    /// 5xx, connection reset, interrupted stream).
    #[error("provider {provider} retryable error: {message}")]
    ProviderRetryable { provider: String, message: String },

    /// Provider call failed in a way known not to be worth retrying (4xx
    /// other than 429, auth, permission).
    #[error("provider {provider} non-retryable error: {message}")]
    ProviderNonRetryable { provider: String, message: String },

    /// Provider call failed in a way we don't recognize. Treated as
    /// retryable but logged loudly.
    #[error("provider {provider} unknown error: {message}")]
    ProviderUnknown { provider: String, message: String },

    /// OpenAI background job exceeded its poll horizon.
    #[error("background job {job_id} timed out after {elapsed_secs}s")]
    BackgroundTimeout { job_id: String, elapsed_secs: u64 },

    /// OpenAI background job ended `incomplete`/`cancelled` due to a token
    /// limit.
    #[error("background job {job_id} hit token limit: {reason}")]
    TokenLimit { job_id: String, reason: String },

    /// OpenAI background job `failed` with `server_error`.
    #[error("background job {job_id} server error: {message}")]
    BackgroundServerError { job_id: String, message: String },

    /// Sandbox child did not exit within its timeout; process group killed.
    #[error("sandbox execution timed out after {timeout_s}s")]
    SandboxTimeout { timeout_s: f64 },

    /// Sandbox child exited non-zero, or produced no parseable JSON.
    #[error("sandbox crashed: {0}")]
    SandboxCrash(String),

    /// No plausible grid block found in free text.
    #[error("no grid found in text")]
    ParseError,

    /// Per-task hard-kill timer expired.
    #[error("per-task watchdog expired after {hours}h")]
    PerTaskWatchdog { hours: f64 },

    /// Global wall-clock batch deadline expired.
    #[error("global deadline exceeded")]
    GlobalDeadline,

    /// Subprocess I/O / protocol error not otherwise categorized above.
    #[error("subprocess communication error: {0}")]
    SubprocessComm(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (step log / submission / failure-log writes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error (missing API key, bad env var, etc).
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ProviderRetryable { .. } => ErrorCategory::Retryable,
            Error::ProviderNonRetryable { .. } => ErrorCategory::NonRetryable,
            Error::ProviderUnknown { .. } => ErrorCategory::Unknown,
            Error::BackgroundTimeout { .. } => ErrorCategory::Retryable,
            Error::TokenLimit { .. } => ErrorCategory::NonRetryable,
            Error::BackgroundServerError { .. } => ErrorCategory::Retryable,
            Error::SandboxTimeout { .. } | Error::SandboxCrash(_) => ErrorCategory::NonRetryable,
            Error::ParseError => ErrorCategory::NonRetryable,
            Error::Validation(_) => ErrorCategory::NonRetryable,
            Error::PerTaskWatchdog { .. } | Error::GlobalDeadline => ErrorCategory::NonRetryable,
            Error::SubprocessComm(_) => ErrorCategory::Unknown,
            Error::Serialization(_) | Error::Io(_) | Error::Config(_) | Error::Internal(_) => {
                ErrorCategory::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Retryable | ErrorCategory::Unknown
        )
    }

    pub fn provider_retryable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderRetryable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn provider_non_retryable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderNonRetryable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn provider_unknown(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderUnknown {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}
