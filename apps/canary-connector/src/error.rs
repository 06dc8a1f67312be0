use crate::telemetry::PollWindow;
use thiserror::Error;

/// The local queue could not serve a window. The cursor is left where it was so the same window is
/// read again on the next tick.
#[derive(Debug, Error)]
pub enum SourceReadError {
    #[error("local queue unavailable while reading {window}: {reason}")]
    Unavailable { window: PollWindow, reason: String },
    #[error("window {window} does not start at the cursor ({cursor})")]
    OutOfOrder {
        window: PollWindow,
        cursor: chrono::DateTime<chrono::Utc>,
    },
}

/// An append carried samples stamped before time the reader has already consumed. Nothing from the
/// call was written.
#[derive(Debug, Error)]
#[error("{count} sample(s) predate the queue read horizon {horizon} (oldest {oldest})")]
pub struct LateSampleError {
    pub count: usize,
    pub oldest: chrono::DateTime<chrono::Utc>,
    pub horizon: chrono::DateTime<chrono::Utc>,
}

/// The historian refused the credentials or could not be reached while (re)authenticating.
#[derive(Debug, Error)]
#[error("historian authentication failed: {reason}")]
pub struct AuthFailure {
    pub reason: String,
}

impl AuthFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network failure, timeout or 5xx. The same batch is sent again next cycle.
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Tokens were rejected mid-post. The session is dropped and the batch kept.
    #[error("historian rejected the session tokens: {0}")]
    Auth(String),
    /// The historian rejected the batch content. The batch is discarded.
    #[error("historian rejected the batch: {}", .reasons.join("; "))]
    Permanent { reasons: Vec<String> },
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DeliveryError::Permanent { .. })
    }
}

impl From<AuthFailure> for DeliveryError {
    fn from(err: AuthFailure) -> Self {
        DeliveryError::Auth(err.reason)
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing required field {0}")]
    Missing(&'static str),
    #[error("field {field} still holds the placeholder value {value:?}")]
    Placeholder { field: &'static str, value: String },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
