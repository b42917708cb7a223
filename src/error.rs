use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Snapshot was missing fields or carried values the engine cannot use.
    /// Prior timer state is kept.
    #[error("invalid room snapshot: {0}")]
    InvalidSnapshot(String),

    /// Network hiccup, timeout or retryable status. Owned by the driver.
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend request failed: {0}")]
    Backend(String),
}

impl TimerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        TimerError::InvalidSnapshot(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TimerError::Transient(_))
    }
}

pub type TimerResult<T> = std::result::Result<T, TimerError>;
