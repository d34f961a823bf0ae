use landing_core::ResolveError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Duplicate plan address: {0}")]
    DuplicateAddress(String),

    #[error("Failed to apply {address}: {message}")]
    Apply {
        address: String,
        message: String,
        retryable: bool,
    },

    #[error("Gave up on {address} after {attempts} attempt(s): {message}")]
    RetriesExhausted {
        address: String,
        attempts: u32,
        message: String,
    },

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Metrics encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PlanError {
    /// Throttling and eventual-consistency failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlanError::Apply { retryable: true, .. })
    }
}
