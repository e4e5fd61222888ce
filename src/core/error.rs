//! Error taxonomy shared by the credential, fetch and cache layers

use std::time::Duration;
use thiserror::Error;

/// Errors raised while acquiring credentials, fetching rates or touching the cache.
///
/// Variants carry strings rather than source errors so a failed fetch can be
/// handed to every waiter attached to the same task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateError {
    #[error("browser did not yield session cookies within {0:?}")]
    AcquisitionTimeout(Duration),
    #[error("browser session could not be started: {0}")]
    AcquisitionFailed(String),
    #[error("transient source error: {0}")]
    Transient(String),
    #[error("source rejected the session: {0}")]
    AuthRejected(String),
    #[error("unexpected response from source: {0}")]
    Parse(String),
    #[error("corrupt cache entry {key}: {reason}")]
    CacheCorrupt { key: String, reason: String },
    #[error("invalid currency pair: {0}")]
    InvalidPair(String),
    #[error("invalid period: {0}")]
    InvalidPeriod(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl RateError {
    /// Errors from the credential layer.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            RateError::AcquisitionTimeout(_) | RateError::AcquisitionFailed(_)
        )
    }
}

pub type RateResult<T> = std::result::Result<T, RateError>;
