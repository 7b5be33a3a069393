use std::time::Duration;

use thiserror::Error;

/// Failure kinds surfaced across component boundaries.
///
/// The upstream client and the recorder worker classify raw failures into
/// these kinds at their boundary; everything above them decides policy
/// (retry, repair, degrade) based on the kind alone.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("credential rejected by upstream")]
    CredentialRejected,

    #[error("credential expired, operator re-authentication required")]
    CredentialExpired,

    #[error("subscription already exists")]
    SubscriptionConflict,

    #[error("subscription cost ceiling exceeded")]
    SubscriptionCostExceeded,

    #[error("no usable stream title for {0}")]
    TitleUnresolved(String),

    #[error("channel {0} is in post-recording cooldown")]
    Cooldown(String),

    #[error("channel {0} is not live")]
    NotLive(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("permanent upstream error ({status}): {message}")]
    Permanent { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether the operation may succeed if simply retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        // Transport-level failures (DNS, connect, timeout, body read) are
        // all retryable; status errors are classified at the call site.
        CoreError::Transient(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(CoreError::Transient("reset".into()).is_transient());
        assert!(
            CoreError::RateLimited {
                retry_after: Duration::from_secs(5)
            }
            .is_transient()
        );
        assert!(!CoreError::CredentialRejected.is_transient());
        assert!(!CoreError::SubscriptionConflict.is_transient());
    }
}
