//! Error types for the CloudFormation adapter.

use thiserror::Error;

/// Errors that can occur when talking to the stack provider.
#[derive(Error, Debug)]
pub enum CfnError {
    /// The stack does not exist. Expected during creation and after
    /// deletion; callers treat this as non-existence, not a failure.
    #[error("stack not found")]
    StackNotFound,

    /// The provider throttled the call. Retried with backoff, never
    /// surfaced to the reconcile loop.
    #[error("throttled by provider: {0}")]
    Throttled(String),

    /// An update call found nothing to change. Surfaced to the update
    /// path only, which converts it into a successful no-op.
    #[error("no updates are to be performed")]
    NoUpdates,

    /// Any other provider error. Propagates to the caller's requeue
    /// mechanism.
    #[error("{operation} failed: {message}")]
    Api {
        /// The provider operation that failed.
        operation: &'static str,
        /// The provider's error text.
        message: String,
    },
}

impl CfnError {
    /// Whether the error is transient and worth retrying in place.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }
}

/// A specialized Result type for stack provider operations.
pub type Result<T> = std::result::Result<T, CfnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttling_is_retriable() {
        assert!(CfnError::Throttled("Rate exceeded".to_string()).is_retriable());
        assert!(!CfnError::StackNotFound.is_retriable());
        assert!(!CfnError::NoUpdates.is_retriable());
        assert!(!CfnError::Api {
            operation: "CreateStack",
            message: "template format error".to_string(),
        }
        .is_retriable());
    }
}
