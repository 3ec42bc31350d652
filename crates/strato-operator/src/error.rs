//! Error types for the operator crate.

use thiserror::Error;

/// Errors that can occur during a reconciliation attempt.
///
/// Errors are scoped to one stack's attempt: the controller requeues the
/// resource and the follower keeps running. Ownership denial and stale
/// status writes never surface here; they are intentional no-ops.
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Stack provider error.
    #[error("stack provider error: {0}")]
    Provider(#[from] strato_cfn::CfnError),

    /// Status payload could not be serialized.
    #[error("status serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for operator operations.
pub type Result<T> = std::result::Result<T, OperatorError>;
