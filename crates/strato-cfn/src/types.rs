//! Provider-neutral request and response types for the stack API.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A key/value tag attached to a stack.
///
/// Tags are carried as an ordered list, not a map: the operator appends
/// entries in a fixed order and duplicate keys are passed through to the
/// provider, which is the final arbiter of duplicate-key behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Build a tag from a key/value pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A template parameter passed to create and update calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    /// Parameter key.
    pub key: String,
    /// Parameter value.
    pub value: String,
}

impl Parameter {
    /// Build a parameter from a key/value pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The provider's description of an existing stack.
#[derive(Debug, Clone, PartialEq)]
pub struct StackDescription {
    /// Provider-assigned stack identifier.
    pub stack_id: String,
    /// Stack name.
    pub name: String,
    /// Current status string, e.g. `CREATE_COMPLETE`.
    pub status: String,
    /// Reason accompanying the status, if any.
    pub status_reason: Option<String>,
    /// Stack outputs.
    pub outputs: BTreeMap<String, String>,
    /// Tags on the stack.
    pub tags: Vec<Tag>,
    /// When the stack was created.
    pub created_time: Option<DateTime<Utc>>,
    /// When the stack was last updated, if it ever was.
    pub updated_time: Option<DateTime<Utc>>,
}

/// One resource inside a stack, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackResourceSummary {
    /// Logical name of the resource within the template.
    pub logical_id: String,
    /// Physical identifier. Empty until the resource is realized.
    pub physical_id: String,
    /// Resource type, e.g. `AWS::S3::Bucket`.
    pub type_: String,
    /// Resource status string.
    pub status: String,
    /// Reason accompanying the status, if any.
    pub status_reason: Option<String>,
}

/// Input for a stack create call.
#[derive(Debug, Clone, Default)]
pub struct CreateStackRequest {
    /// Stack name.
    pub name: String,
    /// Template body.
    pub template: String,
    /// Template parameters.
    pub parameters: Vec<Parameter>,
    /// Tags, in submission order.
    pub tags: Vec<Tag>,
    /// Capabilities to acknowledge, e.g. `CAPABILITY_IAM`.
    pub capabilities: Vec<String>,
}

/// Input for a stack update call. Same shape as a create.
#[derive(Debug, Clone, Default)]
pub struct UpdateStackRequest {
    /// Stack name or ID.
    pub name: String,
    /// Template body.
    pub template: String,
    /// Template parameters.
    pub parameters: Vec<Parameter>,
    /// Tags, in submission order.
    pub tags: Vec<Tag>,
    /// Capabilities to acknowledge.
    pub capabilities: Vec<String>,
}

/// Outcome of an update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The provider accepted the update and an operation is in flight.
    Updated,
    /// The provider reported there was nothing to change. Success.
    NoChanges,
}

/// Whether a stack status string is terminal.
///
/// A status is terminal iff it ends in `_COMPLETE` or `_FAILED`; every
/// other suffix (`_IN_PROGRESS`) means an operation is still running.
/// This suffix rule is the sole gate for when polling stops.
#[must_use]
pub fn is_terminal(status: &str) -> bool {
    status.ends_with("_COMPLETE") || status.ends_with("_FAILED")
}
