//! The `Stack` custom resource and its status types.
//!
//! A `Stack` declares one CloudFormation stack: an opaque template body
//! plus optional parameters and tags. The operator owns the status
//! subresource and is the only writer of it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer token the operator places on every `Stack` it manages.
///
/// The token blocks deletion of the resource until the operator has
/// observed the provider-side stack reach `DELETE_COMPLETE` (or confirmed
/// it is gone).
pub const STACK_FINALIZER: &str = "finalizer.cloudformation.strato.dev";

/// Desired state of a CloudFormation stack.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "cloudformation.strato.dev",
    version = "v1alpha1",
    kind = "Stack",
    namespaced,
    status = "StackStatus",
    shortname = "cfs",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.stackStatus"}"#,
    printcolumn = r#"{"name":"Stack ID","type":"string","jsonPath":".status.stackID","priority":1}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StackSpec {
    /// The CloudFormation template body. Opaque to the operator.
    pub template: String,
    /// Stack parameters, passed through verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
    /// Stack tags declared on the resource. Appended after the
    /// operator-managed and default tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, String>>,
}

/// Observed state of a CloudFormation stack, written only by the operator.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    /// The provider-assigned stack identifier. Empty until the first
    /// successful create; stable once set.
    #[serde(default, rename = "stackID")]
    pub stack_id: String,
    /// The provider's stack status string, e.g. `CREATE_COMPLETE`.
    #[serde(default)]
    pub stack_status: String,
    /// When the provider created the stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<DateTime<Utc>>,
    /// When the provider last updated the stack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_time: Option<DateTime<Utc>>,
    /// Stack outputs as reported by the provider. Only present when the
    /// stack has outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,
    /// The resources managed by the stack. Replaced whole on each sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<StackResource>>,
}

/// One provider-managed resource inside a stack.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StackResource {
    /// Logical name of the resource within the template.
    #[serde(rename = "logicalID")]
    pub logical_id: String,
    /// Physical identifier of the realized resource. Empty until the
    /// provider has materialized it.
    #[serde(default, rename = "physicalID")]
    pub physical_id: String,
    /// The resource type, e.g. `AWS::S3::Bucket`.
    #[serde(rename = "type")]
    pub type_: String,
    /// The resource status string, e.g. `CREATE_COMPLETE`.
    pub status: String,
    /// Reason accompanying the status, if the provider supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

impl Stack {
    /// Whether the resource carries the operator's finalizer.
    #[must_use]
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|fs| fs.iter().any(|f| f == STACK_FINALIZER))
    }

    /// Whether the resource has been marked for deletion.
    #[must_use]
    pub fn marked_for_deletion(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// The recorded provider stack ID, if status carries a non-empty one.
    #[must_use]
    pub fn stack_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.stack_id.as_str())
            .filter(|id| !id.is_empty())
    }
}
