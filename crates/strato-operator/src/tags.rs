//! Compilation of provider call parameters and tags from a `Stack`.

use std::collections::BTreeMap;

use kube::ResourceExt;

use strato_api::Stack;
use strato_cfn::{Parameter, Tag};

use crate::ownership::{CONTROLLER_KEY, CONTROLLER_VALUE};

/// Tag key carrying a stable identifier of the owning resource.
pub const OWNER_KEY: &str = "kubernetes.io/owned-by";

/// Compile the parameter list from the spec. Pass-through, empty if the
/// spec declares none.
#[must_use]
pub fn stack_parameters(stack: &Stack) -> Vec<Parameter> {
    stack
        .spec
        .parameters
        .as_ref()
        .map(|params| {
            params
                .iter()
                .map(|(key, value)| Parameter::new(key, value))
                .collect()
        })
        .unwrap_or_default()
}

/// Compile the tag list for create and update calls.
///
/// Fixed order: the controller-identity tag, the owner-reference tag, the
/// configured default tags, then the tags declared on the spec. Duplicate
/// keys are not deduplicated here; duplicate-key behavior is
/// provider-defined and the provider is the final arbiter.
#[must_use]
pub fn stack_tags(stack: &Stack, default_tags: &BTreeMap<String, String>) -> Vec<Tag> {
    let owner = stack.uid().unwrap_or_else(|| {
        format!(
            "{}/{}",
            stack.namespace().unwrap_or_default(),
            stack.name_any()
        )
    });

    let mut tags = vec![
        Tag::new(CONTROLLER_KEY, CONTROLLER_VALUE),
        Tag::new(OWNER_KEY, owner),
    ];
    tags.extend(
        default_tags
            .iter()
            .map(|(key, value)| Tag::new(key, value)),
    );
    if let Some(spec_tags) = &stack.spec.tags {
        tags.extend(spec_tags.iter().map(|(key, value)| Tag::new(key, value)));
    }
    tags
}
