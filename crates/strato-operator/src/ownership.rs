//! Ownership resolution for provider-side stacks.
//!
//! The operator tags every stack it creates with a controller-identity
//! tag. A stack carrying that tag (or not existing at all) may be mutated;
//! anything else belongs to another actor and is left alone, even during
//! resource finalization.

use kube::ResourceExt;

use strato_api::Stack;
use strato_cfn::{retry, CloudFormation, Result, StackDescription};

/// Tag key marking the controller that manages a stack.
pub const CONTROLLER_KEY: &str = "kubernetes.io/controlled-by";
/// Tag value identifying this operator.
pub const CONTROLLER_VALUE: &str = "cloudformation.strato.dev/operator";

/// The provider-side handle for a stack: the recorded stack ID when status
/// carries one, the resource name otherwise.
///
/// Deleted stacks stop being addressable by name, so the ID is preferred
/// as soon as it is known.
#[must_use]
pub fn provider_ref(stack: &Stack) -> String {
    stack
        .stack_id()
        .map_or_else(|| stack.name_any(), ToString::to_string)
}

/// Describe the provider-side stack for a resource, retrying through
/// throttling.
///
/// # Errors
///
/// Returns an error if the describe call fails; a missing stack is
/// `Ok(None)`.
pub async fn describe<C: CloudFormation + ?Sized>(
    cfn: &C,
    stack: &Stack,
) -> Result<Option<StackDescription>> {
    let target = provider_ref(stack);
    retry::with_backoff("DescribeStacks", || cfn.describe_stack(&target)).await
}

/// Whether a described stack carries this operator's identity tag.
#[must_use]
pub fn is_owned(description: &StackDescription) -> bool {
    description
        .tags
        .iter()
        .any(|t| t.key == CONTROLLER_KEY && t.value == CONTROLLER_VALUE)
}

/// Whether this operator may mutate the provider-side stack for the given
/// resource.
///
/// A stack that does not exist is always owned (fresh claim). A stack
/// that exists is owned only if it carries the controller-identity tag.
///
/// # Errors
///
/// Returns an error if the underlying describe call fails.
pub async fn has_ownership<C: CloudFormation + ?Sized>(cfn: &C, stack: &Stack) -> Result<bool> {
    match describe(cfn, stack).await? {
        None => Ok(true),
        Some(description) => Ok(is_owned(&description)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use strato_api::{StackSpec, StackStatus};
    use strato_cfn::{MockCloudFormation, Tag};

    fn sample_stack(name: &str) -> Stack {
        Stack::new(
            name,
            StackSpec {
                template: "{}".to_string(),
                parameters: None,
                tags: None,
            },
        )
    }

    fn description(name: &str, tags: Vec<Tag>) -> StackDescription {
        StackDescription {
            stack_id: format!("arn:aws:cloudformation:eu-central-1:111111111111:stack/{name}/0"),
            name: name.to_string(),
            status: "CREATE_COMPLETE".to_string(),
            status_reason: None,
            outputs: BTreeMap::new(),
            tags,
            created_time: None,
            updated_time: None,
        }
    }

    #[test]
    fn provider_ref_prefers_recorded_stack_id() {
        let mut stack = sample_stack("vpc");
        assert_eq!(provider_ref(&stack), "vpc");

        stack.status = Some(StackStatus {
            stack_id: "arn:aws:cloudformation:eu-central-1:111:stack/vpc/1".to_string(),
            ..StackStatus::default()
        });
        assert_eq!(
            provider_ref(&stack),
            "arn:aws:cloudformation:eu-central-1:111:stack/vpc/1"
        );
    }

    #[tokio::test]
    async fn absent_stack_is_a_fresh_claim() {
        let cfn = MockCloudFormation::new();
        assert!(has_ownership(&cfn, &sample_stack("vpc")).await.unwrap());
    }

    #[tokio::test]
    async fn tagged_stack_is_owned() {
        let cfn = MockCloudFormation::new();
        cfn.seed_stack(description(
            "vpc",
            vec![Tag::new(CONTROLLER_KEY, CONTROLLER_VALUE)],
        ));
        assert!(has_ownership(&cfn, &sample_stack("vpc")).await.unwrap());
    }

    #[tokio::test]
    async fn foreign_stack_is_not_owned() {
        let cfn = MockCloudFormation::new();
        cfn.seed_stack(description("vpc", vec![Tag::new("team", "platform")]));
        assert!(!has_ownership(&cfn, &sample_stack("vpc")).await.unwrap());

        // Same key, wrong value.
        cfn.seed_stack(description(
            "other",
            vec![Tag::new(CONTROLLER_KEY, "someone-else/operator")],
        ));
        assert!(!has_ownership(&cfn, &sample_stack("other")).await.unwrap());
    }
}
