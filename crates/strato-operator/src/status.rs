//! Observed-status derivation and the compare-and-update write path.
//!
//! Both the reconciler and the follower converge status through this one
//! path: recompute every field from the provider's description, skip the
//! store write when nothing changed, and swallow stale writes.

use kube::ResourceExt;
use tracing::{debug, warn};

use strato_api::{Stack, StackResource, StackStatus};
use strato_cfn::{retry, CloudFormation, StackDescription, StackResourceSummary};

use crate::error::Result;
use crate::ownership;
use crate::store::{StackStore, StatusWrite};

fn to_stack_resource(summary: StackResourceSummary) -> StackResource {
    StackResource {
        logical_id: summary.logical_id,
        physical_id: summary.physical_id,
        type_: summary.type_,
        status: summary.status,
        status_reason: summary.status_reason,
    }
}

/// Recompute the full status from a provider description and resource
/// list.
///
/// The recorded stack ID is kept once set: `create_stack` is the only
/// writer of a new identity, so a describe answered by name for some
/// foreign stack of the same name can never clobber it.
#[must_use]
pub fn build_status(
    stack: &Stack,
    description: &StackDescription,
    resources: Vec<StackResourceSummary>,
) -> StackStatus {
    let recorded = stack.stack_id().unwrap_or_default();
    let stack_id = if recorded.is_empty() {
        description.stack_id.clone()
    } else {
        if recorded != description.stack_id {
            warn!(
                stack = %stack.name_any(),
                recorded,
                observed = %description.stack_id,
                "observed stack ID differs from recorded one, keeping recorded"
            );
        }
        recorded.to_string()
    };

    let outputs = if description.outputs.is_empty() {
        None
    } else {
        Some(description.outputs.clone())
    };

    StackStatus {
        stack_id,
        stack_status: description.status.clone(),
        created_time: description.created_time,
        updated_time: description.updated_time,
        outputs,
        resources: Some(resources.into_iter().map(to_stack_resource).collect()),
    }
}

/// Fetch (or reuse) the provider's view of a stack and converge the
/// resource's status onto it.
///
/// No-op when the stack no longer exists on the provider side, when the
/// recomputed status equals the stored one, or when the write turns out
/// stale (the object changed or vanished underneath us — the next poll
/// re-derives truth).
///
/// # Errors
///
/// Returns an error if a provider call fails or the store write fails for
/// a reason other than staleness.
pub async fn sync_status<S, C>(
    store: &S,
    cfn: &C,
    stack: &Stack,
    observed: Option<StackDescription>,
) -> Result<()>
where
    S: StackStore + ?Sized,
    C: CloudFormation + ?Sized,
{
    let description = match observed {
        Some(description) => description,
        None => match ownership::describe(cfn, stack).await? {
            Some(description) => description,
            None => {
                debug!(stack = %stack.name_any(), "stack gone, nothing to sync");
                return Ok(());
            }
        },
    };

    let resources = retry::with_backoff("ListStackResources", || {
        cfn.list_stack_resources(&description.stack_id)
    })
    .await?;

    let next = build_status(stack, &description, resources);
    if stack.status.as_ref() == Some(&next) {
        debug!(stack = %stack.name_any(), "status unchanged, skipping write");
        return Ok(());
    }

    match store.update_status(stack, next).await? {
        StatusWrite::Applied => {
            debug!(stack = %stack.name_any(), status = %description.status, "status updated");
        }
        StatusWrite::Stale => {
            debug!(stack = %stack.name_any(), "status already converged elsewhere");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::mock::MockStackStore;
    use strato_api::StackSpec;
    use strato_cfn::{MockCloudFormation, Tag};

    fn sample_stack(name: &str) -> Stack {
        let mut stack = Stack::new(
            name,
            StackSpec {
                template: "{}".to_string(),
                parameters: None,
                tags: None,
            },
        );
        stack.metadata.namespace = Some("default".to_string());
        stack
    }

    fn description(name: &str, status: &str) -> StackDescription {
        StackDescription {
            stack_id: format!("arn:aws:cloudformation:eu-central-1:111111111111:stack/{name}/0"),
            name: name.to_string(),
            status: status.to_string(),
            status_reason: None,
            outputs: BTreeMap::new(),
            tags: vec![Tag::new("team", "platform")],
            created_time: None,
            updated_time: None,
        }
    }

    #[test]
    fn build_status_fills_empty_stack_id() {
        let stack = sample_stack("vpc");
        let desc = description("vpc", "CREATE_COMPLETE");

        let status = build_status(&stack, &desc, Vec::new());
        assert_eq!(status.stack_id, desc.stack_id);
        assert_eq!(status.stack_status, "CREATE_COMPLETE");
        assert!(status.outputs.is_none());
        assert_eq!(status.resources, Some(Vec::new()));
    }

    #[test]
    fn build_status_never_overwrites_recorded_stack_id() {
        let mut stack = sample_stack("vpc");
        stack.status = Some(StackStatus {
            stack_id: "arn:aws:cloudformation:eu-central-1:111:stack/vpc/original".to_string(),
            ..StackStatus::default()
        });

        let desc = description("vpc", "CREATE_COMPLETE");
        let status = build_status(&stack, &desc, Vec::new());
        assert_eq!(
            status.stack_id,
            "arn:aws:cloudformation:eu-central-1:111:stack/vpc/original"
        );
    }

    #[test]
    fn build_status_carries_outputs_only_when_present() {
        let stack = sample_stack("vpc");
        let mut desc = description("vpc", "CREATE_COMPLETE");
        desc.outputs
            .insert("VpcId".to_string(), "vpc-123".to_string());

        let status = build_status(&stack, &desc, Vec::new());
        assert_eq!(
            status.outputs,
            Some(BTreeMap::from([(
                "VpcId".to_string(),
                "vpc-123".to_string()
            )]))
        );
    }

    #[tokio::test]
    async fn sync_skips_write_when_status_unchanged() {
        let store = MockStackStore::new();
        let cfn = MockCloudFormation::new();

        let desc = description("vpc", "CREATE_COMPLETE");
        cfn.seed_stack(desc.clone());

        let mut stack = sample_stack("vpc");
        stack.status = Some(StackStatus {
            stack_id: desc.stack_id.clone(),
            stack_status: "CREATE_COMPLETE".to_string(),
            created_time: None,
            updated_time: None,
            outputs: None,
            resources: Some(Vec::new()),
        });
        store.insert(stack.clone());

        sync_status(&store, &cfn, &stack, None).await.unwrap();
        assert_eq!(store.status_write_count(), 0);
    }

    #[tokio::test]
    async fn sync_writes_when_status_changed() {
        let store = MockStackStore::new();
        let cfn = MockCloudFormation::new();
        cfn.seed_stack(description("vpc", "UPDATE_IN_PROGRESS"));

        let stack = sample_stack("vpc");
        store.insert(stack.clone());

        sync_status(&store, &cfn, &stack, None).await.unwrap();
        assert_eq!(store.status_write_count(), 1);

        let stored = store.get_stack("default", "vpc").unwrap();
        assert_eq!(
            stored.status.unwrap().stack_status,
            "UPDATE_IN_PROGRESS"
        );
    }

    #[tokio::test]
    async fn sync_swallows_stale_writes() {
        let store = MockStackStore::new();
        let cfn = MockCloudFormation::new();
        cfn.seed_stack(description("vpc", "UPDATE_IN_PROGRESS"));

        let stack = sample_stack("vpc");
        store.insert(stack.clone());
        store.conflict_next_status_write();

        sync_status(&store, &cfn, &stack, None).await.unwrap();
        assert_eq!(store.status_write_count(), 0);
    }

    #[tokio::test]
    async fn sync_tolerates_missing_stack() {
        let store = MockStackStore::new();
        let cfn = MockCloudFormation::new();

        let stack = sample_stack("vpc");
        store.insert(stack.clone());

        sync_status(&store, &cfn, &stack, None).await.unwrap();
        assert_eq!(store.status_write_count(), 0);
    }
}
