//! CloudFormation client implementations.
//!
//! This module provides the [`CloudFormation`] trait the operator programs
//! against, the [`AwsCloudFormation`] implementation backed by the AWS SDK,
//! and a mock implementation for tests.
//!
//! Every mutating call here is synchronous-request/asynchronous-effect:
//! the provider accepts the request and returns immediately while the
//! stack operation proceeds out of band. Convergence is observed through
//! `describe_stack`.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudformation::error::{DisplayErrorContext, SdkError};
use aws_sdk_cloudformation::types::{Capability, Parameter as CfnParameter, Tag as CfnTag};
use aws_sdk_cloudformation::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CfnError, Result};
use crate::types::{
    CreateStackRequest, Parameter, StackDescription, StackResourceSummary, Tag, UpdateOutcome,
    UpdateStackRequest,
};

/// The `CloudFormation` trait defines the stack provider surface the
/// operator depends on.
#[async_trait]
pub trait CloudFormation: Send + Sync {
    /// Describe a stack by name or stack ID.
    ///
    /// Returns `Ok(None)` when the stack does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the describe call fails for any reason other
    /// than the stack not existing.
    async fn describe_stack(&self, name_or_id: &str) -> Result<Option<StackDescription>>;

    /// Issue a stack create call and return the provider-assigned stack ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the request.
    async fn create_stack(&self, input: &CreateStackRequest) -> Result<String>;

    /// Issue a stack update call.
    ///
    /// A provider response of "no updates are to be performed" maps to
    /// [`UpdateOutcome::NoChanges`], not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the request.
    async fn update_stack(&self, input: &UpdateStackRequest) -> Result<UpdateOutcome>;

    /// Issue a stack delete call. Deleting an absent stack succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider rejects the request.
    async fn delete_stack(&self, name_or_id: &str) -> Result<()>;

    /// List all resources of a stack, consuming the pagination token to
    /// exhaustion.
    ///
    /// # Errors
    ///
    /// Returns an error if any page fails to fetch.
    async fn list_stack_resources(&self, stack_id: &str) -> Result<Vec<StackResourceSummary>>;
}

/// CloudFormation client backed by the AWS SDK.
pub struct AwsCloudFormation {
    client: Client,
}

impl AwsCloudFormation {
    /// Wrap an already-configured SDK client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the ambient AWS configuration, optionally
    /// pinning a region and assuming a cross-account role.
    pub async fn connect(region: Option<String>, assume_role: Option<String>) -> Self {
        let base = Self::load_config(region.clone()).await;

        let config = if let Some(role_arn) = assume_role {
            let provider = aws_config::sts::AssumeRoleProvider::builder(role_arn)
                .configure(&base)
                .build()
                .await;
            let mut loader =
                aws_config::defaults(BehaviorVersion::latest()).credentials_provider(provider);
            if let Some(region) = region {
                loader = loader.region(aws_config::Region::new(region));
            }
            loader.load().await
        } else {
            base
        };

        Self {
            client: Client::new(&config),
        }
    }

    async fn load_config(region: Option<String>) -> aws_config::SdkConfig {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        loader.load().await
    }
}

/// Map an SDK error onto the adapter's taxonomy.
///
/// CloudFormation reports "stack missing", "nothing to update" and
/// throttling through error text rather than distinct types, so the
/// classification matches on the rendered error chain.
fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> CfnError
where
    SdkError<E, R>: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}", DisplayErrorContext(&err));
    if message.contains("does not exist") {
        return CfnError::StackNotFound;
    }
    if message.contains("No updates are to be performed") {
        return CfnError::NoUpdates;
    }
    if message.contains("Rate exceeded") || message.contains("Throttling") {
        return CfnError::Throttled(message);
    }
    CfnError::Api { operation, message }
}

fn to_chrono(time: Option<&aws_sdk_cloudformation::primitives::DateTime>) -> Option<DateTime<Utc>> {
    time.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

fn to_description(stack: &aws_sdk_cloudformation::types::Stack) -> StackDescription {
    let outputs = stack
        .outputs()
        .iter()
        .filter_map(|o| {
            Some((
                o.output_key()?.to_string(),
                o.output_value().unwrap_or_default().to_string(),
            ))
        })
        .collect();

    let tags = stack
        .tags()
        .iter()
        .filter_map(|t| Some(Tag::new(t.key()?, t.value().unwrap_or_default())))
        .collect();

    StackDescription {
        stack_id: stack.stack_id().unwrap_or_default().to_string(),
        name: stack.stack_name().unwrap_or_default().to_string(),
        status: stack
            .stack_status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        status_reason: stack.stack_status_reason().map(ToString::to_string),
        outputs,
        tags,
        created_time: to_chrono(stack.creation_time()),
        updated_time: to_chrono(stack.last_updated_time()),
    }
}

fn to_sdk_parameters(parameters: &[Parameter]) -> Vec<CfnParameter> {
    parameters
        .iter()
        .map(|p| {
            CfnParameter::builder()
                .parameter_key(&p.key)
                .parameter_value(&p.value)
                .build()
        })
        .collect()
}

fn to_sdk_tags(operation: &'static str, tags: &[Tag]) -> Result<Vec<CfnTag>> {
    let _ = operation;
    tags.iter()
        .map(|t| {
            Ok(CfnTag::builder()
                .key(&t.key)
                .value(&t.value)
                .build())
        })
        .collect()
}

fn to_sdk_capabilities(capabilities: &[String]) -> Vec<Capability> {
    capabilities
        .iter()
        .map(|c| Capability::from(c.as_str()))
        .collect()
}

#[async_trait]
impl CloudFormation for AwsCloudFormation {
    async fn describe_stack(&self, name_or_id: &str) -> Result<Option<StackDescription>> {
        let resp = self
            .client
            .describe_stacks()
            .stack_name(name_or_id)
            .send()
            .await;

        match resp {
            Ok(output) => Ok(output.stacks().first().map(to_description)),
            Err(e) => match classify("DescribeStacks", e) {
                CfnError::StackNotFound => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn create_stack(&self, input: &CreateStackRequest) -> Result<String> {
        let output = self
            .client
            .create_stack()
            .stack_name(&input.name)
            .template_body(&input.template)
            .set_parameters(Some(to_sdk_parameters(&input.parameters)))
            .set_tags(Some(to_sdk_tags("CreateStack", &input.tags)?))
            .set_capabilities(Some(to_sdk_capabilities(&input.capabilities)))
            .send()
            .await
            .map_err(|e| classify("CreateStack", e))?;

        Ok(output.stack_id().unwrap_or_default().to_string())
    }

    async fn update_stack(&self, input: &UpdateStackRequest) -> Result<UpdateOutcome> {
        let resp = self
            .client
            .update_stack()
            .stack_name(&input.name)
            .template_body(&input.template)
            .set_parameters(Some(to_sdk_parameters(&input.parameters)))
            .set_tags(Some(to_sdk_tags("UpdateStack", &input.tags)?))
            .set_capabilities(Some(to_sdk_capabilities(&input.capabilities)))
            .send()
            .await;

        match resp {
            Ok(_) => Ok(UpdateOutcome::Updated),
            Err(e) => match classify("UpdateStack", e) {
                CfnError::NoUpdates => {
                    debug!(stack = %input.name, "nothing to update");
                    Ok(UpdateOutcome::NoChanges)
                }
                other => Err(other),
            },
        }
    }

    async fn delete_stack(&self, name_or_id: &str) -> Result<()> {
        let resp = self
            .client
            .delete_stack()
            .stack_name(name_or_id)
            .send()
            .await;

        match resp {
            Ok(_) => Ok(()),
            Err(e) => match classify("DeleteStack", e) {
                CfnError::StackNotFound => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_stack_resources(&self, stack_id: &str) -> Result<Vec<StackResourceSummary>> {
        let mut resources = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_stack_resources()
                .stack_name(stack_id)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| classify("ListStackResources", e))?;

            for summary in output.stack_resource_summaries() {
                resources.push(StackResourceSummary {
                    logical_id: summary.logical_resource_id().unwrap_or_default().to_string(),
                    physical_id: summary
                        .physical_resource_id()
                        .unwrap_or_default()
                        .to_string(),
                    type_: summary.resource_type().unwrap_or_default().to_string(),
                    status: summary
                        .resource_status()
                        .map(|s| s.as_str().to_string())
                        .unwrap_or_default(),
                    status_reason: summary.resource_status_reason().map(ToString::to_string),
                });
            }

            next_token = output.next_token().map(ToString::to_string);
            if next_token.is_none() {
                break;
            }
        }

        Ok(resources)
    }
}

/// A mock stack provider for testing without AWS.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::{
        async_trait, CfnError, CloudFormation, CreateStackRequest, Parameter, Result,
        StackDescription, StackResourceSummary, UpdateOutcome, UpdateStackRequest,
    };

    #[derive(Debug, Clone)]
    struct MockStack {
        description: StackDescription,
        resources: Vec<StackResourceSummary>,
        template: String,
        parameters: Vec<Parameter>,
    }

    /// An in-memory stack provider that records calls and lets tests
    /// steer stack state between polls.
    #[derive(Default)]
    pub struct MockCloudFormation {
        stacks: Mutex<HashMap<String, MockStack>>,
        describe_calls: AtomicU32,
        create_calls: AtomicU32,
        update_calls: AtomicU32,
        delete_calls: AtomicU32,
        throttle_describes: AtomicU32,
        fail_lists: AtomicU32,
        last_create: Mutex<Option<CreateStackRequest>>,
        last_update: Mutex<Option<UpdateStackRequest>>,
        stack_seq: AtomicU32,
    }

    impl MockCloudFormation {
        /// Create an empty mock provider.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed an existing stack with the given description.
        pub fn seed_stack(&self, description: StackDescription) {
            let name = description.name.clone();
            self.stacks.lock().insert(
                name,
                MockStack {
                    description,
                    resources: Vec::new(),
                    template: String::new(),
                    parameters: Vec::new(),
                },
            );
        }

        /// Overwrite the status of a seeded stack.
        pub fn set_status(&self, name: &str, status: &str) {
            if let Some(stack) = self.stacks.lock().get_mut(name) {
                stack.description.status = status.to_string();
            }
        }

        /// Set the resource list returned for a seeded stack.
        pub fn set_resources(&self, name: &str, resources: Vec<StackResourceSummary>) {
            if let Some(stack) = self.stacks.lock().get_mut(name) {
                stack.resources = resources;
            }
        }

        /// Remove a stack, as if deletion completed and it aged out.
        pub fn remove_stack(&self, name: &str) {
            self.stacks.lock().remove(name);
        }

        /// Make the next `n` describe calls fail with throttling.
        pub fn throttle_next_describes(&self, n: u32) {
            self.throttle_describes.store(n, Ordering::SeqCst);
        }

        /// Make the next `n` resource list calls fail.
        pub fn fail_next_list_calls(&self, n: u32) {
            self.fail_lists.store(n, Ordering::SeqCst);
        }

        /// Number of describe calls received.
        #[must_use]
        pub fn describe_count(&self) -> u32 {
            self.describe_calls.load(Ordering::SeqCst)
        }

        /// Number of create calls received.
        #[must_use]
        pub fn create_count(&self) -> u32 {
            self.create_calls.load(Ordering::SeqCst)
        }

        /// Number of update calls received.
        #[must_use]
        pub fn update_count(&self) -> u32 {
            self.update_calls.load(Ordering::SeqCst)
        }

        /// Number of delete calls received.
        #[must_use]
        pub fn delete_count(&self) -> u32 {
            self.delete_calls.load(Ordering::SeqCst)
        }

        /// The most recent create request, if any.
        #[must_use]
        pub fn last_create_request(&self) -> Option<CreateStackRequest> {
            self.last_create.lock().clone()
        }

        /// The most recent update request, if any.
        #[must_use]
        pub fn last_update_request(&self) -> Option<UpdateStackRequest> {
            self.last_update.lock().clone()
        }

        fn find(&self, name_or_id: &str) -> Option<MockStack> {
            let stacks = self.stacks.lock();
            stacks
                .get(name_or_id)
                .or_else(|| {
                    stacks
                        .values()
                        .find(|s| s.description.stack_id == name_or_id)
                })
                .cloned()
        }
    }

    #[async_trait]
    impl CloudFormation for MockCloudFormation {
        async fn describe_stack(&self, name_or_id: &str) -> Result<Option<StackDescription>> {
            self.describe_calls.fetch_add(1, Ordering::SeqCst);

            let pending = self.throttle_describes.load(Ordering::SeqCst);
            if pending > 0 {
                self.throttle_describes.store(pending - 1, Ordering::SeqCst);
                return Err(CfnError::Throttled("Rate exceeded".to_string()));
            }

            Ok(self.find(name_or_id).map(|s| s.description))
        }

        async fn create_stack(&self, input: &CreateStackRequest) -> Result<String> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_create.lock() = Some(input.clone());

            let seq = self.stack_seq.fetch_add(1, Ordering::SeqCst);
            let stack_id = format!(
                "arn:aws:cloudformation:eu-central-1:000000000000:stack/{}/{seq}",
                input.name
            );

            self.stacks.lock().insert(
                input.name.clone(),
                MockStack {
                    description: StackDescription {
                        stack_id: stack_id.clone(),
                        name: input.name.clone(),
                        status: "CREATE_IN_PROGRESS".to_string(),
                        status_reason: None,
                        outputs: std::collections::BTreeMap::new(),
                        tags: input.tags.clone(),
                        created_time: None,
                        updated_time: None,
                    },
                    resources: Vec::new(),
                    template: input.template.clone(),
                    parameters: input.parameters.clone(),
                },
            );

            Ok(stack_id)
        }

        async fn update_stack(&self, input: &UpdateStackRequest) -> Result<UpdateOutcome> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_update.lock() = Some(input.clone());

            let mut stacks = self.stacks.lock();
            let stack = stacks
                .values_mut()
                .find(|s| s.description.name == input.name || s.description.stack_id == input.name)
                .ok_or(CfnError::StackNotFound)?;

            if stack.template == input.template && stack.parameters == input.parameters {
                return Ok(UpdateOutcome::NoChanges);
            }

            stack.template = input.template.clone();
            stack.parameters = input.parameters.clone();
            stack.description.status = "UPDATE_IN_PROGRESS".to_string();
            Ok(UpdateOutcome::Updated)
        }

        async fn delete_stack(&self, name_or_id: &str) -> Result<()> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);

            let mut stacks = self.stacks.lock();
            if let Some(stack) = stacks
                .values_mut()
                .find(|s| s.description.name == name_or_id || s.description.stack_id == name_or_id)
            {
                stack.description.status = "DELETE_IN_PROGRESS".to_string();
            }
            Ok(())
        }

        async fn list_stack_resources(&self, stack_id: &str) -> Result<Vec<StackResourceSummary>> {
            let pending = self.fail_lists.load(Ordering::SeqCst);
            if pending > 0 {
                self.fail_lists.store(pending - 1, Ordering::SeqCst);
                return Err(CfnError::Api {
                    operation: "ListStackResources",
                    message: "injected failure".to_string(),
                });
            }

            self.find(stack_id)
                .map(|s| s.resources)
                .ok_or(CfnError::StackNotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockCloudFormation;
    use super::*;
    use crate::types::Tag;

    fn seeded_description(name: &str, status: &str) -> StackDescription {
        StackDescription {
            stack_id: format!("arn:aws:cloudformation:eu-central-1:111111111111:stack/{name}/0"),
            name: name.to_string(),
            status: status.to_string(),
            status_reason: None,
            outputs: std::collections::BTreeMap::new(),
            tags: vec![Tag::new("team", "platform")],
            created_time: None,
            updated_time: None,
        }
    }

    #[tokio::test]
    async fn mock_describe_by_name_and_id() {
        let cfn = MockCloudFormation::new();
        cfn.seed_stack(seeded_description("vpc", "CREATE_COMPLETE"));

        let by_name = cfn.describe_stack("vpc").await.unwrap().unwrap();
        assert_eq!(by_name.status, "CREATE_COMPLETE");

        let by_id = cfn
            .describe_stack(&by_name.stack_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_id.name, "vpc");

        assert!(cfn.describe_stack("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mock_create_assigns_stack_id() {
        let cfn = MockCloudFormation::new();
        let stack_id = cfn
            .create_stack(&CreateStackRequest {
                name: "vpc".to_string(),
                template: "{}".to_string(),
                ..CreateStackRequest::default()
            })
            .await
            .unwrap();

        assert!(stack_id.contains("stack/vpc"));
        let desc = cfn.describe_stack("vpc").await.unwrap().unwrap();
        assert_eq!(desc.stack_id, stack_id);
        assert_eq!(desc.status, "CREATE_IN_PROGRESS");
        assert_eq!(cfn.create_count(), 1);
    }

    #[tokio::test]
    async fn mock_update_reports_no_changes_when_unchanged() {
        let cfn = MockCloudFormation::new();
        cfn.create_stack(&CreateStackRequest {
            name: "vpc".to_string(),
            template: "{}".to_string(),
            ..CreateStackRequest::default()
        })
        .await
        .unwrap();

        let changed = UpdateStackRequest {
            name: "vpc".to_string(),
            template: "{\"Resources\":{}}".to_string(),
            ..UpdateStackRequest::default()
        };
        assert_eq!(
            cfn.update_stack(&changed).await.unwrap(),
            UpdateOutcome::Updated
        );
        assert_eq!(
            cfn.update_stack(&changed).await.unwrap(),
            UpdateOutcome::NoChanges
        );
    }

    #[tokio::test]
    async fn mock_delete_missing_stack_is_ok() {
        let cfn = MockCloudFormation::new();
        cfn.delete_stack("missing").await.unwrap();
        assert_eq!(cfn.delete_count(), 1);
    }

    #[tokio::test]
    async fn mock_throttles_describes_on_demand() {
        let cfn = MockCloudFormation::new();
        cfn.seed_stack(seeded_description("vpc", "CREATE_COMPLETE"));
        cfn.throttle_next_describes(1);

        assert!(matches!(
            cfn.describe_stack("vpc").await,
            Err(CfnError::Throttled(_))
        ));
        assert!(cfn.describe_stack("vpc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mock_lists_seeded_resources() {
        let cfn = MockCloudFormation::new();
        cfn.seed_stack(seeded_description("vpc", "CREATE_COMPLETE"));
        cfn.set_resources(
            "vpc",
            vec![StackResourceSummary {
                logical_id: "Vpc".to_string(),
                physical_id: "vpc-123".to_string(),
                type_: "AWS::EC2::VPC".to_string(),
                status: "CREATE_COMPLETE".to_string(),
                status_reason: None,
            }],
        );

        let resources = cfn.list_stack_resources("vpc").await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].physical_id, "vpc-123");
    }
}
