//! The stack lifecycle state machine and reconcile entry point.
//!
//! One invocation drives one resource exactly once: load, decide, issue
//! at most one mutating provider call, hand long-running work to the
//! follower, return. A reconciliation never blocks for the duration of a
//! stack operation.
//!
//! Decision order: deletion-marked resources run the delete path; a
//! missing finalizer is added (and nothing else happens that pass); an
//! existing non-terminal stack is handed to the follower; an existing
//! terminal stack is updated; an absent stack is created.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use strato_api::Stack;
use strato_cfn::{
    is_terminal, retry, CloudFormation, CreateStackRequest, UpdateOutcome, UpdateStackRequest,
};

use crate::config::OperatorConfig;
use crate::error::{OperatorError, Result};
use crate::follower::FollowerHandle;
use crate::ownership;
use crate::store::StackStore;
use crate::tags;

/// Backstop requeue while a provider operation is in flight. The follower
/// drives convergence; this only catches lost watch events.
const IN_PROGRESS_REQUEUE: Duration = Duration::from_secs(60);

/// Requeue while waiting for a deletion to reach its terminal state, so
/// the finalizer is released promptly.
const DELETE_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue after a failed reconciliation attempt.
const ERROR_REQUEUE: Duration = Duration::from_secs(15);

/// Reconciles `Stack` resources against the stack provider.
pub struct StackReconciler<S, C> {
    store: Arc<S>,
    cfn: Arc<C>,
    config: OperatorConfig,
    follower: FollowerHandle,
}

impl<S, C> StackReconciler<S, C>
where
    S: StackStore + 'static,
    C: CloudFormation + 'static,
{
    /// Create a reconciler over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        cfn: Arc<C>,
        config: OperatorConfig,
        follower: FollowerHandle,
    ) -> Self {
        Self {
            store,
            cfn,
            config,
            follower,
        }
    }

    /// Reconcile one resource.
    ///
    /// # Errors
    ///
    /// Returns an error when a provider or store call fails fatally; the
    /// controller requeues the resource through [`error_policy`].
    pub async fn reconcile(&self, stack: Arc<Stack>) -> Result<Action> {
        let name = stack.name_any();

        if stack.marked_for_deletion() {
            return self.finalize(&stack).await;
        }

        if !stack.has_finalizer() {
            debug!(stack = %name, "adding finalizer");
            self.store.add_finalizer(&stack).await?;
            return Ok(Action::await_change());
        }

        match ownership::describe(self.cfn.as_ref(), &stack).await? {
            Some(description) if !is_terminal(&description.status) => {
                debug!(
                    stack = %name,
                    status = %description.status,
                    "operation in progress, handing to follower"
                );
                self.follow(&stack);
                Ok(Action::requeue(IN_PROGRESS_REQUEUE))
            }
            Some(_) => {
                self.update(&stack).await?;
                Ok(Action::await_change())
            }
            None => {
                self.create(&stack).await?;
                Ok(Action::await_change())
            }
        }
    }

    async fn create(&self, stack: &Stack) -> Result<()> {
        let name = stack.name_any();
        info!(stack = %name, "creating stack");

        if self.config.dry_run {
            info!(stack = %name, "dry run, skipping stack creation");
            return Ok(());
        }
        if !self.check_ownership(stack, "create").await? {
            return Ok(());
        }

        let input = CreateStackRequest {
            name: name.clone(),
            template: stack.spec.template.clone(),
            parameters: tags::stack_parameters(stack),
            tags: tags::stack_tags(stack, &self.config.default_tags),
            capabilities: self.config.default_capabilities.clone(),
        };
        let stack_id = retry::with_backoff("CreateStack", || self.cfn.create_stack(&input)).await?;

        // Record the ID before anything else so subsequent polls can
        // address the stack by ID even if the name is reused or the stack
        // is deleted out of band.
        let mut status = stack.status.clone().unwrap_or_default();
        status.stack_id = stack_id;
        let mut tracked = stack.clone();
        tracked.status = Some(status.clone());
        self.store.update_status(stack, status).await?;

        self.follow(&tracked);
        Ok(())
    }

    async fn update(&self, stack: &Stack) -> Result<()> {
        let name = stack.name_any();
        info!(stack = %name, "updating stack");

        if self.config.dry_run {
            info!(stack = %name, "dry run, skipping stack update");
            return Ok(());
        }
        if !self.check_ownership(stack, "update").await? {
            return Ok(());
        }

        let input = UpdateStackRequest {
            name: name.clone(),
            template: stack.spec.template.clone(),
            parameters: tags::stack_parameters(stack),
            tags: tags::stack_tags(stack, &self.config.default_tags),
            capabilities: self.config.default_capabilities.clone(),
        };
        match retry::with_backoff("UpdateStack", || self.cfn.update_stack(&input)).await? {
            UpdateOutcome::NoChanges => {
                info!(stack = %name, "stack already up to date");
            }
            UpdateOutcome::Updated => {
                self.follow(stack);
            }
        }
        Ok(())
    }

    /// Run the delete path for a deletion-marked resource.
    ///
    /// The finalizer is released only once a poll observes the stack gone
    /// or `DELETE_COMPLETE`, never optimistically after the delete call.
    async fn finalize(&self, stack: &Stack) -> Result<Action> {
        let name = stack.name_any();

        if !stack.has_finalizer() {
            // Nothing left to release.
            return Ok(Action::await_change());
        }

        match ownership::describe(self.cfn.as_ref(), stack).await? {
            None => {
                info!(stack = %name, "stack gone, releasing finalizer");
                self.store.remove_finalizer(stack).await?;
                Ok(Action::await_change())
            }
            Some(description) if description.status.ends_with("DELETE_COMPLETE") => {
                info!(stack = %name, "stack deletion complete, releasing finalizer");
                self.store.remove_finalizer(stack).await?;
                Ok(Action::await_change())
            }
            Some(description) if !is_terminal(&description.status) => {
                debug!(
                    stack = %name,
                    status = %description.status,
                    "operation in progress before finalization, handing to follower"
                );
                self.follow(stack);
                Ok(Action::requeue(DELETE_REQUEUE))
            }
            Some(_) => {
                if !self.check_ownership(stack, "delete").await? {
                    info!(stack = %name, "stack not owned, releasing finalizer without deleting");
                    self.store.remove_finalizer(stack).await?;
                    return Ok(Action::await_change());
                }
                if self.config.dry_run {
                    info!(stack = %name, "dry run, skipping stack deletion, releasing finalizer");
                    self.store.remove_finalizer(stack).await?;
                    return Ok(Action::await_change());
                }

                info!(stack = %name, "deleting stack");
                let target = ownership::provider_ref(stack);
                retry::with_backoff("DeleteStack", || self.cfn.delete_stack(&target)).await?;
                self.follow(stack);
                Ok(Action::requeue(DELETE_REQUEUE))
            }
        }
    }

    /// Ownership is re-checked immediately before every mutating call:
    /// tags can change out of band between reconciliations. Denial is a
    /// logged no-op, never an error.
    async fn check_ownership(&self, stack: &Stack, action: &'static str) -> Result<bool> {
        if ownership::has_ownership(self.cfn.as_ref(), stack).await? {
            Ok(true)
        } else {
            info!(
                stack = %stack.name_any(),
                action,
                "stack not owned by this operator, skipping"
            );
            Ok(false)
        }
    }

    fn follow(&self, stack: &Stack) {
        self.follower.submit(Arc::new(stack.clone()));
    }
}

/// Requeue policy for failed reconciliation attempts.
pub fn error_policy<S, C>(
    stack: Arc<Stack>,
    error: &OperatorError,
    _reconciler: Arc<StackReconciler<S, C>>,
) -> Action
where
    S: StackStore + 'static,
    C: CloudFormation + 'static,
{
    warn!(
        stack = %stack.name_any(),
        error = %error,
        "reconciliation failed, requeueing"
    );
    Action::requeue(ERROR_REQUEUE)
}
