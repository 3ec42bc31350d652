//! Background convergence tracking for in-flight stack operations.
//!
//! Mutating provider calls return before the stack operation finishes, and
//! the resource store only notifies when the object itself changes, so
//! something has to keep polling until the provider reaches a terminal
//! state. That is the follower: a registry of in-flight stacks, a receiver
//! draining submissions from the reconciler, and a worker sweeping the
//! registry on a fixed interval.
//!
//! The registry is the only mutable shared state in the core and the
//! follower owns it exclusively; the reconciler hands stacks over through
//! the submission channel and never touches the registry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use strato_api::Stack;
use strato_cfn::{is_terminal, CloudFormation};

use crate::ownership;
use crate::status;
use crate::store::StackStore;

/// Capacity of the submission queue. Drops are recoverable: the
/// reconciler re-submits any stack it still observes non-terminal.
const SUBMISSION_QUEUE_DEPTH: usize = 64;

/// How often the worker sweeps the registry.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on each per-stack sync within a sweep, so one stuck call cannot
/// stall the whole sweep.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the submission channel for a follower.
#[must_use]
pub fn channel() -> (FollowerHandle, mpsc::Receiver<Arc<Stack>>) {
    let (tx, rx) = mpsc::channel(SUBMISSION_QUEUE_DEPTH);
    (FollowerHandle { tx }, rx)
}

/// Sending half of the follower's submission queue, held by the
/// reconciler.
#[derive(Clone)]
pub struct FollowerHandle {
    tx: mpsc::Sender<Arc<Stack>>,
}

impl FollowerHandle {
    /// Submit a stack for convergence tracking. Never blocks; a full
    /// queue drops the submission with a warning.
    pub fn submit(&self, stack: Arc<Stack>) {
        if self.tx.try_send(stack).is_err() {
            warn!("follower submission queue full, dropping submission");
        }
    }
}

/// Tracks stacks whose provider-side operation is still in progress and
/// polls them to a terminal state.
pub struct StackFollower<S, C> {
    store: Arc<S>,
    cfn: Arc<C>,
    registry: DashMap<String, Arc<Stack>>,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl<S, C> StackFollower<S, C>
where
    S: StackStore + 'static,
    C: CloudFormation + 'static,
{
    /// Create a follower over the given store and provider.
    #[must_use]
    pub fn new(store: Arc<S>, cfn: Arc<C>) -> Self {
        Self {
            store,
            cfn,
            registry: DashMap::new(),
            poll_interval: POLL_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    /// Whether a stack is currently tracked.
    #[must_use]
    pub fn is_following(&self, stack_id: &str) -> bool {
        self.registry.contains_key(stack_id)
    }

    /// Number of tracked stacks.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.registry.len()
    }

    /// Run the receiver and worker until the submission channel closes.
    ///
    /// Spawn this as a background task; it does not return in normal
    /// operation.
    pub async fn run(self: Arc<Self>, rx: mpsc::Receiver<Arc<Stack>>) {
        let receiver = {
            let follower = Arc::clone(&self);
            async move { follower.receive(rx).await }
        };
        let worker = {
            let follower = Arc::clone(&self);
            async move { follower.sweep_loop().await }
        };
        tokio::join!(receiver, worker);
    }

    async fn receive(&self, mut rx: mpsc::Receiver<Arc<Stack>>) {
        while let Some(stack) = rx.recv().await {
            self.admit(stack).await;
        }
        warn!("follower submission channel closed");
    }

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// Add a submitted stack to the registry (if not already tracked) and
    /// sync its status once immediately.
    async fn admit(&self, stack: Arc<Stack>) {
        let key = ownership::provider_ref(&stack);
        if !self.registry.contains_key(&key) {
            info!(stack_id = %key, "following stack");
            self.registry.insert(key.clone(), Arc::clone(&stack));
        }

        if let Err(e) =
            status::sync_status(self.store.as_ref(), self.cfn.as_ref(), &stack, None).await
        {
            warn!(stack_id = %key, error = %e, "initial status sync failed");
        }
    }

    /// Poll every tracked stack once.
    pub async fn sweep(&self) {
        let entries: Vec<(String, Arc<Stack>)> = self
            .registry
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (stack_id, stack) in entries {
            self.poll_one(&stack_id, &stack).await;
        }
    }

    async fn poll_one(&self, stack_id: &str, stack: &Arc<Stack>) {
        let described = tokio::time::timeout(
            self.request_timeout,
            self.cfn.describe_stack(stack_id),
        )
        .await;

        let description = match described {
            Err(_) => {
                warn!(stack_id, "status poll timed out, keeping stack tracked");
                return;
            }
            Ok(Err(e)) => {
                warn!(stack_id, error = %e, "status poll failed, keeping stack tracked");
                return;
            }
            Ok(Ok(None)) => {
                info!(stack_id, "stack no longer exists, dropping");
                self.registry.remove(stack_id);
                return;
            }
            Ok(Ok(Some(description))) => description,
        };

        if is_terminal(&description.status) {
            info!(stack_id, status = %description.status, "stack reached terminal state");
            self.registry.remove(stack_id);
        } else {
            debug!(stack_id, status = %description.status, "operation still in progress");
        }

        let synced = tokio::time::timeout(
            self.request_timeout,
            status::sync_status(
                self.store.as_ref(),
                self.cfn.as_ref(),
                stack,
                Some(description),
            ),
        )
        .await;

        let failed = !matches!(synced, Ok(Ok(())));
        if failed {
            // Put the entry back so the next sweep retries it instead of
            // silently dropping a half-converged stack.
            warn!(stack_id, "status sync failed, re-tracking stack");
            self.registry
                .insert(stack_id.to_string(), Arc::clone(stack));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::store::mock::MockStackStore;
    use strato_api::{StackSpec, StackStatus};
    use strato_cfn::{MockCloudFormation, StackDescription};

    fn sample_stack(name: &str, stack_id: &str) -> Arc<Stack> {
        let mut stack = Stack::new(
            name,
            StackSpec {
                template: "{}".to_string(),
                parameters: None,
                tags: None,
            },
        );
        stack.metadata.namespace = Some("default".to_string());
        stack.status = Some(StackStatus {
            stack_id: stack_id.to_string(),
            ..StackStatus::default()
        });
        Arc::new(stack)
    }

    fn description(name: &str, status: &str) -> StackDescription {
        StackDescription {
            stack_id: format!("arn:aws:cloudformation:eu-central-1:111111111111:stack/{name}/0"),
            name: name.to_string(),
            status: status.to_string(),
            status_reason: None,
            outputs: BTreeMap::new(),
            tags: Vec::new(),
            created_time: None,
            updated_time: None,
        }
    }

    fn follower(
        store: Arc<MockStackStore>,
        cfn: Arc<MockCloudFormation>,
    ) -> StackFollower<MockStackStore, MockCloudFormation> {
        StackFollower::new(store, cfn)
    }

    #[tokio::test]
    async fn admit_tracks_once_and_syncs_immediately() {
        let store = Arc::new(MockStackStore::new());
        let cfn = Arc::new(MockCloudFormation::new());

        let desc = description("web", "UPDATE_IN_PROGRESS");
        cfn.seed_stack(desc.clone());

        let stack = sample_stack("web", &desc.stack_id);
        store.insert((*stack).clone());

        let follower = follower(Arc::clone(&store), Arc::clone(&cfn));
        follower.admit(Arc::clone(&stack)).await;
        follower.admit(Arc::clone(&stack)).await;

        assert_eq!(follower.tracked_count(), 1);
        assert!(follower.is_following(&desc.stack_id));
        // The immediate sync recorded the in-progress status.
        let stored = store.get_stack("default", "web").unwrap();
        assert_eq!(stored.status.unwrap().stack_status, "UPDATE_IN_PROGRESS");
    }

    #[tokio::test]
    async fn sweep_evicts_on_terminal_state_and_updates_status_once() {
        let store = Arc::new(MockStackStore::new());
        let cfn = Arc::new(MockCloudFormation::new());

        let desc = description("web", "UPDATE_IN_PROGRESS");
        cfn.seed_stack(desc.clone());

        let stack = sample_stack("web", &desc.stack_id);
        store.insert((*stack).clone());

        let follower = follower(Arc::clone(&store), Arc::clone(&cfn));
        follower.admit(Arc::clone(&stack)).await;
        let writes_after_admit = store.status_write_count();

        cfn.set_status("web", "UPDATE_COMPLETE");
        follower.sweep().await;

        assert!(!follower.is_following(&desc.stack_id));
        assert_eq!(store.status_write_count() - writes_after_admit, 1);
        let stored = store.get_stack("default", "web").unwrap();
        assert_eq!(stored.status.unwrap().stack_status, "UPDATE_COMPLETE");
    }

    #[tokio::test]
    async fn sweep_keeps_tracking_while_in_progress() {
        let store = Arc::new(MockStackStore::new());
        let cfn = Arc::new(MockCloudFormation::new());

        let desc = description("web", "CREATE_IN_PROGRESS");
        cfn.seed_stack(desc.clone());

        let stack = sample_stack("web", &desc.stack_id);
        store.insert((*stack).clone());

        let follower = follower(Arc::clone(&store), Arc::clone(&cfn));
        follower.admit(Arc::clone(&stack)).await;
        follower.sweep().await;

        assert!(follower.is_following(&desc.stack_id));
    }

    #[tokio::test]
    async fn sweep_evicts_missing_stacks() {
        let store = Arc::new(MockStackStore::new());
        let cfn = Arc::new(MockCloudFormation::new());

        let desc = description("web", "DELETE_IN_PROGRESS");
        cfn.seed_stack(desc.clone());

        let stack = sample_stack("web", &desc.stack_id);
        store.insert((*stack).clone());

        let follower = follower(Arc::clone(&store), Arc::clone(&cfn));
        follower.admit(Arc::clone(&stack)).await;
        assert!(follower.is_following(&desc.stack_id));

        cfn.remove_stack("web");
        follower.sweep().await;
        assert!(!follower.is_following(&desc.stack_id));
    }

    #[tokio::test]
    async fn failed_sync_during_eviction_re_tracks_the_stack() {
        let store = Arc::new(MockStackStore::new());
        let cfn = Arc::new(MockCloudFormation::new());

        let desc = description("web", "UPDATE_IN_PROGRESS");
        cfn.seed_stack(desc.clone());

        let stack = sample_stack("web", &desc.stack_id);
        store.insert((*stack).clone());

        let follower = follower(Arc::clone(&store), Arc::clone(&cfn));
        follower.admit(Arc::clone(&stack)).await;

        cfn.set_status("web", "UPDATE_COMPLETE");
        cfn.fail_next_list_calls(1);
        follower.sweep().await;

        // The terminal state evicted the entry, but the failed sync put
        // it back for the next sweep.
        assert!(follower.is_following(&desc.stack_id));

        follower.sweep().await;
        assert!(!follower.is_following(&desc.stack_id));
        let stored = store.get_stack("default", "web").unwrap();
        assert_eq!(stored.status.unwrap().stack_status, "UPDATE_COMPLETE");
    }

    #[tokio::test]
    async fn submissions_flow_through_the_channel() {
        let store = Arc::new(MockStackStore::new());
        let cfn = Arc::new(MockCloudFormation::new());

        let desc = description("web", "CREATE_IN_PROGRESS");
        cfn.seed_stack(desc.clone());

        let stack = sample_stack("web", &desc.stack_id);
        store.insert((*stack).clone());

        let follower = Arc::new(StackFollower::new(Arc::clone(&store), Arc::clone(&cfn)));
        let (handle, mut rx) = channel();

        handle.submit(Arc::clone(&stack));
        let submitted = rx.recv().await.unwrap();
        follower.admit(submitted).await;

        assert!(follower.is_following(&desc.stack_id));
    }
}
