//! The resource-store seam.
//!
//! The [`StackStore`] trait is the operator's view of the Kubernetes API
//! for `Stack` objects: load, finalizer management, and status writes with
//! optimistic concurrency. The reconciler and follower are generic over it
//! so tests can run against [`mock::MockStackStore`] without a cluster.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::debug;

use strato_api::{Stack, StackStatus, STACK_FINALIZER};

use crate::error::Result;

/// Outcome of a status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    /// The write was applied.
    Applied,
    /// The write lost an optimistic-concurrency race or the object is
    /// gone. Someone else already converged this; the next poll
    /// re-derives truth.
    Stale,
}

/// Store operations the operator needs on `Stack` objects.
#[async_trait]
pub trait StackStore: Send + Sync {
    /// Fetch a stack by namespace and name.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails for any reason other than
    /// the object not existing.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Stack>>;

    /// Add the operator's finalizer to the object. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn add_finalizer(&self, stack: &Stack) -> Result<Stack>;

    /// Remove the operator's finalizer from the object. Removing from an
    /// already-deleted object succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn remove_finalizer(&self, stack: &Stack) -> Result<Stack>;

    /// Write the status subresource, guarded by the object's
    /// optimistic-concurrency token.
    ///
    /// # Errors
    ///
    /// Returns an error on failures other than conflict/not-found, which
    /// map to [`StatusWrite::Stale`].
    async fn update_status(&self, stack: &Stack, status: StackStatus) -> Result<StatusWrite>;
}

/// `StackStore` backed by the Kubernetes API.
pub struct KubeStackStore {
    client: kube::Client,
}

impl KubeStackStore {
    /// Wrap a Kubernetes client.
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api_for(&self, stack: &Stack) -> Api<Stack> {
        match stack.namespace() {
            Some(ns) => Api::namespaced(self.client.clone(), &ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }

    async fn patch_finalizers(&self, stack: &Stack, finalizers: Vec<String>) -> Result<Stack> {
        let api = self.api_for(stack);
        let name = stack.name_any();
        // Carrying resourceVersion makes the merge patch conditional.
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": stack.resource_version(),
            }
        });
        Ok(api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}

#[async_trait]
impl StackStore for KubeStackStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Stack>> {
        let api: Api<Stack> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn add_finalizer(&self, stack: &Stack) -> Result<Stack> {
        let mut finalizers = stack.finalizers().to_vec();
        if finalizers.iter().any(|f| f == STACK_FINALIZER) {
            return Ok(stack.clone());
        }
        finalizers.push(STACK_FINALIZER.to_string());
        self.patch_finalizers(stack, finalizers).await
    }

    async fn remove_finalizer(&self, stack: &Stack) -> Result<Stack> {
        let finalizers: Vec<String> = stack
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != STACK_FINALIZER)
            .cloned()
            .collect();

        match self.patch_finalizers(stack, finalizers).await {
            Ok(updated) => Ok(updated),
            Err(crate::error::OperatorError::Kube(kube::Error::Api(ae))) if ae.code == 404 => {
                debug!(stack = %stack.name_any(), "object already gone while removing finalizer");
                Ok(stack.clone())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_status(&self, stack: &Stack, status: StackStatus) -> Result<StatusWrite> {
        let api = self.api_for(stack);
        let name = stack.name_any();

        let mut obj = stack.clone();
        obj.status = Some(status);
        let data = serde_json::to_vec(&obj)?;

        match api.replace_status(&name, &PostParams::default(), data).await {
            Ok(_) => Ok(StatusWrite::Applied),
            Err(kube::Error::Api(ae)) if ae.code == 409 || ae.code == 404 => {
                debug!(stack = %name, code = ae.code, "stale status write, skipping");
                Ok(StatusWrite::Stale)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A mock store for testing without a cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use parking_lot::Mutex;

    use super::{async_trait, Result, Stack, StackStatus, StackStore, StatusWrite, STACK_FINALIZER};
    use kube::ResourceExt;

    /// An in-memory `StackStore` that records writes.
    #[derive(Default)]
    pub struct MockStackStore {
        objects: Mutex<HashMap<(String, String), Stack>>,
        status_writes: AtomicU32,
        conflict_next_status: AtomicBool,
    }

    fn key_of(stack: &Stack) -> (String, String) {
        (
            stack.namespace().unwrap_or_else(|| "default".to_string()),
            stack.name_any(),
        )
    }

    impl MockStackStore {
        /// Create an empty mock store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert or replace an object.
        pub fn insert(&self, stack: Stack) {
            self.objects.lock().insert(key_of(&stack), stack);
        }

        /// Fetch the stored copy of an object.
        #[must_use]
        pub fn get_stack(&self, namespace: &str, name: &str) -> Option<Stack> {
            self.objects
                .lock()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
        }

        /// Number of applied status writes.
        #[must_use]
        pub fn status_write_count(&self) -> u32 {
            self.status_writes.load(Ordering::SeqCst)
        }

        /// Make the next status write fail with a conflict.
        pub fn conflict_next_status_write(&self) {
            self.conflict_next_status.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StackStore for MockStackStore {
        async fn get(&self, namespace: &str, name: &str) -> Result<Option<Stack>> {
            Ok(self.get_stack(namespace, name))
        }

        async fn add_finalizer(&self, stack: &Stack) -> Result<Stack> {
            let mut objects = self.objects.lock();
            let entry = objects.entry(key_of(stack)).or_insert_with(|| stack.clone());
            let finalizers = entry.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == STACK_FINALIZER) {
                finalizers.push(STACK_FINALIZER.to_string());
            }
            Ok(entry.clone())
        }

        async fn remove_finalizer(&self, stack: &Stack) -> Result<Stack> {
            let mut objects = self.objects.lock();
            let entry = objects.entry(key_of(stack)).or_insert_with(|| stack.clone());
            if let Some(finalizers) = entry.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != STACK_FINALIZER);
            }
            Ok(entry.clone())
        }

        async fn update_status(&self, stack: &Stack, status: StackStatus) -> Result<StatusWrite> {
            if self.conflict_next_status.swap(false, Ordering::SeqCst) {
                return Ok(StatusWrite::Stale);
            }

            let mut objects = self.objects.lock();
            let Some(entry) = objects.get_mut(&key_of(stack)) else {
                return Ok(StatusWrite::Stale);
            };
            entry.status = Some(status);
            self.status_writes.fetch_add(1, Ordering::SeqCst);
            Ok(StatusWrite::Applied)
        }
    }
}
