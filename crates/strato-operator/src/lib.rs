//! Kubernetes operator converging `Stack` resources against AWS
//! CloudFormation.
//!
//! The operator watches `Stack` objects, claims ownership of the
//! provider-side stacks it creates via a controller-identity tag, and
//! drives create/update/delete operations to convergence without ever
//! blocking a reconciliation on a multi-minute stack operation.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Kubernetes API Server                     │
//! └──────────────────────────────────────────────────────────────┘
//!        │ watch events                        ▲ status writes
//!        ▼                                     │
//! ┌─────────────────┐   submissions   ┌─────────────────────────┐
//! │ StackReconciler │ ──────────────▶ │      StackFollower      │
//! │  (state machine │    (bounded     │  Receiver ── Worker     │
//! │   + ownership + │     queue)      │   registry: stack ID    │
//! │   tag compiler) │                 │   → tracked resource    │
//! └─────────────────┘                 └─────────────────────────┘
//!        │                                     │ interval polls
//!        ▼                                     ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    AWS CloudFormation API                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Mutating calls return as soon as the provider accepts them; the
//! follower polls the in-flight stacks on its own interval and retires
//! them once their status turns terminal (`*_COMPLETE` / `*_FAILED`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod follower;
pub mod ownership;
pub mod reconciler;
pub mod status;
pub mod store;
pub mod tags;

pub use config::OperatorConfig;
pub use error::{OperatorError, Result};
pub use follower::{FollowerHandle, StackFollower};
pub use reconciler::{error_policy, StackReconciler};
pub use store::{KubeStackStore, StackStore, StatusWrite};

#[cfg(any(test, feature = "test-utils"))]
pub use store::mock::MockStackStore;
