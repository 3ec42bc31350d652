//! Custom resource definitions for strato.
//!
//! This crate defines the `Stack` custom resource
//! (`cloudformation.strato.dev/v1alpha1`) that declares a desired AWS
//! CloudFormation stack, along with the status types the operator writes
//! back onto it.
//!
//! # Example
//!
//! ```
//! use strato_api::{Stack, StackSpec};
//!
//! let stack = Stack::new(
//!     "my-stack",
//!     StackSpec {
//!         template: "{}".to_string(),
//!         parameters: None,
//!         tags: None,
//!     },
//! );
//! assert!(stack.status.is_none());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod stack;

pub use stack::{Stack, StackResource, StackSpec, StackStatus, STACK_FINALIZER};
