//! CloudFormation adapter for strato.
//!
//! This crate wraps the AWS CloudFormation API behind the
//! [`CloudFormation`] trait: a thin call-through that normalizes the
//! provider's stringly-typed failure modes ("does not exist", "No updates
//! are to be performed.", "Rate exceeded") into a small typed taxonomy,
//! plus the terminal-state classifier and the throttling backoff the
//! operator shares.
//!
//! # Testing
//!
//! Enable the `test-utils` feature to get [`MockCloudFormation`], an
//! in-memory provider with seedable stacks and call counters.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod error;
pub mod retry;
pub mod types;

pub use client::{AwsCloudFormation, CloudFormation};
pub use error::{CfnError, Result};
pub use types::{
    is_terminal, CreateStackRequest, Parameter, StackDescription, StackResourceSummary, Tag,
    UpdateOutcome, UpdateStackRequest,
};

#[cfg(any(test, feature = "test-utils"))]
pub use client::mock::MockCloudFormation;
