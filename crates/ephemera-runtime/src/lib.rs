//! # ephemera-runtime
//!
//! The seam between the orchestration engine and a container runtime.
//!
//! - [`engine::ContainerEngine`]: the asynchronous driver interface.
//! - [`archive`]: packing a workspace directory into a build context.
//! - [`dry_run::DryRunEngine`]: an in-memory driver that records calls.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod archive;
pub mod dry_run;
pub mod engine;
