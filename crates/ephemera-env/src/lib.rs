//! # ephemera-env
//!
//! Lifecycle of ephemeral multi-container environments.
//!
//! - [`environment::Environment`]: one environment. Apply passes execute
//!   templates, build and fetch images, allocate network, addresses and
//!   ports, interpolate container configuration, start containers and gate
//!   on readiness checks. Teardown is idempotent and best-effort.
//! - [`manager::EnvManager`]: the set of live environments of a process.
//! - [`interpolate`]: placeholder data for container configuration and
//!   readiness check parameters.
//! - [`export::ExportedEnvironment`]: the serializable snapshot handed to
//!   clients.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod discovery;
pub mod environment;
pub mod export;
pub mod fanout;
pub mod interpolate;
pub mod manager;
pub mod ports;
pub mod registry;
