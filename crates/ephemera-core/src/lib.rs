//! # ephemera-core
//!
//! Scarce-resource allocators for the Ephemera orchestration engine.
//!
//! - **IP**: sequential address allocation inside a network's subnet.
//! - **Ports**: a process-wide allocator over an external port range that
//!   probes real availability before handing a port out.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod ip;
pub mod ports;
