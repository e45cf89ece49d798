//! # ephemera-template
//!
//! Turns parameterized template scripts into plain image and container
//! declarations.
//!
//! - **Sandbox**: runs a `*.tpl.rhai` script's `execute(tpl, params)`
//!   function in an embedded interpreter with no host access beyond the
//!   builder API.
//! - **Builder**: the handles a script drives (`Template`, `Image`,
//!   `Container`). Every path argument is confined to the instantiation's
//!   own workspace or mount directory.
//! - **Readiness**: HTTP and TCP/UDP polling checks declared by templates.
//! - **Info**: discovery of available templates and their documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod builder;
pub mod copy;
pub mod info;
pub mod paths;
pub mod readiness;
pub mod render;
pub mod sandbox;
pub mod spec;
