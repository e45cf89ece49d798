//! Unified error types for the Ephemera workspace.
//!
//! Every phase of an apply reports through [`EphemeraError`]. The variants
//! follow the failure taxonomy of the orchestration engine: template
//! failures, resource exhaustion, driver failures, interpolation failures,
//! readiness failures and cancellation.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum EphemeraError {
    /// A template could not be resolved or its script failed.
    #[error("template {template}: {message}")]
    Template {
        /// Template name as submitted.
        template: String,
        /// Description of the failure, including recovered panic messages.
        message: String,
    },

    /// Template execution observed cancellation of its context.
    #[error("template {template}: execution cancelled")]
    TemplateCancelled {
        /// Template name as submitted.
        template: String,
    },

    /// A path argument escaped the directory it must stay within.
    #[error("invalid path {path}: outside of {base}")]
    InvalidPath {
        /// Offending path after normalization.
        path: PathBuf,
        /// Directory the path is confined to.
        base: PathBuf,
    },

    /// A scarce resource pool has no free entries left.
    #[error("{resource} exhausted: {range}")]
    Exhausted {
        /// Kind of resource (`ports`, `ip addresses`).
        resource: &'static str,
        /// Range or subnet that ran dry.
        range: String,
    },

    /// The container runtime driver rejected an operation.
    #[error("{operation} {target} failed: {message}")]
    Driver {
        /// Driver operation name.
        operation: &'static str,
        /// Image tag, container name, or network the operation targeted.
        target: String,
        /// Driver-provided failure description.
        message: String,
    },

    /// A template placeholder could not be evaluated.
    #[error("interpolation of `{fragment}` failed: {message}")]
    Interpolation {
        /// The input text (or a prefix of it) that failed.
        fragment: String,
        /// Parser or evaluation error chain.
        message: String,
    },

    /// A readiness check exhausted its retry budget.
    #[error("readiness check {check} failed")]
    Readiness {
        /// Display form of the failing check.
        check: String,
    },

    /// An operation was aborted because its context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// The discovery agent could not be updated.
    #[error("discovery agent update failed: {message}")]
    Discovery {
        /// Transport error or unexpected status.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration or input value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A required resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl EphemeraError {
    /// Builds an I/O error bound to the path it happened at.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a driver error for `operation` on `target`.
    pub fn driver(
        operation: &'static str,
        target: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Driver {
            operation,
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Returns `true` when the error stems from cancellation rather than
    /// a genuine failure, so callers can avoid reporting shutdown as an error.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::TemplateCancelled { .. })
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, EphemeraError>;
