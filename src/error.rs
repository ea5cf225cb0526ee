//! Error types for flow reassembly.
//!
//! Every error produced inside a worker is flow-local: it is logged, reported
//! through the registry's event channel, and never escalates to the process.
//!
//! ## Error Categories
//!
//! - **Parse Errors**: A parser rejected the bytes of a flow
//! - **Lifecycle Errors**: Submitting to a worker that has shut down or was cancelled
//! - **Configuration Errors**: Invalid or unreadable configuration
//! - **Sink / Source Errors**: Failures at the output sink or the fragment source
//!
//! ## Helper Constructors
//!
//! ```rust
//! use flowstitch::{FlowId, ReassemblyError};
//!
//! let parse = ReassemblyError::parse_error("HTTPRequest", "invalid header name");
//! assert!(!parse.is_retryable());
//!
//! let closed = ReassemblyError::worker_closed(FlowId::from("10.0.0.1:443-10.0.0.2:5120"));
//! assert!(closed.is_retryable());
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::types::FlowId;

/// Result type alias for reassembly operations.
pub type Result<T, E = ReassemblyError> = std::result::Result<T, E>;

/// Main error type for reassembly operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReassemblyError {
    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Worker for flow {flow_id} is closed")]
    WorkerClosed { flow_id: FlowId },

    #[error("Operation cancelled: {context}")]
    Cancelled { context: String },

    #[error("Invalid configuration: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Output sink failed: {reason}")]
    Sink {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Fragment source failed: {reason}")]
    Source {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ReassemblyError {
    /// Returns whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReassemblyError::Parse { .. } => false,
            ReassemblyError::WorkerClosed { .. } => true,
            ReassemblyError::Cancelled { .. } => false,
            ReassemblyError::Config { .. } => false,
            ReassemblyError::File { .. } => false,
            ReassemblyError::Sink { .. } => true,
            ReassemblyError::Source { .. } => true,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ReassemblyError::Parse { .. } => vec![
                "Inspect the flow's captured bytes for truncation",
                "Register a parser factory that recognises this protocol",
            ],
            ReassemblyError::WorkerClosed { .. } => {
                vec!["Dispatch through the registry so a fresh worker is created"]
            }
            ReassemblyError::Cancelled { .. } => vec!["Stop submitting fragments during shutdown"],
            ReassemblyError::Config { .. } => vec![
                "Check that capacities, intervals and thresholds are non-zero",
                "Verify the YAML keys match the documented configuration",
            ],
            ReassemblyError::File { .. } => {
                vec!["Check file exists and is readable", "Check file permissions"]
            }
            ReassemblyError::Sink { .. } => {
                vec!["Check the output destination is writable", "Verify the consumer is still running"]
            }
            ReassemblyError::Source { .. } => {
                vec!["Check the capture source is still producing", "Restart the capture"]
            }
        }
    }

    /// Helper constructor for parse errors.
    pub fn parse_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        ReassemblyError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for submissions to a worker that has shut down.
    pub fn worker_closed(flow_id: FlowId) -> Self {
        ReassemblyError::WorkerClosed { flow_id }
    }

    /// Helper constructor for cancellation.
    pub fn cancelled(context: impl Into<String>) -> Self {
        ReassemblyError::Cancelled { context: context.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(reason: impl Into<String>) -> Self {
        ReassemblyError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration errors with source.
    pub fn config_error_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        ReassemblyError::Config { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        ReassemblyError::File { path, source }
    }

    /// Helper constructor for sink errors.
    pub fn sink_error(reason: impl Into<String>, source: Option<std::io::Error>) -> Self {
        ReassemblyError::Sink { reason: reason.into(), source }
    }

    /// Helper constructor for fragment source errors.
    pub fn source_failed(reason: impl Into<String>) -> Self {
        ReassemblyError::Source { reason: reason.into(), source: None }
    }
}

impl From<serde_yaml_ng::Error> for ReassemblyError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        ReassemblyError::config_error_with_source("failed to parse YAML", Box::new(err))
    }
}
