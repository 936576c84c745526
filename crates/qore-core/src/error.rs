// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for the source-adapter layer
//!
//! Every physical source (relational endpoint, flat file, in-memory rows,
//! nested adapter) maps its failures onto these variants so the host query
//! engine sees one taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all adapter operations
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Connection to {endpoint} failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("Cannot convert column {column}: {message}")]
    TypeConversion { column: String, message: String },

    #[error("Failed to load cached rows for {source_id}: {message}")]
    CacheLoad { source_id: String, message: String },

    #[error("Resource exhausted for {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Data source not found: {source_id}")]
    SourceNotFound { source_id: String },

    #[error("Execution error: {message}")]
    ExecutionError { message: String },

    #[error("Data source {source_id} is closed")]
    Closed { source_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration { message: msg.into() }
    }

    pub fn connection_failed(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    pub fn type_conversion(column: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::TypeConversion {
            column: column.into(),
            message: msg.into(),
        }
    }

    pub fn cache_load(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CacheLoad {
            source_id: source_id.into(),
            message: msg.into(),
        }
    }

    pub fn resource_exhausted(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    pub fn source_not_found(id: impl Into<String>) -> Self {
        Self::SourceNotFound { source_id: id.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn closed(id: impl Into<String>) -> Self {
        Self::Closed { source_id: id.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// Whether the endpoint could not be reached, as opposed to rejecting the request.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Timeout { .. })
    }
}

/// Result type alias for adapter operations
pub type EngineResult<T> = Result<T, EngineError>;
