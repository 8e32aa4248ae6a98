//! # Error Handling Module
//!
//! ## Purpose
//! Centralized error handling for the CFR pipeline, providing structured
//! error types and the transient/permanent classification the backoff
//! retrier relies on.
//!
//! ## Error Categories
//! Fetch (network, HTTP status, dual-source failure), Extraction
//! (malformed or structurally surprising documents), Storage (database,
//! serialization), Similarity (index build), Configuration.

use thiserror::Error;

/// Result type used throughout the pipeline
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error types for the CFR acquisition and indexing pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network-level failures from the HTTP client
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response from an upstream source
    #[error("{source_name} returned HTTP {status}")]
    HttpStatus { source_name: &'static str, status: u16 },

    /// A single physical request exhausted its retry budget
    #[error("{attempts} attempts exhausted: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last_error: Box<PipelineError>,
    },

    /// Both racer branches failed for one logical (title, period) request
    #[error("all sources failed for title {title} ({period}): {details}")]
    AllSourcesFailed {
        title: u16,
        period: String,
        details: String,
    },

    /// Response failed structural sniffing or XML parsing
    #[error("malformed document from {source_name}: {details}")]
    MalformedDocument {
        source_name: &'static str,
        details: String,
    },

    /// Unexpected document structure encountered during extraction
    #[error("extraction failed: {details}")]
    Extraction { details: String },

    /// Embedded database errors
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    /// Binary value encoding/decoding errors
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON parsing errors from metadata endpoints
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Similarity index construction failures
    #[error("index build failed: {details}")]
    IndexBuild { details: String },

    /// Internal invariant violations
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    /// Whether the retrier should spend budget on this error. Malformed
    /// documents count as source failures so the racer treats them like
    /// any other transient fault.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            PipelineError::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            PipelineError::MalformedDocument { .. } => true,
            _ => false,
        }
    }

    /// Coarse category for logging and run summaries
    pub fn category(&self) -> &'static str {
        match self {
            PipelineError::Http(_)
            | PipelineError::HttpStatus { .. }
            | PipelineError::RetriesExhausted { .. }
            | PipelineError::AllSourcesFailed { .. } => "fetch",
            PipelineError::MalformedDocument { .. } | PipelineError::Extraction { .. } => {
                "extraction"
            }
            PipelineError::Database(_) | PipelineError::Serialization(_) => "storage",
            PipelineError::IndexBuild { .. } => "similarity",
            PipelineError::Config { .. } | PipelineError::Toml(_) => "configuration",
            PipelineError::Json(_) | PipelineError::Io(_) | PipelineError::Internal { .. } => {
                "generic"
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_status_classification() {
        let transient = PipelineError::HttpStatus {
            source_name: "ecfr",
            status: 429,
        };
        assert!(transient.is_transient());

        let server_error = PipelineError::HttpStatus {
            source_name: "govinfo",
            status: 503,
        };
        assert!(server_error.is_transient());

        let not_found = PipelineError::HttpStatus {
            source_name: "govinfo",
            status: 404,
        };
        assert!(!not_found.is_transient());
    }

    #[test]
    fn malformed_documents_are_source_failures() {
        let err = PipelineError::MalformedDocument {
            source_name: "ecfr",
            details: "empty body".into(),
        };
        assert!(err.is_transient());
        assert_eq!(err.category(), "extraction");
    }

    #[test]
    fn config_errors_fail_fast() {
        let err = PipelineError::Config {
            message: "bad".into(),
        };
        assert!(!err.is_transient());
    }
}
