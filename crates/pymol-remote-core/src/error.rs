//! Error types for pymol-remote.
//!
//! One enum covers both sides of the wire. Server-side variants are mapped to
//! JSON-RPC error codes with [`PymolRemoteError::to_rpc_error_code`]; the client
//! turns error payloads coming back from the server into [`PymolRemoteError::Remote`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the pymol-remote library.
#[derive(Debug, Error)]
pub enum PymolRemoteError {
    // Client transport errors
    #[error("Error connecting to PyMOL RPC server at `{endpoint}`: {message}")]
    Connection { endpoint: String, message: String },

    #[error("Connection to PyMOL RPC server at `{endpoint}` timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },

    // Lookup errors
    #[error("Unknown command `{name}`{}", suggestion_hint(.suggestions))]
    CommandNotFound {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    // Validation errors
    #[error(
        "Format `{format}` not supported. Please use one of the following: {}",
        .allowed.join(", ")
    )]
    UnsupportedFormat {
        format: String,
        allowed: Vec<&'static str>,
    },

    #[error("Format `{format}` is not a valid file extension")]
    InvalidFormat { format: String },

    #[error("Invalid params for `{method}`: {message}")]
    InvalidParams { method: String, message: String },

    // Execution errors
    #[error("Remote call `{method}` failed ({code}): {message}")]
    Remote {
        method: String,
        code: i32,
        message: String,
    },

    #[error("Host command `{command}` failed: {message}")]
    Host { command: String, message: String },

    // Server bootstrap
    #[error("Could not bind any port in {host}:{first}-{last}")]
    NoPortAvailable { host: String, first: u16, last: u16 },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Result type alias for pymol-remote operations.
pub type Result<T> = std::result::Result<T, PymolRemoteError>;

fn suggestion_hint(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(". Did you mean one of: {}?", suggestions.join(", "))
    }
}

impl From<std::io::Error> for PymolRemoteError {
    fn from(err: std::io::Error) -> Self {
        PymolRemoteError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PymolRemoteError {
    fn from(err: serde_json::Error) -> Self {
        PymolRemoteError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PymolRemoteError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        PymolRemoteError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an invalid-params error for a procedure.
    pub fn invalid_params(method: impl Into<String>, message: impl Into<String>) -> Self {
        PymolRemoteError::InvalidParams {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Host interpreter failure
    /// - -32005: Validation error
    pub fn to_rpc_error_code(&self) -> i32 {
        use crate::protocol::codes;

        match self {
            PymolRemoteError::MethodNotFound { .. } | PymolRemoteError::CommandNotFound { .. } => {
                codes::METHOD_NOT_FOUND
            }

            PymolRemoteError::InvalidParams { .. } => codes::INVALID_PARAMS,

            PymolRemoteError::UnsupportedFormat { .. }
            | PymolRemoteError::InvalidFormat { .. } => codes::VALIDATION_ERROR,

            PymolRemoteError::Host { .. } => codes::HOST_ERROR,

            PymolRemoteError::Remote { code, .. } => *code,

            // All other errors are internal errors
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// True when the server rejected the shape of the arguments rather than
    /// failing while executing the call.
    pub fn is_calling_convention_mismatch(&self) -> bool {
        matches!(
            self,
            PymolRemoteError::Remote { code, .. } if *code == crate::protocol::codes::INVALID_PARAMS
        )
    }
}
