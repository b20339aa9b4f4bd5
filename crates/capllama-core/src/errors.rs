use capllama_abi::ffi::{ERR_INVALID, ERR_MODEL_NOT_FOUND, ERR_NOT_IMPLEMENTED};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    #[error("Context not found")]
    ContextNotFound,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{0}")]
    OperationFailed(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Context limit reached ({limit})")]
    CapacityExceeded { limit: usize },
}

impl PluginError {
    /// Stable identifier surfaced to shells alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContextNotFound => "CONTEXT_NOT_FOUND",
            Self::ModelNotFound(_) => "MODEL_NOT_FOUND",
            Self::InvalidParameters(_) => "INVALID_PARAMETERS",
            Self::OperationFailed(_) => "OPERATION_FAILED",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::OperationFailed(msg.into())
    }

    /// Maps a delegate status code plus its `last_error` text.
    pub fn from_native(code: i32, msg: String) -> Self {
        match code {
            ERR_INVALID => Self::InvalidParameters(msg),
            ERR_MODEL_NOT_FOUND => Self::ModelNotFound(msg),
            ERR_NOT_IMPLEMENTED => Self::NotImplemented(msg),
            _ => Self::OperationFailed(msg),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

/// Rejection shape handed to shells.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
}

impl From<std::io::Error> for PluginError {
    fn from(e: std::io::Error) -> Self {
        PluginError::OperationFailed(format!("I/O error: {e}"))
    }
}

impl From<serde_json::Error> for PluginError {
    fn from(e: serde_json::Error) -> Self {
        PluginError::InvalidParameters(e.to_string())
    }
}

impl From<tokio::task::JoinError> for PluginError {
    fn from(e: tokio::task::JoinError) -> Self {
        PluginError::OperationFailed(format!("worker task failed: {e}"))
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(e: anyhow::Error) -> Self {
        PluginError::OperationFailed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_codes_map_to_kinds() {
        assert_eq!(
            PluginError::from_native(ERR_INVALID, "x".into()),
            PluginError::InvalidParameters("x".into())
        );
        assert_eq!(PluginError::from_native(1, "boom".into()).code(), "OPERATION_FAILED");
        assert_eq!(PluginError::from_native(ERR_NOT_IMPLEMENTED, "op".into()).code(), "NOT_IMPLEMENTED");
    }

    #[test]
    fn payload_carries_code_and_message() {
        let p = PluginError::CapacityExceeded { limit: 2 }.to_payload();
        assert_eq!(p.code, "CAPACITY_EXCEEDED");
        assert_eq!(p.message, "Context limit reached (2)");
        assert_eq!(PluginError::ContextNotFound.to_string(), "Context not found");
    }
}
