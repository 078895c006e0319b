//! `hubcore` Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for `hubcore`
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Event name must not be empty")]
    EmptyEventName,

    #[error("Module '{id}' is not registered")]
    ModuleNotFound { id: String },

    #[error("Module '{id}' does not expose method '{method}'")]
    MethodNotFound { id: String, method: String },

    #[error("Workflow '{id}' not found")]
    WorkflowNotFound { id: String },

    #[error("Workflow needs at least one step")]
    EmptyWorkflow,

    #[error("Module error: {0}")]
    Module(#[from] ModuleError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure raised by a module while handling a cross-module call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Call to '{method}' failed: {reason}")]
    CallFailed { method: String, reason: String },

    #[error("Module panicked in '{method}': {message}")]
    Panicked { method: String, message: String },
}

/// Failure reported by an event subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Failure reported by a workflow step
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("step panicked: {0}")]
    Panicked(String),
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Health probe failures; every variant classifies the dependency as offline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Dependency unreachable: {0}")]
    Unreachable(String),

    #[error("Probe timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializeError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

/// Result type alias for `hubcore` operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Result type alias for Config operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HubError::MethodNotFound {
            id: "billing".to_string(),
            method: "charge".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Module 'billing' does not expose method 'charge'"
        );

        let err = ProbeError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Probe timed out after 5000ms");
    }

    #[test]
    fn test_error_conversion() {
        let module_err = ModuleError::InvalidArguments("missing amount".to_string());
        let hub_err: HubError = module_err.into();
        assert!(matches!(hub_err, HubError::Module(_)));

        let cfg_err = ConfigError::Invalid("zero interval".to_string());
        let hub_err: HubError = cfg_err.into();
        assert!(matches!(hub_err, HubError::Config(_)));
    }

    #[test]
    fn test_panic_message_variants() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
