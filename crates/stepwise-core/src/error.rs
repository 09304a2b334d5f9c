use thiserror::Error;

/// Core error type for the Stepwise flow engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad definition reference, missing required context key or malformed condition
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A step handler raised or returned a failure
    #[error("Handler execution error: {0}")]
    HandlerExecutionError(String),

    /// A step handler did not finish within its timeout
    #[error("Timeout exceeded: {0}")]
    TimeoutExceeded(String),

    /// Lock contention or a lost resume race; the caller should retry the operation
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Transient storage failure
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Operation attempted against a terminal or non-paused instance
    #[error("Terminal state violation: {0}")]
    TerminalStateViolation(String),

    /// Flow instance not found
    #[error("Flow instance not found: {0}")]
    FlowInstanceNotFound(String),

    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowDefinitionNotFound(String),

    /// No handler registered under the requested name
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CoreError {
    /// Whether the engine itself retries this error with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::PersistenceError(_))
    }

    /// Reason recorded on a step attempt that failed with this error
    ///
    /// Handler failures keep the handler's own message and timeouts are
    /// recorded as "timeout"; anything else uses its display form.
    pub fn failure_reason(&self) -> String {
        match self {
            CoreError::HandlerExecutionError(reason) => reason.clone(),
            CoreError::TimeoutExceeded(_) => "timeout".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the caller may retry the operation that produced this error
    pub fn is_retryable_by_caller(&self) -> bool {
        matches!(
            self,
            CoreError::ConcurrencyConflict(_) | CoreError::PersistenceError(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::ConfigurationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::ConfigurationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}
