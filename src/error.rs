//! Error types for the task queue

use thiserror::Error;

/// Result type alias for task queue operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Comprehensive error types for the task queue system
#[derive(Error, Debug)]
pub enum TaskError {
    /// AMQP transport errors
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Broker transport errors outside the AMQP client itself
    #[error("Broker error: {message}")]
    Broker { message: String },

    /// Signature serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Handler execution errors
    #[error("Task execution failed: {message}")]
    TaskExecution { message: String },

    /// Argument or result coercion errors
    #[error("Coercion error: {message}")]
    Coercion { message: String },

    /// Task state not found in the result backend
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Result backend errors
    #[error("Backend error: {message}")]
    Backend { message: String },

    /// Worker errors
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Timeout reached while waiting for a result
    #[error("Timeout reached: {operation}")]
    Timeout { operation: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TaskError {
    /// Create a broker transport error
    pub fn broker<S: Into<String>>(message: S) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }

    /// Create a task execution error
    pub fn task_execution<S: Into<String>>(message: S) -> Self {
        Self::TaskExecution {
            message: message.into(),
        }
    }

    /// Create a coercion error
    pub fn coercion<S: Into<String>>(message: S) -> Self {
        Self::Coercion {
            message: message.into(),
        }
    }

    /// Create a result backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Create a worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if the error is recoverable by reconnecting to the transport
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Amqp(_) => true,
            TaskError::Broker { .. } => true,
            TaskError::Backend { .. } => true,
            TaskError::Serialization(_) => false,
            TaskError::TaskExecution { .. } => false,
            TaskError::Coercion { .. } => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::Worker { .. } => false,
            TaskError::Config { .. } => false,
            TaskError::Timeout { .. } => false,
            TaskError::Internal(_) => false,
        }
    }
}
