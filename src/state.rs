//! Task state lifecycle

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::args::TypedValue;

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Task has been published but not yet picked up
    #[serde(rename = "PENDING")]
    Pending,
    /// Task was delivered to a worker
    #[serde(rename = "RECEIVED")]
    Received,
    /// Handler invocation is in progress
    #[serde(rename = "STARTED")]
    Started,
    /// Task is waiting to be retried
    #[serde(rename = "RETRY")]
    Retry,
    /// Handler finished successfully
    #[serde(rename = "SUCCESS")]
    Success,
    /// Handler failed
    #[serde(rename = "FAILURE")]
    Failure,
}

impl State {
    /// SUCCESS and FAILURE are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Success | State::Failure)
    }
}

/// Persisted lifecycle record of a signature, keyed by its UUID
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(rename = "TaskUUID")]
    pub task_uuid: String,
    #[serde(rename = "State")]
    pub state: State,
    #[serde(rename = "Results", default)]
    pub results: Vec<TypedValue>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
}

impl TaskState {
    /// Create a record in the given state with no results
    pub fn new(task_uuid: &str, state: State) -> Self {
        Self {
            task_uuid: task_uuid.to_string(),
            state,
            results: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Create a SUCCESS record carrying the handler's results
    pub fn success(task_uuid: &str, results: Vec<TypedValue>) -> Self {
        Self {
            results,
            ..Self::new(task_uuid, State::Success)
        }
    }

    /// Create a FAILURE record carrying the error string
    pub fn failure(task_uuid: &str, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(task_uuid, State::Failure)
        }
    }

    /// Whether the task reached a terminal state
    pub fn is_completed(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the task succeeded
    pub fn is_success(&self) -> bool {
        self.state == State::Success
    }

    /// Whether the task failed
    pub fn is_failure(&self) -> bool {
        self.state == State::Failure
    }
}
