//! Result backend abstraction
//!
//! A backend persists task state transitions and group metadata so that
//! producers can await outcomes and workers can coordinate chord
//! dispatch. State transitions for a single UUID are serialized at the
//! backend; a terminal state is never overwritten by a later write.

use async_trait::async_trait;

use crate::args::TypedValue;
use crate::error::TaskResult;
use crate::signature::Signature;
use crate::state::TaskState;

/// Durable store of task states and group metadata
#[async_trait]
pub trait Backend: Send + Sync {
    /// Record PENDING for a just-published signature
    async fn set_state_pending(&self, signature: &Signature) -> TaskResult<()>;

    /// Record RECEIVED once a worker picked the task up
    async fn set_state_received(&self, signature: &Signature) -> TaskResult<()>;

    /// Record STARTED just before handler invocation
    async fn set_state_started(&self, signature: &Signature) -> TaskResult<()>;

    /// Record RETRY for a task scheduled to run again
    async fn set_state_retry(&self, signature: &Signature) -> TaskResult<()>;

    /// Record SUCCESS with the handler's results
    async fn set_state_success(
        &self,
        signature: &Signature,
        results: Vec<TypedValue>,
    ) -> TaskResult<()>;

    /// Record FAILURE with the stringified error
    async fn set_state_failure(&self, signature: &Signature, error: String) -> TaskResult<()>;

    /// Fetch the latest state for a task UUID
    async fn get_state(&self, task_uuid: &str) -> TaskResult<TaskState>;

    /// Drop the stored state for a task UUID
    async fn purge_state(&self, task_uuid: &str) -> TaskResult<()>;

    /// Create group metadata before the first member is published
    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> TaskResult<()>;

    /// Whether every member of the group reached a terminal state
    async fn group_completed(&self, group_uuid: &str, group_task_count: usize)
        -> TaskResult<bool>;

    /// States of all group members, in group insertion order
    async fn group_task_states(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> TaskResult<Vec<TaskState>>;

    /// Atomic test-and-set on the group's chord flag; returns true for
    /// exactly one caller per group across all workers
    async fn trigger_chord(&self, group_uuid: &str) -> TaskResult<bool>;

    /// Drop the metadata for a group
    async fn purge_group_meta(&self, group_uuid: &str) -> TaskResult<()>;

    /// Whether stored state is one-shot consumable. Transport-backed
    /// backends return true; result handles then purge terminal state
    /// after a successful read.
    fn state_consumed_on_read(&self) -> bool {
        false
    }
}
