//! Blocking result handles
//!
//! Handles are read-only views over backend state; they poll until the
//! task (or composition) reaches a terminal state. Waiting can be
//! cancelled by a timeout without affecting the underlying task.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::args::{TypedValue, Value};
use crate::backend::Backend;
use crate::error::{TaskError, TaskResult};
use crate::signature::Signature;
use crate::state::{State, TaskState};

/// Polling handle over a single task's state
pub struct AsyncResult {
    signature: Signature,
    state: TaskState,
    backend: Arc<dyn Backend>,
}

impl AsyncResult {
    /// Create a handle for a published signature
    pub fn new(signature: Signature, backend: Arc<dyn Backend>) -> Self {
        let state = TaskState::new(&signature.uuid, State::Pending);
        Self {
            signature,
            state,
            backend,
        }
    }

    /// The signature this handle tracks
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Latest state observed by this handle
    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Fetch the latest state without waiting.
    ///
    /// Returns `Ok(None)` while the task is pending, `Ok(Some(values))`
    /// once it succeeded, and the failure error once it failed. A task
    /// the backend does not know yet counts as pending (chain members
    /// past the head have no state until delivered); real backend errors
    /// propagate.
    pub async fn touch(&mut self) -> TaskResult<Option<Vec<Value>>> {
        if !self.state.is_completed() {
            match self.backend.get_state(&self.signature.uuid).await {
                Ok(state) => self.state = state,
                Err(TaskError::TaskNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        // Transport-backed backends hand out successful state exactly
        // once; failures stay readable.
        if self.backend.state_consumed_on_read() && self.state.is_success() {
            if let Err(err) = self.backend.purge_state(&self.signature.uuid).await {
                warn!("failed to purge consumed state {}: {err}", self.signature.uuid);
            }
        }

        if self.state.is_success() {
            let values = self
                .state
                .results
                .iter()
                .map(TypedValue::decode)
                .collect::<TaskResult<Vec<Value>>>()?;
            return Ok(Some(values));
        }

        if self.state.is_failure() {
            return Err(TaskError::task_execution(
                self.state
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        Ok(None)
    }

    /// Block until the task reaches a terminal state, polling with the
    /// given interval
    pub async fn get(&mut self, sleep: Duration) -> TaskResult<Vec<Value>> {
        loop {
            if let Some(results) = self.touch().await? {
                return Ok(results);
            }
            tokio::time::sleep(sleep).await;
        }
    }

    /// Like [`get`](AsyncResult::get) but abort the wait at the deadline.
    /// The underlying task keeps running.
    pub async fn get_with_timeout(
        &mut self,
        timeout: Duration,
        sleep: Duration,
    ) -> TaskResult<Vec<Value>> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(TaskError::timeout("waiting for task result"));
            }
            if let Some(results) = self.touch().await? {
                return Ok(results);
            }
            tokio::time::sleep(sleep).await;
        }
    }
}

/// Polling handle over a chain; resolves to the last member's results
pub struct ChainAsyncResult {
    results: Vec<AsyncResult>,
}

impl ChainAsyncResult {
    /// Create a handle for a published chain
    pub fn new(signatures: Vec<Signature>, backend: Arc<dyn Backend>) -> Self {
        Self {
            results: signatures
                .into_iter()
                .map(|signature| AsyncResult::new(signature, backend.clone()))
                .collect(),
        }
    }

    /// Await every member in order and return the last member's results
    pub async fn get(&mut self, sleep: Duration) -> TaskResult<Vec<Value>> {
        let mut last = Vec::new();
        for result in &mut self.results {
            last = result.get(sleep).await?;
        }
        Ok(last)
    }

    /// Like [`get`](ChainAsyncResult::get) with a deadline on the whole
    /// chain
    pub async fn get_with_timeout(
        &mut self,
        timeout: Duration,
        sleep: Duration,
    ) -> TaskResult<Vec<Value>> {
        if self.results.is_empty() {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let last_index = self.results.len() - 1;
        loop {
            if Instant::now() >= deadline {
                return Err(TaskError::timeout("waiting for chain result"));
            }
            for (index, result) in self.results.iter_mut().enumerate() {
                let touched = result.touch().await?;
                if index == last_index {
                    if let Some(results) = touched {
                        return Ok(results);
                    }
                }
            }
            tokio::time::sleep(sleep).await;
        }
    }
}

/// Polling handle over a chord; resolves to the callback's results
pub struct ChordAsyncResult {
    group_results: Vec<AsyncResult>,
    chord_result: AsyncResult,
}

impl ChordAsyncResult {
    /// Create a handle for a published chord
    pub fn new(
        group_signatures: Vec<Signature>,
        callback: Signature,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            group_results: group_signatures
                .into_iter()
                .map(|signature| AsyncResult::new(signature, backend.clone()))
                .collect(),
            chord_result: AsyncResult::new(callback, backend),
        }
    }

    /// Await every group member, then the callback
    pub async fn get(&mut self, sleep: Duration) -> TaskResult<Vec<Value>> {
        for result in &mut self.group_results {
            result.get(sleep).await?;
        }
        self.chord_result.get(sleep).await
    }

    /// Like [`get`](ChordAsyncResult::get) with a deadline on the whole
    /// chord
    pub async fn get_with_timeout(
        &mut self,
        timeout: Duration,
        sleep: Duration,
    ) -> TaskResult<Vec<Value>> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(TaskError::timeout("waiting for chord result"));
            }
            for result in &mut self.group_results {
                result.touch().await?;
            }
            if let Some(results) = self.chord_result.touch().await? {
                return Ok(results);
            }
            tokio::time::sleep(sleep).await;
        }
    }
}
