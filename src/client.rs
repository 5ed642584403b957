//! Client interface for submitting tasks to the queue

use anyhow::anyhow;
use std::sync::Arc;
use tracing::debug;

use crate::backend::Backend;
use crate::broker::Broker;
use crate::composition::{Chain, Chord, Group};
use crate::error::{TaskError, TaskResult};
use crate::result::{AsyncResult, ChainAsyncResult, ChordAsyncResult};
use crate::signature::Signature;

/// Producer-side handle submitting signatures and compositions
pub struct TaskClient {
    broker: Arc<dyn Broker>,
    backend: Arc<dyn Backend>,
}

impl TaskClient {
    /// Create a client over a broker and a result backend
    pub fn new(broker: Arc<dyn Broker>, backend: Arc<dyn Backend>) -> Self {
        Self { broker, backend }
    }

    /// Publish a single signature and return its result handle
    pub async fn send_task(&self, mut signature: Signature) -> TaskResult<AsyncResult> {
        signature.ensure_uuid();
        self.backend.set_state_pending(&signature).await?;
        self.broker.publish(&signature).await?;
        debug!("submitted task {} ({})", signature.uuid, signature.name);
        Ok(AsyncResult::new(signature, self.backend.clone()))
    }

    /// Publish the head of a chain; successors dispatch as their
    /// predecessors succeed
    pub async fn send_chain(&self, chain: Chain) -> TaskResult<ChainAsyncResult> {
        let head = chain
            .head()
            .cloned()
            .ok_or_else(|| TaskError::Internal(anyhow!("cannot send an empty chain")))?;

        self.backend.set_state_pending(&head).await?;
        self.broker.publish(&head).await?;
        debug!("submitted chain of {} tasks headed by {}", chain.signatures.len(), head.uuid);
        Ok(ChainAsyncResult::new(chain.signatures, self.backend.clone()))
    }

    /// Initialize group metadata, then publish every member
    pub async fn send_group(&self, group: Group) -> TaskResult<Vec<AsyncResult>> {
        self.backend
            .init_group(&group.group_uuid, &group.task_uuids())
            .await?;

        for signature in &group.signatures {
            self.backend.set_state_pending(signature).await?;
        }
        for signature in &group.signatures {
            self.broker.publish(signature).await?;
        }

        debug!("submitted group {} with {} members", group.group_uuid, group.signatures.len());
        Ok(group
            .signatures
            .iter()
            .map(|signature| AsyncResult::new(signature.clone(), self.backend.clone()))
            .collect())
    }

    /// Publish a chord: a group whose completion dispatches the callback
    pub async fn send_chord(&self, chord: Chord) -> TaskResult<ChordAsyncResult> {
        self.backend
            .init_group(&chord.group.group_uuid, &chord.group.task_uuids())
            .await?;

        for signature in &chord.group.signatures {
            self.backend.set_state_pending(signature).await?;
        }
        for signature in &chord.group.signatures {
            self.broker.publish(signature).await?;
        }

        debug!(
            "submitted chord {} with callback {}",
            chord.group.group_uuid, chord.callback.name
        );
        Ok(ChordAsyncResult::new(
            chord.group.signatures,
            chord.callback,
            self.backend.clone(),
        ))
    }
}
