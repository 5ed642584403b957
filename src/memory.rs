//! In-process broker and backend
//!
//! [`MemoryBroker`] and [`MemoryBackend`] satisfy the same contracts as
//! the AMQP reference without leaving the process. They back local
//! development and the integration test suite; nothing survives a
//! restart.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use crate::args::TypedValue;
use crate::backend::Backend;
use crate::broker::{Broker, BrokerBase, TaskProcessor};
use crate::error::{TaskError, TaskResult};
use crate::signature::Signature;
use crate::state::{State, TaskState};

/// Delay before an unregistered task is handed back to the queue
const RECYCLE_DELAY: Duration = Duration::from_millis(50);

/// Broker delivering signatures over an in-process channel
pub struct MemoryBroker {
    base: Arc<BrokerBase>,
    tx: mpsc::UnboundedSender<Signature>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Signature>>>,
}

impl MemoryBroker {
    /// Create an in-process broker
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            base: Arc::new(BrokerBase::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn enqueue(&self, signature: Signature) -> TaskResult<()> {
        self.tx
            .send(signature)
            .map_err(|_| TaskError::broker("memory queue closed"))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> TaskResult<()> {
        self.base.begin_consuming();

        let mut rx = self
            .rx
            .lock()
            .expect("queue lock poisoned")
            .take()
            .ok_or_else(|| TaskError::broker("memory broker is already consuming"))?;

        let semaphore = (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency)));
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<TaskError>();
        let mut stop_rx = self.base.stop_signal();
        if *stop_rx.borrow_and_update() {
            *self.rx.lock().expect("queue lock poisoned") = Some(rx);
            return Ok(());
        }
        let mut tasks: JoinSet<()> = JoinSet::new();

        debug!("consumer {consumer_tag} waiting for messages");

        let result = loop {
            tokio::select! {
                Some(err) = err_rx.recv() => break Err(err),
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow_and_update() {
                        break Ok(());
                    }
                }
                message = rx.recv() => match message {
                    None => break Err(TaskError::broker("memory queue closed")),
                    Some(signature) => {
                        // Another worker may have this handler; hand the
                        // message back after a short pause.
                        if !self.base.is_task_registered(&signature.name) {
                            let tx = self.tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(RECYCLE_DELAY).await;
                                let _ = tx.send(signature);
                            });
                            continue;
                        }

                        let permit = match &semaphore {
                            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                                Ok(permit) => Some(permit),
                                Err(_) => break Err(TaskError::broker("worker pool closed")),
                            },
                            None => None,
                        };
                        let processor = processor.clone();
                        let err_tx = err_tx.clone();
                        tasks.spawn(async move {
                            if let Err(err) = processor.process(signature).await {
                                let _ = err_tx.send(err);
                            }
                            drop(permit);
                        });
                    }
                }
            }
        };

        while tasks.join_next().await.is_some() {}
        *self.rx.lock().expect("queue lock poisoned") = Some(rx);
        result
    }

    fn stop_consuming(&self) {
        self.base.stop_consuming();
    }

    async fn publish(&self, signature: &Signature) -> TaskResult<()> {
        let mut signature = signature.clone();
        signature.ensure_uuid();

        if let Some(eta) = signature.eta {
            let now = Utc::now();
            if eta > now {
                let delay = (eta - now)
                    .to_std()
                    .map_err(|_| TaskError::broker("cannot delay a task by 0ms"))?;
                let tx = self.tx.clone();
                debug!("delaying task {} by {:?}", signature.uuid, delay);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(signature);
                });
                return Ok(());
            }
        }

        self.enqueue(signature)
    }

    async fn purge_queue(&self, _queue: &str) -> TaskResult<u32> {
        let mut guard = self.rx.lock().expect("queue lock poisoned");
        let rx = guard
            .as_mut()
            .ok_or_else(|| TaskError::broker("cannot purge while consuming"))?;
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        Ok(count)
    }

    fn should_retry(&self) -> bool {
        self.base.should_retry()
    }

    fn set_registered_task_names(&self, names: Vec<String>) {
        self.base.set_registered_task_names(names);
    }

    fn is_task_registered(&self, name: &str) -> bool {
        self.base.is_task_registered(name)
    }
}

struct GroupMeta {
    task_uuids: Vec<String>,
    chord_triggered: bool,
}

/// Backend keeping task states and group metadata in process memory
pub struct MemoryBackend {
    expire_in: Option<ChronoDuration>,
    states: Mutex<HashMap<String, TaskState>>,
    groups: Mutex<HashMap<String, GroupMeta>>,
}

impl MemoryBackend {
    /// Create a backend whose results never expire
    pub fn new() -> Self {
        Self {
            expire_in: None,
            states: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Create a backend whose results expire after the given number of
    /// seconds (0 keeps them forever)
    pub fn with_expiry(seconds: u64) -> Self {
        Self {
            expire_in: (seconds > 0).then(|| ChronoDuration::seconds(seconds as i64)),
            ..Self::new()
        }
    }

    /// Write a state unless the stored one is already terminal
    fn write_state(&self, state: TaskState) {
        let mut states = self.states.lock().expect("state lock poisoned");
        if let Some(existing) = states.get(&state.task_uuid) {
            if existing.is_completed() {
                debug!(
                    "ignoring state write for completed task {}",
                    state.task_uuid
                );
                return;
            }
        }
        states.insert(state.task_uuid.clone(), state);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn set_state_pending(&self, signature: &Signature) -> TaskResult<()> {
        self.write_state(TaskState::new(&signature.uuid, State::Pending));
        Ok(())
    }

    async fn set_state_received(&self, signature: &Signature) -> TaskResult<()> {
        self.write_state(TaskState::new(&signature.uuid, State::Received));
        Ok(())
    }

    async fn set_state_started(&self, signature: &Signature) -> TaskResult<()> {
        self.write_state(TaskState::new(&signature.uuid, State::Started));
        Ok(())
    }

    async fn set_state_retry(&self, signature: &Signature) -> TaskResult<()> {
        self.write_state(TaskState::new(&signature.uuid, State::Retry));
        Ok(())
    }

    async fn set_state_success(
        &self,
        signature: &Signature,
        results: Vec<TypedValue>,
    ) -> TaskResult<()> {
        self.write_state(TaskState::success(&signature.uuid, results));
        Ok(())
    }

    async fn set_state_failure(&self, signature: &Signature, error: String) -> TaskResult<()> {
        self.write_state(TaskState::failure(&signature.uuid, error));
        Ok(())
    }

    async fn get_state(&self, task_uuid: &str) -> TaskResult<TaskState> {
        let mut states = self.states.lock().expect("state lock poisoned");
        if let Some(expire_in) = self.expire_in {
            if let Some(state) = states.get(task_uuid) {
                if state.created_at + expire_in < Utc::now() {
                    states.remove(task_uuid);
                }
            }
        }
        states
            .get(task_uuid)
            .cloned()
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: task_uuid.to_string(),
            })
    }

    async fn purge_state(&self, task_uuid: &str) -> TaskResult<()> {
        self.states
            .lock()
            .expect("state lock poisoned")
            .remove(task_uuid);
        Ok(())
    }

    async fn init_group(&self, group_uuid: &str, task_uuids: &[String]) -> TaskResult<()> {
        let mut groups = self.groups.lock().expect("group lock poisoned");
        groups.insert(
            group_uuid.to_string(),
            GroupMeta {
                task_uuids: task_uuids.to_vec(),
                chord_triggered: false,
            },
        );
        Ok(())
    }

    async fn group_completed(
        &self,
        group_uuid: &str,
        group_task_count: usize,
    ) -> TaskResult<bool> {
        let members = {
            let groups = self.groups.lock().expect("group lock poisoned");
            let meta = groups.get(group_uuid).ok_or_else(|| {
                TaskError::backend(format!("group {group_uuid} not initialized"))
            })?;
            meta.task_uuids.clone()
        };

        let states = self.states.lock().expect("state lock poisoned");
        let completed = members
            .iter()
            .filter(|uuid| states.get(*uuid).map(TaskState::is_completed).unwrap_or(false))
            .count();
        Ok(completed == group_task_count)
    }

    async fn group_task_states(
        &self,
        group_uuid: &str,
        _group_task_count: usize,
    ) -> TaskResult<Vec<TaskState>> {
        let members = {
            let groups = self.groups.lock().expect("group lock poisoned");
            let meta = groups.get(group_uuid).ok_or_else(|| {
                TaskError::backend(format!("group {group_uuid} not initialized"))
            })?;
            meta.task_uuids.clone()
        };

        let states = self.states.lock().expect("state lock poisoned");
        members
            .iter()
            .map(|uuid| {
                states.get(uuid).cloned().ok_or_else(|| {
                    TaskError::backend(format!("no state for group member {uuid}"))
                })
            })
            .collect()
    }

    async fn trigger_chord(&self, group_uuid: &str) -> TaskResult<bool> {
        let mut groups = self.groups.lock().expect("group lock poisoned");
        let meta = groups
            .get_mut(group_uuid)
            .ok_or_else(|| TaskError::backend(format!("group {group_uuid} not initialized")))?;
        if meta.chord_triggered {
            return Ok(false);
        }
        meta.chord_triggered = true;
        Ok(true)
    }

    async fn purge_group_meta(&self, group_uuid: &str) -> TaskResult<()> {
        self.groups
            .lock()
            .expect("group lock poisoned")
            .remove(group_uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::TypedValue;

    fn signature(name: &str) -> Signature {
        Signature::new(name, vec![])
    }

    #[tokio::test]
    async fn terminal_states_are_absorbing() {
        let backend = MemoryBackend::new();
        let sig = signature("add");

        backend.set_state_started(&sig).await.unwrap();
        backend
            .set_state_success(&sig, vec![TypedValue::int64(3)])
            .await
            .unwrap();
        backend
            .set_state_failure(&sig, "late failure".to_string())
            .await
            .unwrap();

        let state = backend.get_state(&sig.uuid).await.unwrap();
        assert!(state.is_success());
        assert_eq!(state.results, vec![TypedValue::int64(3)]);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let backend = MemoryBackend::new();
        let err = backend.get_state("missing").await.unwrap_err();
        assert!(matches!(err, TaskError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn group_completion_counts_terminal_members() {
        let backend = MemoryBackend::new();
        let members: Vec<Signature> = (0..3).map(|_| signature("add")).collect();
        let uuids: Vec<String> = members.iter().map(|s| s.uuid.clone()).collect();
        backend.init_group("group-1", &uuids).await.unwrap();

        assert!(!backend.group_completed("group-1", 3).await.unwrap());

        backend
            .set_state_success(&members[0], vec![])
            .await
            .unwrap();
        backend
            .set_state_failure(&members[1], "boom".to_string())
            .await
            .unwrap();
        assert!(!backend.group_completed("group-1", 3).await.unwrap());

        backend
            .set_state_success(&members[2], vec![])
            .await
            .unwrap();
        assert!(backend.group_completed("group-1", 3).await.unwrap());
    }

    #[tokio::test]
    async fn chord_triggers_for_exactly_one_caller() {
        let backend = Arc::new(MemoryBackend::new());
        backend.init_group("group-1", &[]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let backend = backend.clone();
            handles.push(tokio::spawn(async move {
                backend.trigger_chord("group-1").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn purge_drains_pending_messages() {
        let broker = MemoryBroker::new();
        let sig = signature("add");
        broker.publish(&sig).await.unwrap();
        broker.publish(&sig).await.unwrap();
        assert_eq!(broker.purge_queue("default").await.unwrap(), 2);
        assert_eq!(broker.purge_queue("default").await.unwrap(), 0);
    }
}
