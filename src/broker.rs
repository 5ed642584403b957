//! Broker abstraction
//!
//! A broker transports signatures from producers to workers. The crate
//! ships an AMQP reference implementation ([`crate::amqp::AmqpBroker`])
//! and an in-process one for local development
//! ([`crate::memory::MemoryBroker`]). [`BrokerBase`] carries the pieces
//! every implementation shares: the registered-handler set, the stop
//! gate and the retry policy for the worker's reconnect loop.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::TaskResult;
use crate::signature::Signature;

/// Receives decoded signatures from a broker's consume loop
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    /// Execute one delivered signature
    async fn process(&self, signature: Signature) -> TaskResult<()>;
}

/// Message transport connecting producers to workers
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enter the consume loop and block until stopped or a transport
    /// error occurs. In-flight tasks are drained before returning.
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: std::sync::Arc<dyn TaskProcessor>,
    ) -> TaskResult<()>;

    /// Signal an in-progress consume loop to drain and return. Idempotent.
    fn stop_consuming(&self);

    /// Serialize and dispatch a signature, delaying it when its ETA lies
    /// in the future. Returns only after transport-level confirmation.
    async fn publish(&self, signature: &Signature) -> TaskResult<()>;

    /// Remove all messages from a queue, returning how many were dropped
    async fn purge_queue(&self, queue: &str) -> TaskResult<u32>;

    /// Whether the worker should reconnect after a recoverable error;
    /// false once [`stop_consuming`](Broker::stop_consuming) was called
    fn should_retry(&self) -> bool;

    /// Install the set of handler names registered on this worker
    fn set_registered_task_names(&self, names: Vec<String>);

    /// Whether a handler name is registered on this worker
    fn is_task_registered(&self, name: &str) -> bool;
}

/// Shared state for broker implementations
pub struct BrokerBase {
    registered: RwLock<HashSet<String>>,
    stop_tx: watch::Sender<bool>,
    retry: AtomicBool,
}

impl BrokerBase {
    /// Create base state with the stop gate open
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            registered: RwLock::new(HashSet::new()),
            stop_tx,
            retry: AtomicBool::new(true),
        }
    }

    /// Reset the stop gate and retry flag; called on entry to a consume
    /// loop so a stopped broker can be started again
    pub fn begin_consuming(&self) {
        self.retry.store(true, Ordering::SeqCst);
        self.stop_tx.send_replace(false);
    }

    /// Close the stop gate and disable reconnects
    pub fn stop_consuming(&self) {
        self.retry.store(false, Ordering::SeqCst);
        self.stop_tx.send_replace(true);
    }

    /// Subscribe to the stop gate
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Whether reconnecting is still allowed
    pub fn should_retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    /// Install registered handler names
    pub fn set_registered_task_names(&self, names: Vec<String>) {
        let mut registered = self.registered.write().expect("registry lock poisoned");
        *registered = names.into_iter().collect();
    }

    /// Whether a handler name is registered
    pub fn is_task_registered(&self, name: &str) -> bool {
        let registered = self.registered.read().expect("registry lock poisoned");
        registered.contains(name)
    }
}

impl Default for BrokerBase {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff for reconnect attempts, capped at 30 seconds
pub fn retry_backoff(attempt: u32) -> Duration {
    let seconds = 2u64.saturating_pow(attempt.min(5));
    Duration::from_secs(seconds.min(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_gate_toggles_and_resets() {
        let base = BrokerBase::new();
        assert!(base.should_retry());
        assert!(!*base.stop_signal().borrow());

        base.stop_consuming();
        assert!(!base.should_retry());
        assert!(*base.stop_signal().borrow());

        base.begin_consuming();
        assert!(base.should_retry());
        assert!(!*base.stop_signal().borrow());
    }

    #[test]
    fn tracks_registered_names() {
        let base = BrokerBase::new();
        base.set_registered_task_names(vec!["add".to_string(), "multiply".to_string()]);
        assert!(base.is_task_registered("add"));
        assert!(!base.is_task_registered("divide"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(retry_backoff(0), Duration::from_secs(1));
        assert_eq!(retry_backoff(1), Duration::from_secs(2));
        assert_eq!(retry_backoff(3), Duration::from_secs(8));
        assert_eq!(retry_backoff(10), Duration::from_secs(30));
    }
}
