//! Worker implementation for processing tasks

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::args::{coerce, TypeDesc, TypedValue, Value};
use crate::backend::Backend;
use crate::broker::{retry_backoff, Broker, TaskProcessor};
use crate::error::{TaskError, TaskResult};
use crate::registry::{HandlerRegistry, TaskHandler};
use crate::signature::Signature;
use crate::state::TaskState;

/// Worker consuming signatures from a broker and executing registered
/// handlers
pub struct Worker {
    consumer_tag: String,
    concurrency: usize,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn Backend>,
    registry: Arc<HandlerRegistry>,
}

impl Worker {
    /// Create a worker with the given consumer tag and concurrency bound
    /// (0 means unbounded)
    pub fn new(
        consumer_tag: &str,
        concurrency: usize,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            consumer_tag: consumer_tag.to_string(),
            concurrency,
            broker,
            backend,
            registry: Arc::new(HandlerRegistry::new()),
        }
    }

    /// Register a task handler; must happen before [`launch`](Worker::launch)
    pub async fn register_handler<H>(&self, name: &str, handler: H)
    where
        H: TaskHandler + 'static,
    {
        self.registry.register(name, handler).await;
    }

    /// Run the consume loop, reconnecting with exponential backoff on
    /// recoverable transport errors until stopped
    pub async fn launch(self: Arc<Self>) -> TaskResult<()> {
        let mut attempt: u32 = 0;

        loop {
            let names = self.registry.names().await;
            self.broker.set_registered_task_names(names);

            info!("worker {} entering consume loop", self.consumer_tag);
            let processor: Arc<dyn TaskProcessor> = self.clone();
            match self
                .broker
                .start_consuming(&self.consumer_tag, self.concurrency, processor)
                .await
            {
                Ok(()) => {
                    info!("worker {} stopped", self.consumer_tag);
                    return Ok(());
                }
                Err(err) => {
                    if !self.broker.should_retry() || !err.is_recoverable() {
                        return Err(err);
                    }
                    let wait = retry_backoff(attempt);
                    attempt += 1;
                    warn!("consume loop failed ({err}); reconnecting in {wait:?}");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Signal the consume loop to drain in-flight tasks and exit
    pub fn stop(&self) {
        info!("worker {} stopping", self.consumer_tag);
        self.broker.stop_consuming();
    }

    /// Record FAILURE and publish error callbacks with the error string
    /// prepended to their args
    async fn task_failed(&self, signature: &Signature, message: &str) -> TaskResult<()> {
        error!("task {} failed: {message}", signature.uuid);
        self.backend
            .set_state_failure(signature, message.to_string())
            .await?;

        let error_arg = TypedValue::string(message);
        for callback in &signature.on_error {
            let mut callback = callback.clone();
            let mut args = vec![error_arg.clone()];
            args.extend(callback.args.clone());
            callback.args = args;
            self.broker.publish(&callback).await?;
        }
        Ok(())
    }

    /// Record SUCCESS, publish success callbacks and handle group
    /// bookkeeping
    async fn task_succeeded(
        &self,
        signature: &Signature,
        results: Vec<TypedValue>,
    ) -> TaskResult<()> {
        self.backend
            .set_state_success(signature, results.clone())
            .await?;
        debug!("task {} succeeded", signature.uuid);

        for callback in &signature.on_success {
            let mut callback = callback.clone();
            if !callback.immutable {
                let mut args = results.clone();
                args.extend(callback.args.clone());
                callback.args = args;
            }
            self.broker.publish(&callback).await?;
        }

        if let Some(group_uuid) = signature.group_uuid.clone() {
            let count = signature.group_task_count.unwrap_or(0);
            if self.backend.group_completed(&group_uuid, count).await? {
                self.dispatch_chord(signature, &group_uuid, count).await?;
            }
        }

        Ok(())
    }

    /// Publish the chord callback if every group member succeeded and
    /// this worker wins the trigger
    async fn dispatch_chord(
        &self,
        signature: &Signature,
        group_uuid: &str,
        count: usize,
    ) -> TaskResult<()> {
        let callback = match &signature.chord_callback {
            Some(callback) => callback.as_ref().clone(),
            None => return Ok(()),
        };

        let states = self.backend.group_task_states(group_uuid, count).await?;
        if !states.iter().all(TaskState::is_success) {
            return Ok(());
        }
        if !self.backend.trigger_chord(group_uuid).await? {
            return Ok(());
        }

        let mut callback = callback;
        if !callback.immutable {
            let mut args: Vec<TypedValue> = Vec::new();
            for state in &states {
                args.extend(state.results.iter().cloned());
            }
            args.extend(callback.args.clone());
            callback.args = args;
        }

        info!(
            "group {group_uuid} completed; dispatching chord callback {}",
            callback.name
        );
        self.broker.publish(&callback).await?;
        self.backend.purge_group_meta(group_uuid).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskProcessor for Worker {
    async fn process(&self, signature: Signature) -> TaskResult<()> {
        let handler = match self.registry.get(&signature.name).await {
            Some(handler) => handler,
            None => {
                // The broker re-routes unregistered tasks before they
                // reach the processor.
                return Err(TaskError::worker(format!(
                    "task {} is not registered",
                    signature.name
                )));
            }
        };

        self.backend.set_state_received(&signature).await?;
        self.backend.set_state_started(&signature).await?;

        let args = match decode_args(&signature.args, handler.arg_types()) {
            Ok(args) => args,
            Err(err) => return self.task_failed(&signature, &err.to_string()).await,
        };

        match handler.run(args).await {
            Ok(results) => self.task_succeeded(&signature, results).await,
            Err(err) => self.task_failed(&signature, &err.to_string()).await,
        }
    }
}

/// Decode wire args and adapt them to the handler's declared parameter
/// types.
///
/// A trailing slice parameter gathers any remaining scalar args into one
/// list; this is how a chord callback declared over `[]int64` receives
/// the flattened scalar results of its group.
fn decode_args(args: &[TypedValue], arg_types: &[TypeDesc]) -> TaskResult<Vec<Value>> {
    let count = arg_types.len();
    let gather_kind = match arg_types.last() {
        Some(TypeDesc::Slice(kind)) => {
            let last_is_slice =
                args.len() == count && args[count - 1].type_name.starts_with("[]");
            (!last_is_slice).then_some(*kind)
        }
        _ => None,
    };

    if let Some(kind) = gather_kind {
        if args.len() < count - 1 {
            return Err(TaskError::coercion(format!(
                "handler takes at least {} arguments, signature carries {}",
                count - 1,
                args.len()
            )));
        }

        let mut values = args[..count - 1]
            .iter()
            .zip(arg_types[..count - 1].iter())
            .map(|(arg, desc)| coerce(&arg.decode()?, *desc))
            .collect::<TaskResult<Vec<Value>>>()?;

        let tail = args[count - 1..]
            .iter()
            .map(|arg| coerce(&arg.decode()?, TypeDesc::Scalar(kind)))
            .collect::<TaskResult<Vec<Value>>>()?;
        values.push(Value::List(tail));
        return Ok(values);
    }

    if args.len() != count {
        return Err(TaskError::coercion(format!(
            "handler takes {} arguments, signature carries {}",
            count,
            args.len()
        )));
    }

    args.iter()
        .zip(arg_types.iter())
        .map(|(arg, desc)| coerce(&arg.decode()?, *desc))
        .collect()
}
