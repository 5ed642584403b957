//! AMQP reference broker
//!
//! Topology: one durable exchange of the configured type and one durable
//! default queue bound by the configured binding key. Delayed tasks go
//! through a per-task TTL queue named by the signature UUID whose
//! dead-letter settings re-inject the message into the main flow once the
//! TTL expires.
//!
//! Connections are opened fresh per publish; the consume loop owns one
//! channel for its lifetime.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerBase, TaskProcessor};
use crate::config::{Config, TlsConfig};
use crate::error::{TaskError, TaskResult};
use crate::signature::Signature;

/// Broker speaking AMQP 0.9.1, e.g. to RabbitMQ
pub struct AmqpBroker {
    base: Arc<BrokerBase>,
    config: Config,
}

impl AmqpBroker {
    /// Create an AMQP broker from the given configuration
    pub fn new(config: Config) -> Self {
        Self {
            base: Arc::new(BrokerBase::new()),
            config,
        }
    }

    /// Open a connection and a channel, declaring the exchange
    async fn open(&self) -> TaskResult<(Connection, Channel)> {
        let properties = ConnectionProperties::default();
        let connection = match &self.config.tls {
            Some(tls) => {
                Connection::connect_with_config(
                    &self.config.broker_url,
                    properties,
                    owned_tls_config(tls),
                )
                .await?
            }
            None => Connection::connect(&self.config.broker_url, properties).await?,
        };
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.config.amqp.exchange,
                exchange_kind(&self.config.amqp.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok((connection, channel))
    }

    /// Declare a durable queue and bind it to the exchange
    async fn declare_bound_queue(
        &self,
        channel: &Channel,
        queue: &str,
        declare_args: FieldTable,
        binding_key: &str,
    ) -> TaskResult<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                declare_args,
            )
            .await?;

        channel
            .queue_bind(
                queue,
                &self.config.amqp.exchange,
                binding_key,
                QueueBindOptions::default(),
                string_table(&self.config.amqp.queue_binding_args),
            )
            .await?;

        Ok(())
    }

    /// Default the routing key from the topology: the binding key for a
    /// direct exchange, the default queue name otherwise
    fn adjust_routing_key(&self, signature: &mut Signature) {
        if signature.routing_key.is_empty() {
            signature.routing_key = if self.config.amqp.exchange_type == "direct" {
                self.config.amqp.binding_key.clone()
            } else {
                self.config.default_queue.clone()
            };
        }
    }

    /// Publish a message and wait for the broker's confirm
    async fn publish_confirmed(
        &self,
        channel: &Channel,
        routing_key: &str,
        body: Vec<u8>,
        headers: &HashMap<String, String>,
    ) -> TaskResult<()> {
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        let confirm = channel
            .basic_publish(
                &self.config.amqp.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2)
                    .with_headers(string_table(headers)),
            )
            .await?
            .await?;

        match confirm {
            Confirmation::Nack(_) => Err(TaskError::broker(format!(
                "publish to {routing_key} was nacked by the server"
            ))),
            _ => Ok(()),
        }
    }

    /// Delay a signature by publishing it to a per-task TTL queue.
    ///
    /// The queue is named by the signature UUID and is redeclared on
    /// every call, which zeroes its TTL timer so a late re-publish with
    /// the same UUID wins.
    async fn delay(&self, signature: &Signature, delay_ms: i64) -> TaskResult<()> {
        if delay_ms <= 0 {
            return Err(TaskError::broker("cannot delay a task by 0ms"));
        }

        let body = serde_json::to_vec(signature)?;
        let queue_name = signature.uuid.clone();
        let declare_args =
            delay_queue_args(&self.config.amqp.exchange, &self.config.amqp.binding_key, delay_ms);

        let (connection, channel) = self.open().await?;
        let result = async {
            self.declare_bound_queue(&channel, &queue_name, declare_args, &queue_name)
                .await?;
            self.publish_confirmed(&channel, &queue_name, body, &signature.headers)
                .await
        }
        .await;
        let _ = connection.close(200, "bye").await;

        if result.is_ok() {
            debug!("delayed task {} by {}ms", signature.uuid, delay_ms);
        }
        result
    }

    /// Consume loop: dispatch each delivery as a concurrent task, bounded
    /// by the concurrency semaphore, until stopped or a transport error
    async fn consume(
        &self,
        connection: &Connection,
        channel: &Channel,
        consumer_tag: &str,
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> TaskResult<()> {
        self.declare_bound_queue(
            channel,
            &self.config.default_queue,
            FieldTable::default(),
            &self.config.amqp.binding_key,
        )
        .await?;

        channel
            .basic_qos(self.config.amqp.prefetch_count, BasicQosOptions::default())
            .await?;

        let mut consumer = channel
            .basic_consume(
                &self.config.default_queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = close_tx.send(err);
        });

        let semaphore = (concurrency > 0).then(|| Arc::new(Semaphore::new(concurrency)));
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<TaskError>();
        let mut stop_rx = self.base.stop_signal();
        if *stop_rx.borrow_and_update() {
            return Ok(());
        }
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!("waiting for messages on queue {}", self.config.default_queue);

        let result = loop {
            tokio::select! {
                Some(err) = close_rx.recv() => break Err(TaskError::Amqp(err)),
                Some(err) = err_rx.recv() => break Err(err),
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow_and_update() {
                        break Ok(());
                    }
                }
                delivery = consumer.next() => match delivery {
                    None => break Err(TaskError::broker("consume stream closed")),
                    Some(Err(err)) => break Err(TaskError::Amqp(err)),
                    Some(Ok(delivery)) => {
                        let permit = match &semaphore {
                            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                                Ok(permit) => Some(permit),
                                Err(_) => break Err(TaskError::broker("worker pool closed")),
                            },
                            None => None,
                        };
                        let base = self.base.clone();
                        let processor = processor.clone();
                        let err_tx = err_tx.clone();
                        tasks.spawn(async move {
                            if let Err(err) = consume_one(delivery, base, processor).await {
                                let _ = err_tx.send(err);
                            }
                            drop(permit);
                        });
                    }
                }
            }
        };

        // In-flight tasks finish before the loop reports back.
        while tasks.join_next().await.is_some() {}
        result
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn start_consuming(
        &self,
        consumer_tag: &str,
        concurrency: usize,
        processor: Arc<dyn TaskProcessor>,
    ) -> TaskResult<()> {
        self.base.begin_consuming();

        let (connection, channel) = self.open().await?;
        let result = self
            .consume(&connection, &channel, consumer_tag, concurrency, processor)
            .await;
        let _ = connection.close(200, "bye").await;
        result
    }

    fn stop_consuming(&self) {
        self.base.stop_consuming();
    }

    async fn publish(&self, signature: &Signature) -> TaskResult<()> {
        let mut signature = signature.clone();
        signature.ensure_uuid();
        self.adjust_routing_key(&mut signature);

        if let Some(eta) = signature.eta {
            let now = Utc::now();
            if eta > now {
                let delay_ms = (eta - now).num_milliseconds();
                return self.delay(&signature, delay_ms).await;
            }
        }

        let body = serde_json::to_vec(&signature)?;
        let (connection, channel) = self.open().await?;
        let result = async {
            self.declare_bound_queue(
                &channel,
                &self.config.default_queue,
                FieldTable::default(),
                &self.config.amqp.binding_key,
            )
            .await?;
            self.publish_confirmed(&channel, &signature.routing_key, body, &signature.headers)
                .await
        }
        .await;
        let _ = connection.close(200, "bye").await;

        if result.is_ok() {
            debug!("published task {} to {}", signature.uuid, signature.routing_key);
        }
        result
    }

    async fn purge_queue(&self, queue: &str) -> TaskResult<u32> {
        let (connection, channel) = self.open().await?;
        let result = channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(TaskError::from);
        let _ = connection.close(200, "bye").await;
        result
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

/// Handle a single delivery: validate, decode, re-route or ACK and
/// process.
///
/// The ACK happens before invocation; transport redelivery is the only
/// redelivery mechanism and handlers are expected to be idempotent.
async fn consume_one(
    delivery: Delivery,
    base: Arc<BrokerBase>,
    processor: Arc<dyn TaskProcessor>,
) -> TaskResult<()> {
    if delivery.data.is_empty() {
        delivery.nack(BasicNackOptions::default()).await?;
        return Err(TaskError::broker("received an empty message (broker down?)"));
    }

    debug!("received new message: {}", String::from_utf8_lossy(&delivery.data));

    let signature: Signature = match serde_json::from_slice(&delivery.data) {
        Ok(signature) => signature,
        Err(err) => {
            warn!("discarding undecodable message: {err}");
            delivery.nack(BasicNackOptions::default()).await?;
            return Err(TaskError::Serialization(err));
        }
    };

    // A different worker may have this handler registered.
    if !base.is_task_registered(&signature.name) {
        delivery
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await?;
        return Ok(());
    }

    delivery.ack(BasicAckOptions::default()).await?;
    processor.process(signature).await
}

/// Queue arguments turning a per-task queue into a TTL timer: expired
/// messages dead-letter back into the main exchange, and the queue
/// removes itself shortly after
fn delay_queue_args(exchange: &str, binding_key: &str, delay_ms: i64) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(exchange.to_string().into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(binding_key.to_string().into()),
    );
    args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(delay_ms));
    args.insert("x-expires".into(), AMQPValue::LongLongInt(delay_ms + 3000));
    args
}

fn exchange_kind(exchange_type: &str) -> ExchangeKind {
    match exchange_type {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

fn string_table(map: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
    }
    table
}

fn owned_tls_config(tls: &TlsConfig) -> OwnedTLSConfig {
    OwnedTLSConfig {
        identity: match (&tls.identity_der, &tls.identity_password) {
            (Some(der), Some(password)) => Some(OwnedIdentity {
                der: der.clone(),
                password: password.clone(),
            }),
            _ => None,
        },
        cert_chain: tls.cert_chain.clone(),
    }
}
