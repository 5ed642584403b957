//! # conveyor
//!
//! A distributed task queue for Rust: producers publish typed task
//! signatures through a message broker, workers execute registered
//! handlers, and a result backend records the state lifecycle so
//! producers can await outcomes.
//!
//! ## Features
//!
//! - Typed task signatures with dynamic argument marshalling
//! - AMQP broker with delayed delivery via per-task TTL queues
//! - Worker loop with bounded concurrency and graceful stop
//! - Chains, groups and chords with blocking result handles
//! - In-process broker/backend pair for local development and tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use conveyor::{
//!     FnHandler, Kind, MemoryBackend, MemoryBroker, Signature, TaskClient, TypeDesc,
//!     TypedValue, Value, Worker,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> conveyor::TaskResult<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let backend = Arc::new(MemoryBackend::new());
//!
//!     let worker = Arc::new(Worker::new("worker-1", 4, broker.clone(), backend.clone()));
//!     worker
//!         .register_handler(
//!             "add",
//!             FnHandler::new(
//!                 vec![TypeDesc::Scalar(Kind::Int64), TypeDesc::Scalar(Kind::Int64)],
//!                 |args: Vec<Value>| async move {
//!                     Ok(vec![TypedValue::int64(args[0].as_i64()? + args[1].as_i64()?)])
//!                 },
//!             ),
//!         )
//!         .await;
//!     tokio::spawn(worker.clone().launch());
//!
//!     let client = TaskClient::new(broker, backend);
//!     let mut result = client
//!         .send_task(Signature::new(
//!             "add",
//!             vec![TypedValue::int64(1), TypedValue::int64(2)],
//!         ))
//!         .await?;
//!     let values = result.get(Duration::from_millis(10)).await?;
//!     println!("1 + 2 = {}", values[0].as_i64()?);
//!
//!     worker.stop();
//!     Ok(())
//! }
//! ```

pub mod amqp;
pub mod args;
pub mod backend;
pub mod broker;
pub mod client;
pub mod composition;
pub mod config;
pub mod error;
pub mod memory;
pub mod registry;
pub mod result;
pub mod signature;
pub mod state;
pub mod worker;

// Re-export commonly used types
pub use amqp::AmqpBroker;
pub use args::{coerce, decode, Kind, TypeDesc, TypedValue, Value};
pub use backend::Backend;
pub use broker::{Broker, BrokerBase, TaskProcessor};
pub use client::TaskClient;
pub use composition::{Chain, Chord, Group};
pub use config::{AmqpConfig, Config, TlsConfig};
pub use error::{TaskError, TaskResult};
pub use memory::{MemoryBackend, MemoryBroker};
pub use registry::{FnHandler, HandlerRegistry, TaskHandler};
pub use result::{AsyncResult, ChainAsyncResult, ChordAsyncResult};
pub use signature::Signature;
pub use state::{State, TaskState};
pub use worker::Worker;

/// Version of the conveyor library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
