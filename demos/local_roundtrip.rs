//! Local round-trip over the in-process broker and backend.
//!
//! Runs a worker and a client in the same process, no RabbitMQ needed:
//!
//! ```bash
//! cargo run --example local_roundtrip
//! ```

use conveyor::{
    Chain, Chord, FnHandler, Group, Kind, MemoryBackend, MemoryBroker, Signature, TaskClient,
    TypeDesc, TypedValue, Value, Worker,
};
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() -> conveyor::TaskResult<()> {
    tracing_subscriber::fmt::init();

    let broker = Arc::new(MemoryBroker::new());
    let backend = Arc::new(MemoryBackend::new());

    let worker = Arc::new(Worker::new("demo-worker", 4, broker.clone(), backend.clone()));
    worker
        .register_handler(
            "add",
            FnHandler::new(
                vec![TypeDesc::Scalar(Kind::Int64), TypeDesc::Scalar(Kind::Int64)],
                |args: Vec<Value>| async move {
                    Ok(vec![TypedValue::int64(args[0].as_i64()? + args[1].as_i64()?)])
                },
            ),
        )
        .await;
    worker
        .register_handler(
            "multiply",
            FnHandler::new(
                vec![TypeDesc::Scalar(Kind::Int64), TypeDesc::Scalar(Kind::Int64)],
                |args: Vec<Value>| async move {
                    Ok(vec![TypedValue::int64(args[0].as_i64()? * args[1].as_i64()?)])
                },
            ),
        )
        .await;
    worker
        .register_handler(
            "sum",
            FnHandler::new(
                vec![TypeDesc::Slice(Kind::Int64)],
                |args: Vec<Value>| async move {
                    let mut total = 0;
                    for value in args[0].as_list()? {
                        total += value.as_i64()?;
                    }
                    Ok(vec![TypedValue::int64(total)])
                },
            ),
        )
        .await;

    let consume = tokio::spawn(worker.clone().launch());
    let client = TaskClient::new(broker, backend);

    // Single task: add(1, 2)
    let mut result = client
        .send_task(Signature::new(
            "add",
            vec![TypedValue::int64(1), TypedValue::int64(2)],
        ))
        .await?;
    let values = result.get(POLL).await?;
    println!("add(1, 2) = {}", values[0].as_i64()?);

    // Chain: add(1, 2) feeding multiply(_, 4)
    let chain = Chain::new(vec![
        Signature::new("add", vec![TypedValue::int64(1), TypedValue::int64(2)]),
        Signature::new("multiply", vec![TypedValue::int64(4)]),
    ]);
    let mut result = client.send_chain(chain).await?;
    let values = result.get(POLL).await?;
    println!("multiply(add(1, 2), 4) = {}", values[0].as_i64()?);

    // Chord: three adds fanning into sum
    let group = Group::new(vec![
        Signature::new("add", vec![TypedValue::int64(1), TypedValue::int64(1)]),
        Signature::new("add", vec![TypedValue::int64(2), TypedValue::int64(2)]),
        Signature::new("add", vec![TypedValue::int64(3), TypedValue::int64(3)]),
    ]);
    let chord = Chord::new(group, Signature::new("sum", vec![]));
    let mut result = client.send_chord(chord).await?;
    let values = result.get(POLL).await?;
    println!("sum of the group = {}", values[0].as_i64()?);

    worker.stop();
    consume.await.expect("worker task panicked")?;
    Ok(())
}
