//! End-to-end tests driving a worker over the in-process broker/backend

use conveyor::{
    Backend, Chain, Chord, FnHandler, Group, Kind, MemoryBackend, MemoryBroker, Signature, State,
    TaskClient, TaskResult, TypeDesc, TypedValue, Value, Worker,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

const POLL: Duration = Duration::from_millis(10);

struct Harness {
    backend: Arc<MemoryBackend>,
    worker: Arc<Worker>,
    client: TaskClient,
    consume: JoinHandle<TaskResult<()>>,
}

impl Harness {
    /// Build a worker, register the standard arithmetic handlers, and
    /// start consuming
    async fn start(concurrency: usize) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        let backend = Arc::new(MemoryBackend::new());
        let worker = Arc::new(Worker::new(
            "integration-worker",
            concurrency,
            broker.clone(),
            backend.clone(),
        ));

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
        let client = TaskClient::new(broker, backend.clone());

        Self {
            backend,
            worker,
            client,
            consume,
        }
    }

    async fn shutdown(self) {
        self.worker.stop();
        self.consume.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn single_task_round_trip() {
    let harness = Harness::start(4).await;

    let mut result = harness
        .client
        .send_task(Signature::new(
            "add",
            vec![TypedValue::int64(1), TypedValue::int64(2)],
        ))
        .await
        .unwrap();

    let values = result.get(POLL).await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_i64().unwrap(), 3);

    let state = harness
        .backend
        .get_state(&result.signature().uuid)
        .await
        .unwrap();
    assert_eq!(state.state, State::Success);

    harness.shutdown().await;
}

#[tokio::test]
async fn chain_feeds_results_forward_in_order() {
    let harness = Harness::start(4).await;

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for name in ["first", "second"] {
        let order = order.clone();
        harness
            .worker
            .register_handler(
                name,
                FnHandler::new(
                    vec![TypeDesc::Scalar(Kind::Int64), TypeDesc::Scalar(Kind::Int64)],
                    move |args: Vec<Value>| {
                        let order = order.clone();
                        async move {
                            order.lock().unwrap().push(name);
                            Ok(vec![TypedValue::int64(
                                args[0].as_i64()? * args[1].as_i64()?,
                            )])
                        }
                    },
                ),
            )
            .await;
    }
    // Restart the consume loop so the broker learns the new handler names.
    harness.worker.stop();
    harness.consume.await.unwrap().unwrap();
    let consume = tokio::spawn(harness.worker.clone().launch());

    // first(1, 3) = 3, then second(3, 4) = 12
    let chain = Chain::new(vec![
        Signature::new("first", vec![TypedValue::int64(1), TypedValue::int64(3)]),
        Signature::new("second", vec![TypedValue::int64(4)]),
    ]);
    let mut result = harness.client.send_chain(chain).await.unwrap();

    let values = result.get(POLL).await.unwrap();
    assert_eq!(values[0].as_i64().unwrap(), 12);
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    harness.worker.stop();
    consume.await.unwrap().unwrap();
}

#[tokio::test]
async fn chord_dispatches_callback_with_flattened_results() {
    let harness = Harness::start(4).await;

    let group = Group::new(vec![
        Signature::new("add", vec![TypedValue::int64(1), TypedValue::int64(1)]),
        Signature::new("add", vec![TypedValue::int64(2), TypedValue::int64(2)]),
        Signature::new("add", vec![TypedValue::int64(3), TypedValue::int64(3)]),
    ]);
    let chord = Chord::new(group, Signature::new("sum", vec![]));
    let mut result = harness.client.send_chord(chord).await.unwrap();

    let values = result.get(POLL).await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].as_i64().unwrap(), 12);

    harness.shutdown().await;
}

#[tokio::test]
async fn group_members_run_independently() {
    let harness = Harness::start(4).await;

    let group = Group::new(vec![
        Signature::new("add", vec![TypedValue::int64(1), TypedValue::int64(2)]),
        Signature::new("add", vec![TypedValue::int64(3), TypedValue::int64(4)]),
    ]);
    let results = harness.client.send_group(group).await.unwrap();

    let mut sums = Vec::new();
    for mut result in results {
        let values = result.get(POLL).await.unwrap();
        sums.push(values[0].as_i64().unwrap());
    }
    assert_eq!(sums, vec![3, 7]);

    harness.shutdown().await;
}

#[tokio::test]
async fn failure_runs_error_callbacks_with_the_error_prepended() {
    let harness = Harness::start(4).await;

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_handler = seen.clone();
    harness
        .worker
        .register_handler(
            "log_error",
            FnHandler::new(
                vec![TypeDesc::Scalar(Kind::String)],
                move |args: Vec<Value>| {
                    let seen = seen_in_handler.clone();
                    async move {
                        seen.lock().unwrap().push(args[0].as_str()?.to_string());
                        Ok(vec![])
                    }
                },
            ),
        )
        .await;
    harness
        .worker
        .register_handler(
            "fail",
            FnHandler::new(vec![], |_args: Vec<Value>| async move {
                Err::<Vec<TypedValue>, _>(conveyor::TaskError::task_execution("boom"))
            }),
        )
        .await;
    harness.worker.stop();
    harness.consume.await.unwrap().unwrap();
    let consume = tokio::spawn(harness.worker.clone().launch());

    let signature =
        Signature::new("fail", vec![]).with_on_error(Signature::new("log_error", vec![]));
    let mut result = harness.client.send_task(signature).await.unwrap();

    let err = result.get(POLL).await.unwrap_err();
    assert!(err.to_string().contains("boom"));

    let state = harness
        .backend
        .get_state(&result.signature().uuid)
        .await
        .unwrap();
    assert_eq!(state.state, State::Failure);
    assert_eq!(state.error.as_deref(), Some("boom"));

    // The error callback eventually runs with "boom" as its first arg.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if seen.lock().unwrap().as_slice() == ["boom"] {
            break;
        }
        assert!(Instant::now() < deadline, "log_error was never invoked");
        tokio::time::sleep(POLL).await;
    }

    harness.worker.stop();
    consume.await.unwrap().unwrap();
}

#[tokio::test]
async fn delayed_task_is_not_delivered_early() {
    let harness = Harness::start(4).await;

    let eta = chrono::Utc::now() + chrono::Duration::milliseconds(300);
    let signature = Signature::new(
        "add",
        vec![TypedValue::int64(1), TypedValue::int64(2)],
    )
    .with_eta(eta);

    let started = Instant::now();
    let mut result = harness.client.send_task(signature).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = harness
        .backend
        .get_state(&result.signature().uuid)
        .await
        .unwrap();
    assert_eq!(state.state, State::Pending, "task ran before its ETA");

    let values = result.get(POLL).await.unwrap();
    assert_eq!(values[0].as_i64().unwrap(), 3);
    assert!(started.elapsed() >= Duration::from_millis(300));

    harness.shutdown().await;
}

#[tokio::test]
async fn concurrency_bound_holds() {
    let harness = Harness::start(2).await;

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current_in, peak_in) = (current.clone(), peak.clone());
    harness
        .worker
        .register_handler(
            "sleepy",
            FnHandler::new(vec![], move |_args: Vec<Value>| {
                let current = current_in.clone();
                let peak = peak_in.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(vec![])
                }
            }),
        )
        .await;
    harness.worker.stop();
    harness.consume.await.unwrap().unwrap();
    let consume = tokio::spawn(harness.worker.clone().launch());

    let mut results = Vec::new();
    for _ in 0..8 {
        results.push(
            harness
                .client
                .send_task(Signature::new("sleepy", vec![]))
                .await
                .unwrap(),
        );
    }
    for mut result in results {
        result.get(POLL).await.unwrap();
    }

    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "peak concurrency {} exceeded the bound",
        peak.load(Ordering::SeqCst)
    );

    harness.worker.stop();
    consume.await.unwrap().unwrap();
}

#[tokio::test]
async fn unregistered_task_cycles_until_a_worker_has_the_handler() {
    let broker = Arc::new(MemoryBroker::new());
    let backend = Arc::new(MemoryBackend::new());

    // Worker A knows nothing about "late".
    let worker_a = Arc::new(Worker::new("worker-a", 2, broker.clone(), backend.clone()));
    let consume_a = tokio::spawn(worker_a.clone().launch());

    let client = TaskClient::new(broker.clone(), backend.clone());
    let mut result = client
        .send_task(Signature::new(
            "late",
            vec![TypedValue::int64(20), TypedValue::int64(1)],
        ))
        .await
        .unwrap();

    // The message keeps cycling; the worker writes no state.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let state = backend
        .get_state(&result.signature().uuid)
        .await
        .unwrap();
    assert_eq!(state.state, State::Pending);

    worker_a.stop();
    consume_a.await.unwrap().unwrap();

    // Worker B registers the handler and picks the task up.
    let worker_b = Arc::new(Worker::new("worker-b", 2, broker.clone(), backend.clone()));
    worker_b
        .register_handler(
            "late",
            FnHandler::new(
                vec![TypeDesc::Scalar(Kind::Int64), TypeDesc::Scalar(Kind::Int64)],
                |args: Vec<Value>| async move {
                    Ok(vec![TypedValue::int64(args[0].as_i64()? - args[1].as_i64()?)])
                },
            ),
        )
        .await;
    let consume_b = tokio::spawn(worker_b.clone().launch());

    let values = result.get(POLL).await.unwrap();
    assert_eq!(values[0].as_i64().unwrap(), 19);

    worker_b.stop();
    consume_b.await.unwrap().unwrap();
}

#[tokio::test]
async fn redelivery_cannot_overwrite_a_terminal_state() {
    use conveyor::TaskProcessor;

    let broker = Arc::new(MemoryBroker::new());
    let backend = Arc::new(MemoryBackend::new());
    let worker = Arc::new(Worker::new("worker", 2, broker.clone(), backend.clone()));

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in = calls.clone();
    worker
        .register_handler(
            "count",
            FnHandler::new(vec![], move |_args: Vec<Value>| {
                let calls = calls_in.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(vec![TypedValue::int64(n as i64)])
                }
            }),
        )
        .await;

    let signature = Signature::new("count", vec![]);
    worker.process(signature.clone()).await.unwrap();
    // Simulate a transport redelivery of the same signature.
    worker.process(signature.clone()).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let state = backend.get_state(&signature.uuid).await.unwrap();
    assert_eq!(state.state, State::Success);
    assert_eq!(state.results, vec![TypedValue::int64(1)]);
}

#[tokio::test]
async fn timeout_cancels_the_wait_not_the_task() {
    let harness = Harness::start(2).await;

    let eta = chrono::Utc::now() + chrono::Duration::milliseconds(300);
    let signature = Signature::new(
        "add",
        vec![TypedValue::int64(5), TypedValue::int64(5)],
    )
    .with_eta(eta);
    let mut result = harness.client.send_task(signature).await.unwrap();

    let err = result
        .get_with_timeout(Duration::from_millis(50), POLL)
        .await
        .unwrap_err();
    assert!(matches!(err, conveyor::TaskError::Timeout { .. }));

    // The task still completes after the wait was abandoned.
    let values = result.get(POLL).await.unwrap();
    assert_eq!(values[0].as_i64().unwrap(), 10);

    harness.shutdown().await;
}
