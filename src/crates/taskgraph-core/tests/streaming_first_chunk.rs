//! End-to-end: a `first-chunk` readiness edge lets a downstream node
//! start before its upstream producer reaches a terminal status.
//!
//! A `Job`'s input is fixed at submission time, so this only validates
//! the scheduling property the runner actually implements: the first
//! published chunk unblocks the consumer's slot early, and the consumer's
//! job is dispatched immediately with that snapshot. It does not (and
//! the single-shot job model cannot) feed the consumer a live-updating
//! stream of every later chunk, nor correct the consumer's input once
//! dispatched: the producer's later `propagate()` of its final output
//! only runs after the producer's own run finishes, by which point the
//! consumer has typically already completed against the first chunk alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use taskgraph_core::graph::{Graph, NodeSpec};
use taskgraph_core::port::{DataPort, PortSchema, ReadinessMode};
use taskgraph_core::runner::GraphRunner;
use taskgraph_core::task::TaskStatus;
use taskgraph_runtime::queue::InMemoryQueueStorage;
use taskgraph_runtime::{ConcurrencyLimiter, JobQueue, OutputCache, QueueConfig, Registry};

#[tokio::test]
async fn consumer_starts_before_producer_completes_on_first_chunk() {
    let producer_completed = Arc::new(AtomicBool::new(false));
    let consumer_started_early = Arc::new(AtomicBool::new(false));

    let registry = Arc::new(Registry::new());
    {
        let producer_completed = producer_completed.clone();
        registry.register(
            "Stream",
            "local",
            Arc::new(move |_input, ctx| {
                let producer_completed = producer_completed.clone();
                Box::pin(async move {
                    ctx.push_chunk("chunk", json!("A"));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ctx.push_chunk("chunk", json!("B"));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ctx.push_chunk("chunk", json!("C"));
                    producer_completed.store(true, Ordering::SeqCst);
                    Ok(json!({ "chunk": "ABC" }))
                })
            }),
        );
    }
    {
        let producer_completed = producer_completed.clone();
        let consumer_started_early = consumer_started_early.clone();
        registry.register(
            "Consume",
            "local",
            Arc::new(move |input, _ctx| {
                let producer_completed = producer_completed.clone();
                let consumer_started_early = consumer_started_early.clone();
                Box::pin(async move {
                    if !producer_completed.load(Ordering::SeqCst) {
                        consumer_started_early.store(true, Ordering::SeqCst);
                    }
                    Ok(json!({ "seen": input["chunk"] }))
                })
            }),
        );
    }

    let storage = Arc::new(InMemoryQueueStorage::new());
    let limiter = Arc::new(ConcurrencyLimiter::new(4));
    let cache = Arc::new(OutputCache::new());
    let queue = JobQueue::new(
        "stream-q",
        storage,
        limiter,
        cache,
        registry,
        QueueConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(5),
            ..Default::default()
        },
    );
    queue.start();

    let mut graph = Graph::new();
    graph
        .insert(
            NodeSpec::new("A", "Stream", "local").with_output(DataPort::streaming_output(
                "chunk",
                PortSchema::Typed("string".into()),
                ReadinessMode::FirstChunk,
            )),
        )
        .unwrap();
    graph
        .insert(
            NodeSpec::new("B", "Consume", "local")
                .with_input(DataPort::scalar("chunk", PortSchema::Typed("string".into())))
                .with_output(DataPort::scalar("seen", PortSchema::Typed("string".into()))),
        )
        .unwrap();
    graph.add_edge("A", "chunk", "B", "chunk", None).unwrap();

    let mut queues = HashMap::new();
    queues.insert("local".to_string(), queue.clone());
    let runner = GraphRunner::new(graph, queues).unwrap();

    let outcomes = runner.run(HashMap::new()).await.unwrap();
    queue.stop().await;

    assert_eq!(outcomes["A"].status, TaskStatus::Completed);
    assert_eq!(outcomes["B"].status, TaskStatus::Completed);
    assert!(
        consumer_started_early.load(Ordering::SeqCst),
        "consumer should have been unblocked by the first chunk, before the producer finished"
    );
    // B is dispatched the instant the first chunk lands in its slot, using
    // that chunk as its (immutable, once submitted) job input. A's later
    // `propagate()` call, which would overwrite the slot with the producer's
    // final output, only runs after A's own run_node call returns — by then
    // B has already leased, run, and completed against the stale snapshot.
    assert_eq!(outcomes["B"].output, Some(json!({ "seen": "A" })));
}
