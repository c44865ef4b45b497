//! Schedules ready tasks, propagates data along edges, and honours
//! per-edge readiness modes (§4.3, §5).
//!
//! Each node in the graph gets its own async "slot": a map of filled
//! input ports plus a `Notify` woken whenever a new value lands. A node
//! becomes runnable once every port named by its inbound edges has a
//! value (or immediately, for roots). This avoids the cyclic
//! task-knows-runner reference §9 flags by keeping all shared state in
//! plain data the runner owns, not in the task itself.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use taskgraph_runtime::{Chunk, Job, JobQueue, JobStatus};

use crate::error::{GraphError, Result};
use crate::graph::{ExecutionPlan, Graph, NodeSpec};
use crate::port::ReadinessMode;
use crate::task::TaskStatus;

/// Outcome recorded for one node (or, for a fan-out node, one clone)
/// once the run finishes.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

struct NodeSlot {
    inputs: AsyncMutex<HashMap<String, Value>>,
    required: HashSet<String>,
    notify: Notify,
    aborted: AtomicBool,
}

type Slots = Arc<HashMap<String, Arc<NodeSlot>>>;
type Outcomes = Arc<AsyncMutex<HashMap<String, NodeOutcome>>>;

fn fingerprint_for(task_type: &str, input: &Value) -> String {
    use std::hash::{Hash, Hasher};
    let canonical = serde_json::to_string(input).unwrap_or_default();
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    task_type.hash(&mut hasher);
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn status_for(job_status: JobStatus) -> TaskStatus {
    match job_status {
        JobStatus::Completed | JobStatus::Skipped => TaskStatus::Completed,
        JobStatus::Aborting => TaskStatus::Aborted,
        _ => TaskStatus::Failed,
    }
}

/// Runs a compiled [`Graph`] against a set of named job queues, one per
/// provider. Construct once per run; `run` consumes the set of root
/// inputs and drives every node to a terminal status.
pub struct GraphRunner {
    graph: Graph,
    plan: ExecutionPlan,
    queues: HashMap<String, Arc<JobQueue>>,
    /// Jobs currently in flight for each node (fan-out clones are recorded
    /// under their parent's node id). Cleared as soon as a recorded job
    /// reaches a terminal status, so `abort_task`/`abort_graph` never call
    /// `queue.abort` on a job that has already completed — `abort` itself
    /// unconditionally sets `Aborting`, which would clobber a finished job.
    active_jobs: AsyncMutex<HashMap<String, Vec<(Arc<JobQueue>, String)>>>,
    /// The slot map of whichever `run` call is currently in flight, if any.
    active_slots: AsyncMutex<Option<Slots>>,
}

impl GraphRunner {
    pub fn new(graph: Graph, queues: HashMap<String, Arc<JobQueue>>) -> Result<Self> {
        let plan = graph.compile()?;
        Ok(Self {
            graph,
            plan,
            queues,
            active_jobs: AsyncMutex::new(HashMap::new()),
            active_slots: AsyncMutex::new(None),
        })
    }

    /// Cancels every in-flight job recorded for `node_id` and marks that
    /// node, plus all of its strict downstream descendants, ABORTED.
    pub async fn abort_task(&self, node_id: &str) -> Result<()> {
        if let Some(jobs) = self.active_jobs.lock().await.remove(node_id) {
            for (queue, job_id) in jobs {
                queue.abort(&job_id).await?;
            }
        }
        let slots_guard = self.active_slots.lock().await;
        if let Some(slots) = slots_guard.as_ref() {
            if let Some(slot) = slots.get(node_id) {
                slot.aborted.store(true, Ordering::SeqCst);
                slot.notify.notify_waiters();
            }
            self.cascade_abort(node_id, slots).await;
        }
        Ok(())
    }

    /// Cancels every in-flight job across every node of the current run
    /// and marks every node ABORTED.
    pub async fn abort_graph(&self) -> Result<()> {
        let jobs: Vec<(Arc<JobQueue>, String)> = self.active_jobs.lock().await.drain().flat_map(|(_, v)| v).collect();
        for (queue, job_id) in jobs {
            queue.abort(&job_id).await?;
        }
        let slots_guard = self.active_slots.lock().await;
        if let Some(slots) = slots_guard.as_ref() {
            for slot in slots.values() {
                slot.aborted.store(true, Ordering::SeqCst);
                slot.notify.notify_waiters();
            }
        }
        Ok(())
    }

    async fn record_active_job(&self, node_id: &str, queue: Arc<JobQueue>, job_id: String) {
        self.active_jobs.lock().await.entry(node_id.to_string()).or_default().push((queue, job_id));
    }

    async fn clear_active_job(&self, node_id: &str, job_id: &str) {
        let mut active = self.active_jobs.lock().await;
        if let Some(jobs) = active.get_mut(node_id) {
            jobs.retain(|(_, id)| id != job_id);
            if jobs.is_empty() {
                active.remove(node_id);
            }
        }
    }

    fn queue_for(&self, provider: &str) -> Result<Arc<JobQueue>> {
        self.queues.get(provider).cloned().ok_or_else(|| {
            GraphError::Validation(format!("no queue registered for provider {provider:?}"))
        })
    }

    /// Runs every node to completion, failure, or abortion. `initial_inputs`
    /// supplies the input object for root nodes (nodes with no inbound
    /// edges); nodes with no entry there run with an empty input object.
    pub async fn run(&self, initial_inputs: HashMap<String, Value>) -> Result<HashMap<String, NodeOutcome>> {
        let mut slot_map = HashMap::new();
        for node in self.graph.nodes() {
            let required: HashSet<String> = self
                .graph
                .in_edges(&node.id)
                .iter()
                .map(|e| e.dst_port.clone())
                .collect();
            slot_map.insert(
                node.id.clone(),
                Arc::new(NodeSlot {
                    inputs: AsyncMutex::new(HashMap::new()),
                    required,
                    notify: Notify::new(),
                    aborted: AtomicBool::new(false),
                }),
            );
        }
        let slots: Slots = Arc::new(slot_map);
        let outcomes: Outcomes = Arc::new(AsyncMutex::new(HashMap::new()));

        *self.active_slots.lock().await = Some(slots.clone());

        let runs = self.graph.nodes().map(|node| {
            self.run_node(
                node.id.clone(),
                initial_inputs.get(&node.id).cloned(),
                slots.clone(),
                outcomes.clone(),
            )
        });
        join_all(runs).await;

        *self.active_slots.lock().await = None;

        let outcomes = Arc::try_unwrap(outcomes)
            .map_err(|_| GraphError::Validation("run outlived its own outcome handles".into()))?
            .into_inner();
        Ok(outcomes)
    }

    async fn run_node(&self, node_id: String, initial_input: Option<Value>, slots: Slots, outcomes: Outcomes) {
        let slot = slots[&node_id].clone();

        let input_obj = loop {
            if slot.aborted.load(Ordering::SeqCst) {
                outcomes.lock().await.insert(
                    node_id.clone(),
                    NodeOutcome {
                        status: TaskStatus::Aborted,
                        output: None,
                        error: None,
                    },
                );
                return;
            }
            if slot.required.is_empty() {
                break initial_input.clone().unwrap_or_else(|| Value::Object(Default::default()));
            }
            let inputs = slot.inputs.lock().await;
            if slot.required.iter().all(|p| inputs.contains_key(p)) {
                break Value::Object(inputs.clone().into_iter().collect());
            }
            drop(inputs);
            slot.notify.notified().await;
        };

        let node = self.graph.node(&node_id).expect("node present for every slot");
        let queue = match self.queue_for(&node.provider) {
            Ok(q) => q,
            Err(err) => {
                warn!(node = %node_id, %err, "no queue for node's provider");
                self.cascade_abort(&node_id, &slots).await;
                outcomes.lock().await.insert(
                    node_id,
                    NodeOutcome {
                        status: TaskStatus::Failed,
                        output: None,
                        error: Some(err.to_string()),
                    },
                );
                return;
            }
        };

        let result = if self.plan.fan_out_nodes.contains(&node_id) {
            self.run_fan_out(&node_id, node, input_obj, &queue, &outcomes).await
        } else {
            self.run_single(&node_id, node, input_obj, &queue, &slots).await
        };

        match result {
            Ok((status, output)) => {
                if status == TaskStatus::Failed {
                    self.cascade_abort(&node_id, &slots).await;
                } else if let Some(out) = &output {
                    self.propagate(&node_id, out, &slots).await;
                }
                outcomes.lock().await.insert(
                    node_id,
                    NodeOutcome {
                        status,
                        output,
                        error: None,
                    },
                );
            }
            Err(err) => {
                self.cascade_abort(&node_id, &slots).await;
                outcomes.lock().await.insert(
                    node_id,
                    NodeOutcome {
                        status: TaskStatus::Failed,
                        output: None,
                        error: Some(err.to_string()),
                    },
                );
            }
        }
    }

    /// Submits one job, and for any streaming output port declared
    /// `first-chunk`, spawns a listener that delivers the first observed
    /// chunk on that port to downstream slots as soon as it arrives — so
    /// a downstream consumer may become ready before this job completes.
    /// The edge's final, authoritative value is still delivered by the
    /// normal post-completion propagation once `runFn` returns its fully
    /// accumulated output (jobs are single-shot records; this runner does
    /// not re-open an already-submitted job's input, so early delivery
    /// carries only the first chunk, not a live-updating stream).
    async fn run_single(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: Value,
        queue: &Arc<JobQueue>,
        slots: &Slots,
    ) -> Result<(TaskStatus, Option<Value>)> {
        let fingerprint = fingerprint_for(&node.task_type, &input);
        let job = Job::new(queue.name(), node.task_type.clone(), node.provider.clone(), input, fingerprint, 3);
        let job_id = queue.add(job).await?;
        self.record_active_job(node_id, queue.clone(), job_id.clone()).await;

        let first_chunk_targets: Vec<(String, String, String)> = node
            .output_ports
            .iter()
            .filter(|p| p.streaming && p.readiness == Some(ReadinessMode::FirstChunk))
            .flat_map(|p| {
                self.graph
                    .out_edges(node_id)
                    .into_iter()
                    .filter(move |e| e.src_port == p.name)
                    .map(|e| (e.src_port.clone(), e.dst.clone(), e.dst_port.clone()))
            })
            .collect();

        if !first_chunk_targets.is_empty() {
            let queue = queue.clone();
            let job_id = job_id.clone();
            let slots = slots.clone();
            tokio::spawn(async move {
                first_chunk_listener(queue, job_id, first_chunk_targets, slots).await;
            });
        }

        let done = queue.wait_for(&job_id).await?;
        self.clear_active_job(node_id, &job_id).await;
        info!(node = %node_id, status = ?done.status, "node job finished");
        Ok((status_for(done.status), done.output))
    }

    /// Splits the fan-out input array into one clone per element, runs
    /// each as an independent job (the shared queue's own limiter bounds
    /// concurrency across clones), and rejoins by collecting each
    /// clone's output into an array keyed by the parent node id.
    async fn run_fan_out(
        &self,
        node_id: &str,
        node: &NodeSpec,
        input: Value,
        queue: &Arc<JobQueue>,
        outcomes: &Outcomes,
    ) -> Result<(TaskStatus, Option<Value>)> {
        let fan_out_port = self
            .plan
            .fan_out_ports
            .get(node_id)
            .ok_or_else(|| GraphError::Validation(format!("{node_id:?} has no recorded fan-out port")))?;

        let elements = input
            .get(fan_out_port)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                GraphError::Validation(format!(
                    "fan-out port {fan_out_port:?} on {node_id:?} did not carry an array"
                ))
            })?;

        let base = input.as_object().cloned().unwrap_or_default();

        let clone_runs = elements.iter().enumerate().map(|(i, element)| {
            let mut clone_input = base.clone();
            clone_input.insert(fan_out_port.clone(), element.clone());
            let clone_id = format!("{node_id}#{i}");
            let fingerprint = fingerprint_for(&node.task_type, &Value::Object(clone_input.clone()));
            let job = Job::new(
                queue.name(),
                node.task_type.clone(),
                node.provider.clone(),
                Value::Object(clone_input),
                fingerprint,
                3,
            )
            .with_parent(node_id.to_string());
            let queue = queue.clone();
            let clone_id = clone_id.clone();
            async move {
                let job_id = queue.add(job).await?;
                self.record_active_job(node_id, queue.clone(), job_id.clone()).await;
                let done = queue.wait_for(&job_id).await?;
                self.clear_active_job(node_id, &job_id).await;
                Ok::<_, GraphError>((clone_id, status_for(done.status), done.output))
            }
        });

        let results = join_all(clone_runs).await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut any_failed = false;
        for result in results {
            let (clone_id, status, output) = result?;
            if status != TaskStatus::Completed {
                any_failed = true;
            }
            outputs.push(output.clone().unwrap_or(Value::Null));
            outcomes.lock().await.insert(
                clone_id,
                NodeOutcome {
                    status,
                    output,
                    error: None,
                },
            );
        }

        let status = if any_failed { TaskStatus::Failed } else { TaskStatus::Completed };
        let combined = match node.output_ports.first() {
            Some(port) => {
                let mut map = serde_json::Map::new();
                map.insert(port.name.clone(), Value::Array(outputs));
                Value::Object(map)
            }
            None => Value::Array(outputs),
        };
        Ok((status, Some(combined)))
    }

    async fn propagate(&self, node_id: &str, output: &Value, slots: &Slots) {
        for edge in self.graph.out_edges(node_id) {
            let Some(dst_slot) = slots.get(&edge.dst) else { continue };
            let value = output.get(&edge.src_port).cloned().unwrap_or(Value::Null);
            dst_slot.inputs.lock().await.insert(edge.dst_port.clone(), value);
            dst_slot.notify.notify_waiters();
        }
    }

    /// Marks every strict descendant of a failed node ABORTED and wakes
    /// any that are waiting on inputs, so a cascading abort (not a
    /// cascading failure) reaches the whole downstream subgraph.
    async fn cascade_abort(&self, node_id: &str, slots: &Slots) {
        let mut queue = VecDeque::from([node_id.to_string()]);
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            for edge in self.graph.out_edges(&id) {
                if seen.insert(edge.dst.clone()) {
                    if let Some(slot) = slots.get(&edge.dst) {
                        slot.aborted.store(true, Ordering::SeqCst);
                        slot.notify.notify_waiters();
                    }
                    queue.push_back(edge.dst.clone());
                }
            }
        }
    }
}

async fn first_chunk_listener(
    queue: Arc<JobQueue>,
    job_id: String,
    targets: Vec<(String, String, String)>,
    slots: Slots,
) {
    let mut rx = None;
    for _ in 0..50 {
        if let Some(r) = queue.subscribe_chunks(&job_id) {
            rx = Some(r);
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let Some(mut rx) = rx else {
        return;
    };

    let mut fired: HashSet<(String, String)> = HashSet::new();
    while let Ok(chunk) = rx.recv().await {
        deliver_first_chunk(&chunk, &targets, &slots, &mut fired).await;
        if fired.len() == targets.len() {
            break;
        }
    }
}

async fn deliver_first_chunk(
    chunk: &Chunk,
    targets: &[(String, String, String)],
    slots: &Slots,
    fired: &mut HashSet<(String, String)>,
) {
    for (src_port, dst_id, dst_port) in targets {
        if *src_port != chunk.port {
            continue;
        }
        let key = (dst_id.clone(), dst_port.clone());
        if !fired.insert(key) {
            continue;
        }
        if let Some(slot) = slots.get(dst_id) {
            slot.inputs.lock().await.insert(dst_port.clone(), chunk.value.clone());
            slot.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeSpec;
    use crate::port::{DataPort, PortSchema};
    use std::time::Duration as StdDuration;
    use taskgraph_runtime::queue::InMemoryQueueStorage;
    use taskgraph_runtime::{ConcurrencyLimiter, OutputCache, QueueConfig, Registry};

    fn make_queue(name: &str, registry: Arc<Registry>) -> Arc<JobQueue> {
        let storage = Arc::new(InMemoryQueueStorage::new());
        let limiter = Arc::new(ConcurrencyLimiter::new(4));
        let cache = Arc::new(OutputCache::new());
        JobQueue::new(
            name,
            storage,
            limiter,
            cache,
            registry,
            QueueConfig {
                worker_count: 2,
                poll_interval: StdDuration::from_millis(5),
                ..Default::default()
            },
        )
    }

    fn numeric_node(id: &str, task_type: &str) -> NodeSpec {
        NodeSpec::new(id, task_type, "local")
            .with_input(DataPort::scalar("x", PortSchema::Typed("number".into())))
            .with_output(DataPort::scalar("x", PortSchema::Typed("number".into())))
    }

    #[tokio::test]
    async fn linear_pipeline_propagates_in_order() {
        let registry = Arc::new(Registry::new());
        registry.register(
            "Identity",
            "local",
            Arc::new(|input: Value, _ctx| Box::pin(async move { Ok(input) })),
        );
        registry.register(
            "Double",
            "local",
            Arc::new(|input: Value, _ctx| {
                Box::pin(async move {
                    let x = input["x"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!({ "x": x * 2 }))
                })
            }),
        );
        registry.register(
            "AddFive",
            "local",
            Arc::new(|input: Value, _ctx| {
                Box::pin(async move {
                    let x = input["x"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!({ "x": x + 5 }))
                })
            }),
        );

        let queue = make_queue("q", registry);
        queue.start();

        let mut graph = Graph::new();
        graph.insert(numeric_node("A", "Identity")).unwrap();
        graph.insert(numeric_node("B", "Double")).unwrap();
        graph.insert(numeric_node("C", "AddFive")).unwrap();
        graph.add_edge("A", "x", "B", "x", None).unwrap();
        graph.add_edge("B", "x", "C", "x", None).unwrap();

        let mut queues = HashMap::new();
        queues.insert("local".to_string(), queue.clone());
        let runner = GraphRunner::new(graph, queues).unwrap();

        let mut initial = HashMap::new();
        initial.insert("A".to_string(), serde_json::json!({ "x": 1 }));
        let outcomes = runner.run(initial).await.unwrap();
        queue.stop().await;

        assert_eq!(outcomes["A"].output, Some(serde_json::json!({"x": 1})));
        assert_eq!(outcomes["B"].output, Some(serde_json::json!({"x": 2})));
        assert_eq!(outcomes["C"].output, Some(serde_json::json!({"x": 7})));
        assert_eq!(outcomes["C"].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn fan_out_runs_one_clone_per_array_element() {
        let registry = Arc::new(Registry::new());
        registry.register(
            "Emit",
            "local",
            Arc::new(|_input: Value, _ctx| {
                Box::pin(async move { Ok(serde_json::json!({ "items": [1, 2, 3] })) })
            }),
        );
        registry.register(
            "Consume",
            "local",
            Arc::new(|input: Value, _ctx| {
                Box::pin(async move {
                    let item = input["item"].as_i64().unwrap_or(0);
                    Ok(serde_json::json!({ "item": item * 10 }))
                })
            }),
        );

        let queue = make_queue("q", registry);
        queue.start();

        let mut graph = Graph::new();
        graph
            .insert(
                NodeSpec::new("A", "Emit", "local")
                    .with_output(DataPort::scalar("items", PortSchema::TypedArray("number".into()))),
            )
            .unwrap();
        graph
            .insert(
                NodeSpec::new("B", "Consume", "local")
                    .with_input(DataPort::scalar("item", PortSchema::Typed("number".into())))
                    .with_output(DataPort::scalar("item", PortSchema::Typed("number".into()))),
            )
            .unwrap();
        graph.add_edge("A", "items", "B", "item", None).unwrap();

        let mut queues = HashMap::new();
        queues.insert("local".to_string(), queue.clone());
        let runner = GraphRunner::new(graph, queues).unwrap();

        let outcomes = runner.run(HashMap::new()).await.unwrap();
        queue.stop().await;

        assert_eq!(outcomes["B#0"].status, TaskStatus::Completed);
        assert_eq!(outcomes["B#1"].status, TaskStatus::Completed);
        assert_eq!(outcomes["B#2"].status, TaskStatus::Completed);
        assert_eq!(
            outcomes["B"].output,
            Some(serde_json::json!({ "item": [10, 20, 30] }))
        );
    }

    #[tokio::test]
    async fn abort_task_cancels_job_and_cascades_downstream() {
        let registry = Arc::new(Registry::new());
        registry.register(
            "Slow",
            "local",
            Arc::new(|_input: Value, _ctx| {
                Box::pin(async move {
                    tokio::time::sleep(StdDuration::from_millis(200)).await;
                    Ok(serde_json::json!({ "x": 1 }))
                })
            }),
        );
        registry.register(
            "Identity",
            "local",
            Arc::new(|input: Value, _ctx| Box::pin(async move { Ok(input) })),
        );

        let queue = make_queue("q", registry);
        queue.start();

        let mut graph = Graph::new();
        graph.insert(numeric_node("A", "Slow")).unwrap();
        graph.insert(numeric_node("B", "Identity")).unwrap();
        graph.add_edge("A", "x", "B", "x", None).unwrap();

        let mut queues = HashMap::new();
        queues.insert("local".to_string(), queue.clone());
        let runner = Arc::new(GraphRunner::new(graph, queues).unwrap());

        let run_runner = runner.clone();
        let run_handle = tokio::spawn(async move { run_runner.run(HashMap::new()).await });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        runner.abort_task("A").await.unwrap();

        let outcomes = run_handle.await.unwrap().unwrap();
        queue.stop().await;

        assert_eq!(outcomes["A"].status, TaskStatus::Aborted);
        assert_eq!(outcomes["B"].status, TaskStatus::Aborted);
    }

    #[tokio::test]
    async fn abort_graph_cancels_every_in_flight_job() {
        let registry = Arc::new(Registry::new());
        registry.register(
            "Slow",
            "local",
            Arc::new(|_input: Value, _ctx| {
                Box::pin(async move {
                    tokio::time::sleep(StdDuration::from_millis(200)).await;
                    Ok(serde_json::json!({ "x": 1 }))
                })
            }),
        );

        let queue = make_queue("q", registry);
        queue.start();

        let mut graph = Graph::new();
        graph.insert(numeric_node("A", "Slow")).unwrap();
        graph.insert(numeric_node("B", "Slow")).unwrap();

        let mut queues = HashMap::new();
        queues.insert("local".to_string(), queue.clone());
        let runner = Arc::new(GraphRunner::new(graph, queues).unwrap());

        let run_runner = runner.clone();
        let run_handle = tokio::spawn(async move { run_runner.run(HashMap::new()).await });

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        runner.abort_graph().await.unwrap();

        let outcomes = run_handle.await.unwrap().unwrap();
        queue.stop().await;

        assert_eq!(outcomes["A"].status, TaskStatus::Aborted);
        assert_eq!(outcomes["B"].status, TaskStatus::Aborted);
    }
}
