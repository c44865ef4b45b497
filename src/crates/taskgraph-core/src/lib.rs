//! Graph model, task runtime, and graph runner for agentic task-graph
//! execution, built on the job-queue primitives in `taskgraph_runtime`.
//!
//! A [`graph::Graph`] holds typed nodes and dataflows; `Graph::compile`
//! produces an [`graph::ExecutionPlan`] (topological order, dependency
//! layers, fan-out markings). A [`runner::GraphRunner`] drives that plan:
//! it submits one job per ready node to the node's provider queue,
//! propagates each job's output along outgoing edges, and honours
//! per-port readiness (`first-chunk` vs `final`).
//!
//! ```
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskgraph_core::graph::{Graph, NodeSpec};
//! use taskgraph_core::port::{DataPort, PortSchema};
//! use taskgraph_core::runner::GraphRunner;
//! use taskgraph_runtime::{ConcurrencyLimiter, JobQueue, OutputCache, QueueConfig, Registry};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = Arc::new(Registry::new());
//! registry.register("Double", "local", Arc::new(|input: serde_json::Value, _ctx| {
//!     Box::pin(async move {
//!         let x = input["x"].as_i64().unwrap_or(0);
//!         Ok(json!({ "x": x * 2 }))
//!     })
//! }));
//! let queue = JobQueue::new(
//!     "demo",
//!     Arc::new(taskgraph_runtime::queue::InMemoryQueueStorage::new()),
//!     Arc::new(ConcurrencyLimiter::new(2)),
//!     Arc::new(OutputCache::new()),
//!     registry,
//!     QueueConfig::default(),
//! );
//! queue.start();
//!
//! let mut graph = Graph::new();
//! graph.insert(
//!     NodeSpec::new("A", "Double", "local")
//!         .with_input(DataPort::scalar("x", PortSchema::Typed("number".into())))
//!         .with_output(DataPort::scalar("x", PortSchema::Typed("number".into()))),
//! ).unwrap();
//!
//! let mut queues = HashMap::new();
//! queues.insert("local".to_string(), queue.clone());
//! let runner = GraphRunner::new(graph, queues).unwrap();
//!
//! let mut initial = HashMap::new();
//! initial.insert("A".to_string(), json!({"x": 21}));
//! let outcomes = runner.run(initial).await.unwrap();
//! queue.stop().await;
//! assert_eq!(outcomes["A"].output, Some(json!({"x": 42})));
//! # }
//! ```

pub mod error;
pub mod graph;
pub mod port;
pub mod runner;
pub mod task;

pub use error::GraphError;
pub use graph::{Edge, ExecutionPlan, Graph, NodeSpec};
pub use port::{Accumulator, DataPort, PortSchema, ReadinessMode, SchemaCompat};
pub use runner::{GraphRunner, NodeOutcome};
pub use task::{TaskContext, TaskStatus};
