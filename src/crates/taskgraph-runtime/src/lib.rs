//! Durable job-queue runtime.
//!
//! This crate is the leaf layer of the task-graph engine: storage
//! contracts, limiters, retry policy, the content-addressed output cache,
//! and the job queue itself, with an in-process client/server split. It
//! has no notion of a *graph* — that's built on top, in `taskgraph-core`,
//! which schedules jobs onto queues defined here.
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use taskgraph_runtime::cache::OutputCache;
//! use taskgraph_runtime::limiter::ConcurrencyLimiter;
//! use taskgraph_runtime::queue::{InMemoryQueueStorage, Job, JobQueue, QueueConfig, Registry};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let storage = Arc::new(InMemoryQueueStorage::new());
//! let limiter = Arc::new(ConcurrencyLimiter::new(4));
//! let cache = Arc::new(OutputCache::new());
//! let registry = Arc::new(Registry::new());
//! registry.register("Double", "local", Arc::new(|input: serde_json::Value, _ctx| {
//!     Box::pin(async move {
//!         let x = input["x"].as_i64().unwrap_or(0);
//!         Ok(json!({ "x": x * 2 }))
//!     })
//! }));
//!
//! let queue = JobQueue::new("demo", storage, limiter, cache, registry, QueueConfig::default());
//! queue.start();
//! let id = queue.add(Job::new("demo", "Double", "local", json!({"x": 21}), "fp-21", 3)).await.unwrap();
//! let done = queue.wait_for(&id).await.unwrap();
//! assert_eq!(done.output, Some(json!({"x": 42})));
//! queue.stop().await;
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod transport;

pub use cache::{CacheEvent, CacheLease, OutputCache, SharedOutputCache};
pub use error::{ErrorKind, QueueError};
pub use limiter::{ConcurrencyLimiter, Limiter, RateLimiter};
pub use queue::{
    CancellationSignal, Chunk, Job, JobChange, JobContext, JobQueue, JobStatus, QueueConfig,
    QueueStorage, Registry, RunFn,
};
pub use retry::{parse_retry_after, RetryPolicy};
pub use storage::{InMemoryKvStore, InMemoryTabularStore, KvEvent, KvStore, TabularRow, TabularStore};
pub use transport::{JobQueueClient, JobQueueServer};
