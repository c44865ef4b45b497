//! Worker transport: an in-process client/server split.
//!
//! A [`JobQueueServer`] runs the worker pool against shared storage; a
//! [`JobQueueClient`] submits and observes jobs against the *same* storage.
//! There is deliberately no wire protocol here — the two communicate
//! exclusively through the storage contract plus the queue's own
//! subscription channel. Running the server in a different process than
//! its clients is an external collaborator's concern (a thin RPC shim
//! sitting on top of this API), not something this crate provides.

use std::sync::Arc;

use serde_json::Value;

use crate::error::QueueError;
use crate::queue::{Job, JobQueue, JobStatus};

/// Runs a [`JobQueue`]'s worker pool. Owns the same `Arc<JobQueue>` a
/// [`JobQueueClient`] submits against.
pub struct JobQueueServer {
    queue: Arc<JobQueue>,
}

impl JobQueueServer {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    pub fn start(&self) {
        self.queue.start();
    }

    pub async fn stop(&self) {
        self.queue.stop().await;
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }
}

/// Submits and observes jobs on a queue without running any workers
/// itself. A client and a server constructed from the same `Arc<JobQueue>`
/// (backed by the same storage) see each other's effects immediately —
/// there is no network hop to model.
#[derive(Clone)]
pub struct JobQueueClient {
    queue: Arc<JobQueue>,
}

impl JobQueueClient {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    pub async fn submit(&self, job: Job) -> Result<String, QueueError> {
        self.queue.add(job).await
    }

    pub async fn wait_for(&self, id: &str) -> Result<Job, QueueError> {
        self.queue.wait_for(id).await
    }

    pub async fn progress(&self, id: &str) -> Result<Option<(u8, Option<String>)>, QueueError> {
        self.queue.get_progress(id).await
    }

    pub async fn abort(&self, id: &str) -> Result<(), QueueError> {
        self.queue.abort(id).await
    }

    pub async fn output_if_done(&self, id: &str) -> Result<Option<Value>, QueueError> {
        let job = self.queue.wait_for(id).await?;
        Ok(match job.status {
            JobStatus::Completed | JobStatus::Skipped => job.output,
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::OutputCache;
    use crate::limiter::ConcurrencyLimiter;
    use crate::queue::{QueueConfig, Registry};
    use serde_json::json;

    #[tokio::test]
    async fn client_and_server_share_the_same_storage() {
        let storage = Arc::new(crate::queue::InMemoryQueueStorage::new());
        let limiter = Arc::new(ConcurrencyLimiter::new(2));
        let cache = Arc::new(OutputCache::new());
        let registry = Arc::new(Registry::new());
        registry.register(
            "Echo",
            "local",
            Arc::new(|input: Value, _ctx| Box::pin(async move { Ok(input) })),
        );

        let queue = JobQueue::new(
            "shared",
            storage,
            limiter,
            cache,
            registry,
            QueueConfig {
                worker_count: 1,
                ..Default::default()
            },
        );

        let server = JobQueueServer::new(queue.clone());
        let client = JobQueueClient::new(queue);

        server.start();
        let id = client
            .submit(Job::new("shared", "Echo", "local", json!({"a": 1}), "fp-echo", 1))
            .await
            .unwrap();
        let output = client.output_if_done(&id).await.unwrap();
        server.stop().await;

        assert_eq!(output, Some(json!({"a": 1})));
    }
}
