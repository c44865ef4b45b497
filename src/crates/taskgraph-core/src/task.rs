//! Per-task state machine and the `ctx` handed to `execute` (§3, §4.2).

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use taskgraph_runtime::{CancellationSignal, JobContext};

use crate::error::{GraphError, Result};
use crate::port::DataPort;

/// A task's lifecycle. Transitions are single-writer: the runner owns every
/// move except that a task's own execution may drive itself to `Failed`
/// (by returning an error) or `Aborted` (via its cancellation signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// The `ctx` argument to a task's `execute`. Wraps the queue-level
/// [`JobContext`], adding validation against the task's own declared
/// ports: `pushChunk` on an undeclared or non-streaming port fails with
/// `UnknownPort`; `closeStream` on an already-closed port fails with
/// `StreamAlreadyClosed`.
pub struct TaskContext {
    inner: Arc<JobContext>,
    node_id: String,
    output_ports: Vec<DataPort>,
    closed: Mutex<HashSet<String>>,
}

impl TaskContext {
    pub fn new(inner: Arc<JobContext>, node_id: impl Into<String>, output_ports: Vec<DataPort>) -> Self {
        Self {
            inner,
            node_id: node_id.into(),
            output_ports,
            closed: Mutex::new(HashSet::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn signal(&self) -> CancellationSignal {
        self.inner.signal()
    }

    pub async fn update_progress(&self, percent: u8, message: Option<String>) {
        self.inner.update_progress(percent, message).await;
    }

    /// Publishes `value` on a declared streaming output port.
    pub fn push_chunk(&self, port: &str, value: Value) -> Result<()> {
        if !self.output_ports.iter().any(|p| p.name == port && p.streaming) {
            return Err(GraphError::UnknownPort {
                node: self.node_id.clone(),
                port: port.to_string(),
            });
        }
        if self.closed.lock().contains(port) {
            return Err(GraphError::StreamAlreadyClosed(port.to_string()));
        }
        self.inner.push_chunk(port, value);
        Ok(())
    }

    /// Terminal: closes a streaming output port. Fails if already closed.
    pub fn close_stream(&self, port: &str) -> Result<()> {
        if !self.output_ports.iter().any(|p| p.name == port && p.streaming) {
            return Err(GraphError::UnknownPort {
                node: self.node_id.clone(),
                port: port.to_string(),
            });
        }
        let mut closed = self.closed.lock();
        if !closed.insert(port.to_string()) {
            return Err(GraphError::StreamAlreadyClosed(port.to_string()));
        }
        Ok(())
    }

    pub fn is_stream_closed(&self, port: &str) -> bool {
        self.closed.lock().contains(port)
    }

    pub async fn cache_get(&self, fingerprint: &str) -> Option<Value> {
        self.inner.cache_get(fingerprint).await
    }

    pub async fn cache_put(&self, fingerprint: &str, value: Value) {
        self.inner.cache_put(fingerprint, value).await
    }

    /// Enforces the invariant that a task reaches COMPLETED only once
    /// every declared streaming output port has been closed. Called by
    /// the runner after `execute` returns `Ok`.
    pub fn ensure_all_streams_closed(&self) -> Result<()> {
        let closed = self.closed.lock();
        for port in self.output_ports.iter().filter(|p| p.streaming) {
            if !closed.contains(&port.name) {
                return Err(GraphError::Validation(format!(
                    "node {:?} completed without closing streaming port {:?}",
                    self.node_id, port.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{PortSchema, ReadinessMode};
    use taskgraph_runtime::queue::InMemoryQueueStorage;
    use taskgraph_runtime::{JobContext, OutputCache, QueueStorage};
    use tokio::sync::broadcast;

    fn test_ctx(output_ports: Vec<DataPort>) -> TaskContext {
        let storage: Arc<dyn QueueStorage> = Arc::new(InMemoryQueueStorage::new());
        let cache = Arc::new(OutputCache::new());
        let (chunk_tx, _rx) = broadcast::channel(8);
        let inner = Arc::new(JobContext::new("job-1", "Task", storage, cache, chunk_tx));
        TaskContext::new(inner, "A", output_ports)
    }

    #[test]
    fn push_chunk_on_undeclared_port_fails() {
        let ctx = test_ctx(vec![]);
        let err = ctx.push_chunk("output", Value::String("x".into())).unwrap_err();
        assert!(matches!(err, GraphError::UnknownPort { .. }));
    }

    #[test]
    fn close_stream_twice_fails() {
        let ports = vec![DataPort::streaming_output(
            "output",
            PortSchema::Typed("string".into()),
            ReadinessMode::FirstChunk,
        )];
        let ctx = test_ctx(ports);
        ctx.close_stream("output").unwrap();
        let err = ctx.close_stream("output").unwrap_err();
        assert!(matches!(err, GraphError::StreamAlreadyClosed(p) if p == "output"));
    }

    #[test]
    fn ensure_all_streams_closed_rejects_unclosed_port() {
        let ports = vec![DataPort::streaming_output(
            "output",
            PortSchema::Typed("string".into()),
            ReadinessMode::Final,
        )];
        let ctx = test_ctx(ports);
        assert!(ctx.ensure_all_streams_closed().is_err());
        ctx.close_stream("output").unwrap();
        assert!(ctx.ensure_all_streams_closed().is_ok());
    }
}
