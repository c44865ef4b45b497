//! Graph-model and task-runtime errors.
//!
//! Mirrors `taskgraph_runtime::error::QueueError`'s shape (named-field
//! variants, `#[error("...")]`, a handful of `#[from]` conversions) but
//! scoped to the concerns that live above the job queue: graph mutation
//! and the per-task port contract.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    /// `insert` collided with an existing node id.
    #[error("node {0:?} already exists")]
    DuplicateNode(String),

    /// An edge or lookup referenced a node id that isn't in the graph.
    #[error("node {0:?} not found")]
    MissingNode(String),

    /// An edge or lookup referenced a port name the node doesn't declare.
    #[error("node {node:?} has no port {port:?}")]
    UnknownPort { node: String, port: String },

    /// The source output schema and target input schema are neither
    /// identical/unconstrained (static) nor a valid refinement (runtime).
    #[error("incompatible types on edge {src}.{src_port} -> {dst}.{dst_port}")]
    IncompatibleTypes {
        src: String,
        src_port: String,
        dst: String,
        dst_port: String,
    },

    /// Adding this edge would close a cycle. The graph is left unchanged.
    #[error("edge {src} -> {dst} would close a cycle")]
    CycleError { src: String, dst: String },

    /// `closeStream` called on a port that was already closed.
    #[error("stream port {0:?} is already closed")]
    StreamAlreadyClosed(String),

    /// Input failed schema validation before the task could run.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Queue(#[from] taskgraph_runtime::QueueError),
}

pub type Result<T> = std::result::Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_node_message_includes_id() {
        let err = GraphError::DuplicateNode("A".into());
        assert_eq!(err.to_string(), "node \"A\" already exists");
    }

    #[test]
    fn cycle_error_names_both_endpoints() {
        let err = GraphError::CycleError {
            src: "C".into(),
            dst: "A".into(),
        };
        assert!(err.to_string().contains("C -> A"));
    }
}
