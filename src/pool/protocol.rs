// Messages exchanged between the pool and its workers
//
// Workers only ever see requests; replies flow back to the router tagged with
// the sending worker's index.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one batch of texts, unique for the lifetime of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Requests sent to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Embed a batch of texts
    Embed { texts: Vec<String>, batch_id: BatchId },
    /// Liveness probe
    Health,
    /// Finish and exit
    Shutdown,
}

/// Outcome of one batch as reported by a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    Vectors(Vec<Vec<f32>>),
    Error(String),
    /// The provider refused the input; retrying cannot help
    Rejected(String),
}

/// Replies sent by a worker (or by its supervisor, for `Terminated`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerReply {
    /// Model loaded and warm
    Ready,
    /// Batch finished
    Result {
        batch_id: BatchId,
        outcome: BatchOutcome,
    },
    /// Answer to a health probe
    HealthResponse {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_usage: Option<u64>,
    },
    /// Acknowledges a shutdown request
    ShutdownAck,
    /// Worker exited without being asked to
    Terminated { reason: String },
}
