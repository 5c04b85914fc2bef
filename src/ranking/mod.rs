//! Progressive tiered ranking
//!
//! - Tier plan: which slice of the input each tier covers
//! - Tier scorer: cache lookups, embedding of misses, cumulative re-sort
//! - Pipeline adapter: progressive or single-shot, same downstream stages

mod adapter;
mod embedder;
mod result;
mod scorer;
mod scoring;
mod tiers;
mod version;

pub use adapter::{
    ExhaustiveRanker, JsonLinesSink, PipelineAdapter, RankOptions, RankingStage,
    SingleShotRanker, TierSink, TruncateStage,
};
pub use embedder::{Embedded, Embedder};
pub use result::{TierMetadata, TierResult};
pub use scorer::{TierScorer, TierStream};
pub use tiers::{TierDescriptor, TierName, TierPlan, TierPlanError};
pub use version::{VersionCounter, VersionGate};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RankError {
    /// Both the pool and the synchronous fallback failed
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Ranking cancelled")]
    Cancelled,

    #[error("Query vector has dimension {actual}, expected {expected}")]
    QueryDimension { expected: usize, actual: usize },

    #[error("Ranking stage failed: {0}")]
    Stage(String),

    #[error("Tier sink failed: {0}")]
    Sink(String),
}
