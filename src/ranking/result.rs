// Tier result events as pushed through the transport boundary

use super::tiers::TierName;
use crate::document::Document;
use serde::{Deserialize, Serialize};

/// Per-tier counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierMetadata {
    /// Documents in this tier's slice
    pub processed: usize,
    /// Vectors served from the cache
    pub cache_hits: usize,
    /// Vectors newly produced by the pool or the fallback
    pub computed: usize,
    /// Documents left out because no vector could be obtained
    pub failed: usize,
    /// Fallback path used or cache unreachable
    pub degraded: bool,
}

/// One emitted tier: the full cumulative ranking so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierResult {
    pub tier: TierName,
    pub version: u64,
    pub documents: Vec<Document>,
    /// Milliseconds since the operation started
    pub latency_ms: u64,
    pub metadata: TierMetadata,
}
