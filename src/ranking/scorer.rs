//! Progressive tier scorer
//!
//! `score` spawns one producer task per operation. The producer runs the
//! tiers in priority order and hands each result over a channel of capacity
//! one, reserving the slot before computing a tier so it never runs more than
//! one tier ahead of the consumer.

use super::embedder::Embedder;
use super::result::{TierMetadata, TierResult};
use super::scoring::{materialize, resolve_vectors, score_vectors, sort_scored, Scored};
use super::tiers::TierPlan;
use super::version::VersionCounter;
use super::RankError;
use crate::cache::VectorCache;
use crate::document::Document;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Scores documents tier by tier against a query vector
#[derive(Clone)]
pub struct TierScorer {
    cache: Arc<VectorCache>,
    embedder: Embedder,
    tiers: TierPlan,
}

/// Ordered, finite, single-pass sequence of tier results
///
/// Ends after the last tier, after a terminal error, or on cancellation.
/// Dropping the stream stops the producer.
pub struct TierStream {
    rx: mpsc::Receiver<Result<TierResult, RankError>>,
}

impl TierStream {
    /// Next tier result, `None` once the sequence is over
    pub async fn next(&mut self) -> Option<Result<TierResult, RankError>> {
        self.rx.recv().await
    }

    /// Drain the remaining results
    pub async fn collect(mut self) -> Vec<Result<TierResult, RankError>> {
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result);
        }
        results
    }
}

impl TierScorer {
    pub fn new(cache: Arc<VectorCache>, embedder: Embedder, tiers: TierPlan) -> Self {
        Self {
            cache,
            embedder,
            tiers,
        }
    }

    pub fn cache(&self) -> &Arc<VectorCache> {
        &self.cache
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn tiers(&self) -> &TierPlan {
        &self.tiers
    }

    /// Start scoring; results are pulled from the returned stream
    pub fn score(
        &self,
        documents: Vec<Document>,
        query: Vec<f32>,
        versions: VersionCounter,
        cancel: CancellationToken,
    ) -> TierStream {
        let (tx, rx) = mpsc::channel(1);
        let scorer = self.clone();

        tokio::spawn(async move {
            scorer.produce(documents, query, versions, cancel, tx).await;
        });

        TierStream { rx }
    }

    async fn produce(
        self,
        documents: Vec<Document>,
        query: Vec<f32>,
        mut versions: VersionCounter,
        cancel: CancellationToken,
        tx: mpsc::Sender<Result<TierResult, RankError>>,
    ) {
        let started = Instant::now();
        let operation = Uuid::new_v4();
        let total = documents.len();
        let dimension = self.embedder.dimension();
        debug!("Operation {}: scoring {} documents", operation, total);

        if total > 0 && query.len() != dimension {
            error!(
                "Query vector has dimension {}, model produces {}",
                query.len(),
                dimension
            );
            let _ = tx
                .send(Err(RankError::QueryDimension {
                    expected: dimension,
                    actual: query.len(),
                }))
                .await;
            return;
        }

        let mut scored: Vec<Scored> = Vec::with_capacity(total);

        for (tier, range) in self.tiers.ranges(total) {
            if cancel.is_cancelled() {
                debug!("Cancelled before tier {}", tier.name);
                return;
            }

            let slot = tokio::select! {
                _ = cancel.cancelled() => return,
                reserved = tx.reserve() => match reserved {
                    Ok(slot) => slot,
                    Err(_) => {
                        debug!("Tier stream dropped, stopping before tier {}", tier.name);
                        return;
                    }
                },
            };

            let slice = &documents[range.clone()];
            let resolved =
                match resolve_vectors(&self.cache, &self.embedder, slice, dimension, &cancel).await
                {
                    Ok(resolved) => resolved,
                    Err(RankError::Cancelled) => {
                        debug!("Cancelled during tier {}", tier.name);
                        return;
                    }
                    Err(e) => {
                        error!("Tier {} failed: {}", tier.name, e);
                        slot.send(Err(e));
                        return;
                    }
                };

            if cancel.is_cancelled() {
                debug!("Cancelled after resolving tier {}", tier.name);
                return;
            }

            scored.extend(score_vectors(&query, range.start, &resolved.vectors));
            sort_scored(&mut scored);

            let result = TierResult {
                tier: tier.name,
                version: versions.next(),
                documents: materialize(&documents, &scored),
                latency_ms: started.elapsed().as_millis() as u64,
                metadata: TierMetadata {
                    processed: slice.len(),
                    cache_hits: resolved.cache_hits,
                    computed: resolved.computed,
                    failed: resolved.failed,
                    degraded: resolved.degraded,
                },
            };

            info!(
                "[{}] Tier {} v{}: {} docs ({} cached, {} computed, {} failed) in {}ms",
                operation,
                result.tier,
                result.version,
                result.metadata.processed,
                result.metadata.cache_hits,
                result.metadata.computed,
                result.metadata.failed,
                result.latency_ms
            );

            slot.send(Ok(result));
        }
    }
}
