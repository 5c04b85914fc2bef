//! Pipeline adapter
//!
//! One entry point for both ranking modes. Progressive mode drives the tier
//! scorer and relays tier results to a sink; otherwise the single-shot ranker
//! runs. Either way the same downstream stages see the final ordering.

use super::embedder::Embedder;
use super::result::TierResult;
use super::scorer::TierScorer;
use super::scoring::{materialize, resolve_vectors, score_vectors, sort_scored};
use super::version::{VersionCounter, VersionGate};
use super::RankError;
use crate::cache::VectorCache;
use crate::document::Document;
use async_trait::async_trait;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Ranks a whole document list in one pass
#[async_trait]
pub trait SingleShotRanker: Send + Sync {
    async fn rank(
        &self,
        documents: Vec<Document>,
        query: &[f32],
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>, RankError>;
}

/// Step applied to the ordering after ranking
#[async_trait]
pub trait RankingStage: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(
        &self,
        documents: Vec<Document>,
        query: &[f32],
    ) -> Result<Vec<Document>, RankError>;
}

/// Transport boundary receiving accepted tier results
pub trait TierSink: Send {
    fn emit(&mut self, result: &TierResult) -> Result<(), RankError>;
}

impl TierSink for Vec<TierResult> {
    fn emit(&mut self, result: &TierResult) -> Result<(), RankError> {
        self.push(result.clone());
        Ok(())
    }
}

/// Writes each tier result as one JSON line
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Write the ordering left after the downstream stages as the last line
    ///
    /// Tier lines show each tier before any stage ran; this one carries
    /// `"final": true` and the staged documents.
    pub fn finish(&mut self, documents: &[Document]) -> Result<(), RankError> {
        self.write_line(&FinalLine {
            is_final: true,
            documents,
        })
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<(), RankError> {
        serde_json::to_writer(&mut self.writer, value)
            .map_err(|e| RankError::Sink(e.to_string()))?;
        self.writer
            .write_all(b"\n")
            .and_then(|_| self.writer.flush())
            .map_err(|e| RankError::Sink(e.to_string()))
    }
}

#[derive(Serialize)]
struct FinalLine<'a> {
    #[serde(rename = "final")]
    is_final: bool,
    documents: &'a [Document],
}

impl<W: Write + Send> TierSink for JsonLinesSink<W> {
    fn emit(&mut self, result: &TierResult) -> Result<(), RankError> {
        self.write_line(result)
    }
}

/// Built-in single-shot ranker: resolve every vector at once, then sort
pub struct ExhaustiveRanker {
    cache: Arc<VectorCache>,
    embedder: Embedder,
}

impl ExhaustiveRanker {
    pub fn new(cache: Arc<VectorCache>, embedder: Embedder) -> Self {
        Self { cache, embedder }
    }

    /// Share the scorer's cache and embedder
    pub fn from_scorer(scorer: &TierScorer) -> Self {
        Self::new(scorer.cache().clone(), scorer.embedder().clone())
    }
}

#[async_trait]
impl SingleShotRanker for ExhaustiveRanker {
    async fn rank(
        &self,
        documents: Vec<Document>,
        query: &[f32],
        cancel: &CancellationToken,
    ) -> Result<Vec<Document>, RankError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let dimension = self.embedder.dimension();
        if query.len() != dimension {
            return Err(RankError::QueryDimension {
                expected: dimension,
                actual: query.len(),
            });
        }

        let resolved =
            resolve_vectors(&self.cache, &self.embedder, &documents, dimension, cancel).await?;
        if resolved.failed > 0 {
            warn!("{} documents left unranked, no vector available", resolved.failed);
        }

        let mut scored = score_vectors(query, 0, &resolved.vectors);
        sort_scored(&mut scored);
        Ok(materialize(&documents, &scored))
    }
}

/// Keeps the first `limit` documents
pub struct TruncateStage {
    limit: usize,
}

impl TruncateStage {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

#[async_trait]
impl RankingStage for TruncateStage {
    fn name(&self) -> &str {
        "truncate"
    }

    async fn apply(
        &self,
        mut documents: Vec<Document>,
        _query: &[f32],
    ) -> Result<Vec<Document>, RankError> {
        documents.truncate(self.limit);
        Ok(documents)
    }
}

/// How one `rank` call should run
#[derive(Debug, Clone, Default)]
pub struct RankOptions {
    /// Stream tier results instead of ranking in one pass
    pub progressive: bool,
    /// Stop after the first accepted tier
    pub immediate_only: bool,
    pub cancel: CancellationToken,
}

pub struct PipelineAdapter {
    scorer: TierScorer,
    legacy: Arc<dyn SingleShotRanker>,
    stages: Vec<Arc<dyn RankingStage>>,
}

impl PipelineAdapter {
    pub fn new(
        scorer: TierScorer,
        legacy: Arc<dyn SingleShotRanker>,
        stages: Vec<Arc<dyn RankingStage>>,
    ) -> Self {
        Self {
            scorer,
            legacy,
            stages,
        }
    }

    /// Rank `documents` and run the downstream stages on the result
    ///
    /// Cancellation is not an error: the ordering known at that point is
    /// returned (empty if nothing was ranked yet) and the stages are skipped.
    pub async fn rank(
        &self,
        documents: Vec<Document>,
        query: Vec<f32>,
        options: RankOptions,
        sink: &mut dyn TierSink,
    ) -> Result<Vec<Document>, RankError> {
        let ordered = if options.progressive {
            self.rank_progressive(documents, query.clone(), &options, sink)
                .await?
        } else {
            match self.legacy.rank(documents, &query, &options.cancel).await {
                Ok(ordered) => ordered,
                Err(RankError::Cancelled) => Vec::new(),
                Err(e) => return Err(e),
            }
        };

        if options.cancel.is_cancelled() {
            debug!("Ranking cancelled, skipping downstream stages");
            return Ok(ordered);
        }

        self.run_stages(ordered, &query).await
    }

    async fn rank_progressive(
        &self,
        documents: Vec<Document>,
        query: Vec<f32>,
        options: &RankOptions,
        sink: &mut dyn TierSink,
    ) -> Result<Vec<Document>, RankError> {
        let cancel = options.cancel.child_token();
        let mut stream = self
            .scorer
            .score(documents, query, VersionCounter::new(), cancel.clone());
        let mut gate = VersionGate::new();
        let mut latest = Vec::new();

        while let Some(item) = stream.next().await {
            let result = item?;

            if !gate.accept(result.version) {
                warn!(
                    "Dropping stale {} result v{} (last accepted v{:?})",
                    result.tier,
                    result.version,
                    gate.last_seen()
                );
                continue;
            }

            sink.emit(&result)?;
            latest = result.documents;

            if options.immediate_only {
                debug!("First tier delivered, cancelling the rest");
                cancel.cancel();
                break;
            }
        }

        Ok(latest)
    }

    async fn run_stages(
        &self,
        mut documents: Vec<Document>,
        query: &[f32],
    ) -> Result<Vec<Document>, RankError> {
        for stage in &self.stages {
            debug!("Running stage {} on {} documents", stage.name(), documents.len());
            documents = stage.apply(documents, query).await?;
        }
        Ok(documents)
    }
}
