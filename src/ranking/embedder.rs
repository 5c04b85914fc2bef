//! Embedding front door for the ranker
//!
//! Prefers the worker pool and falls back to calling the provider directly on
//! the blocking thread pool when the pool is missing, has no live workers or
//! loses every batch. Only a failure of that fallback is terminal.

use super::RankError;
use crate::embedding::EmbeddingProvider;
use crate::pool::{EmbedOutcome, PoolError, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Vectors for a list of texts, aligned with the input
#[derive(Debug, Default)]
pub struct Embedded {
    /// `None` where the text's batch failed
    pub vectors: Vec<Option<Vec<f32>>>,
    /// The synchronous fallback stood in for a configured pool
    pub degraded: bool,
}

#[derive(Clone)]
pub struct Embedder {
    pool: Option<Arc<WorkerPool>>,
    fallback: Arc<dyn EmbeddingProvider>,
    submit_timeout: Duration,
}

impl Embedder {
    pub fn new(
        pool: Option<Arc<WorkerPool>>,
        fallback: Arc<dyn EmbeddingProvider>,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            fallback,
            submit_timeout,
        }
    }

    /// Embedder without a pool; every call runs on the blocking thread pool
    pub fn synchronous(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self::new(None, provider, Duration::from_secs(30))
    }

    pub fn dimension(&self) -> usize {
        self.fallback.dimension()
    }

    pub fn model_tag(&self) -> String {
        self.fallback.model_tag()
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    pub async fn embed(
        &self,
        texts: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Embedded, RankError> {
        if texts.is_empty() {
            return Ok(Embedded::default());
        }
        if cancel.is_cancelled() {
            return Err(RankError::Cancelled);
        }

        if let Some(pool) = &self.pool {
            if pool.live_workers() == 0 {
                warn!("No live workers, embedding {} texts synchronously", texts.len());
            } else {
                match pool.embed(texts.clone(), self.submit_timeout, cancel).await {
                    EmbedOutcome::Success(vectors) => {
                        return Ok(Embedded {
                            vectors: vectors.into_iter().map(Some).collect(),
                            degraded: false,
                        });
                    }
                    EmbedOutcome::PartialSuccess {
                        vectors,
                        failed_batches,
                    } => {
                        debug!(
                            "{} batches failed, {} texts left without vectors",
                            failed_batches.len(),
                            vectors.iter().filter(|v| v.is_none()).count()
                        );
                        return Ok(Embedded {
                            vectors,
                            degraded: false,
                        });
                    }
                    EmbedOutcome::Failure(PoolError::Cancelled) => {
                        return Err(RankError::Cancelled);
                    }
                    EmbedOutcome::Failure(e) => {
                        warn!("Worker pool failed ({}), embedding synchronously", e);
                    }
                }
            }
        }

        let vectors = self.embed_synchronously(texts, cancel).await?;
        Ok(Embedded {
            vectors: vectors.into_iter().map(Some).collect(),
            degraded: self.pool.is_some(),
        })
    }

    async fn embed_synchronously(
        &self,
        texts: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, RankError> {
        let provider = self.fallback.clone();
        let expected = texts.len();
        let task = tokio::task::spawn_blocking(move || provider.embed_batch(&texts));

        let vectors = tokio::select! {
            _ = cancel.cancelled() => return Err(RankError::Cancelled),
            joined = task => match joined {
                Ok(Ok(vectors)) => vectors,
                Ok(Err(e)) => return Err(RankError::EmbeddingUnavailable(e.to_string())),
                Err(e) => {
                    return Err(RankError::EmbeddingUnavailable(format!(
                        "synchronous embedding task failed: {}",
                        e
                    )))
                }
            },
        };

        if vectors.len() != expected {
            return Err(RankError::EmbeddingUnavailable(format!(
                "provider returned {} vectors for {} texts",
                vectors.len(),
                expected
            )));
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingError, HashEmbedProvider};

    struct Unreachable;

    impl EmbeddingProvider for Unreachable {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::GenerationError("model server down".to_string()))
        }
        fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::GenerationError("model server down".to_string()))
        }
        fn dimension(&self) -> usize {
            4
        }
        fn model_name(&self) -> &str {
            "unreachable"
        }
    }

    #[tokio::test]
    async fn test_synchronous_path() {
        let embedder = Embedder::synchronous(Arc::new(HashEmbedProvider::new(8)));
        let embedded = embedder
            .embed(vec!["a".to_string(), "b".to_string()], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(embedded.vectors.len(), 2);
        assert!(embedded.vectors.iter().all(|v| v.as_ref().map(Vec::len) == Some(8)));
        assert!(!embedded.degraded);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_terminal() {
        let embedder = Embedder::synchronous(Arc::new(Unreachable));
        let result = embedder
            .embed(vec!["a".to_string()], &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(RankError::EmbeddingUnavailable(_))));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let embedder = Embedder::synchronous(Arc::new(HashEmbedProvider::new(8)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = embedder.embed(vec!["a".to_string()], &cancel).await;
        assert!(matches!(result, Err(RankError::Cancelled)));
    }
}
