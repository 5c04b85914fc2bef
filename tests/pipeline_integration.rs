// Integration tests for the progressive ranking pipeline
//
// Runs the tier scorer over the worker pool and the vector cache with the
// deterministic hash provider, so no model download is needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tierank::cache::{CacheBackend, CacheError, CacheSettings, MemoryBackend, VectorCache};
use tierank::document::Document;
use tierank::embedding::{EmbeddingError, EmbeddingProvider, HashEmbedProvider};
use tierank::pool::{FixedProbe, PoolSettings, WorkerPool};
use tierank::ranking::{
    Embedder, ExhaustiveRanker, PipelineAdapter, RankError, RankOptions, TierName, TierPlan,
    TierResult, TierScorer, VersionCounter,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const DIM: usize = 64;

/// Fails any batch containing a text that starts with "poison"
struct PoisonProvider {
    inner: HashEmbedProvider,
}

impl EmbeddingProvider for PoisonProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.starts_with("poison")) {
            return Err(EmbeddingError::GenerationError("poisoned batch".to_string()));
        }
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        "poison"
    }
}

/// Refuses any batch holding a blank text, like the ONNX tokenizer does
struct BlankRejecting {
    inner: HashEmbedProvider,
}

impl EmbeddingProvider for BlankRejecting {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        "blank-rejecting"
    }
}

/// Blocks inside `embed_batch` on any batch with a "slow" text until released
struct GatedProvider {
    inner: HashEmbedProvider,
    started: Notify,
    released: AtomicBool,
}

impl EmbeddingProvider for GatedProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner.embed(text)
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.starts_with("slow")) {
            self.started.notify_one();
            let deadline = Instant::now() + Duration::from_secs(5);
            while !self.released.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        self.inner.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn model_name(&self) -> &str {
        "gated"
    }
}

/// Backend whose every call fails, like an unreachable cache server
struct OfflineBackend;

impl CacheBackend for OfflineBackend {
    fn get_many(&self, _keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    fn set_many(&self, _entries: &[(String, Vec<u8>)], _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    fn len(&self) -> Result<usize, CacheError> {
        Err(CacheError::Unavailable("connection refused".to_string()))
    }

    fn name(&self) -> &'static str {
        "offline"
    }
}

fn settings(model_tag: String) -> CacheSettings {
    CacheSettings {
        namespace: "it".to_string(),
        schema_version: 1,
        ttl: Duration::from_secs(300),
        compression_threshold: 1024,
        model_tag,
        dimension: DIM,
    }
}

fn memory_cache(provider: &dyn EmbeddingProvider) -> Arc<VectorCache> {
    Arc::new(VectorCache::new(
        Arc::new(MemoryBackend::new()),
        settings(provider.model_tag()),
    ))
}

fn documents(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| {
            Document::new(format!("study {} of retrieval and ranking models", i))
                .with_external_id(format!("10.1000/{}", i))
        })
        .collect()
}

fn pool_settings(workers: usize, batch_size: usize) -> PoolSettings {
    PoolSettings {
        workers,
        min_batch_size: batch_size,
        max_batch_size: batch_size,
        queue_depth: 2,
        max_in_flight: 8,
        max_retries: 1,
        retry_backoff: Duration::from_millis(1),
        health_interval: Duration::from_millis(50),
    }
}

async fn ready_pool(
    provider: Arc<dyn EmbeddingProvider>,
    settings: PoolSettings,
) -> Arc<WorkerPool> {
    let pool = WorkerPool::start_with_probe(provider, settings, Arc::new(FixedProbe(None))).unwrap();
    pool.wait_ready(Duration::from_secs(5)).await.unwrap();
    Arc::new(pool)
}

fn query(provider: &dyn EmbeddingProvider) -> Vec<f32> {
    provider.embed("retrieval models").unwrap()
}

async fn collect(scorer: &TierScorer, docs: Vec<Document>, query: Vec<f32>) -> Vec<TierResult> {
    scorer
        .score(docs, query, VersionCounter::new(), CancellationToken::new())
        .collect()
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_run_over_worker_pool() {
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedProvider::new(DIM));
    let pool = ready_pool(provider.clone(), pool_settings(4, 16)).await;
    let embedder = Embedder::new(Some(pool.clone()), provider.clone(), Duration::from_secs(5));
    let scorer = TierScorer::new(memory_cache(provider.as_ref()), embedder, TierPlan::default());

    let results = collect(&scorer, documents(600), query(provider.as_ref())).await;

    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        results.iter().map(|r| r.tier).collect::<Vec<_>>(),
        vec![TierName::Immediate, TierName::Refined, TierName::Complete]
    );
    assert_eq!(
        results.iter().map(|r| r.metadata.computed).sum::<usize>(),
        600
    );
    assert!(results.iter().all(|r| !r.metadata.degraded));
    assert_eq!(results[2].documents.len(), 600);

    pool.stop().await;
}

#[tokio::test]
async fn test_small_input_single_immediate_tier() {
    let provider = Arc::new(HashEmbedProvider::new(DIM));
    let scorer = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );

    let results = collect(&scorer, documents(10), query(provider.as_ref())).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].tier, TierName::Immediate);
    assert_eq!(results[0].version, 1);
    assert_eq!(results[0].documents.len(), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_batches_are_excluded() {
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(PoisonProvider {
        inner: HashEmbedProvider::new(DIM),
    });
    let pool = ready_pool(provider.clone(), pool_settings(3, 13)).await;
    let embedder = Embedder::new(Some(pool.clone()), provider.clone(), Duration::from_secs(5));
    let scorer = TierScorer::new(memory_cache(provider.as_ref()), embedder, TierPlan::default());

    // The refined tier covers documents 50..200: 12 batches of 13, two poisoned
    let mut docs = documents(200);
    docs[50].text = "poison one".to_string();
    docs[115].text = "poison two".to_string();

    let results = collect(&scorer, docs, query(provider.as_ref())).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].metadata.computed, 50);
    assert_eq!(results[0].metadata.failed, 0);

    let refined = &results[1];
    assert_eq!(refined.tier, TierName::Refined);
    assert_eq!(refined.metadata.processed, 150);
    assert_eq!(refined.metadata.computed, 124);
    assert_eq!(refined.metadata.failed, 26);
    assert_eq!(refined.documents.len(), 174);
    assert!(refined
        .documents
        .iter()
        .all(|d| !d.text.starts_with("poison")));

    pool.stop().await;
}

#[tokio::test]
async fn test_cancel_before_first_tier() {
    let provider = Arc::new(HashEmbedProvider::new(DIM));
    let scorer = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = scorer
        .score(documents(300), query(provider.as_ref()), VersionCounter::new(), cancel)
        .collect()
        .await;

    assert!(results.is_empty());
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_emission() {
    let provider = Arc::new(HashEmbedProvider::new(DIM));
    let scorer = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );
    let cancel = CancellationToken::new();

    let mut stream = scorer.score(
        documents(600),
        query(provider.as_ref()),
        VersionCounter::new(),
        cancel.clone(),
    );

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.tier, TierName::Immediate);

    cancel.cancel();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_cancel_while_refined_tier_embeds() {
    let provider = Arc::new(GatedProvider {
        inner: HashEmbedProvider::new(DIM),
        started: Notify::new(),
        released: AtomicBool::new(false),
    });
    let scorer = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );
    let cancel = CancellationToken::new();

    let mut docs = documents(200);
    for doc in docs.iter_mut().skip(50) {
        doc.text = format!("slow {}", doc.text);
    }

    let mut stream = scorer.score(
        docs,
        query(provider.as_ref()),
        VersionCounter::new(),
        cancel.clone(),
    );

    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(first.tier, TierName::Immediate);
    assert_eq!(first.version, 1);

    let gate = provider.clone();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        gate.started.notified().await;
        trigger.cancel();
    });

    assert!(stream.next().await.is_none());
    assert!(stream.next().await.is_none());
    assert!(cancel.is_cancelled());

    provider.released.store(true, Ordering::SeqCst);
}

#[tokio::test]
async fn test_blank_text_left_unranked() {
    let provider = Arc::new(BlankRejecting {
        inner: HashEmbedProvider::new(DIM),
    });
    let scorer = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );

    let mut docs = documents(120);
    docs[3].text = String::new();

    let results = collect(&scorer, docs, query(provider.as_ref())).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].metadata.computed, 49);
    assert_eq!(results[0].metadata.failed, 1);
    assert_eq!(results[0].documents.len(), 49);
    assert_eq!(results[1].metadata.failed, 0);
    assert_eq!(results[1].documents.len(), 119);
    assert!(results[1].documents.iter().all(|d| !d.text.is_empty()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blank_text_does_not_sink_its_batch() {
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(BlankRejecting {
        inner: HashEmbedProvider::new(DIM),
    });
    let pool = ready_pool(provider.clone(), pool_settings(3, 13)).await;
    let embedder = Embedder::new(Some(pool.clone()), provider.clone(), Duration::from_secs(5));
    let scorer = TierScorer::new(memory_cache(provider.as_ref()), embedder, TierPlan::default());

    let mut docs = documents(120);
    docs[3].text = "   ".to_string();

    let results = collect(&scorer, docs, query(provider.as_ref())).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].metadata.computed, 49);
    assert_eq!(results[0].metadata.failed, 1);
    assert!(!results[0].metadata.degraded);
    assert_eq!(results[1].documents.len(), 119);

    pool.stop().await;
}

#[tokio::test]
async fn test_unreachable_cache_gives_same_ranking() {
    let provider = Arc::new(HashEmbedProvider::new(DIM));
    let healthy = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );
    let offline = TierScorer::new(
        Arc::new(VectorCache::new(
            Arc::new(OfflineBackend),
            settings(provider.model_tag()),
        )),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );

    let expected = collect(&healthy, documents(250), query(provider.as_ref())).await;
    let degraded = collect(&offline, documents(250), query(provider.as_ref())).await;

    assert_eq!(expected.len(), degraded.len());
    for (a, b) in expected.iter().zip(degraded.iter()) {
        assert_eq!(a.documents, b.documents);
        assert_eq!(b.metadata.cache_hits, 0);
        assert!(b.metadata.degraded);
    }
    assert!(offline.cache().stats().errors > 0);
}

#[tokio::test]
async fn test_dead_pool_falls_back_and_flags_degraded() {
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashEmbedProvider::new(DIM));
    let pool = ready_pool(provider.clone(), pool_settings(2, 8)).await;
    pool.stop().await;

    let embedder = Embedder::new(Some(pool), provider.clone(), Duration::from_secs(5));
    let scorer = TierScorer::new(memory_cache(provider.as_ref()), embedder, TierPlan::default());

    let results = collect(&scorer, documents(40), query(provider.as_ref())).await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].metadata.computed, 40);
    assert!(results[0].metadata.degraded);
}

#[tokio::test]
async fn test_adapter_progressive_and_legacy_agree() {
    let provider = Arc::new(HashEmbedProvider::new(DIM));
    let scorer = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );
    let legacy = Arc::new(ExhaustiveRanker::from_scorer(&scorer));
    let adapter = PipelineAdapter::new(scorer, legacy, Vec::new());

    let mut events: Vec<TierResult> = Vec::new();
    let progressive = adapter
        .rank(
            documents(320),
            query(provider.as_ref()),
            RankOptions {
                progressive: true,
                ..Default::default()
            },
            &mut events,
        )
        .await
        .unwrap();

    let mut unused: Vec<TierResult> = Vec::new();
    let single = adapter
        .rank(
            documents(320),
            query(provider.as_ref()),
            RankOptions::default(),
            &mut unused,
        )
        .await
        .unwrap();

    assert_eq!(events.len(), 3);
    assert_eq!(events.last().unwrap().documents, progressive);
    assert_eq!(progressive, single);
}

#[tokio::test]
async fn test_adapter_reports_query_dimension() {
    let provider = Arc::new(HashEmbedProvider::new(DIM));
    let scorer = TierScorer::new(
        memory_cache(provider.as_ref()),
        Embedder::synchronous(provider.clone()),
        TierPlan::default(),
    );
    let legacy = Arc::new(ExhaustiveRanker::from_scorer(&scorer));
    let adapter = PipelineAdapter::new(scorer, legacy, Vec::new());
    let mut events: Vec<TierResult> = Vec::new();

    let err = adapter
        .rank(
            documents(5),
            vec![0.5; DIM / 2],
            RankOptions {
                progressive: true,
                ..Default::default()
            },
            &mut events,
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        RankError::QueryDimension {
            expected: DIM,
            actual: DIM / 2
        }
    );
    assert!(events.is_empty());
}
