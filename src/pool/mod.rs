//! Worker pool for text-to-vector embedding
//!
//! A fixed set of worker tasks, each owning a provider handle, fed through
//! bounded per-worker queues. Texts are split into batches sized from memory
//! headroom, dispatched round-robin to the least-loaded live worker, retried
//! with linear backoff and reassembled in input order.
//!
//! Dead workers are not respawned. They stop receiving batches and their
//! pending batches fail; once every worker is dead the pool reports itself
//! unavailable and callers fall back to the synchronous path.

mod batching;
mod protocol;
mod retry;
mod router;
mod worker;

pub use batching::{BatchSizer, FixedProbe, MemoryProbe, SysinfoProbe};
pub use protocol::{BatchId, BatchOutcome, WorkerReply, WorkerRequest};
pub use retry::RetryPolicy;
pub use router::WorkerStatus;

use crate::embedding::EmbeddingProvider;
use router::{RouterEvent, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long `stop` waits for each worker to acknowledge
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Worker pool unavailable: {0}")]
    Unavailable(String),

    #[error("All {batches} batches failed, last error: {last_error}")]
    AllBatchesFailed { batches: usize, last_error: String },

    #[error("Embedding request cancelled")]
    Cancelled,

    #[error("Worker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Batch rejected: {0}")]
    Rejected(String),
}

/// Pool sizing, batching and retry settings
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Capacity of each worker's inbound queue
    pub queue_depth: usize,
    /// Batches in flight across the whole pool
    pub max_in_flight: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub health_interval: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            min_batch_size: 8,
            max_batch_size: 64,
            queue_depth: 4,
            max_in_flight: 16,
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
            health_interval: Duration::from_secs(10),
        }
    }
}

/// Result of one `embed` call
#[derive(Debug, Clone)]
pub enum EmbedOutcome {
    /// Every text has a vector, in input order
    Success(Vec<Vec<f32>>),
    /// Some batches exhausted their retries; their slots are `None`
    PartialSuccess {
        vectors: Vec<Option<Vec<f32>>>,
        failed_batches: Vec<BatchId>,
    },
    Failure(PoolError),
}

/// Snapshot of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealth {
    pub id: usize,
    pub status: WorkerStatus,
    pub in_flight: usize,
    pub completed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub workers: Vec<WorkerHealth>,
}

impl PoolHealth {
    /// Workers currently accepting batches
    pub fn live(&self) -> usize {
        self.workers.iter().filter(|w| w.status.is_live()).count()
    }
}

#[derive(Debug)]
struct Batch {
    id: BatchId,
    start: usize,
    texts: Vec<String>,
}

struct Inner {
    requests: Vec<mpsc::Sender<WorkerRequest>>,
    shared: Arc<Shared>,
    router: mpsc::UnboundedSender<RouterEvent>,
    permits: Arc<Semaphore>,
    probe: Arc<dyn MemoryProbe>,
    sizer: BatchSizer,
    retry: RetryPolicy,
    cursor: AtomicUsize,
    next_batch: AtomicU64,
    shutdown: CancellationToken,
    supervisors: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    router_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Bounded pool of embedding workers
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Spawn the workers; memory headroom is read through `sysinfo`
    ///
    /// Must be called from inside a tokio runtime. Returns immediately; use
    /// [`WorkerPool::wait_ready`] to wait for the workers to warm up.
    pub fn start(
        provider: Arc<dyn EmbeddingProvider>,
        settings: PoolSettings,
    ) -> Result<Self, PoolError> {
        Self::start_with_probe(provider, settings, Arc::new(SysinfoProbe::new()))
    }

    /// Spawn the workers with a custom memory probe
    pub fn start_with_probe(
        provider: Arc<dyn EmbeddingProvider>,
        settings: PoolSettings,
        probe: Arc<dyn MemoryProbe>,
    ) -> Result<Self, PoolError> {
        if settings.workers == 0 {
            return Err(PoolError::Unavailable(
                "pool configured with zero workers".to_string(),
            ));
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| PoolError::Unavailable(format!("no async runtime: {}", e)))?;

        info!(
            "Starting worker pool: {} workers, model {}",
            settings.workers,
            provider.model_tag()
        );

        let shared = Arc::new(Shared::new(settings.workers));
        let shutdown = CancellationToken::new();
        let (router_tx, router_rx) = mpsc::unbounded_channel();

        let mut requests = Vec::with_capacity(settings.workers);
        let mut supervisors = Vec::with_capacity(settings.workers);

        for id in 0..settings.workers {
            let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
            let ctx = worker::WorkerContext {
                id,
                provider: provider.clone(),
                probe: probe.clone(),
                replies: router_tx.clone(),
            };
            supervisors.push(worker::spawn(ctx, rx));
            requests.push(tx);
        }

        let router_task = tokio::spawn(router::run_router(
            shared.clone(),
            router_rx,
            shutdown.clone(),
        ));

        let inner = Arc::new(Inner {
            requests,
            shared,
            router: router_tx,
            permits: Arc::new(Semaphore::new(settings.max_in_flight.max(1))),
            probe,
            sizer: BatchSizer::new(settings.min_batch_size, settings.max_batch_size),
            retry: RetryPolicy::new(settings.max_retries, settings.retry_backoff),
            cursor: AtomicUsize::new(0),
            next_batch: AtomicU64::new(1),
            shutdown,
            supervisors: tokio::sync::Mutex::new(supervisors),
            router_task: tokio::sync::Mutex::new(Some(router_task)),
        });

        if !settings.health_interval.is_zero() {
            tokio::spawn(health_probe(inner.clone(), settings.health_interval));
        }

        Ok(Self { inner })
    }

    /// Wait until every worker has either warmed up or died
    ///
    /// Returns the number of live workers. Timing out with at least one live
    /// worker is not an error.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<usize, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let changed = self.inner.shared.changed.notified();
            let (starting, live) = self.inner.shared.counts();

            if starting == 0 {
                return if live > 0 {
                    info!("Worker pool ready: {} live workers", live);
                    Ok(live)
                } else {
                    Err(PoolError::Unavailable(
                        "every worker failed to start".to_string(),
                    ))
                };
            }

            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                let (starting, live) = self.inner.shared.counts();
                return if live > 0 {
                    warn!(
                        "{} workers still starting after {:?}, continuing with {}",
                        starting, timeout, live
                    );
                    Ok(live)
                } else {
                    Err(PoolError::Unavailable(format!(
                        "no worker became ready within {:?}",
                        timeout
                    )))
                };
            }
        }
    }

    /// Workers currently accepting batches
    pub fn live_workers(&self) -> usize {
        self.inner.shared.counts().1
    }

    pub fn health(&self) -> PoolHealth {
        PoolHealth {
            workers: self
                .inner
                .shared
                .slots
                .iter()
                .enumerate()
                .map(|(id, slot)| WorkerHealth {
                    id,
                    status: slot.status(),
                    in_flight: slot.in_flight(),
                    completed: slot.completed(),
                    memory_usage: slot.memory_usage(),
                })
                .collect(),
        }
    }

    /// Embed `texts`, returning vectors in input order
    ///
    /// `timeout` bounds each attempt of each batch. Cancellation stops
    /// dispatching and retrying; batches already on a worker run to
    /// completion and their replies are dropped.
    pub async fn embed(
        &self,
        texts: Vec<String>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> EmbedOutcome {
        if texts.is_empty() {
            return EmbedOutcome::Success(Vec::new());
        }
        if cancel.is_cancelled() {
            return EmbedOutcome::Failure(PoolError::Cancelled);
        }
        if self.inner.shutdown.is_cancelled() {
            return EmbedOutcome::Failure(PoolError::Unavailable(
                "worker pool stopped".to_string(),
            ));
        }
        if self.live_workers() == 0 {
            return EmbedOutcome::Failure(PoolError::Unavailable(
                "no live workers".to_string(),
            ));
        }

        let total = texts.len();
        let size = self.inner.sizer.size_from(self.inner.probe.as_ref());
        let mut remaining = texts.into_iter();
        let mut handles = Vec::new();
        let mut start = 0;

        while start < total {
            let chunk: Vec<String> = remaining.by_ref().take(size).collect();
            let batch = Batch {
                id: BatchId(self.inner.next_batch.fetch_add(1, Ordering::Relaxed)),
                start,
                texts: chunk,
            };
            start += batch.texts.len();

            let id = batch.id;
            let batch_start = batch.start;
            let len = batch.texts.len();
            let inner = self.inner.clone();
            let cancel = cancel.clone();
            let handle = tokio::spawn(async move { run_batch(inner, batch, timeout, cancel).await });
            handles.push((id, batch_start, len, handle));
        }

        let batch_count = handles.len();
        debug!(
            "Dispatched {} texts as {} batches of up to {}",
            total, batch_count, size
        );

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; total];
        let mut failed_batches = Vec::new();
        let mut last_error = None;
        let mut cancelled = false;

        for (id, batch_start, len, handle) in handles {
            let result = handle.await.unwrap_or_else(|e| {
                Err(PoolError::Worker(format!("batch task failed: {}", e)))
            });

            match result {
                Ok(batch_vectors) => {
                    for (offset, vector) in batch_vectors.into_iter().enumerate() {
                        vectors[batch_start + offset] = Some(vector);
                    }
                }
                Err(PoolError::Cancelled) => cancelled = true,
                Err(e) => {
                    warn!("{} ({} texts) failed: {}", id, len, e);
                    failed_batches.push(id);
                    last_error = Some(e);
                }
            }
        }

        if cancelled || cancel.is_cancelled() {
            return EmbedOutcome::Failure(PoolError::Cancelled);
        }

        if failed_batches.is_empty() {
            return match vectors.into_iter().collect::<Option<Vec<_>>>() {
                Some(vectors) => EmbedOutcome::Success(vectors),
                None => EmbedOutcome::Failure(PoolError::Worker(
                    "batches completed without vectors".to_string(),
                )),
            };
        }

        if failed_batches.len() == batch_count {
            return EmbedOutcome::Failure(PoolError::AllBatchesFailed {
                batches: batch_count,
                last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
            });
        }

        failed_batches.sort_unstable();
        EmbedOutcome::PartialSuccess {
            vectors,
            failed_batches,
        }
    }

    /// Ask every worker to finish and wait for them to exit
    pub async fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        info!("Stopping worker pool");

        for (id, tx) in self.inner.requests.iter().enumerate() {
            if self.inner.shared.slots[id].status() == WorkerStatus::Dead {
                continue;
            }
            if tokio::time::timeout(STOP_GRACE, tx.send(WorkerRequest::Shutdown))
                .await
                .is_err()
            {
                warn!("Worker {} did not accept shutdown in time", id);
            }
        }

        let supervisors = std::mem::take(&mut *self.inner.supervisors.lock().await);
        for handle in supervisors {
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                warn!("Worker did not exit within {:?}", STOP_GRACE);
            }
        }

        self.inner.shutdown.cancel();
        self.inner.permits.close();
        if let Some(router) = self.inner.router_task.lock().await.take() {
            let _ = router.await;
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Least-loaded live worker, scanning round-robin from the cursor
    fn pick_worker(&self) -> Option<usize> {
        let n = self.requests.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        let mut best: Option<(usize, usize)> = None;

        for offset in 0..n {
            let idx = (start + offset) % n;
            let slot = &self.shared.slots[idx];
            if !slot.status().is_live() {
                continue;
            }
            let load = slot.in_flight();
            if best.map_or(true, |(_, best_load)| load < best_load) {
                best = Some((idx, load));
            }
        }

        best.map(|(idx, _)| idx)
    }

    /// One attempt of one batch on one worker
    async fn attempt(
        &self,
        batch: &Batch,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, PoolError> {
        let worker = self
            .pick_worker()
            .ok_or_else(|| PoolError::Unavailable("no live workers".to_string()))?;

        // Reserving the queue slot first keeps registration and send together
        let queue_slot = tokio::select! {
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            reserved = tokio::time::timeout(timeout, self.requests[worker].reserve()) => match reserved {
                Err(_) => return Err(PoolError::Timeout(timeout)),
                Ok(Err(_)) => {
                    return Err(PoolError::WorkerCrashed(format!("worker {} is gone", worker)))
                }
                Ok(Ok(slot)) => slot,
            },
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.router
            .send(RouterEvent::Register {
                batch_id: batch.id,
                worker,
                reply: reply_tx,
            })
            .map_err(|_| PoolError::Unavailable("worker pool stopped".to_string()))?;
        self.shared.slots[worker].begin();
        queue_slot.send(WorkerRequest::Embed {
            texts: batch.texts.clone(),
            batch_id: batch.id,
        });

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = self.router.send(RouterEvent::Forget(batch.id));
                Err(PoolError::Cancelled)
            }
            reply = tokio::time::timeout(timeout, reply_rx) => match reply {
                Err(_) => {
                    let _ = self.router.send(RouterEvent::Forget(batch.id));
                    Err(PoolError::Timeout(timeout))
                }
                Ok(Err(_)) => Err(PoolError::WorkerCrashed(format!(
                    "worker {} dropped {}",
                    worker, batch.id
                ))),
                Ok(Ok(result)) => result,
            },
        }
    }
}

/// Run one batch to completion: permit, attempts, backoff
async fn run_batch(
    inner: Arc<Inner>,
    batch: Batch,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<Vec<Vec<f32>>, PoolError> {
    let _permit = tokio::select! {
        _ = cancel.cancelled() => return Err(PoolError::Cancelled),
        permit = inner.permits.clone().acquire_owned() => permit
            .map_err(|_| PoolError::Unavailable("worker pool stopped".to_string()))?,
    };

    let attempts = inner.retry.attempts();
    let mut last_error = PoolError::Unavailable("no attempt made".to_string());

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = inner.retry.delay_for(attempt);
            debug!(
                "Retrying {} in {:?} (attempt {}/{})",
                batch.id,
                delay,
                attempt + 1,
                attempts
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match inner.attempt(&batch, timeout, &cancel).await {
            Ok(vectors) if vectors.len() == batch.texts.len() => return Ok(vectors),
            Ok(vectors) => {
                last_error = PoolError::Worker(format!(
                    "{} returned {} vectors for {} texts",
                    batch.id,
                    vectors.len(),
                    batch.texts.len()
                ));
            }
            Err(PoolError::Cancelled) => return Err(PoolError::Cancelled),
            Err(e @ PoolError::Unavailable(_)) => return Err(e),
            Err(e @ PoolError::Rejected(_)) => return Err(e),
            Err(e) => {
                debug!("{} attempt {} failed: {}", batch.id, attempt + 1, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Periodically probe live workers; full queues are skipped, not waited on
async fn health_probe(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for (id, tx) in inner.requests.iter().enumerate() {
                    if !inner.shared.slots[id].status().is_live() {
                        continue;
                    }
                    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(WorkerRequest::Health) {
                        debug!("Worker {} queue full, skipping health probe", id);
                    }
                }
            }
        }
    }
}
