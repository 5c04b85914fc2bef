// Reply routing and per-worker bookkeeping
//
// The router task owns the pending-batch table. Worker status and in-flight
// counts live in atomics so dispatch can read them without a round trip;
// dispatch bumps them when it sends, the router settles them when replies land.

use super::protocol::{BatchId, BatchOutcome, WorkerReply};
use super::PoolError;
use ahash::{HashMap, HashMapExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) type BatchReply = oneshot::Sender<Result<Vec<Vec<f32>>, PoolError>>;

/// Lifecycle state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Starting,
    Ready,
    Busy,
    Dead,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerStatus::Starting,
            1 => WorkerStatus::Ready,
            2 => WorkerStatus::Busy,
            _ => WorkerStatus::Dead,
        }
    }

    /// Whether the worker accepts new batches
    pub fn is_live(self) -> bool {
        matches!(self, WorkerStatus::Ready | WorkerStatus::Busy)
    }
}

#[derive(Debug, Default)]
pub(super) struct WorkerSlot {
    status: AtomicU8,
    in_flight: AtomicUsize,
    memory_usage: AtomicU64,
    completed: AtomicU64,
}

impl WorkerSlot {
    pub(super) fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(super) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(super) fn memory_usage(&self) -> Option<u64> {
        match self.memory_usage.load(Ordering::Relaxed) {
            0 => None,
            bytes => Some(bytes),
        }
    }

    pub(super) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Dispatch side: a batch was handed to this worker
    pub(super) fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _ = self.status.compare_exchange(
            WorkerStatus::Ready as u8,
            WorkerStatus::Busy as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Completion side: the worker answered one batch
    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous <= 1 {
            let _ = self.status.compare_exchange(
                WorkerStatus::Busy as u8,
                WorkerStatus::Ready as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn mark_ready(&self) {
        let _ = self.status.compare_exchange(
            WorkerStatus::Starting as u8,
            WorkerStatus::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn mark_dead(&self) {
        self.status.store(WorkerStatus::Dead as u8, Ordering::Release);
        self.in_flight.store(0, Ordering::Release);
    }
}

/// State shared between dispatch, the router and health reporting
#[derive(Debug)]
pub(super) struct Shared {
    pub(super) slots: Vec<WorkerSlot>,
    /// Signalled on every status transition
    pub(super) changed: Notify,
}

impl Shared {
    pub(super) fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers).map(|_| WorkerSlot::default()).collect(),
            changed: Notify::new(),
        }
    }

    /// (starting, live) worker counts
    pub(super) fn counts(&self) -> (usize, usize) {
        self.slots.iter().fold((0, 0), |(starting, live), slot| {
            match slot.status() {
                WorkerStatus::Starting => (starting + 1, live),
                s if s.is_live() => (starting, live + 1),
                _ => (starting, live),
            }
        })
    }
}

pub(super) enum RouterEvent {
    /// A batch was sent to `worker`; resolve `reply` when it answers
    Register {
        batch_id: BatchId,
        worker: usize,
        reply: BatchReply,
    },
    /// The submitter gave up on a batch; drop its reply when it arrives
    Forget(BatchId),
    /// Message from worker `worker`
    Reply { worker: usize, message: WorkerReply },
}

struct Pending {
    worker: usize,
    reply: BatchReply,
}

/// Router loop; exits on shutdown or once every sender is gone
pub(super) async fn run_router(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<RouterEvent>,
    shutdown: CancellationToken,
) {
    let mut pending: HashMap<BatchId, Pending> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            event = events.recv() => {
                let Some(event) = event else { break };
                handle_event(&shared, &mut pending, event);
            }
        }
    }

    // Settle whatever was already queued, acknowledgements included
    while let Ok(event) = events.try_recv() {
        handle_event(&shared, &mut pending, event);
    }

    for (batch_id, entry) in pending.drain() {
        debug!("Failing {} on pool shutdown", batch_id);
        let _ = entry
            .reply
            .send(Err(PoolError::Unavailable("worker pool stopped".to_string())));
    }
    debug!("Router stopped");
}

fn handle_event(shared: &Shared, pending: &mut HashMap<BatchId, Pending>, event: RouterEvent) {
    match event {
        RouterEvent::Register {
            batch_id,
            worker,
            reply,
        } => {
            pending.insert(batch_id, Pending { worker, reply });
        }

        RouterEvent::Forget(batch_id) => {
            pending.remove(&batch_id);
        }

        RouterEvent::Reply { worker, message } => {
            let Some(slot) = shared.slots.get(worker) else {
                warn!("Reply from unknown worker {}", worker);
                return;
            };

            match message {
                WorkerReply::Ready => {
                    info!("Worker {} ready", worker);
                    slot.mark_ready();
                    shared.changed.notify_waiters();
                }

                WorkerReply::Result { batch_id, outcome } => {
                    slot.finish();
                    let result = match outcome {
                        BatchOutcome::Vectors(vectors) => Ok(vectors),
                        BatchOutcome::Error(message) => Err(PoolError::Worker(message)),
                        BatchOutcome::Rejected(message) => Err(PoolError::Rejected(message)),
                    };

                    match pending.remove(&batch_id) {
                        Some(entry) => {
                            if entry.reply.send(result).is_err() {
                                debug!("Submitter of {} went away", batch_id);
                            }
                        }
                        None => debug!("Dropping reply for abandoned {}", batch_id),
                    }
                }

                WorkerReply::HealthResponse {
                    status,
                    memory_usage,
                } => {
                    debug!(
                        "Worker {} health: {} (memory {:?})",
                        worker, status, memory_usage
                    );
                    slot.memory_usage
                        .store(memory_usage.unwrap_or(0), Ordering::Relaxed);
                }

                WorkerReply::ShutdownAck => {
                    debug!("Worker {} acknowledged shutdown", worker);
                    slot.mark_dead();
                    fail_pending(pending, worker, || {
                        PoolError::Unavailable("worker pool stopped".to_string())
                    });
                    shared.changed.notify_waiters();
                }

                WorkerReply::Terminated { reason } => {
                    warn!("Worker {} terminated: {}", worker, reason);
                    slot.mark_dead();
                    fail_pending(pending, worker, || PoolError::WorkerCrashed(reason.clone()));
                    shared.changed.notify_waiters();
                }
            }
        }
    }
}

fn fail_pending<F: Fn() -> PoolError>(
    pending: &mut HashMap<BatchId, Pending>,
    worker: usize,
    error: F,
) {
    let orphaned: Vec<BatchId> = pending
        .iter()
        .filter(|(_, entry)| entry.worker == worker)
        .map(|(id, _)| *id)
        .collect();

    for batch_id in orphaned {
        if let Some(entry) = pending.remove(&batch_id) {
            let _ = entry.reply.send(Err(error()));
        }
    }
}
