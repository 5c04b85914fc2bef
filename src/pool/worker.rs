// Worker task and its supervisor
//
// Each worker owns a provider handle and answers requests one at a time,
// running inference on the blocking thread pool. The supervisor awaits the
// worker task and reports any exit that was not a requested shutdown.

use super::batching::MemoryProbe;
use super::protocol::{BatchOutcome, WorkerReply, WorkerRequest};
use super::router::RouterEvent;
use crate::embedding::{EmbeddingError, EmbeddingProvider};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Text embedded once at start-up so the first real batch does not pay for model loading
const WARM_UP_TEXT: &str = "warm-up";

pub(super) struct WorkerContext {
    pub id: usize,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub probe: Arc<dyn MemoryProbe>,
    pub replies: mpsc::UnboundedSender<RouterEvent>,
}

impl WorkerContext {
    /// Forward a reply to the router; false once the router is gone
    fn reply(&self, message: WorkerReply) -> bool {
        self.replies
            .send(RouterEvent::Reply {
                worker: self.id,
                message,
            })
            .is_ok()
    }
}

enum WorkerExit {
    /// Asked to stop, or the pool went away
    Stopped,
    /// Anything else
    Failed(String),
}

/// Spawn a worker plus its supervisor; the returned handle is the supervisor's
pub(super) fn spawn(ctx: WorkerContext, requests: mpsc::Receiver<WorkerRequest>) -> JoinHandle<()> {
    let id = ctx.id;
    let replies = ctx.replies.clone();
    let worker = tokio::spawn(run(ctx, requests));

    tokio::spawn(async move {
        let reason = match worker.await {
            Ok(WorkerExit::Stopped) => {
                debug!("Worker {} exited", id);
                return;
            }
            Ok(WorkerExit::Failed(reason)) => reason,
            Err(e) if e.is_panic() => "worker task panicked".to_string(),
            Err(e) => format!("worker task aborted: {}", e),
        };

        let _ = replies.send(RouterEvent::Reply {
            worker: id,
            message: WorkerReply::Terminated { reason },
        });
    })
}

async fn run(ctx: WorkerContext, mut requests: mpsc::Receiver<WorkerRequest>) -> WorkerExit {
    let provider = ctx.provider.clone();
    match tokio::task::spawn_blocking(move || provider.embed(WARM_UP_TEXT)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return WorkerExit::Failed(format!("warm-up failed: {}", e)),
        Err(e) => return WorkerExit::Failed(format!("warm-up panicked: {}", e)),
    }

    if !ctx.reply(WorkerReply::Ready) {
        return WorkerExit::Stopped;
    }

    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Embed { texts, batch_id } => {
                debug!("Worker {} embedding {} ({} texts)", ctx.id, batch_id, texts.len());

                let provider = ctx.provider.clone();
                let outcome =
                    match tokio::task::spawn_blocking(move || provider.embed_batch(&texts)).await {
                        Ok(Ok(vectors)) => BatchOutcome::Vectors(vectors),
                        Ok(Err(e @ EmbeddingError::InvalidInput(_))) => {
                            debug!("Worker {} rejected {}: {}", ctx.id, batch_id, e);
                            BatchOutcome::Rejected(e.to_string())
                        }
                        Ok(Err(e)) => {
                            debug!("Worker {} failed {}: {}", ctx.id, batch_id, e);
                            BatchOutcome::Error(e.to_string())
                        }
                        Err(e) => {
                            return WorkerExit::Failed(format!(
                                "inference panicked on {}: {}",
                                batch_id, e
                            ))
                        }
                    };

                if !ctx.reply(WorkerReply::Result { batch_id, outcome }) {
                    return WorkerExit::Stopped;
                }
            }

            WorkerRequest::Health => {
                let memory_usage = ctx.probe.used_bytes();
                if !ctx.reply(WorkerReply::HealthResponse {
                    status: "ok".to_string(),
                    memory_usage,
                }) {
                    return WorkerExit::Stopped;
                }
            }

            WorkerRequest::Shutdown => {
                ctx.reply(WorkerReply::ShutdownAck);
                return WorkerExit::Stopped;
            }
        }
    }

    WorkerExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedProvider;
    use crate::pool::batching::FixedProbe;
    use crate::pool::protocol::BatchId;

    fn context(
        provider: Arc<dyn EmbeddingProvider>,
    ) -> (WorkerContext, mpsc::UnboundedReceiver<RouterEvent>) {
        let (replies, events) = mpsc::unbounded_channel();
        (
            WorkerContext {
                id: 0,
                provider,
                probe: Arc::new(FixedProbe(None)),
                replies,
            },
            events,
        )
    }

    async fn next_reply(events: &mut mpsc::UnboundedReceiver<RouterEvent>) -> WorkerReply {
        match events.recv().await {
            Some(RouterEvent::Reply { message, .. }) => message,
            _ => panic!("expected a worker reply"),
        }
    }

    #[tokio::test]
    async fn test_worker_lifecycle() {
        let (ctx, mut events) = context(Arc::new(HashEmbedProvider::new(8)));
        let (tx, rx) = mpsc::channel(4);
        let supervisor = spawn(ctx, rx);

        assert!(matches!(next_reply(&mut events).await, WorkerReply::Ready));

        tx.send(WorkerRequest::Embed {
            texts: vec!["a".to_string(), "b".to_string()],
            batch_id: BatchId(1),
        })
        .await
        .unwrap();
        match next_reply(&mut events).await {
            WorkerReply::Result {
                batch_id,
                outcome: BatchOutcome::Vectors(vectors),
            } => {
                assert_eq!(batch_id, BatchId(1));
                assert_eq!(vectors.len(), 2);
                assert_eq!(vectors[0].len(), 8);
            }
            other => panic!("unexpected reply: {:?}", other),
        }

        tx.send(WorkerRequest::Health).await.unwrap();
        assert!(matches!(
            next_reply(&mut events).await,
            WorkerReply::HealthResponse { .. }
        ));

        tx.send(WorkerRequest::Shutdown).await.unwrap();
        assert!(matches!(
            next_reply(&mut events).await,
            WorkerReply::ShutdownAck
        ));

        supervisor.await.unwrap();
    }

    struct PanickingProvider;

    impl EmbeddingProvider for PanickingProvider {
        fn embed(&self, _text: &str) -> Result<Vec<f32>, crate::embedding::EmbeddingError> {
            Ok(vec![0.0])
        }
        fn embed_batch(
            &self,
            _texts: &[String],
        ) -> Result<Vec<Vec<f32>>, crate::embedding::EmbeddingError> {
            panic!("inference blew up");
        }
        fn dimension(&self) -> usize {
            1
        }
        fn model_name(&self) -> &str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_supervisor_reports_crash() {
        let (ctx, mut events) = context(Arc::new(PanickingProvider));
        let (tx, rx) = mpsc::channel(4);
        let supervisor = spawn(ctx, rx);

        assert!(matches!(next_reply(&mut events).await, WorkerReply::Ready));
        tx.send(WorkerRequest::Embed {
            texts: vec!["x".to_string()],
            batch_id: BatchId(5),
        })
        .await
        .unwrap();

        match next_reply(&mut events).await {
            WorkerReply::Terminated { reason } => assert!(reason.contains("batch-5")),
            other => panic!("unexpected reply: {:?}", other),
        }
        supervisor.await.unwrap();
    }
}
