use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use ulid::Ulid;

use super::service::{IngestOptions, IngestResult, IngestService};
use super::{Error, Result};
use crate::candidate::CandidateEvent;
use crate::catalog::models::{BatchItemOutcome, BatchItemResult, BatchState, BatchStatus};
use crate::catalog::CatalogStore;
use crate::config::IngestConfig;
use crate::models::RequestContext;

const TERMINAL_WRITE_ATTEMPTS: u32 = 3;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(50);

struct BatchJob {
    batch_id: String,
    ctx: RequestContext,
    candidates: Vec<CandidateEvent>,
    options: IngestOptions,
}

/// Accepts candidate lists and ingests them on a background worker.
///
/// Progress lives in a persisted [`BatchStatus`] record, so a status query
/// works from any process, not only the one running the worker.
#[derive(Clone)]
pub struct BatchIngestor {
    ingest: IngestService,
    store: Arc<dyn CatalogStore>,
    cfg: IngestConfig,
    jobs_tx: mpsc::Sender<BatchJob>,
}

pub struct BatchIngestorHandle {
    ingestor: BatchIngestor,
    tasks: Vec<JoinHandle<()>>,
}

impl BatchIngestor {
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn start(ingest: IngestService) -> BatchIngestorHandle {
        let cfg = ingest.config().clone();
        let store = ingest.store().clone();
        let (jobs_tx, jobs_rx) = mpsc::channel::<BatchJob>(cfg.batch_queue_capacity.max(1));
        let ingestor = Self {
            ingest,
            store,
            cfg,
            jobs_tx,
        };
        let tasks = vec![tokio::spawn(ingestor.clone().run_worker(jobs_rx))];
        BatchIngestorHandle { ingestor, tasks }
    }

    /// Persist a queued status record and hand the list to the worker.
    /// Returns the batch id without waiting for any item.
    #[tracing::instrument(level = "debug", skip_all, fields(items = candidates.len()))]
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        candidates: Vec<CandidateEvent>,
        options: IngestOptions,
    ) -> Result<String> {
        if candidates.is_empty() {
            return Err(Error::BatchEmpty);
        }
        if candidates.len() > self.cfg.max_batch_size {
            return Err(Error::BatchTooLarge {
                size: candidates.len(),
                max: self.cfg.max_batch_size,
            });
        }

        // Reserve the slot first: a full queue fails fast and leaves no
        // status row behind.
        let permit = self.jobs_tx.try_reserve().map_err(|err| match err {
            mpsc::error::TrySendError::Full(()) => Error::QueueFull,
            mpsc::error::TrySendError::Closed(()) => Error::QueueClosed,
        })?;

        let batch_id = Ulid::new().to_string();
        let status = BatchStatus::queued(batch_id.clone(), candidates.len(), Utc::now());
        self.persist(ctx, &status).await?;

        permit.send(BatchJob {
            batch_id: batch_id.clone(),
            ctx: ctx.child(None),
            candidates,
            options,
        });
        tracing::info!(batch_id = %batch_id, "batch queued");
        Ok(batch_id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(batch_id = %batch_id))]
    pub async fn status(&self, ctx: &RequestContext, batch_id: &str) -> Result<BatchStatus> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        let status = ctx.bound(tx.get_batch(batch_id)).await?;
        tx.rollback().await?;
        status.ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))
    }

    async fn persist(&self, ctx: &RequestContext, status: &BatchStatus) -> Result<()> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        ctx.bound(tx.put_batch(status)).await?;
        ctx.bound(tx.commit()).await?;
        Ok(())
    }

    /// Persist progress; a failed write is logged and the batch goes on.
    async fn checkpoint(&self, ctx: &RequestContext, status: &BatchStatus) {
        if let Err(err) = self.persist(ctx, status).await {
            tracing::warn!(batch_id = %status.id, error = %err, "failed persisting batch progress");
        }
    }

    /// The final write must land or the batch would look stuck, so it is
    /// retried a few times.
    async fn finish(&self, ctx: &RequestContext, status: &BatchStatus) {
        for attempt in 1..=TERMINAL_WRITE_ATTEMPTS {
            match self.persist(ctx, status).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(batch_id = %status.id, attempt, error = %err, "failed persisting final batch state");
                    tokio::time::sleep(TERMINAL_WRITE_BACKOFF * attempt).await;
                }
            }
        }
        tracing::error!(batch_id = %status.id, state = status.state.as_str(), "giving up on final batch state");
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn run_worker(self, mut jobs_rx: mpsc::Receiver<BatchJob>) {
        while let Some(job) = jobs_rx.recv().await {
            let batch_id = job.batch_id.clone();
            let total = job.candidates.len();
            let ctx = job.ctx.clone();
            // A panicking item must not take the worker (and every later
            // batch) down with it.
            let worker = self.clone();
            if let Err(err) = tokio::spawn(async move { worker.process(job).await }).await {
                tracing::error!(batch_id = %batch_id, error = %err, "batch aborted");
                self.fail(&ctx, &batch_id, total, err.to_string()).await;
            }
        }
    }

    async fn fail(&self, ctx: &RequestContext, batch_id: &str, total: usize, reason: String) {
        let mut status = match self.status(ctx, batch_id).await {
            Ok(status) => status,
            Err(_) => BatchStatus::queued(batch_id.to_string(), total, Utc::now()),
        };
        status.state = BatchState::Failed;
        status.completed_at = Some(Utc::now());
        status.error = Some(reason);
        self.finish(ctx, &status).await;
    }

    #[tracing::instrument(level = "debug", skip_all, fields(batch_id = %job.batch_id))]
    async fn process(&self, job: BatchJob) {
        let mut status = match self.status(&job.ctx, &job.batch_id).await {
            Ok(status) => status,
            Err(err) => {
                if !matches!(err, Error::BatchNotFound(_)) {
                    tracing::warn!(batch_id = %job.batch_id, error = %err, "failed loading batch status");
                }
                BatchStatus::queued(job.batch_id.clone(), job.candidates.len(), Utc::now())
            }
        };
        status.state = BatchState::Processing;
        self.checkpoint(&job.ctx, &status).await;

        for (index, candidate) in job.candidates.iter().enumerate() {
            let item_ctx = job.ctx.child(Some(self.cfg.batch_item_timeout));
            let result = self.ingest.ingest(&item_ctx, candidate, job.options).await;
            status.record(item_result(index, result));
            self.checkpoint(&job.ctx, &status).await;
        }

        status.state = BatchState::Completed;
        status.completed_at = Some(Utc::now());
        self.finish(&job.ctx, &status).await;
        tracing::info!(
            batch_id = %status.id,
            created = status.created,
            duplicates = status.duplicates,
            needs_review = status.needs_review,
            failed = status.failed,
            "batch completed"
        );
    }
}

fn item_result(index: usize, result: Result<IngestResult>) -> BatchItemResult {
    match result {
        Ok(res) => {
            let outcome = if res.is_duplicate {
                BatchItemOutcome::Duplicate
            } else if res.needs_review {
                BatchItemOutcome::NeedsReview
            } else {
                BatchItemOutcome::Created
            };
            BatchItemResult {
                index,
                outcome,
                event_id: Some(res.event.id),
                error: None,
            }
        }
        Err(err) => BatchItemResult {
            index,
            outcome: BatchItemOutcome::Failed,
            event_id: None,
            error: Some(err.to_string()),
        },
    }
}

impl BatchIngestorHandle {
    pub fn ingestor(&self) -> &BatchIngestor {
        &self.ingestor
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn shutdown(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for t in tasks {
            t.abort();
        }
    }
}

impl Drop for BatchIngestorHandle {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::{IdempotencyConfig, ValidationConfig};
    use crate::idempotency::IdempotencyCoordinator;

    fn start(store: &MemoryCatalog, max_batch_size: usize) -> BatchIngestorHandle {
        let store: Arc<dyn CatalogStore> = Arc::new(store.clone());
        BatchIngestor::start(IngestService::new(
            store.clone(),
            IdempotencyCoordinator::new(store, IdempotencyConfig::default()),
            ValidationConfig::default(),
            IngestConfig {
                max_batch_size,
                ..IngestConfig::default()
            },
        ))
    }

    fn candidate(name: &str) -> CandidateEvent {
        CandidateEvent {
            name: name.into(),
            description: Some("desc".into()),
            start_date: "2026-07-10T19:00:00Z".into(),
            virtual_location: Some(crate::candidate::VirtualLocationInput {
                url: "https://stream.example/live".into(),
            }),
            ..CandidateEvent::default()
        }
    }

    async fn wait_completed(ingestor: &BatchIngestor, id: &str) -> BatchStatus {
        let ctx = RequestContext::system("test");
        for _ in 0..200 {
            let status = ingestor.status(&ctx, id).await.unwrap();
            if status.state == BatchState::Completed {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("batch {id} did not complete");
    }

    #[tokio::test]
    async fn bounds_are_enforced() {
        let store = MemoryCatalog::new();
        let handle = start(&store, 2);
        let ctx = RequestContext::system("test");
        let empty = handle
            .ingestor()
            .submit(&ctx, vec![], IngestOptions::default())
            .await;
        assert!(matches!(empty, Err(Error::BatchEmpty)));
        let big = handle
            .ingestor()
            .submit(
                &ctx,
                vec![candidate("a"), candidate("b"), candidate("c")],
                IngestOptions::default(),
            )
            .await;
        assert!(matches!(big, Err(Error::BatchTooLarge { size: 3, max: 2 })));
    }

    #[tokio::test]
    async fn item_outcomes_are_aggregated() {
        let store = MemoryCatalog::new();
        let handle = start(&store, 10);
        let ctx = RequestContext::system("test");
        let bad = CandidateEvent {
            start_date: "whenever".into(),
            ..candidate("Broken")
        };
        let id = handle
            .ingestor()
            .submit(
                &ctx,
                vec![candidate("Open Mic"), candidate("Open Mic"), bad],
                IngestOptions::default(),
            )
            .await
            .unwrap();

        let status = wait_completed(handle.ingestor(), &id).await;
        assert_eq!(status.total, 3);
        assert_eq!((status.created, status.duplicates, status.failed), (1, 1, 1));
        assert!(status.completed_at.is_some());
        assert!(status.results[2].error.as_deref().unwrap().contains("startDate"));
        handle.shutdown().await;
    }

    /// An ingestor whose queue nobody drains.
    fn idle(store: &MemoryCatalog, capacity: usize) -> (BatchIngestor, mpsc::Receiver<BatchJob>) {
        let handle = start(store, 10);
        let (jobs_tx, jobs_rx) = mpsc::channel(capacity);
        let ingestor = BatchIngestor {
            jobs_tx,
            ..handle.ingestor().clone()
        };
        (ingestor, jobs_rx)
    }

    #[tokio::test]
    async fn full_queue_rejects_without_leaving_a_record() {
        let store = MemoryCatalog::new();
        let (ingestor, _jobs) = idle(&store, 1);
        let ctx = RequestContext::system("test");

        let first = ingestor
            .submit(&ctx, vec![candidate("Open Mic")], IngestOptions::default())
            .await
            .unwrap();
        let err = ingestor
            .submit(&ctx, vec![candidate("Poetry Slam")], IngestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        assert!(err.is_transient());

        let batches = store.all_batches().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].id, first);
        assert_eq!(batches[0].state, BatchState::Queued);
    }

    #[tokio::test]
    async fn progress_write_failures_do_not_stall_the_batch() {
        let store = MemoryCatalog::new();
        let handle = start(&store, 10);
        // The queued record lands; the processing and first progress writes fail.
        store.fail_batch_writes(1, 2);

        let id = handle
            .ingestor()
            .submit(
                &RequestContext::system("test"),
                vec![candidate("Open Mic"), candidate("Poetry Slam")],
                IngestOptions::default(),
            )
            .await
            .unwrap();

        let status = wait_completed(handle.ingestor(), &id).await;
        assert_eq!(status.results.len(), 2);
        assert_eq!(status.created, 2);
        assert_eq!(store.all_events().await.len(), 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn aborted_batch_is_marked_failed() {
        let store = MemoryCatalog::new();
        let (ingestor, _jobs) = idle(&store, 1);
        let ctx = RequestContext::system("test");
        let id = ingestor
            .submit(&ctx, vec![candidate("Open Mic")], IngestOptions::default())
            .await
            .unwrap();

        ingestor.fail(&ctx, &id, 1, "worker panicked".to_string()).await;

        let status = ingestor.status(&ctx, &id).await.unwrap();
        assert_eq!(status.state, BatchState::Failed);
        assert!(status.state.is_terminal());
        assert!(status.completed_at.is_some());
        assert_eq!(status.error.as_deref(), Some("worker panicked"));
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let store = MemoryCatalog::new();
        let handle = start(&store, 10);
        let err = handle
            .ingestor()
            .status(&RequestContext::system("test"), "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BatchNotFound(_)));
    }
}
