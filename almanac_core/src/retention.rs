//! Garbage collection of expired bookkeeping rows.
//!
//! Rejection memory is kept until `rejection_grace` after the rejected
//! event is over, so a scraper resubmitting an event the moderators already
//! turned down stays blocked while the event is still relevant.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::catalog::{self, CatalogStore};
use crate::config::RetentionConfig;
use crate::models::RequestContext;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub idempotency_keys: u64,
    pub rejected_reviews: u64,
    pub batches: u64,
}

#[derive(Clone)]
pub struct Janitor {
    store: Arc<dyn CatalogStore>,
    cfg: RetentionConfig,
}

pub struct JanitorHandle {
    tasks: Vec<JoinHandle<()>>,
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

impl Janitor {
    pub fn new(store: Arc<dyn CatalogStore>, cfg: RetentionConfig) -> Self {
        Self { store, cfg }
    }

    /// One sweep, in a single transaction.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn purge_expired(
        &self,
        ctx: &RequestContext,
        now: DateTime<Utc>,
    ) -> catalog::Result<PurgeReport> {
        let rejection_cutoff = now
            .checked_sub_signed(to_chrono(self.cfg.rejection_grace))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let batch_cutoff = now
            .checked_sub_signed(to_chrono(self.cfg.batch_result_ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut tx = ctx.bound(self.store.begin()).await?;
        let report = PurgeReport {
            idempotency_keys: ctx.bound(tx.purge_idempotency_keys(now)).await?,
            rejected_reviews: ctx.bound(tx.purge_rejected_reviews(rejection_cutoff)).await?,
            batches: ctx.bound(tx.purge_batches(batch_cutoff)).await?,
        };
        ctx.bound(tx.commit()).await?;
        tracing::info!(
            idempotency_keys = report.idempotency_keys,
            rejected_reviews = report.rejected_reviews,
            batches = report.batches,
            "retention sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `sweep_interval` until the handle is dropped.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn start(self) -> JanitorHandle {
        JanitorHandle {
            tasks: vec![tokio::spawn(self.run_worker())],
        }
    }

    async fn run_worker(self) {
        let mut ticker = tokio::time::interval(self.cfg.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let ctx = RequestContext::system("janitor");
            if let Err(err) = self.purge_expired(&ctx, Utc::now()).await {
                tracing::warn!(error = %err, "retention sweep failed");
            }
        }
    }
}

impl JanitorHandle {
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn shutdown(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        for t in tasks {
            t.abort();
        }
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::catalog::models::{
        BatchItemOutcome, BatchItemResult, BatchState, BatchStatus, IdempotencyKey, ReviewEntry,
        ReviewStatus,
    };
    use crate::catalog::MemoryCatalog;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn rejected(id: &str, event_start: DateTime<Utc>) -> ReviewEntry {
        ReviewEntry {
            id: id.into(),
            event_id: format!("event-{id}"),
            original_payload: serde_json::json!({}),
            normalized_payload: serde_json::json!({}),
            warnings: vec![],
            confidence: 0.5,
            source: None,
            fingerprint: Some(format!("fp-{id}")),
            event_start,
            event_end: None,
            status: ReviewStatus::Rejected,
            reviewed_by: Some("alice".into()),
            reviewed_at: Some(event_start),
            review_notes: None,
            rejection_reason: Some("spam".into()),
            created_at: event_start,
            updated_at: event_start,
        }
    }

    fn completed_batch(id: &str, at: DateTime<Utc>) -> BatchStatus {
        let mut b = BatchStatus::queued(id.into(), 1, at);
        b.record(BatchItemResult {
            index: 0,
            outcome: BatchItemOutcome::Created,
            event_id: Some("e".into()),
            error: None,
        });
        b.state = BatchState::Completed;
        b.completed_at = Some(at);
        b
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let store = MemoryCatalog::new();
        let now = ts("2026-08-01T00:00:00Z");
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_idempotency_key(&IdempotencyKey::new(
                "old",
                "h",
                now - chrono::Duration::days(2),
                chrono::Duration::days(1),
            ))
            .await
            .unwrap();
            tx.insert_idempotency_key(&IdempotencyKey::new("fresh", "h", now, chrono::Duration::days(1)))
                .await
                .unwrap();
            // Over long ago vs. over three days ago (inside the 7 day grace).
            tx.insert_review_entry(&rejected("R1", ts("2026-06-01T19:00:00Z")))
                .await
                .unwrap();
            tx.insert_review_entry(&rejected("R2", ts("2026-07-29T19:00:00Z")))
                .await
                .unwrap();
            tx.put_batch(&completed_batch("B1", now - chrono::Duration::days(30)))
                .await
                .unwrap();
            tx.put_batch(&completed_batch("B2", now - chrono::Duration::hours(1)))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let janitor = Janitor::new(Arc::new(store.clone()), RetentionConfig::default());
        let report = janitor
            .purge_expired(&RequestContext::system("test"), now)
            .await
            .unwrap();
        assert_eq!(
            report,
            PurgeReport {
                idempotency_keys: 1,
                rejected_reviews: 1,
                batches: 1
            }
        );
        assert!(store.get_review_entry("R2").await.unwrap().is_some());
        assert!(store.get_review_entry("R1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn background_sweep_runs_until_dropped() {
        let store = MemoryCatalog::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_idempotency_key(&IdempotencyKey::new(
                "old",
                "h",
                Utc::now() - chrono::Duration::days(2),
                chrono::Duration::days(1),
            ))
            .await
            .unwrap();
            tx.commit().await.unwrap();
        }
        let handle = Janitor::new(
            Arc::new(store.clone()),
            RetentionConfig {
                sweep_interval: Duration::from_millis(10),
                ..RetentionConfig::default()
            },
        )
        .start();

        let mut gone = false;
        for _ in 0..100 {
            let mut tx = store.begin().await.unwrap();
            let key = tx.get_idempotency_key("old").await.unwrap();
            tx.rollback().await.unwrap();
            if key.is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(gone);
        handle.shutdown().await;
    }
}
