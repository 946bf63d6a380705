//! First-writer-wins coordination keyed by a caller-supplied token.
//!
//! Exclusivity comes from the unique index on the key, never from an
//! in-process lock, so concurrent requests on different processes still
//! observe each other.

mod error;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::catalog::models::IdempotencyKey;
use crate::catalog::{CatalogStore, CatalogTx};
use crate::config::IdempotencyConfig;
use crate::dedup::sha256_hex;
use crate::models::RequestContext;

pub use error::{Error, Result};

/// SHA-256 over the canonical JSON form of a request body.
pub fn request_hash<T: Serialize + ?Sized>(body: &T) -> Result<String> {
    let bytes = serde_json::to_vec(body)?;
    Ok(sha256_hex(&bytes))
}

/// Outcome of [`IdempotencyCoordinator::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// The token already produced this event. Do not redo the work.
    AlreadyCompleted(String),
    /// The caller owns the token until it completes or abandons the claim.
    ProceedExclusive(Claim),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub key: String,
    pub request_hash: String,
}

#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn CatalogStore>,
    cfg: IdempotencyConfig,
}

enum ClaimAttempt {
    Done(Begin),
    Wait,
    Retry,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn CatalogStore>, cfg: IdempotencyConfig) -> Self {
        Self { store, cfg }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.cfg
    }

    /// Look the token up, claiming it when absent or expired.
    ///
    /// While another request holds the token this polls until it completes
    /// (returning its event) or `in_flight_max_wait` elapses.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    pub async fn begin(
        &self,
        ctx: &RequestContext,
        key: &str,
        request_hash: &str,
    ) -> Result<Begin> {
        let started = tokio::time::Instant::now();
        loop {
            match self.try_claim(ctx, key, request_hash).await? {
                ClaimAttempt::Done(begin) => return Ok(begin),
                ClaimAttempt::Retry => continue,
                ClaimAttempt::Wait => {
                    if started.elapsed() >= self.cfg.in_flight_max_wait || ctx.is_expired() {
                        tracing::info!(key = %key, "idempotency key still in flight");
                        return Err(Error::InFlight {
                            key: key.to_string(),
                        });
                    }
                    let pause = match ctx.remaining() {
                        Some(left) => self.cfg.in_flight_poll.min(left),
                        None => self.cfg.in_flight_poll,
                    };
                    tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    async fn try_claim(&self, ctx: &RequestContext, key: &str, request_hash: &str) -> Result<ClaimAttempt> {
        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let existing = ctx.bound(tx.get_idempotency_key(key)).await?;

        match existing {
            Some(row) if !row.is_expired(now) => {
                tx.rollback().await?;
                if row.request_hash != request_hash {
                    return Err(Error::PayloadMismatch {
                        key: key.to_string(),
                    });
                }
                Ok(match row.event_id {
                    Some(event_id) => ClaimAttempt::Done(Begin::AlreadyCompleted(event_id)),
                    None => ClaimAttempt::Wait,
                })
            }
            expired => {
                if expired.is_some() {
                    tracing::debug!(key = %key, "replacing expired idempotency key");
                    ctx.bound(tx.delete_idempotency_key(key)).await?;
                }
                let ttl = chrono::Duration::from_std(self.cfg.ttl)
                    .unwrap_or_else(|_| chrono::Duration::hours(24));
                let row = IdempotencyKey::new(key, request_hash, now, ttl);
                match ctx.bound(tx.insert_idempotency_key(&row)).await {
                    Ok(()) => {}
                    // A concurrent request claimed it between our read and write.
                    Err(e) if e.is_conflict() => return Ok(ClaimAttempt::Retry),
                    Err(e) => return Err(e.into()),
                }
                match ctx.bound(tx.commit()).await {
                    Ok(()) => Ok(ClaimAttempt::Done(Begin::ProceedExclusive(Claim {
                        key: key.to_string(),
                        request_hash: request_hash.to_string(),
                    }))),
                    Err(e) if e.is_conflict() => Ok(ClaimAttempt::Retry),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Record the produced event inside the caller's write transaction, so
    /// the key and the event commit together.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %claim.key, event_id = %event_id))]
    pub async fn complete_in(
        &self,
        tx: &mut dyn CatalogTx,
        claim: &Claim,
        event_id: &str,
    ) -> Result<()> {
        tx.complete_idempotency_key(&claim.key, event_id).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %claim.key, event_id = %event_id))]
    pub async fn complete(&self, ctx: &RequestContext, claim: &Claim, event_id: &str) -> Result<()> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        ctx.bound(tx.complete_idempotency_key(&claim.key, event_id))
            .await?;
        ctx.bound(tx.commit()).await?;
        Ok(())
    }

    /// Release a claim whose work failed so a retry can run again. Keys that
    /// were completed or re-claimed with another payload are left alone.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %claim.key))]
    pub async fn abandon(&self, ctx: &RequestContext, claim: &Claim) -> Result<()> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        let row = ctx.bound(tx.get_idempotency_key(&claim.key)).await?;
        let releasable = row
            .is_some_and(|r| r.event_id.is_none() && r.request_hash == claim.request_hash);
        if !releasable {
            tx.rollback().await?;
            return Ok(());
        }
        ctx.bound(tx.delete_idempotency_key(&claim.key)).await?;
        ctx.bound(tx.commit()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;

    fn coordinator(store: &MemoryCatalog) -> IdempotencyCoordinator {
        IdempotencyCoordinator::new(
            Arc::new(store.clone()),
            IdempotencyConfig {
                in_flight_poll: Duration::from_millis(5),
                in_flight_max_wait: Duration::from_millis(40),
                ..IdempotencyConfig::default()
            },
        )
    }

    fn ctx() -> RequestContext {
        RequestContext::system("test")
    }

    #[test]
    fn request_hash_is_stable_for_equal_json() {
        let a = serde_json::json!({"b": 1, "a": [1, 2]});
        let b = serde_json::json!({"a": [1, 2], "b": 1});
        assert_eq!(request_hash(&a).unwrap(), request_hash(&b).unwrap());
    }

    #[tokio::test]
    async fn completed_key_short_circuits() {
        let store = MemoryCatalog::new();
        let c = coordinator(&store);
        let Begin::ProceedExclusive(claim) = c.begin(&ctx(), "k1", "h").await.unwrap() else {
            panic!("expected a fresh claim");
        };
        c.complete(&ctx(), &claim, "E1").await.unwrap();
        assert_eq!(
            c.begin(&ctx(), "k1", "h").await.unwrap(),
            Begin::AlreadyCompleted("E1".into())
        );
    }

    #[tokio::test]
    async fn different_payload_is_rejected() {
        let store = MemoryCatalog::new();
        let c = coordinator(&store);
        c.begin(&ctx(), "k1", "h1").await.unwrap();
        let err = c.begin(&ctx(), "k1", "h2").await.unwrap_err();
        assert!(matches!(err, Error::PayloadMismatch { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn in_flight_key_times_out() {
        let store = MemoryCatalog::new();
        let c = coordinator(&store);
        c.begin(&ctx(), "k1", "h").await.unwrap();
        let err = c.begin(&ctx(), "k1", "h").await.unwrap_err();
        assert!(matches!(err, Error::InFlight { .. }));
    }

    #[tokio::test]
    async fn waiter_sees_result_of_in_flight_request() {
        let store = MemoryCatalog::new();
        let c = coordinator(&store);
        let Begin::ProceedExclusive(claim) = c.begin(&ctx(), "k1", "h").await.unwrap() else {
            panic!("expected a fresh claim");
        };
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.begin(&ctx(), "k1", "h").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        c.complete(&ctx(), &claim, "E9").await.unwrap();
        assert_eq!(
            waiter.await.unwrap().unwrap(),
            Begin::AlreadyCompleted("E9".into())
        );
    }

    #[tokio::test]
    async fn abandoned_claim_can_be_retaken() {
        let store = MemoryCatalog::new();
        let c = coordinator(&store);
        let Begin::ProceedExclusive(claim) = c.begin(&ctx(), "k1", "h").await.unwrap() else {
            panic!("expected a fresh claim");
        };
        c.abandon(&ctx(), &claim).await.unwrap();
        assert!(matches!(
            c.begin(&ctx(), "k1", "h").await.unwrap(),
            Begin::ProceedExclusive(_)
        ));
    }

    #[tokio::test]
    async fn expired_key_is_replaced() {
        let store = MemoryCatalog::new();
        let past = Utc::now() - chrono::Duration::days(2);
        let mut tx = store.begin().await.unwrap();
        tx.insert_idempotency_key(&IdempotencyKey {
            event_id: Some("OLD".into()),
            ..IdempotencyKey::new("k1", "other", past, chrono::Duration::hours(24))
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let c = coordinator(&store);
        assert!(matches!(
            c.begin(&ctx(), "k1", "h").await.unwrap(),
            Begin::ProceedExclusive(_)
        ));
    }
}
