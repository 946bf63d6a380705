use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Error, Result};
use crate::catalog::models::FederationNode;
use crate::catalog::CatalogStore;
use crate::models::RequestContext;

/// Registration input for a peer node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRegistration {
    pub domain: String,
    pub name: String,
    pub base_url: String,
    pub trust_level: i32,
    pub sync_enabled: bool,
}

/// Known peer nodes. Only registered, sync-enabled nodes may push events.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Arc<dyn CatalogStore>,
}

/// Lowercased host (with port, when given) that keys the node table.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Insert or update a node. Re-registering keeps its creation time and
    /// last sync.
    #[tracing::instrument(level = "debug", skip_all, fields(domain = %reg.domain))]
    pub async fn register_node(
        &self,
        ctx: &RequestContext,
        reg: NodeRegistration,
    ) -> Result<FederationNode> {
        let domain = normalize_domain(&reg.domain);
        if domain.is_empty() {
            return Err(Error::InvalidInput("node domain is empty".to_string()));
        }
        let base_url = reg.base_url.trim();
        let parsed = url::Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("invalid base url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(
                "base url must be http or https".to_string(),
            ));
        }

        let now = Utc::now();
        let mut tx = ctx.bound(self.store.begin()).await?;
        let existing = ctx.bound(tx.get_node(&domain)).await?;
        let node = FederationNode {
            name: if reg.name.trim().is_empty() {
                domain.clone()
            } else {
                reg.name.trim().to_string()
            },
            domain,
            base_url: base_url.to_string(),
            trust_level: reg.trust_level,
            sync_enabled: reg.sync_enabled,
            is_online: existing.as_ref().map_or(true, |n| n.is_online),
            last_sync_at: existing.as_ref().and_then(|n| n.last_sync_at),
            created_at: existing.as_ref().map_or(now, |n| n.created_at),
            updated_at: now,
        };
        ctx.bound(tx.upsert_node(&node)).await?;
        ctx.bound(tx.commit()).await?;
        tracing::info!(domain = %node.domain, sync_enabled = node.sync_enabled, "federation node registered");
        Ok(node)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(domain = %domain))]
    pub async fn get_node(&self, ctx: &RequestContext, domain: &str) -> Result<FederationNode> {
        let domain = normalize_domain(domain);
        let mut tx = ctx.bound(self.store.begin()).await?;
        let node = ctx.bound(tx.get_node(&domain)).await?;
        tx.rollback().await?;
        node.ok_or(Error::UnknownNode(domain))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(domain = %domain, enabled))]
    pub async fn set_sync_enabled(
        &self,
        ctx: &RequestContext,
        domain: &str,
        enabled: bool,
    ) -> Result<FederationNode> {
        let domain = normalize_domain(domain);
        let mut tx = ctx.bound(self.store.begin()).await?;
        let Some(mut node) = ctx.bound(tx.get_node(&domain)).await? else {
            return Err(Error::UnknownNode(domain));
        };
        node.sync_enabled = enabled;
        node.updated_at = Utc::now();
        ctx.bound(tx.upsert_node(&node)).await?;
        ctx.bound(tx.commit()).await?;
        Ok(node)
    }

    /// Stamp a successful sync from `domain`.
    pub(crate) async fn record_sync(
        &self,
        ctx: &RequestContext,
        domain: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = ctx.bound(self.store.begin()).await?;
        let Some(mut node) = ctx.bound(tx.get_node(domain)).await? else {
            return Err(Error::UnknownNode(domain.to_string()));
        };
        node.last_sync_at = Some(at);
        node.is_online = true;
        node.updated_at = at;
        ctx.bound(tx.upsert_node(&node)).await?;
        ctx.bound(tx.commit()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;

    fn reg(domain: &str) -> NodeRegistration {
        NodeRegistration {
            domain: domain.into(),
            name: "Peer".into(),
            base_url: format!("https://{domain}"),
            trust_level: 5,
            sync_enabled: true,
        }
    }

    #[tokio::test]
    async fn register_is_an_upsert_keeping_history() {
        let registry = NodeRegistry::new(Arc::new(MemoryCatalog::new()));
        let ctx = RequestContext::system("test");
        let first = registry.register_node(&ctx, reg("Peer.Example")).await.unwrap();
        assert_eq!(first.domain, "peer.example");

        let synced_at = Utc::now();
        registry.record_sync(&ctx, "peer.example", synced_at).await.unwrap();
        let again = registry
            .register_node(
                &ctx,
                NodeRegistration {
                    trust_level: 9,
                    ..reg("peer.example")
                },
            )
            .await
            .unwrap();
        assert_eq!(again.trust_level, 9);
        assert_eq!(again.created_at, first.created_at);
        assert_eq!(again.last_sync_at, Some(synced_at));
    }

    #[tokio::test]
    async fn toggling_sync_on_unknown_node_fails() {
        let registry = NodeRegistry::new(Arc::new(MemoryCatalog::new()));
        let ctx = RequestContext::system("test");
        let err = registry
            .set_sync_enabled(&ctx, "nobody.example", false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownNode(d) if d == "nobody.example"));

        registry.register_node(&ctx, reg("peer.example")).await.unwrap();
        let node = registry
            .set_sync_enabled(&ctx, "peer.example", false)
            .await
            .unwrap();
        assert!(!node.sync_enabled);
        assert!(!registry.get_node(&ctx, "PEER.example").await.unwrap().sync_enabled);
    }

    #[tokio::test]
    async fn rejects_non_http_base_url() {
        let registry = NodeRegistry::new(Arc::new(MemoryCatalog::new()));
        let err = registry
            .register_node(
                &RequestContext::system("test"),
                NodeRegistration {
                    base_url: "ftp://peer.example".into(),
                    ..reg("peer.example")
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
