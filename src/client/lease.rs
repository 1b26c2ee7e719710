//! Lease operations.

use tracing::debug;

use super::{Client, ClientResult};

impl Client {
    /// Grants a lease and returns its ID. Negative TTLs are sent as 0; the
    /// store raises short TTLs to its minimum.
    pub async fn lease_grant(&self, ttl: i64) -> ClientResult<i64> {
        let store = self.connection()?;
        let grant = self.timed(store.lease_grant(ttl.max(0))).await?;
        debug!(lease_id = grant.id, ttl = grant.ttl, "lease granted");
        Ok(grant.id)
    }

    /// Refreshes a lease once and returns its new TTL.
    pub async fn lease_renew(&self, id: i64) -> ClientResult<i64> {
        let store = self.connection()?;
        self.timed(store.lease_keep_alive(id)).await
    }

    /// Revokes a lease, deleting every key attached to it.
    pub async fn lease_revoke(&self, id: i64) -> ClientResult<()> {
        let store = self.connection()?;
        self.timed(store.lease_revoke(id)).await?;
        debug!(lease_id = id, "lease revoked");
        Ok(())
    }

    /// Returns `(remaining, granted)` TTLs in seconds. `remaining` is -1
    /// once the lease has expired or been revoked.
    pub async fn lease_time_to_live(&self, id: i64) -> ClientResult<(i64, i64)> {
        let store = self.connection()?;
        let ttl = self.timed(store.lease_time_to_live(id)).await?;
        Ok((ttl.ttl, ttl.granted_ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use crate::config::ClientConfig;
    use crate::embedded::{EmbeddedConnector, EmbeddedStore, MAX_LEASE_TTL, MIN_LEASE_TTL};
    use crate::store::StoreError;
    use std::sync::Arc;

    async fn client() -> Client {
        let store = EmbeddedStore::single_node("node1", "http://127.0.0.1:2379").unwrap();
        Client::open(
            ClientConfig::default(),
            Arc::new(EmbeddedConnector::new(store)),
        )
        .await
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let client = client().await;
        let id = client.lease_grant(10).await.unwrap();
        assert_ne!(id, 0);

        assert_eq!(client.lease_renew(id).await.unwrap(), 10);
        let (remaining, granted) = client.lease_time_to_live(id).await.unwrap();
        assert_eq!(granted, 10);
        assert!(remaining > 0 && remaining <= 10);

        client.lease_revoke(id).await.unwrap();
        assert!(matches!(
            client.lease_renew(id).await,
            Err(ClientError::Store(StoreError::LeaseNotFound(_)))
        ));
        assert_eq!(client.lease_time_to_live(id).await.unwrap().0, -1);
    }

    #[tokio::test]
    async fn test_non_positive_ttl_still_grants() {
        let client = client().await;
        let id = client.lease_grant(-5).await.unwrap();
        assert_ne!(id, 0);
        assert_eq!(client.lease_time_to_live(id).await.unwrap().1, MIN_LEASE_TTL);
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_rejected() {
        let client = client().await;
        assert!(matches!(
            client.lease_grant(i64::MAX).await,
            Err(ClientError::Store(StoreError::InvalidArgument(_)))
        ));
        assert!(matches!(
            client.lease_grant(MAX_LEASE_TTL + 1).await,
            Err(ClientError::Store(StoreError::InvalidArgument(_)))
        ));

        let id = client.lease_grant(MAX_LEASE_TTL).await.unwrap();
        assert_eq!(client.lease_time_to_live(id).await.unwrap().1, MAX_LEASE_TTL);
    }
}
