//! Connection supervisor and the caller-facing client.
//!
//! A [`Client`] owns the single store connection and the endpoint list.
//! [`Client::open`] dials once and never fails: the outcome is observed
//! through [`Client::state`], [`Client::ready`] and [`Client::err`].
//! Operations clone the current connection handle per call, so a concurrent
//! [`Client::reopen`] never disturbs calls already in flight.
//!
//! The operation surface lives in the submodules:
//! - [`kv`]: dispatch of GET / PUT / DELETE, transactions, compaction, paging
//! - [`lease`]: grant, renew, revoke, time-to-live
//! - [`watch`]: watch subscriptions with per-action aggregation

pub mod kv;
pub mod lease;
pub mod watch;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ConfigError};
use crate::store::grpc::GrpcConnector;
use crate::store::{Connector, KvStore, Member, StoreError, StoreResult};

pub use watch::split_batch;

/// Error type returned by watch callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum ClientError {
    /// Rejected before reaching the store.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Error returned by a watch callback, passed through unchanged.
    #[error("{0}")]
    Callback(BoxError),

    #[error("watch stream closed unexpectedly")]
    WatchClosed,

    #[error("client is not connected")]
    NotConnected,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Failed,
    Closed,
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    endpoints: RwLock<Vec<String>>,
    conn: RwLock<Option<Arc<dyn KvStore>>>,
    state: Mutex<ConnectionState>,
    ready: Mutex<Option<oneshot::Receiver<()>>>,
    pending_error: Mutex<Option<StoreError>>,
    shutdown: CancellationToken,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to a supervised store connection. Cheap to clone; all clones
/// share the connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

impl Client {
    /// Dials the configured endpoints through `connector`.
    pub async fn open(config: ClientConfig, connector: Arc<dyn Connector>) -> Client {
        let client = Client {
            inner: Arc::new(Inner {
                endpoints: RwLock::new(config.endpoints.clone()),
                config,
                connector,
                conn: RwLock::new(None),
                state: Mutex::new(ConnectionState::Connecting),
                ready: Mutex::new(None),
                pending_error: Mutex::new(None),
                shutdown: CancellationToken::new(),
                sync_task: Mutex::new(None),
            }),
        };

        match client.dial().await {
            Ok(conn) => client.mark_ready(conn),
            Err(e) => {
                warn!(error = %e, endpoints = ?client.endpoints(), "initial connection failed");
                client.mark_failed(e);
            }
        }

        if let Some(period) = client.inner.config.auto_sync_interval() {
            client.spawn_member_sync(period);
        }
        client
    }

    /// Dials an etcd cluster over gRPC.
    pub async fn connect(config: ClientConfig) -> Client {
        Self::open(config, Arc::new(GrpcConnector)).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Readiness signal. Resolves immediately once the client is Ready.
    /// Consumable once per successful connection.
    pub fn ready(&self) -> Option<oneshot::Receiver<()>> {
        self.inner.ready.lock().take()
    }

    /// Takes the error of the last failed connection attempt.
    pub fn err(&self) -> Option<ClientError> {
        self.inner
            .pending_error
            .lock()
            .take()
            .map(ClientError::Store)
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.inner.endpoints.read().clone()
    }

    /// Replaces the endpoint list used by the next dial.
    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        debug!(?endpoints, "endpoints replaced");
        *self.inner.endpoints.write() = endpoints;
    }

    /// Dials the current endpoint list again. On success the new connection
    /// replaces the old one; on failure the old one is dropped and the
    /// client moves to Failed.
    pub async fn reopen(&self) -> ClientResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::NotConnected);
        }
        *self.inner.state.lock() = ConnectionState::Connecting;

        let dialed = self.dial().await;
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::NotConnected);
        }
        match dialed {
            Ok(conn) => {
                self.mark_ready(conn);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, endpoints = ?self.endpoints(), "reconnect failed");
                self.mark_failed(e.clone());
                Err(e.into())
            }
        }
    }

    pub async fn member_list(&self) -> ClientResult<Vec<Member>> {
        let store = self.connection()?;
        self.timed(store.member_list()).await
    }

    /// Refreshes the endpoint list from the client URLs of the cluster's
    /// started, voting members. Failures leave the connection state alone.
    pub async fn sync_members(&self) -> ClientResult<Vec<String>> {
        let members = match self.member_list().await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "member sync failed");
                return Err(e);
            }
        };

        let mut endpoints: Vec<String> = Vec::new();
        for member in members
            .iter()
            .filter(|m| !m.name.is_empty() && !m.is_learner)
        {
            for url in &member.client_urls {
                if !endpoints.contains(url) {
                    endpoints.push(url.clone());
                }
            }
        }
        if endpoints.is_empty() {
            debug!("member list carried no client URLs, keeping endpoints");
            return Ok(self.endpoints());
        }

        debug!(?endpoints, "endpoints refreshed from member list");
        *self.inner.endpoints.write() = endpoints.clone();
        Ok(endpoints)
    }

    /// Stops background work and drops the connection. Later operations
    /// fail with [`ClientError::NotConnected`].
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        if let Some(task) = self.inner.sync_task.lock().take() {
            task.abort();
        }
        *self.inner.conn.write() = None;
        *self.inner.ready.lock() = None;
        *self.inner.state.lock() = ConnectionState::Closed;
        info!("client closed");
    }

    /// Current connection handle.
    pub(crate) fn connection(&self) -> ClientResult<Arc<dyn KvStore>> {
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::NotConnected);
        }
        self.inner
            .conn
            .read()
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Runs one remote call under the request timeout.
    pub(crate) async fn timed<T, F>(&self, call: F) -> ClientResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout = self.inner.config.request_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(timeout).into()),
        }
    }

    async fn dial(&self) -> StoreResult<Arc<dyn KvStore>> {
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return Err(StoreError::InvalidArgument("no endpoints configured".into()));
        }
        let timeout = self.inner.config.dial_timeout();
        debug!(?endpoints, ?timeout, "dialing");
        tokio::time::timeout(timeout, self.inner.connector.connect(&endpoints, timeout))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }

    fn mark_ready(&self, conn: Arc<dyn KvStore>) {
        *self.inner.conn.write() = Some(conn);
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        *self.inner.ready.lock() = Some(rx);
        *self.inner.pending_error.lock() = None;
        *self.inner.state.lock() = ConnectionState::Ready;
        info!(endpoints = ?self.endpoints(), "client ready");
    }

    fn mark_failed(&self, err: StoreError) {
        *self.inner.conn.write() = None;
        *self.inner.ready.lock() = None;
        *self.inner.pending_error.lock() = Some(err);
        *self.inner.state.lock() = ConnectionState::Failed;
    }

    /// Periodic member sync. The task only holds a weak reference and stops
    /// once the client is closed or dropped.
    fn spawn_member_sync(&self, period: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let client = Client { inner };
                if client.state() == ConnectionState::Ready {
                    // Failures are logged by sync_members.
                    let _ = client.sync_members().await;
                }
            }
            debug!("member sync task stopped");
        });
        *self.inner.sync_task.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedded::{EmbeddedConnector, EmbeddedStore};
    use async_trait::async_trait;

    const ENDPOINT: &str = "http://127.0.0.1:2379";

    async fn open_embedded(endpoints: &[&str]) -> (Arc<EmbeddedStore>, Client) {
        let store = EmbeddedStore::single_node("node1", ENDPOINT).unwrap();
        let config = ClientConfig::with_endpoints(endpoints.iter().copied());
        let client = Client::open(config, Arc::new(EmbeddedConnector::new(store.clone()))).await;
        (store, client)
    }

    /// Never answers a dial.
    struct HangingConnector;

    #[async_trait]
    impl Connector for HangingConnector {
        async fn connect(
            &self,
            _endpoints: &[String],
            _dial_timeout: Duration,
        ) -> StoreResult<Arc<dyn KvStore>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_open_ready() {
        let (_store, client) = open_embedded(&[ENDPOINT]).await;
        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(client.err().is_none());

        let ready = client.ready().expect("readiness signal");
        ready.await.unwrap();
        assert!(client.ready().is_none());
    }

    #[tokio::test]
    async fn test_open_with_bad_endpoint_fails_softly() {
        let (_store, client) = open_embedded(&["x"]).await;
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(client.ready().is_none());
        assert!(matches!(client.err(), Some(ClientError::Store(StoreError::Transport(_)))));
        assert!(client.err().is_none());
        assert!(matches!(client.connection(), Err(ClientError::NotConnected)));
    }

    #[tokio::test]
    async fn test_reopen_switches_state() {
        let (_store, client) = open_embedded(&[ENDPOINT]).await;

        client.set_endpoints(vec!["x".to_string()]);
        assert!(client.reopen().await.is_err());
        assert_eq!(client.state(), ConnectionState::Failed);

        client.set_endpoints(vec![ENDPOINT.to_string()]);
        client.reopen().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Ready);
        assert!(client.ready().is_some());
    }

    #[tokio::test]
    async fn test_sync_members_refreshes_endpoints() {
        let (store, client) = open_embedded(&["127.0.0.1:2379"]).await;
        store
            .members()
            .add_member("node2", Vec::new(), vec!["http://127.0.0.1:22379".into()], false)
            .unwrap();
        store
            .members()
            .add_member("learner", Vec::new(), vec!["http://127.0.0.1:32379".into()], true)
            .unwrap();

        let mut endpoints = client.sync_members().await.unwrap();
        endpoints.sort();
        assert_eq!(endpoints, vec![ENDPOINT.to_string(), "http://127.0.0.1:22379".to_string()]);
        assert_eq!(client.endpoints().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_member_sync() {
        let store = EmbeddedStore::single_node("node1", ENDPOINT).unwrap();
        let config = ClientConfig {
            endpoints: vec!["127.0.0.1:2379".into()],
            auto_sync_interval_ms: 1_000,
            ..Default::default()
        };
        let client = Client::open(config, Arc::new(EmbeddedConnector::new(store))).await;
        assert_eq!(client.endpoints(), vec!["127.0.0.1:2379".to_string()]);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(client.endpoints(), vec![ENDPOINT.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout() {
        let config = ClientConfig {
            dial_timeout_ms: 50,
            ..Default::default()
        };
        let client = Client::open(config, Arc::new(HangingConnector)).await;
        assert_eq!(client.state(), ConnectionState::Failed);
        assert!(matches!(
            client.err(),
            Some(ClientError::Store(StoreError::Timeout(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_later_calls() {
        let (_store, client) = open_embedded(&[ENDPOINT]).await;
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.connection(), Err(ClientError::NotConnected)));
        assert!(matches!(client.reopen().await, Err(ClientError::NotConnected)));
    }
}
