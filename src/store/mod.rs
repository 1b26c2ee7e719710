//! Backing store abstraction.
//!
//! The client core talks to a revisioned key-value store through two traits:
//! [`RangeReader`], the narrow read seam the paging engine depends on, and
//! [`KvStore`], the full surface (writes, transactions, compaction, leases,
//! watches and membership). A [`Connector`] turns an endpoint list into a
//! live store handle. Two implementations ship with the crate:
//!
//! - [`grpc`]: the etcd v3 wire protocol over tonic
//! - [`crate::embedded`]: an in-process MVCC store

pub mod grpc;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::op::{CmpOptions, SortOrder};

/// Errors surfaced by a backing store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("required revision {0} has been compacted")]
    Compacted(i64),

    #[error("required revision {0} is a future revision")]
    FutureRevision(i64),

    #[error("requested lease {0} not found")]
    LeaseNotFound(i64),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored key-value pair. Tombstones are never returned by reads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub value: Vec<u8>,
    pub lease: i64,
}

/// Range read. An empty `range_end` reads the single key, `[0]` reads every
/// key at or above `key`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// Maximum rows returned, 0 for no limit.
    pub limit: i64,
    /// Snapshot revision, 0 for the current one.
    pub revision: i64,
    pub sort_order: SortOrder,
    pub keys_only: bool,
    pub count_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResult {
    pub kvs: Vec<KeyValue>,
    /// Number of keys in the range regardless of `limit`.
    pub count: i64,
    pub more: bool,
    /// Store revision at the time the read was served.
    pub revision: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lease: i64,
    pub prev_kv: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutResult {
    pub revision: i64,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub prev_kv: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub revision: i64,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

/// One operation inside a transaction branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    Range(RangeRequest),
    Put(PutRequest),
    Delete(DeleteRequest),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOpResult {
    Range(RangeResult),
    Put(PutResult),
    Delete(DeleteResult),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compares: Vec<CmpOptions>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnResult {
    pub succeeded: bool,
    pub revision: i64,
    pub responses: Vec<TxnOpResult>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
    pub id: i64,
    pub ttl: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTtl {
    pub id: i64,
    /// Remaining seconds, -1 when the lease is gone.
    pub ttl: i64,
    pub granted_ttl: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change. For deletions `kv` holds the tombstone (key and
/// mod revision only).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// First revision delivered, 0 for "changes from now on".
    pub start_revision: i64,
    pub prev_kv: bool,
}

/// Events delivered together by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchBatch {
    pub revision: i64,
    pub events: Vec<Event>,
    pub compact_revision: i64,
    pub canceled: bool,
    pub cancel_reason: String,
}

/// Receiving half of a watch subscription. Dropping it releases the
/// subscription on the store side.
pub struct WatchStream {
    rx: mpsc::UnboundedReceiver<StoreResult<WatchBatch>>,
    on_drop: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchStream {
    pub fn new(rx: mpsc::UnboundedReceiver<StoreResult<WatchBatch>>) -> Self {
        Self { rx, on_drop: None }
    }

    /// Registers a hook run once when the stream is dropped.
    pub fn on_drop(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_drop = Some(Box::new(hook));
        self
    }

    /// Next batch, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<StoreResult<WatchBatch>> {
        self.rx.recv().await
    }
}

impl fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream").finish_non_exhaustive()
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        if let Some(hook) = self.on_drop.take() {
            hook();
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
}

/// Read access to a revisioned key range.
#[async_trait]
pub trait RangeReader: Send + Sync {
    async fn range(&self, req: RangeRequest) -> StoreResult<RangeResult>;
}

/// Full store surface used by the client.
#[async_trait]
pub trait KvStore: RangeReader {
    async fn put(&self, req: PutRequest) -> StoreResult<PutResult>;

    async fn delete_range(&self, req: DeleteRequest) -> StoreResult<DeleteResult>;

    async fn txn(&self, req: TxnRequest) -> StoreResult<TxnResult>;

    /// Discards history below `revision`.
    async fn compact(&self, revision: i64) -> StoreResult<()>;

    async fn lease_grant(&self, ttl: i64) -> StoreResult<LeaseGrant>;

    /// Renews a lease once and returns its TTL.
    async fn lease_keep_alive(&self, id: i64) -> StoreResult<i64>;

    async fn lease_revoke(&self, id: i64) -> StoreResult<()>;

    async fn lease_time_to_live(&self, id: i64) -> StoreResult<LeaseTtl>;

    /// Opens a subscription. The subscription is registered once this
    /// returns, so later writes are guaranteed to be observed.
    async fn watch(&self, req: WatchRequest) -> StoreResult<WatchStream>;

    async fn member_list(&self) -> StoreResult<Vec<Member>>;
}

/// Dials a store from an endpoint list.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> StoreResult<Arc<dyn KvStore>>;
}
