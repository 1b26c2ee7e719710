//! In-process revisioned store.
//!
//! [`EmbeddedStore`] implements [`KvStore`] on top of an in-memory MVCC
//! history, a lease table, a watch hub and a member registry, and serves
//! in-process clients through [`EmbeddedConnector`]. All writes go through a
//! single write lock: a write commits its revision, updates lease attachments
//! and notifies watchers before the lock is released, so watchers observe
//! revisions in commit order.
//!
//! A store built inside a tokio runtime sweeps expired leases in the
//! background every [`LEASE_EXPIRY_PERIOD`], deleting their keys.

pub mod cluster;
pub mod index;
pub mod lease;
pub mod mvcc;
pub mod watch;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{
    Connector, DeleteRequest, DeleteResult, Event, EventType, KvStore, LeaseGrant, LeaseTtl,
    Member, PutRequest, PutResult, RangeReader, RangeRequest, RangeResult, StoreError,
    StoreResult, TxnOp, TxnOpResult, TxnRequest, TxnResult, WatchRequest, WatchStream,
};

pub use cluster::MemberRegistry;
pub use lease::{LeaseTable, MAX_LEASE_TTL, MIN_LEASE_TTL};
pub use mvcc::MvccStore;
pub use watch::{WatchHub, WatchRange};

struct State {
    mvcc: MvccStore,
    leases: LeaseTable,
}

/// Period of the background lease sweep.
pub const LEASE_EXPIRY_PERIOD: Duration = Duration::from_millis(500);

pub struct EmbeddedStore {
    state: RwLock<State>,
    hub: Arc<WatchHub>,
    members: MemberRegistry,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for EmbeddedStore {
    fn drop(&mut self) {
        if let Some(task) = self.expiry_task.get_mut().take() {
            task.abort();
        }
    }
}

fn require_key(key: &[u8]) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

/// Keeps lease attachments in line with committed changes.
fn sync_leases(leases: &mut LeaseTable, events: &[Event]) {
    for event in events {
        let old = event.prev_kv.as_ref().map_or(0, |prev| prev.lease);
        let new = match event.event_type {
            EventType::Put => event.kv.lease,
            EventType::Delete => 0,
        };
        if old != 0 && old != new {
            leases.detach(old, &event.kv.key);
        }
        if new != 0 {
            if let Err(e) = leases.attach(new, &event.kv.key) {
                warn!(lease_id = new, error = %e, "failed to attach key to lease");
            }
        }
    }
}

impl EmbeddedStore {
    /// Creates a store with no members. Dials through
    /// [`EmbeddedConnector`] fail until a member is added.
    ///
    /// Inside a tokio runtime the lease sweep starts right away. Outside
    /// one, call [`Self::start_lease_expiry`] from a runtime later or
    /// [`Self::expire_leases`] by hand.
    pub fn new() -> Arc<Self> {
        let store = Arc::new(Self {
            state: RwLock::new(State {
                mvcc: MvccStore::new(),
                leases: LeaseTable::new(),
            }),
            hub: Arc::new(WatchHub::new()),
            members: MemberRegistry::new(),
            expiry_task: Mutex::new(None),
        });
        if tokio::runtime::Handle::try_current().is_ok() {
            store.start_lease_expiry(LEASE_EXPIRY_PERIOD);
        }
        store
    }

    /// Creates a store with one member serving `client_url`.
    pub fn single_node(name: &str, client_url: &str) -> StoreResult<Arc<Self>> {
        let store = Self::new();
        store
            .members
            .add_member(name, Vec::new(), vec![client_url.to_string()], false)?;
        Ok(store)
    }

    pub fn members(&self) -> &MemberRegistry {
        &self.members
    }

    pub fn current_revision(&self) -> i64 {
        self.state.read().mvcc.current_revision()
    }

    pub fn watcher_count(&self) -> usize {
        self.hub.len()
    }

    fn publish(&self, leases: &mut LeaseTable, committed: Option<(i64, Vec<Event>)>) {
        if let Some((revision, events)) = committed {
            sync_leases(leases, &events);
            self.hub.notify(revision, &events);
        }
    }

    /// Deletes the keys of every lease past its deadline. Returns the
    /// number of leases expired.
    pub fn expire_leases(&self) -> usize {
        let mut state = self.state.write();
        let State { mvcc, leases } = &mut *state;
        let expired = leases.expire(tokio::time::Instant::now());
        if expired.is_empty() {
            return 0;
        }

        let mut txn = mvcc.write();
        for lease in &expired {
            for key in &lease.keys {
                txn.delete_range(&DeleteRequest {
                    key: key.clone(),
                    ..Default::default()
                });
            }
        }
        let committed = txn.commit();
        self.publish(leases, committed);

        info!(leases = expired.len(), "expired leases");
        expired.len()
    }

    /// Runs [`Self::expire_leases`] every `period` until the store is
    /// dropped, replacing any sweep already running. Must be called from
    /// within a tokio runtime.
    pub fn start_lease_expiry(self: &Arc<Self>, period: Duration) {
        let store: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("embedded store dropped, stopping lease expiry");
                    break;
                };
                store.expire_leases();
            }
        });
        if let Some(previous) = self.expiry_task.lock().replace(task) {
            previous.abort();
        }
    }
}

#[async_trait]
impl RangeReader for EmbeddedStore {
    async fn range(&self, req: RangeRequest) -> StoreResult<RangeResult> {
        self.state.read().mvcc.range(&req)
    }
}

#[async_trait]
impl KvStore for EmbeddedStore {
    async fn put(&self, req: PutRequest) -> StoreResult<PutResult> {
        require_key(&req.key)?;
        let mut state = self.state.write();
        let State { mvcc, leases } = &mut *state;
        if req.lease != 0 {
            leases.check(req.lease)?;
        }

        let mut txn = mvcc.write();
        let result = txn.put(&req);
        let committed = txn.commit();
        self.publish(leases, committed);
        Ok(result)
    }

    async fn delete_range(&self, req: DeleteRequest) -> StoreResult<DeleteResult> {
        require_key(&req.key)?;
        let mut state = self.state.write();
        let State { mvcc, leases } = &mut *state;

        let mut txn = mvcc.write();
        let result = txn.delete_range(&req);
        let committed = txn.commit();
        self.publish(leases, committed);
        Ok(result)
    }

    async fn txn(&self, req: TxnRequest) -> StoreResult<TxnResult> {
        let mut state = self.state.write();
        let State { mvcc, leases } = &mut *state;

        let succeeded = req
            .compares
            .iter()
            .all(|cmp| cmp.matches(mvcc.latest(&cmp.key).as_ref()));
        let branch = if succeeded { &req.success } else { &req.failure };

        // Reject the whole branch before anything is written.
        for op in branch {
            match op {
                TxnOp::Range(range) => {
                    require_key(&range.key)?;
                    mvcc.check_revision(range.revision)?;
                }
                TxnOp::Put(put) => {
                    require_key(&put.key)?;
                    if put.lease != 0 {
                        leases.check(put.lease)?;
                    }
                }
                TxnOp::Delete(delete) => require_key(&delete.key)?,
            }
        }

        let mut txn = mvcc.write();
        let responses = branch
            .iter()
            .map(|op| match op {
                TxnOp::Range(range) => TxnOpResult::Range(txn.range(range)),
                TxnOp::Put(put) => TxnOpResult::Put(txn.put(put)),
                TxnOp::Delete(delete) => TxnOpResult::Delete(txn.delete_range(delete)),
            })
            .collect();
        let committed = txn.commit();
        let revision = committed
            .as_ref()
            .map_or(mvcc.current_revision(), |(revision, _)| *revision);
        self.publish(leases, committed);

        debug!(succeeded, revision, "txn applied");
        Ok(TxnResult {
            succeeded,
            revision,
            responses,
        })
    }

    async fn compact(&self, revision: i64) -> StoreResult<()> {
        self.state.write().mvcc.compact(revision).map(|_| ())
    }

    async fn lease_grant(&self, ttl: i64) -> StoreResult<LeaseGrant> {
        let (id, ttl) = self.state.write().leases.grant(ttl)?;
        Ok(LeaseGrant { id, ttl })
    }

    async fn lease_keep_alive(&self, id: i64) -> StoreResult<i64> {
        self.state.write().leases.renew(id)
    }

    async fn lease_revoke(&self, id: i64) -> StoreResult<()> {
        let mut state = self.state.write();
        let State { mvcc, leases } = &mut *state;
        let keys = leases.revoke(id)?;

        let mut txn = mvcc.write();
        for key in keys {
            txn.delete_range(&DeleteRequest {
                key,
                ..Default::default()
            });
        }
        let committed = txn.commit();
        self.publish(leases, committed);
        Ok(())
    }

    async fn lease_time_to_live(&self, id: i64) -> StoreResult<LeaseTtl> {
        match self.state.write().leases.time_to_live(id) {
            Ok((ttl, granted_ttl)) => Ok(LeaseTtl {
                id,
                ttl,
                granted_ttl,
            }),
            Err(StoreError::LeaseNotFound(_)) => Ok(LeaseTtl {
                id,
                ttl: -1,
                granted_ttl: 0,
            }),
            Err(e) => Err(e),
        }
    }

    async fn watch(&self, req: WatchRequest) -> StoreResult<WatchStream> {
        require_key(&req.key)?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Writers notify under the write lock, so holding the read lock
        // while replaying and registering leaves no gap between the two.
        let id = {
            let state = self.state.read();
            let backlog = if req.start_revision > 0
                && req.start_revision <= state.mvcc.current_revision()
            {
                state.mvcc.events_since(req.start_revision)?
            } else {
                Vec::new()
            };
            self.hub.register(
                WatchRange {
                    key: req.key,
                    range_end: req.range_end,
                },
                req.start_revision,
                req.prev_kv,
                backlog,
                tx,
            )
        };

        let hub = Arc::clone(&self.hub);
        Ok(WatchStream::new(rx).on_drop(move || {
            hub.cancel(id);
        }))
    }

    async fn member_list(&self) -> StoreResult<Vec<Member>> {
        Ok(self.members.list_members())
    }
}

/// Hands out an [`EmbeddedStore`] to any endpoint list naming one of its
/// members' client URLs.
#[derive(Clone)]
pub struct EmbeddedConnector {
    store: Arc<EmbeddedStore>,
}

impl EmbeddedConnector {
    pub fn new(store: Arc<EmbeddedStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Connector for EmbeddedConnector {
    async fn connect(
        &self,
        endpoints: &[String],
        _dial_timeout: Duration,
    ) -> StoreResult<Arc<dyn KvStore>> {
        match endpoints
            .iter()
            .find(|endpoint| self.store.members.serves(endpoint))
        {
            Some(endpoint) => {
                debug!(endpoint = %endpoint, "connected to embedded store");
                Ok(Arc::clone(&self.store) as Arc<dyn KvStore>)
            }
            None => Err(StoreError::Transport(format!(
                "no reachable endpoint in {endpoints:?}"
            ))),
        }
    }
}
