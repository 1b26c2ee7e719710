//! Revisioned key-value history.
//!
//! Every committed write bumps the store revision. Each change is recorded
//! under its `(main, sub)` revision in an ordered history map; the
//! [`KeyIndex`] resolves "which revision of key K was visible at revision R"
//! so reads can be served at any revision that has not been compacted.
//! Deletions are recorded as tombstones (version 0), which is also what the
//! watch replay turns into DELETE events.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::index::{KeyIndex, Revision};
use crate::op::SortOrder;
use crate::store::{
    DeleteRequest, DeleteResult, Event, EventType, KeyValue, PutRequest, PutResult, RangeRequest,
    RangeResult, StoreError, StoreResult,
};

#[derive(Debug)]
pub struct MvccStore {
    current_revision: i64,
    compact_revision: i64,
    index: KeyIndex,
    history: BTreeMap<Revision, KeyValue>,
}

impl Default for MvccStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MvccStore {
    pub fn new() -> Self {
        Self {
            current_revision: 1,
            compact_revision: 0,
            index: KeyIndex::new(),
            history: BTreeMap::new(),
        }
    }

    pub fn current_revision(&self) -> i64 {
        self.current_revision
    }

    pub fn compact_revision(&self) -> i64 {
        self.compact_revision
    }

    /// Resolves a requested read revision, 0 meaning the current one.
    pub fn check_revision(&self, revision: i64) -> StoreResult<i64> {
        if revision <= 0 {
            return Ok(self.current_revision);
        }
        if revision > self.current_revision {
            return Err(StoreError::FutureRevision(revision));
        }
        if revision < self.compact_revision {
            return Err(StoreError::Compacted(revision));
        }
        Ok(revision)
    }

    /// The live pair for `key`, if any.
    pub fn latest(&self, key: &[u8]) -> Option<KeyValue> {
        self.index
            .get(key, self.current_revision)
            .and_then(|rev| self.history.get(&rev))
            .cloned()
    }

    pub fn range(&self, req: &RangeRequest) -> StoreResult<RangeResult> {
        let at = self.check_revision(req.revision)?;
        Ok(self.range_at(req, at))
    }

    fn keys_in(&self, key: &[u8], range_end: &[u8], at: i64) -> Vec<(Vec<u8>, Revision)> {
        match range_end {
            [] => self
                .index
                .get(key, at)
                .map(|rev| vec![(key.to_vec(), rev)])
                .unwrap_or_default(),
            [0] => self.index.range(key, &[], at),
            end => self.index.range(key, end, at),
        }
    }

    fn range_at(&self, req: &RangeRequest, at: i64) -> RangeResult {
        let found = self.keys_in(&req.key, &req.range_end, at);
        let count = found.len() as i64;
        if req.count_only {
            return RangeResult {
                kvs: Vec::new(),
                count,
                more: count > 0,
                revision: self.current_revision,
            };
        }

        let mut revisions: Vec<Revision> = found.into_iter().map(|(_, rev)| rev).collect();
        if req.sort_order == SortOrder::Descend {
            revisions.reverse();
        }
        if req.limit > 0 {
            revisions.truncate(req.limit as usize);
        }

        let kvs: Vec<KeyValue> = revisions
            .iter()
            .filter_map(|rev| self.history.get(rev))
            .map(|kv| {
                let mut kv = kv.clone();
                if req.keys_only {
                    kv.value.clear();
                }
                kv
            })
            .collect();

        RangeResult {
            more: (kvs.len() as i64) < count,
            kvs,
            count,
            revision: self.current_revision,
        }
    }

    /// Starts a write at the next revision. Nothing becomes visible to
    /// callers outside the transaction until [`WriteTxn::commit`].
    pub fn write(&mut self) -> WriteTxn<'_> {
        let main = self.current_revision + 1;
        WriteTxn {
            store: self,
            main,
            sub: 0,
            events: Vec::new(),
        }
    }

    /// Discards history that is unreachable from reads at or above
    /// `revision`.
    pub fn compact(&mut self, revision: i64) -> StoreResult<usize> {
        if revision <= self.compact_revision {
            return Err(StoreError::Compacted(revision));
        }
        if revision > self.current_revision {
            return Err(StoreError::FutureRevision(revision));
        }

        let removed = self.index.compact(revision);
        for rev in &removed {
            self.history.remove(rev);
        }
        self.compact_revision = revision;

        info!(revision, removed = removed.len(), "compacted history");
        Ok(removed.len())
    }

    /// Changes committed at or after `start_revision`, grouped per revision
    /// in commit order.
    pub fn events_since(&self, start_revision: i64) -> StoreResult<Vec<(i64, Vec<Event>)>> {
        if self.compact_revision > 0 && start_revision <= self.compact_revision {
            return Err(StoreError::Compacted(start_revision));
        }

        let mut grouped: Vec<(i64, Vec<Event>)> = Vec::new();
        for (rev, kv) in self.history.range(Revision::new(start_revision, 0)..) {
            let event = Event {
                event_type: if kv.version == 0 {
                    EventType::Delete
                } else {
                    EventType::Put
                },
                kv: kv.clone(),
                prev_kv: self
                    .index
                    .get(&kv.key, rev.main - 1)
                    .and_then(|prev| self.history.get(&prev))
                    .cloned(),
            };
            match grouped.last_mut() {
                Some((main, events)) if *main == rev.main => events.push(event),
                _ => grouped.push((rev.main, vec![event])),
            }
        }
        Ok(grouped)
    }

    /// Number of keys currently alive.
    pub fn len(&self) -> usize {
        self.index.live_keys()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes sharing one store revision.
pub struct WriteTxn<'a> {
    store: &'a mut MvccStore,
    main: i64,
    sub: i64,
    events: Vec<Event>,
}

impl WriteTxn<'_> {
    /// Reads inside the transaction observe its earlier writes.
    fn read_revision(&self) -> i64 {
        if self.events.is_empty() {
            self.store.current_revision
        } else {
            self.main
        }
    }

    fn next_revision(&mut self) -> Revision {
        let rev = Revision::new(self.main, self.sub);
        self.sub += 1;
        rev
    }

    fn visible(&self, key: &[u8]) -> Option<KeyValue> {
        self.store
            .index
            .get(key, self.read_revision())
            .and_then(|rev| self.store.history.get(&rev))
            .cloned()
    }

    /// Range read. The caller validates `req.revision` up front.
    pub fn range(&self, req: &RangeRequest) -> RangeResult {
        let at = if req.revision > 0 {
            req.revision
        } else {
            self.read_revision()
        };
        self.store.range_at(req, at)
    }

    pub fn put(&mut self, req: &PutRequest) -> PutResult {
        let prev = self.visible(&req.key);
        let rev = self.next_revision();
        let kv = KeyValue {
            key: req.key.clone(),
            create_revision: prev.as_ref().map_or(self.main, |p| p.create_revision),
            mod_revision: self.main,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            value: req.value.clone(),
            lease: req.lease,
        };

        self.store.history.insert(rev, kv.clone());
        self.store.index.put(&req.key, rev);
        self.events.push(Event {
            event_type: EventType::Put,
            kv,
            prev_kv: prev.clone(),
        });

        PutResult {
            revision: self.main,
            prev_kv: if req.prev_kv { prev } else { None },
        }
    }

    pub fn delete_range(&mut self, req: &DeleteRequest) -> DeleteResult {
        let found = self
            .store
            .keys_in(&req.key, &req.range_end, self.read_revision());
        let deleted = found.len() as i64;
        let mut prev_kvs = Vec::new();

        for (key, rev) in found {
            let prev = self.store.history.get(&rev).cloned();
            let tombstone_rev = self.next_revision();
            let tombstone = KeyValue {
                key: key.clone(),
                mod_revision: self.main,
                ..Default::default()
            };
            self.store.history.insert(tombstone_rev, tombstone.clone());
            self.store.index.tombstone(&key, tombstone_rev);
            if req.prev_kv {
                prev_kvs.extend(prev.clone());
            }
            self.events.push(Event {
                event_type: EventType::Delete,
                kv: tombstone,
                prev_kv: prev,
            });
        }

        DeleteResult {
            revision: if deleted > 0 {
                self.main
            } else {
                self.read_revision()
            },
            deleted,
            prev_kvs,
        }
    }

    /// Publishes the writes. Returns the new revision and its events, or
    /// `None` when nothing was written.
    pub fn commit(self) -> Option<(i64, Vec<Event>)> {
        if self.events.is_empty() {
            return None;
        }
        self.store.current_revision = self.main;
        debug!(revision = self.main, changes = self.events.len(), "write committed");
        Some((self.main, self.events))
    }
}
