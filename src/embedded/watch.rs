//! Watch hub for the embedded store.
//!
//! Watchers are registered in a `DashMap` keyed by watch ID. After every
//! committed revision the store calls [`WatchHub::notify`] while still
//! holding its write lock, so each watcher receives the revisions in commit
//! order and never misses one committed after its registration.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::store::{Event, StoreResult, WatchBatch};

/// A watched key range. An empty `range_end` watches the single key,
/// `[0]` every key at or above `key`.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct WatchRange {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl WatchRange {
    pub fn contains(&self, key: &[u8]) -> bool {
        if key < self.key.as_slice() {
            return false;
        }
        match self.range_end.as_slice() {
            [] => key == self.key.as_slice(),
            [0] => true,
            end => key < end,
        }
    }
}

struct Watcher {
    range: WatchRange,
    start_revision: i64,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<StoreResult<WatchBatch>>,
}

impl Watcher {
    /// The part of a committed revision this watcher is interested in.
    fn select(&self, revision: i64, events: &[Event]) -> Option<WatchBatch> {
        if revision < self.start_revision {
            return None;
        }
        let events: Vec<Event> = events
            .iter()
            .filter(|event| self.range.contains(&event.kv.key))
            .map(|event| {
                let mut event = event.clone();
                if !self.prev_kv {
                    event.prev_kv = None;
                }
                event
            })
            .collect();
        if events.is_empty() {
            return None;
        }
        Some(WatchBatch {
            revision,
            events,
            ..Default::default()
        })
    }
}

#[derive(Default)]
pub struct WatchHub {
    watchers: DashMap<i64, Watcher>,
    next_id: AtomicI64,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watcher and returns its ID. `backlog` holds replayed
    /// history, delivered before any live revision.
    pub fn register(
        &self,
        range: WatchRange,
        start_revision: i64,
        prev_kv: bool,
        backlog: Vec<(i64, Vec<Event>)>,
        tx: mpsc::UnboundedSender<StoreResult<WatchBatch>>,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let watcher = Watcher {
            range,
            start_revision,
            prev_kv,
            tx,
        };
        for (revision, events) in &backlog {
            if let Some(batch) = watcher.select(*revision, events) {
                // The receiver is still held by the caller at this point.
                let _ = watcher.tx.send(Ok(batch));
            }
        }
        debug!(watch_id = id, start_revision, replayed = backlog.len(), "watch registered");
        self.watchers.insert(id, watcher);
        id
    }

    pub fn cancel(&self, id: i64) -> bool {
        let removed = self.watchers.remove(&id).is_some();
        if removed {
            debug!(watch_id = id, "watch canceled");
        }
        removed
    }

    /// Delivers one committed revision to every matching watcher. Watchers
    /// whose receiver is gone are dropped.
    pub fn notify(&self, revision: i64, events: &[Event]) {
        if events.is_empty() {
            return;
        }
        let mut closed = Vec::new();
        for entry in self.watchers.iter() {
            if let Some(batch) = entry.value().select(revision, events) {
                if entry.value().tx.send(Ok(batch)).is_err() {
                    closed.push(*entry.key());
                }
            }
        }
        for id in closed {
            debug!(watch_id = id, "watch receiver dropped");
            self.watchers.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}
