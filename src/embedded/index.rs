//! In-memory key index for the embedded store.
//!
//! Every key maps to a list of generations. A generation starts with the
//! write that creates the key and ends with its tombstone; re-creating a
//! deleted key opens a new generation. This lets a read at any retained
//! revision find the revision of the pair that was visible at that point.

use std::collections::BTreeMap;
use std::ops::Bound;

use tracing::trace;

/// Position of a change: `main` is the store revision, `sub` orders the
/// changes made by one transaction.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

impl Revision {
    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }
}

#[derive(Clone, Debug)]
struct Generation {
    created: Revision,
    revisions: Vec<Revision>,
    deleted: Option<Revision>,
}

impl Generation {
    fn visible_at(&self, revision: i64) -> Option<Revision> {
        if self.created.main > revision || self.deleted.is_some_and(|del| del.main <= revision) {
            return None;
        }
        self.revisions.iter().rfind(|r| r.main <= revision).copied()
    }
}

#[derive(Clone, Debug, Default)]
struct Entry {
    generations: Vec<Generation>,
}

impl Entry {
    fn visible_at(&self, revision: i64) -> Option<Revision> {
        self.generations
            .iter()
            .rev()
            .find_map(|gen| gen.visible_at(revision))
    }

    fn is_alive(&self) -> bool {
        self.generations
            .last()
            .is_some_and(|gen| gen.deleted.is_none())
    }
}

/// Ordered key → revision history index.
#[derive(Debug, Default)]
pub struct KeyIndex {
    tree: BTreeMap<Vec<u8>, Entry>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Revision of the pair visible for `key` at `revision`, if the key
    /// existed then.
    pub fn get(&self, key: &[u8], revision: i64) -> Option<Revision> {
        self.tree.get(key)?.visible_at(revision)
    }

    /// Records a write of `key`, opening a new generation when the key is
    /// absent.
    pub fn put(&mut self, key: &[u8], revision: Revision) {
        let entry = self.tree.entry(key.to_vec()).or_default();
        match entry.generations.last_mut() {
            Some(gen) if gen.deleted.is_none() => gen.revisions.push(revision),
            _ => entry.generations.push(Generation {
                created: revision,
                revisions: vec![revision],
                deleted: None,
            }),
        }
        trace!(key = %String::from_utf8_lossy(key), ?revision, "index put");
    }

    /// Closes the live generation of `key`. Returns false when the key was
    /// not alive.
    pub fn tombstone(&mut self, key: &[u8], revision: Revision) -> bool {
        let Some(gen) = self
            .tree
            .get_mut(key)
            .and_then(|entry| entry.generations.last_mut())
        else {
            return false;
        };
        if gen.deleted.is_some() {
            return false;
        }
        gen.deleted = Some(revision);
        trace!(key = %String::from_utf8_lossy(key), ?revision, "index tombstone");
        true
    }

    /// Keys in `[start, end)` visible at `revision`, ascending. An empty
    /// `end` leaves the range unbounded above.
    pub fn range(&self, start: &[u8], end: &[u8], revision: i64) -> Vec<(Vec<u8>, Revision)> {
        let upper = if end.is_empty() {
            Bound::Unbounded
        } else if end <= start {
            return Vec::new();
        } else {
            Bound::Excluded(end)
        };
        self.tree
            .range::<[u8], _>((Bound::Included(start), upper))
            .filter_map(|(key, entry)| entry.visible_at(revision).map(|rev| (key.clone(), rev)))
            .collect()
    }

    /// Drops history that is no longer reachable from reads at or above
    /// `compact_revision` and returns the revisions removed.
    ///
    /// For each live generation the latest revision at or below the
    /// compaction point is kept, since it is still the visible pair.
    /// Generations whose tombstone is at or below the point vanish entirely.
    pub fn compact(&mut self, compact_revision: i64) -> Vec<Revision> {
        let mut removed = Vec::new();

        for entry in self.tree.values_mut() {
            entry.generations.retain_mut(|gen| {
                if let Some(del) = gen.deleted.filter(|del| del.main <= compact_revision) {
                    removed.extend(gen.revisions.iter().copied());
                    removed.push(del);
                    return false;
                }
                let keep_from = gen
                    .revisions
                    .iter()
                    .rposition(|r| r.main <= compact_revision)
                    .unwrap_or(0);
                removed.extend(gen.revisions.drain(..keep_from));
                true
            });
        }
        self.tree.retain(|_, entry| !entry.generations.is_empty());

        trace!(compact_revision, removed = removed.len(), "index compacted");
        removed
    }

    /// Number of keys currently alive.
    pub fn live_keys(&self) -> usize {
        self.tree.values().filter(|entry| entry.is_alive()).count()
    }

    /// Number of revisions retained for `key`, tombstones included.
    pub fn retained(&self, key: &[u8]) -> usize {
        self.tree.get(key).map_or(0, |entry| {
            entry
                .generations
                .iter()
                .map(|gen| gen.revisions.len() + usize::from(gen.deleted.is_some()))
                .sum()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(main: i64) -> Revision {
        Revision::new(main, 0)
    }

    #[test]
    fn test_put_and_get() {
        let mut index = KeyIndex::new();
        index.put(b"key1", rev(2));

        assert_eq!(index.get(b"key1", 2), Some(rev(2)));
        assert_eq!(index.get(b"key1", 1), None);
        assert_eq!(index.get(b"key1", 9), Some(rev(2)));
    }

    #[test]
    fn test_updates_and_tombstone() {
        let mut index = KeyIndex::new();
        index.put(b"key1", rev(2));
        index.put(b"key1", rev(4));
        assert!(index.tombstone(b"key1", rev(6)));
        assert!(!index.tombstone(b"key1", rev(7)));

        assert_eq!(index.get(b"key1", 3), Some(rev(2)));
        assert_eq!(index.get(b"key1", 5), Some(rev(4)));
        assert_eq!(index.get(b"key1", 6), None);
        assert_eq!(index.live_keys(), 0);
    }

    #[test]
    fn test_generation_lifecycle() {
        let mut index = KeyIndex::new();
        index.put(b"key1", rev(2));
        index.tombstone(b"key1", rev(3));
        index.put(b"key1", rev(4));

        assert_eq!(index.get(b"key1", 2), Some(rev(2)));
        assert_eq!(index.get(b"key1", 3), None);
        assert_eq!(index.get(b"key1", 4), Some(rev(4)));
    }

    #[test]
    fn test_range_bounds() {
        let mut index = KeyIndex::new();
        for key in [b"a", b"b", b"c", b"d"] {
            index.put(key, rev(2));
        }

        let keys: Vec<_> = index.range(b"b", b"d", 2).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(index.range(b"b", b"", 2).len(), 3);
        assert!(index.range(b"c", b"b", 2).is_empty());
    }

    #[test]
    fn test_compaction_keeps_visible_revision() {
        let mut index = KeyIndex::new();
        index.put(b"key1", rev(2));
        index.put(b"key1", rev(3));
        index.put(b"key1", rev(5));

        let removed = index.compact(4);
        assert_eq!(removed, vec![rev(2)]);
        assert_eq!(index.get(b"key1", 4), Some(rev(3)));
        assert_eq!(index.retained(b"key1"), 2);
    }

    #[test]
    fn test_compaction_drops_deleted_generation() {
        let mut index = KeyIndex::new();
        index.put(b"gone", rev(2));
        index.tombstone(b"gone", rev(3));
        index.put(b"kept", rev(2));

        let mut removed = index.compact(3);
        removed.sort();
        assert_eq!(removed, vec![rev(2), rev(3)]);
        assert_eq!(index.retained(b"gone"), 0);
        assert_eq!(index.get(b"kept", 3), Some(rev(2)));
    }
}
