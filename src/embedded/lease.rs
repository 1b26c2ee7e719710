//! Lease table with TTL tracking.
//!
//! Expiry is tracked in a min-heap of deadlines. Renewals push a fresh
//! deadline and leave the stale entry in the heap; stale entries are
//! recognised and skipped when popped. Leases are also expired lazily on
//! access, so a renew after the deadline fails even when the background
//! sweep has not run yet.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::store::{StoreError, StoreResult};

/// Smallest TTL handed out, in seconds. Requests below it are raised.
pub const MIN_LEASE_TTL: i64 = 2;

/// Largest TTL accepted, in seconds.
pub const MAX_LEASE_TTL: i64 = 9_000_000_000;

#[derive(Clone, Debug)]
pub struct Lease {
    pub id: i64,
    pub granted_ttl: i64,
    pub expires_at: Instant,
    pub keys: HashSet<Vec<u8>>,
}

impl Lease {
    /// Whole seconds left before expiry.
    pub fn remaining_ttl(&self, now: Instant) -> i64 {
        self.expires_at.saturating_duration_since(now).as_secs() as i64
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

fn deadline(now: Instant, ttl: i64) -> StoreResult<Instant> {
    now.checked_add(Duration::from_secs(ttl.max(0) as u64))
        .ok_or_else(|| StoreError::InvalidArgument(format!("lease TTL {ttl} is out of range")))
}

/// A lease that ran out, with the keys that must be deleted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpiredLease {
    pub id: i64,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<i64, Lease>,
    deadlines: BinaryHeap<Reverse<(Instant, i64)>>,
    next_id: i64,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    /// Grants a lease. TTLs below [`MIN_LEASE_TTL`] are raised to it,
    /// TTLs above [`MAX_LEASE_TTL`] are rejected.
    pub fn grant(&mut self, ttl: i64) -> StoreResult<(i64, i64)> {
        if ttl > MAX_LEASE_TTL {
            return Err(StoreError::InvalidArgument(format!(
                "lease TTL {ttl} exceeds maximum {MAX_LEASE_TTL}"
            )));
        }
        let ttl = ttl.max(MIN_LEASE_TTL);
        let expires_at = deadline(Instant::now(), ttl)?;
        let id = self.next_id;
        self.next_id += 1;

        self.leases.insert(
            id,
            Lease {
                id,
                granted_ttl: ttl,
                expires_at,
                keys: HashSet::new(),
            },
        );
        self.deadlines.push(Reverse((expires_at, id)));

        debug!(lease_id = id, ttl, "lease granted");
        Ok((id, ttl))
    }

    /// Resets the deadline of a live lease and returns its granted TTL.
    pub fn renew(&mut self, id: i64) -> StoreResult<i64> {
        let lease = self.live_mut(id)?;
        let ttl = lease.granted_ttl;
        lease.expires_at = deadline(Instant::now(), ttl)?;
        let expires_at = lease.expires_at;
        self.deadlines.push(Reverse((expires_at, id)));

        debug!(lease_id = id, ttl, "lease renewed");
        Ok(ttl)
    }

    /// Removes a lease and returns the keys attached to it.
    pub fn revoke(&mut self, id: i64) -> StoreResult<Vec<Vec<u8>>> {
        let lease = self.leases.remove(&id).ok_or(StoreError::LeaseNotFound(id))?;
        debug!(lease_id = id, keys = lease.keys.len(), "lease revoked");
        Ok(lease.keys.into_iter().collect())
    }

    /// Fails with `LeaseNotFound` unless `id` is live.
    pub fn check(&mut self, id: i64) -> StoreResult<()> {
        self.live_mut(id).map(|_| ())
    }

    pub fn attach(&mut self, id: i64, key: &[u8]) -> StoreResult<()> {
        self.live_mut(id)?.keys.insert(key.to_vec());
        Ok(())
    }

    /// Detaches `key` from `id`. Unknown leases are ignored.
    pub fn detach(&mut self, id: i64, key: &[u8]) {
        if let Some(lease) = self.leases.get_mut(&id) {
            lease.keys.remove(key);
        }
    }

    /// Remaining and granted TTL of a live lease.
    pub fn time_to_live(&mut self, id: i64) -> StoreResult<(i64, i64)> {
        let now = Instant::now();
        let lease = self.live_mut(id)?;
        Ok((lease.remaining_ttl(now), lease.granted_ttl))
    }

    /// Pops every lease whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<ExpiredLease> {
        let mut expired = Vec::new();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            // Skip entries superseded by a renewal or a revoke.
            let Some(lease) = self.leases.get(&id) else {
                continue;
            };
            if !lease.is_expired(now) {
                continue;
            }
            if let Some(lease) = self.leases.remove(&id) {
                debug!(lease_id = id, keys = lease.keys.len(), "lease expired");
                expired.push(ExpiredLease {
                    id,
                    keys: lease.keys.into_iter().collect(),
                });
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    fn live_mut(&mut self, id: i64) -> StoreResult<&mut Lease> {
        let now = Instant::now();
        match self.leases.get(&id) {
            Some(lease) if !lease.is_expired(now) => {}
            _ => return Err(StoreError::LeaseNotFound(id)),
        }
        self.leases.get_mut(&id).ok_or(StoreError::LeaseNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let mut table = LeaseTable::new();
        let (id, ttl) = table.grant(30).unwrap();
        assert!(id > 0);
        assert_eq!(ttl, 30);

        table.attach(id, b"k").unwrap();
        assert_eq!(table.revoke(id).unwrap(), vec![b"k".to_vec()]);
        assert_eq!(table.revoke(id), Err(StoreError::LeaseNotFound(id)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_non_positive_ttl_uses_minimum() {
        let mut table = LeaseTable::new();
        let (a, ttl_a) = table.grant(0).unwrap();
        let (b, ttl_b) = table.grant(-1).unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        assert_eq!(ttl_a, MIN_LEASE_TTL);
        assert_eq!(ttl_b, MIN_LEASE_TTL);
    }

    #[tokio::test]
    async fn test_oversized_ttl_rejected() {
        let mut table = LeaseTable::new();
        assert!(matches!(
            table.grant(i64::MAX),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.grant(MAX_LEASE_TTL + 1),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(table.is_empty());

        let (id, ttl) = table.grant(MAX_LEASE_TTL).unwrap();
        assert_eq!(ttl, MAX_LEASE_TTL);
        assert_eq!(table.renew(id).unwrap(), MAX_LEASE_TTL);
    }

    #[tokio::test]
    async fn test_detach_unknown_lease_is_noop() {
        let mut table = LeaseTable::new();
        table.detach(99, b"k");
        assert_eq!(table.attach(99, b"k"), Err(StoreError::LeaseNotFound(99)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_lazy_check() {
        let mut table = LeaseTable::new();
        let (id, _) = table.grant(2).unwrap();
        table.attach(id, b"a").unwrap();
        assert_eq!(table.renew(id).unwrap(), 2);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(table.renew(id), Err(StoreError::LeaseNotFound(id)));

        let expired = table.expire(Instant::now());
        assert_eq!(
            expired,
            vec![ExpiredLease {
                id,
                keys: vec![b"a".to_vec()]
            }]
        );
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_pushes_deadline() {
        let mut table = LeaseTable::new();
        let (id, _) = table.grant(4).unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        table.renew(id).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(table.expire(Instant::now()).is_empty());
        let (remaining, granted) = table.time_to_live(id).unwrap();
        assert_eq!(granted, 4);
        assert_eq!(remaining, 2);
    }
}
