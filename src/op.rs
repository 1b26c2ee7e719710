//! Operation descriptors, compare predicates and caller-facing responses.
//!
//! An [`OpOptions`] describes one logical operation against the store: the
//! target key or key range, the projection (`key_only`, `count_only`), the
//! positional window (`offset` / `limit`), ordering, a pinned revision and the
//! write-side options (`value`, `lease_id`, `prev_kv`). Descriptors are plain
//! values built either with the chained setters or with a struct literal:
//!
//! ```
//! use etcd_adapter::op::OpOptions;
//!
//! let page = OpOptions::get("/registry/").prefix().offset(2).limit(2);
//! let same = OpOptions {
//!     key: b"/registry/".to_vec(),
//!     prefix: true,
//!     offset: 2,
//!     limit: 2,
//!     ..Default::default()
//! };
//! assert_eq!(page, same);
//! ```

use std::cmp::Ordering;
use std::fmt;

use crate::store;

/// Default number of rows fetched per page by the paging engine.
pub const DEFAULT_PAGE_COUNT: i64 = 4096;

/// Action carried by an operation or a watch response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Action {
    #[default]
    Get,
    Put,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Get => write!(f, "GET"),
            Action::Put => write!(f, "PUT"),
            Action::Delete => write!(f, "DELETE"),
        }
    }
}

/// Key ordering of range results.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SortOrder {
    #[default]
    Ascend,
    Descend,
}

/// Descriptor of a single operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpOptions {
    /// Action used when the descriptor is part of a transaction.
    pub action: Action,
    pub key: Vec<u8>,
    /// Exclusive upper bound of a range read or delete.
    pub end_key: Option<Vec<u8>>,
    /// Value written by a PUT.
    pub value: Option<Vec<u8>>,
    /// Treat `key` as a prefix. Takes precedence over `end_key`.
    pub prefix: bool,
    pub prev_kv: bool,
    /// Lease attached to a PUT, 0 for none.
    pub lease_id: i64,
    pub key_only: bool,
    pub count_only: bool,
    pub order: SortOrder,
    /// Read revision, or the start revision of a watch. 0 means "current".
    pub revision: i64,
    /// Rows skipped before collecting. Negative disables positional paging.
    pub offset: i64,
    /// Maximum rows returned. 0 or negative means unbounded.
    pub limit: i64,
}

impl OpOptions {
    pub fn new(action: Action, key: impl Into<Vec<u8>>) -> Self {
        Self {
            action,
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn get(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Action::Get, key)
    }

    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Action::Put, key).value(value)
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self::new(Action::Delete, key)
    }

    pub fn prefix(mut self) -> Self {
        self.prefix = true;
        self
    }

    pub fn end_key(mut self, end: impl Into<Vec<u8>>) -> Self {
        self.end_key = Some(end.into());
        self
    }

    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }

    pub fn lease(mut self, lease_id: i64) -> Self {
        self.lease_id = lease_id;
        self
    }

    pub fn key_only(mut self) -> Self {
        self.key_only = true;
        self
    }

    pub fn count_only(mut self) -> Self {
        self.count_only = true;
        self
    }

    pub fn descend(mut self) -> Self {
        self.order = SortOrder::Descend;
        self
    }

    pub fn revision(mut self, revision: i64) -> Self {
        self.revision = revision;
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Returns true when the descriptor addresses a key range rather than
    /// a single key.
    pub fn is_range(&self) -> bool {
        self.prefix || self.end_key.as_ref().is_some_and(|end| !end.is_empty())
    }

    /// Exclusive range end as sent to the store. Empty for single-key
    /// operations, `[0]` for "every key from `key` upward".
    pub fn range_end(&self) -> Vec<u8> {
        if self.prefix {
            prefix_range_end(&self.key)
        } else {
            self.end_key.clone().unwrap_or_default()
        }
    }

    pub(crate) fn range_request(&self) -> store::RangeRequest {
        store::RangeRequest {
            key: self.key.clone(),
            range_end: self.range_end(),
            limit: 0,
            revision: self.revision,
            sort_order: self.order,
            keys_only: self.key_only,
            count_only: self.count_only,
        }
    }
}

/// Lexicographic successor of every key starting with `prefix`.
///
/// Trailing `0xff` bytes are dropped before incrementing. A prefix made only
/// of `0xff` bytes (or an empty one) has no successor and maps to `[0]`,
/// the "no upper bound" marker.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// Ordering relation of a compare predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpResult {
    Equal,
    NotEqual,
    Greater,
    Less,
}

impl CmpResult {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpResult::Equal => ordering == Ordering::Equal,
            CmpResult::NotEqual => ordering != Ordering::Equal,
            CmpResult::Greater => ordering == Ordering::Greater,
            CmpResult::Less => ordering == Ordering::Less,
        }
    }
}

/// Attribute of the stored pair a predicate compares against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CmpTarget {
    Value(Vec<u8>),
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Lease(i64),
}

/// Predicate guarding a conditional transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmpOptions {
    pub key: Vec<u8>,
    pub result: CmpResult,
    pub target: CmpTarget,
}

impl CmpOptions {
    pub fn new(key: impl Into<Vec<u8>>, result: CmpResult, target: CmpTarget) -> Self {
        Self {
            key: key.into(),
            result,
            target,
        }
    }

    pub fn value_equals(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self::new(key, CmpResult::Equal, CmpTarget::Value(value.into()))
    }

    /// Holds when the key currently exists.
    pub fn exists(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, CmpResult::Greater, CmpTarget::Version(0))
    }

    /// Holds when the key does not exist.
    pub fn not_exists(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, CmpResult::Equal, CmpTarget::Version(0))
    }

    /// Evaluates the predicate against the live pair for `key`, if any.
    /// A missing key compares as version, revisions and lease 0 with an
    /// empty value.
    pub fn matches(&self, current: Option<&store::KeyValue>) -> bool {
        let ordering = match &self.target {
            CmpTarget::Value(target) => {
                let actual = current.map(|kv| kv.value.as_slice()).unwrap_or(&[]);
                actual.cmp(target.as_slice())
            }
            CmpTarget::Version(target) => current.map_or(0, |kv| kv.version).cmp(target),
            CmpTarget::CreateRevision(target) => {
                current.map_or(0, |kv| kv.create_revision).cmp(target)
            }
            CmpTarget::ModRevision(target) => current.map_or(0, |kv| kv.mod_revision).cmp(target),
            CmpTarget::Lease(target) => current.map_or(0, |kv| kv.lease).cmp(target),
        };
        self.result.holds(ordering)
    }
}

/// A key-value pair as returned to callers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    /// `None` under key-only projection and for deletions observed without
    /// the previous value.
    pub value: Option<Vec<u8>>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

impl KeyValue {
    pub(crate) fn from_store(kv: store::KeyValue, key_only: bool) -> Self {
        Self {
            value: if key_only { None } else { Some(kv.value) },
            key: kv.key,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            version: kv.version,
            lease: kv.lease,
        }
    }

    /// Key as UTF-8, lossy.
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }

    /// Value as UTF-8, lossy. Empty when no value is carried.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(self.value.as_deref().unwrap_or_default())
    }
}

/// Uniform result of every operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub action: Action,
    pub succeeded: bool,
    /// Total number of logical matches, independent of paging.
    pub count: i64,
    pub kvs: Option<Vec<KeyValue>>,
    pub revision: i64,
}

impl Response {
    /// Rows carried by the response, empty when there are none.
    pub fn rows(&self) -> &[KeyValue] {
        self.kvs.as_deref().unwrap_or_default()
    }
}
