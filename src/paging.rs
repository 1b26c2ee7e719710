//! Paging engine for large range reads.
//!
//! A range read is served as a sequence of bounded reads, all pinned to the
//! revision observed by an initial count-only read so the pages compose into
//! a single consistent snapshot:
//!
//! 1. count the whole range (`count`, revision `R`)
//! 2. if the requested window fits in one page, issue one read at `R`
//! 3. otherwise walk pages of `page_size` rows at `R`, resuming past the
//!    last key of the previous page, skipping `offset` rows across page
//!    boundaries until `limit` rows are collected or the range is exhausted
//!
//! A page that comes back empty before `count` rows were visited means the
//! snapshot shrank underneath us (for instance it was compacted away between
//! calls on a store that does not reject that). The engine stops and returns
//! what it has, together with the count it originally observed.

use tracing::{debug, warn};

use crate::op::{OpOptions, SortOrder};
use crate::store::{KeyValue, RangeReader, RangeRequest, RangeResult, StoreResult};

/// Positional window requested by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Window {
    skip: i64,
    take: Option<i64>,
    page: i64,
}

impl Window {
    fn new(op: &OpOptions, page_size: i64) -> Self {
        let page_size = page_size.max(1);
        if op.offset < 0 {
            // Full enumeration, paged by the caller's limit.
            Window {
                skip: 0,
                take: None,
                page: if op.limit > 0 { op.limit } else { page_size },
            }
        } else if op.limit <= 0 {
            Window {
                skip: 0,
                take: None,
                page: page_size,
            }
        } else {
            Window {
                skip: op.offset,
                take: Some(op.limit),
                page: page_size,
            }
        }
    }

    /// Rows that must be visited from the start of the range.
    fn needed(&self, count: i64) -> i64 {
        match self.take {
            Some(take) => self.skip.saturating_add(take).min(count),
            None => count,
        }
    }
}

/// Reads the range described by `op` through `reader`, page by page.
///
/// The returned `count` is the size of the whole range at the pinned
/// revision, `kvs` holds the requested window. `op.count_only` short-cuts
/// after the first read. Any failed fetch aborts the call.
pub async fn paging(
    reader: &dyn RangeReader,
    op: &OpOptions,
    page_size: i64,
) -> StoreResult<RangeResult> {
    let base = op.range_request();
    let counted = reader
        .range(RangeRequest {
            count_only: true,
            limit: 0,
            ..base.clone()
        })
        .await?;
    let count = counted.count;
    let revision = counted.revision;

    let window = Window::new(op, page_size);
    if op.count_only || count == 0 || window.skip >= count {
        return Ok(RangeResult {
            kvs: Vec::new(),
            count,
            more: false,
            revision,
        });
    }

    let pinned = if op.revision > 0 { op.revision } else { revision };
    let needed = window.needed(count);
    let wanted = needed - window.skip;
    let mut cursor = RangeRequest {
        revision: pinned,
        count_only: false,
        ..base
    };

    if needed <= window.page {
        cursor.limit = needed;
        let page = reader.range(cursor).await?;
        let kvs: Vec<KeyValue> = page
            .kvs
            .into_iter()
            .skip(window.skip as usize)
            .take(wanted as usize)
            .collect();
        return Ok(RangeResult {
            more: (kvs.len() as i64) < count,
            kvs,
            count,
            revision,
        });
    }

    debug!(count, revision = pinned, page = window.page, "paging range read");

    cursor.limit = window.page;
    let mut kvs = Vec::with_capacity(wanted.min(count) as usize);
    let mut to_skip = window.skip;
    let mut visited = 0i64;

    loop {
        let page = reader.range(cursor.clone()).await?;
        let fetched = page.kvs.len() as i64;
        if fetched == 0 {
            if visited < count {
                warn!(
                    visited,
                    count,
                    revision = pinned,
                    "range shrank while paging, returning partial result"
                );
            }
            break;
        }
        visited += fetched;

        if let Some(last) = page.kvs.last() {
            advance(&mut cursor, &last.key);
        }
        for kv in page.kvs {
            if to_skip > 0 {
                to_skip -= 1;
                continue;
            }
            kvs.push(kv);
            if kvs.len() as i64 >= wanted {
                break;
            }
        }

        if kvs.len() as i64 >= wanted || fetched < window.page || visited >= count {
            break;
        }
    }

    Ok(RangeResult {
        more: (kvs.len() as i64) < count,
        kvs,
        count,
        revision,
    })
}

/// Moves the cursor past `last` in the direction of the walk.
fn advance(cursor: &mut RangeRequest, last: &[u8]) {
    match cursor.sort_order {
        SortOrder::Ascend => {
            let mut next = last.to_vec();
            next.push(0);
            cursor.key = next;
        }
        SortOrder::Descend => {
            cursor.range_end = last.to_vec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    fn kv(key: &str) -> KeyValue {
        KeyValue {
            key: key.as_bytes().to_vec(),
            value: key.as_bytes().to_vec(),
            create_revision: 2,
            mod_revision: 2,
            version: 1,
            lease: 0,
        }
    }

    fn keys(result: &RangeResult) -> Vec<String> {
        result
            .kvs
            .iter()
            .map(|kv| String::from_utf8_lossy(&kv.key).into_owned())
            .collect()
    }

    /// Replays canned responses in order and records every request.
    struct ScriptedReader {
        replies: Mutex<VecDeque<StoreResult<RangeResult>>>,
        requests: Mutex<Vec<RangeRequest>>,
    }

    impl ScriptedReader {
        fn new(replies: Vec<StoreResult<RangeResult>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<RangeRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl RangeReader for ScriptedReader {
        async fn range(&self, req: RangeRequest) -> StoreResult<RangeResult> {
            self.requests.lock().push(req);
            self.replies
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(StoreError::Internal("script exhausted".into())))
        }
    }

    /// Sorted in-memory range over a fixed set of keys.
    struct SortedReader {
        rows: Vec<KeyValue>,
        calls: Mutex<usize>,
    }

    impl SortedReader {
        fn new(keys: &[&str]) -> Self {
            let mut rows: Vec<KeyValue> = keys.iter().map(|k| kv(k)).collect();
            rows.sort_by(|a, b| a.key.cmp(&b.key));
            Self {
                rows,
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl RangeReader for SortedReader {
        async fn range(&self, req: RangeRequest) -> StoreResult<RangeResult> {
            *self.calls.lock() += 1;
            let mut matched: Vec<KeyValue> = self
                .rows
                .iter()
                .filter(|kv| {
                    kv.key >= req.key
                        && (req.range_end == [0] || kv.key < req.range_end)
                })
                .cloned()
                .collect();
            if req.sort_order == SortOrder::Descend {
                matched.reverse();
            }
            let count = matched.len() as i64;
            if req.count_only {
                matched.clear();
            } else if req.limit > 0 {
                matched.truncate(req.limit as usize);
            }
            Ok(RangeResult {
                more: (matched.len() as i64) < count,
                kvs: matched,
                count,
                revision: 10,
            })
        }
    }

    fn reply(rows: Vec<KeyValue>, count: i64) -> StoreResult<RangeResult> {
        Ok(RangeResult {
            kvs: rows,
            count,
            more: false,
            revision: 42,
        })
    }

    #[tokio::test]
    async fn test_snapshot_shrinks_between_pages() {
        let first_page: Vec<KeyValue> = (0..4096).map(|i| kv(&format!("/k/{:05}", i))).collect();
        let last_key = first_page[4095].key.clone();
        let reader = ScriptedReader::new(vec![
            reply(Vec::new(), 4097),
            reply(first_page, 4097),
            reply(Vec::new(), 4097),
        ]);

        let op = OpOptions::get("/k/").prefix().offset(-1).limit(4096);
        let result = paging(&reader, &op, 4096).await.unwrap();
        assert_eq!(result.count, 4097);
        assert_eq!(result.kvs.len(), 4096);

        let requests = reader.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].count_only);
        assert_eq!(requests[1].revision, 42);
        assert_eq!(requests[2].revision, 42);
        let mut resume = last_key;
        resume.push(0);
        assert_eq!(requests[2].key, resume);
    }

    #[tokio::test]
    async fn test_snapshot_shrinks_to_zero() {
        let reader = ScriptedReader::new(vec![reply(Vec::new(), 3), reply(Vec::new(), 0)]);
        let op = OpOptions::get("/k/").prefix();
        let result = paging(&reader, &op, 4096).await.unwrap();
        assert_eq!(result.count, 3);
        assert!(result.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_count_only_makes_one_call() {
        let reader = ScriptedReader::new(vec![reply(Vec::new(), 5)]);
        let op = OpOptions::get("/k/").prefix().count_only().offset(1).limit(2);
        let result = paging(&reader, &op, 4096).await.unwrap();
        assert_eq!(result.count, 5);
        assert!(result.kvs.is_empty());
        assert_eq!(reader.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_offset_past_end_returns_no_rows() {
        let reader = ScriptedReader::new(vec![reply(Vec::new(), 5)]);
        let op = OpOptions::get("/k/").prefix().offset(6).limit(2);
        let result = paging(&reader, &op, 4096).await.unwrap();
        assert_eq!(result.count, 5);
        assert!(result.kvs.is_empty());
        assert_eq!(reader.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_page_aborts() {
        let reader = ScriptedReader::new(vec![
            reply(Vec::new(), 10),
            reply(vec![kv("a"), kv("b"), kv("c"), kv("d")], 10),
            Err(StoreError::Transport("connection reset".into())),
        ]);
        let op = OpOptions::get("a").end_key("z");
        let err = paging(&reader, &op, 4).await.unwrap_err();
        assert_eq!(err, StoreError::Transport("connection reset".into()));
    }

    #[tokio::test]
    async fn test_offset_spans_page_boundaries() {
        let reader = SortedReader::new(&["a", "b", "c", "d", "e", "f", "g"]);
        let op = OpOptions::get("a").end_key("z").offset(3).limit(3);
        let result = paging(&reader, &op, 2).await.unwrap();
        assert_eq!(keys(&result), vec!["d", "e", "f"]);
        assert_eq!(result.count, 7);
        assert_eq!(result.revision, 10);
    }

    #[tokio::test]
    async fn test_single_page_window() {
        let reader = SortedReader::new(&["a", "b", "c", "d", "e"]);
        let op = OpOptions::get("a").end_key("z").offset(2).limit(2);
        let result = paging(&reader, &op, 4096).await.unwrap();
        assert_eq!(keys(&result), vec!["c", "d"]);
        assert_eq!(result.count, 5);
        assert_eq!(reader.calls(), 2);
    }

    #[tokio::test]
    async fn test_limit_truncates_at_range_end() {
        let reader = SortedReader::new(&["a", "b", "c", "d", "e"]);
        let op = OpOptions::get("a").end_key("z").offset(4).limit(2);
        let result = paging(&reader, &op, 2).await.unwrap();
        assert_eq!(keys(&result), vec!["e"]);
        assert_eq!(result.count, 5);
    }

    #[tokio::test]
    async fn test_negative_offset_enumerates_by_limit() {
        let reader = SortedReader::new(&["a", "b", "c", "d", "e"]);
        let op = OpOptions::get("a").end_key("z").offset(-2).limit(2);
        let result = paging(&reader, &op, 4096).await.unwrap();
        assert_eq!(keys(&result), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(result.count, 5);
        // count + pages of 2, 2 and 1
        assert_eq!(reader.calls(), 4);
    }

    #[tokio::test]
    async fn test_zero_limit_ignores_offset() {
        let reader = SortedReader::new(&["a", "b", "c"]);
        let op = OpOptions::get("a").end_key("z").offset(2);
        let result = paging(&reader, &op, 4096).await.unwrap();
        assert_eq!(keys(&result), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_descending_walk() {
        let reader = SortedReader::new(&["a", "b", "c", "d", "e", "f"]);
        let op = OpOptions::get("a").end_key("z").descend().offset(1).limit(4);
        let result = paging(&reader, &op, 2).await.unwrap();
        assert_eq!(keys(&result), vec!["e", "d", "c", "b"]);
        assert_eq!(result.count, 6);
    }

    #[test]
    fn test_window_shapes() {
        let w = Window::new(&OpOptions::get("a").offset(-1).limit(0), 4096);
        assert_eq!(w, Window { skip: 0, take: None, page: 4096 });
        let w = Window::new(&OpOptions::get("a").offset(3).limit(5), 100);
        assert_eq!(w.needed(6), 6);
        assert_eq!(w.needed(100), 8);
    }
}
