//! Key-value operations: action dispatch, transactions, compaction and
//! paged reads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Client, ClientError, ClientResult};
use crate::op::{Action, CmpOptions, KeyValue, OpOptions, Response, DEFAULT_PAGE_COUNT};
use crate::paging;
use crate::store::{
    DeleteRequest, KvStore, PutRequest, RangeReader, RangeRequest, RangeResult, StoreError,
    StoreResult, TxnOp, TxnOpResult, TxnRequest,
};

/// Applies the request timeout to every page fetched by the paging engine.
struct TimedReader {
    store: Arc<dyn KvStore>,
    timeout: Duration,
}

#[async_trait]
impl RangeReader for TimedReader {
    async fn range(&self, req: RangeRequest) -> StoreResult<RangeResult> {
        tokio::time::timeout(self.timeout, self.store.range(req))
            .await
            .unwrap_or(Err(StoreError::Timeout(self.timeout)))
    }
}

fn validate(action: Action, op: &OpOptions) -> ClientResult<()> {
    if op.key.is_empty() {
        return Err(ClientError::InvalidArgument("key must not be empty".into()));
    }
    if action == Action::Put && op.value.is_none() {
        return Err(ClientError::InvalidArgument("PUT requires a value".into()));
    }
    Ok(())
}

fn rows(kvs: Vec<crate::store::KeyValue>, key_only: bool) -> Vec<KeyValue> {
    kvs.into_iter()
        .map(|kv| KeyValue::from_store(kv, key_only))
        .collect()
}

fn range_response(result: RangeResult, key_only: bool) -> Response {
    Response {
        action: Action::Get,
        succeeded: true,
        count: result.count,
        kvs: Some(rows(result.kvs, key_only)),
        revision: result.revision,
    }
}

fn count_response(result: RangeResult) -> Response {
    Response {
        action: Action::Get,
        succeeded: true,
        count: result.count,
        kvs: None,
        revision: result.revision,
    }
}

fn put_request(op: &OpOptions) -> PutRequest {
    PutRequest {
        key: op.key.clone(),
        value: op.value.clone().unwrap_or_default(),
        lease: op.lease_id,
        prev_kv: op.prev_kv,
    }
}

fn delete_request(op: &OpOptions) -> DeleteRequest {
    DeleteRequest {
        key: op.key.clone(),
        range_end: op.range_end(),
        prev_kv: op.prev_kv,
    }
}

fn txn_op(op: &OpOptions) -> ClientResult<TxnOp> {
    validate(op.action, op)?;
    Ok(match op.action {
        Action::Get => TxnOp::Range(op.range_request()),
        Action::Put => TxnOp::Put(put_request(op)),
        Action::Delete => TxnOp::Delete(delete_request(op)),
    })
}

impl Client {
    /// Runs `op` as `action`.
    ///
    /// GET on a range goes through the paging engine, so `offset` and
    /// `limit` are honoured and `count` is the size of the whole range.
    /// Writes carry rows only when `prev_kv` is requested.
    pub async fn dispatch(&self, action: Action, op: &OpOptions) -> ClientResult<Response> {
        validate(action, op)?;
        let store = self.connection()?;
        match action {
            Action::Get => self.do_get(store, op).await,
            Action::Put => self.do_put(store, op).await,
            Action::Delete => self.do_delete(store, op).await,
        }
    }

    pub async fn get(&self, op: &OpOptions) -> ClientResult<Response> {
        self.dispatch(Action::Get, op).await
    }

    pub async fn put(&self, op: &OpOptions) -> ClientResult<Response> {
        self.dispatch(Action::Put, op).await
    }

    pub async fn delete(&self, op: &OpOptions) -> ClientResult<Response> {
        self.dispatch(Action::Delete, op).await
    }

    /// Reads `op` through the paging engine regardless of its shape.
    pub async fn paging(&self, op: &OpOptions) -> ClientResult<Response> {
        validate(Action::Get, op)?;
        let store = self.connection()?;
        let reader = TimedReader {
            store,
            timeout: self.config().request_timeout(),
        };
        let result = paging::paging(&reader, op, DEFAULT_PAGE_COUNT).await?;
        if op.count_only {
            return Ok(count_response(result));
        }
        Ok(range_response(result, op.key_only))
    }

    async fn do_get(&self, store: Arc<dyn KvStore>, op: &OpOptions) -> ClientResult<Response> {
        if op.count_only {
            let result = self.timed(store.range(op.range_request())).await?;
            return Ok(count_response(result));
        }

        let result = if op.is_range() {
            let reader = TimedReader {
                store,
                timeout: self.config().request_timeout(),
            };
            paging::paging(&reader, op, DEFAULT_PAGE_COUNT).await?
        } else {
            self.timed(store.range(op.range_request())).await?
        };
        Ok(range_response(result, op.key_only))
    }

    async fn do_put(&self, store: Arc<dyn KvStore>, op: &OpOptions) -> ClientResult<Response> {
        let result = self.timed(store.put(put_request(op))).await?;
        let kvs = op
            .prev_kv
            .then(|| rows(result.prev_kv.into_iter().collect(), false));
        Ok(Response {
            action: Action::Put,
            succeeded: true,
            count: kvs.as_ref().map_or(0, |kvs| kvs.len() as i64),
            kvs,
            revision: result.revision,
        })
    }

    async fn do_delete(&self, store: Arc<dyn KvStore>, op: &OpOptions) -> ClientResult<Response> {
        let result = self.timed(store.delete_range(delete_request(op))).await?;
        Ok(Response {
            action: Action::Delete,
            succeeded: true,
            count: result.deleted,
            kvs: op.prev_kv.then(|| rows(result.prev_kvs, false)),
            revision: result.revision,
        })
    }

    /// Applies every descriptor atomically, each according to its own
    /// `action`.
    pub async fn txn(&self, ops: &[OpOptions]) -> ClientResult<Response> {
        if ops.is_empty() {
            return Err(ClientError::InvalidArgument(
                "transaction needs at least one operation".into(),
            ));
        }
        self.txn_with_cmp(ops, &[], &[]).await
    }

    /// Conditional transaction: `success` runs when every compare holds,
    /// `failure` otherwise. Rows read by GET descriptors of the executed
    /// branch are concatenated into the response.
    pub async fn txn_with_cmp(
        &self,
        success: &[OpOptions],
        cmps: &[CmpOptions],
        failure: &[OpOptions],
    ) -> ClientResult<Response> {
        if success.is_empty() && failure.is_empty() {
            return Err(ClientError::InvalidArgument(
                "transaction needs at least one operation".into(),
            ));
        }
        if cmps.iter().any(|cmp| cmp.key.is_empty()) {
            return Err(ClientError::InvalidArgument(
                "compare key must not be empty".into(),
            ));
        }
        let req = TxnRequest {
            compares: cmps.to_vec(),
            success: success.iter().map(txn_op).collect::<ClientResult<_>>()?,
            failure: failure.iter().map(txn_op).collect::<ClientResult<_>>()?,
        };

        let store = self.connection()?;
        let result = self.timed(store.txn(req)).await?;
        debug!(succeeded = result.succeeded, revision = result.revision, "txn done");

        let branch = if result.succeeded { success } else { failure };
        let mut response = Response {
            action: Action::Get,
            succeeded: result.succeeded,
            count: 0,
            kvs: None,
            revision: result.revision,
        };
        for (op, outcome) in branch.iter().zip(result.responses) {
            if let TxnOpResult::Range(range) = outcome {
                response.count += range.count;
                response
                    .kvs
                    .get_or_insert_with(Vec::new)
                    .extend(rows(range.kvs, op.key_only));
            }
        }
        Ok(response)
    }

    /// Discards history below `revision`. 0 compacts at the current head.
    pub async fn compact(&self, revision: i64) -> ClientResult<()> {
        if revision < 0 {
            return Err(ClientError::InvalidArgument(format!(
                "negative compact revision {revision}"
            )));
        }
        let store = self.connection()?;
        let target = if revision > 0 {
            revision
        } else {
            let head = self
                .timed(store.range(RangeRequest {
                    key: vec![0],
                    range_end: vec![0],
                    count_only: true,
                    ..Default::default()
                }))
                .await?;
            head.revision
        };

        self.timed(store.compact(target)).await?;
        info!(revision = target, "compacted");
        Ok(())
    }
}
