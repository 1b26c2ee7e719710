//! etcd v3 gRPC backend.
//!
//! [`GrpcStore`] speaks the etcd v3 wire protocol over a tonic [`Channel`].
//! There is no generated client: each RPC is a call through
//! [`tonic::client::Grpc`] with a [`ProstCodec`] over the message types in
//! [`proto`] and the method path from etcd's service definitions.
//!
//! Per-call deadlines are applied by the client layer, not by the channel,
//! since watch streams live far longer than any single request.

pub mod proto;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{debug, warn};

use crate::op::{CmpOptions, CmpResult, CmpTarget, SortOrder};
use crate::store::{
    Connector, DeleteRequest, DeleteResult, Event, EventType, KeyValue, KvStore, LeaseGrant,
    LeaseTtl, Member, PutRequest, PutResult, RangeReader, RangeRequest, RangeResult, StoreError,
    StoreResult, TxnOp, TxnOpResult, TxnRequest, TxnResult, WatchBatch, WatchRequest, WatchStream,
};

const KV_RANGE: &str = "/etcdserverpb.KV/Range";
const KV_PUT: &str = "/etcdserverpb.KV/Put";
const KV_DELETE_RANGE: &str = "/etcdserverpb.KV/DeleteRange";
const KV_TXN: &str = "/etcdserverpb.KV/Txn";
const KV_COMPACT: &str = "/etcdserverpb.KV/Compact";
const LEASE_GRANT: &str = "/etcdserverpb.Lease/LeaseGrant";
const LEASE_REVOKE: &str = "/etcdserverpb.Lease/LeaseRevoke";
const LEASE_KEEP_ALIVE: &str = "/etcdserverpb.Lease/LeaseKeepAlive";
const LEASE_TIME_TO_LIVE: &str = "/etcdserverpb.Lease/LeaseTimeToLive";
const WATCH: &str = "/etcdserverpb.Watch/Watch";
const MEMBER_LIST: &str = "/etcdserverpb.Cluster/MemberList";

/// Prefixes `http://` when the endpoint carries no scheme.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

/// Maps a gRPC status onto a store error. `subject` is the revision or
/// lease ID the request referred to, reported in the matching variants.
fn map_status(status: Status, subject: i64) -> StoreError {
    let message = status.message().to_string();
    match status.code() {
        Code::Unavailable | Code::Cancelled => StoreError::Transport(message),
        Code::DeadlineExceeded => StoreError::Transport(format!("deadline exceeded: {message}")),
        Code::OutOfRange if message.contains("compacted") => StoreError::Compacted(subject),
        Code::OutOfRange if message.contains("future") => StoreError::FutureRevision(subject),
        Code::NotFound if message.contains("lease") => StoreError::LeaseNotFound(subject),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StoreError::InvalidArgument(message)
        }
        Code::ResourceExhausted | Code::Aborted => StoreError::Unavailable(message),
        code => StoreError::Internal(format!("{code:?}: {message}")),
    }
}

fn header_revision(header: &Option<proto::ResponseHeader>) -> i64 {
    header.as_ref().map_or(0, |h| h.revision)
}

impl From<proto::KeyValue> for KeyValue {
    fn from(kv: proto::KeyValue) -> Self {
        KeyValue {
            key: kv.key,
            create_revision: kv.create_revision,
            mod_revision: kv.mod_revision,
            version: kv.version,
            value: kv.value,
            lease: kv.lease,
        }
    }
}

impl From<RangeRequest> for proto::RangeRequest {
    fn from(req: RangeRequest) -> Self {
        let sort_order = match req.sort_order {
            SortOrder::Ascend => proto::SORT_NONE,
            SortOrder::Descend => proto::SORT_DESCEND,
        };
        proto::RangeRequest {
            key: req.key,
            range_end: req.range_end,
            limit: req.limit,
            revision: req.revision,
            sort_order,
            sort_target: proto::SORT_TARGET_KEY,
            serializable: false,
            keys_only: req.keys_only,
            count_only: req.count_only,
        }
    }
}

impl From<proto::RangeResponse> for RangeResult {
    fn from(resp: proto::RangeResponse) -> Self {
        RangeResult {
            revision: header_revision(&resp.header),
            kvs: resp.kvs.into_iter().map(KeyValue::from).collect(),
            count: resp.count,
            more: resp.more,
        }
    }
}

impl From<PutRequest> for proto::PutRequest {
    fn from(req: PutRequest) -> Self {
        proto::PutRequest {
            key: req.key,
            value: req.value,
            lease: req.lease,
            prev_kv: req.prev_kv,
        }
    }
}

impl From<proto::PutResponse> for PutResult {
    fn from(resp: proto::PutResponse) -> Self {
        PutResult {
            revision: header_revision(&resp.header),
            prev_kv: resp.prev_kv.map(KeyValue::from),
        }
    }
}

impl From<DeleteRequest> for proto::DeleteRangeRequest {
    fn from(req: DeleteRequest) -> Self {
        proto::DeleteRangeRequest {
            key: req.key,
            range_end: req.range_end,
            prev_kv: req.prev_kv,
        }
    }
}

impl From<proto::DeleteRangeResponse> for DeleteResult {
    fn from(resp: proto::DeleteRangeResponse) -> Self {
        DeleteResult {
            revision: header_revision(&resp.header),
            deleted: resp.deleted,
            prev_kvs: resp.prev_kvs.into_iter().map(KeyValue::from).collect(),
        }
    }
}

impl From<&CmpOptions> for proto::Compare {
    fn from(cmp: &CmpOptions) -> Self {
        use proto::compare::TargetUnion;

        let result = match cmp.result {
            CmpResult::Equal => proto::COMPARE_EQUAL,
            CmpResult::Greater => proto::COMPARE_GREATER,
            CmpResult::Less => proto::COMPARE_LESS,
            CmpResult::NotEqual => proto::COMPARE_NOT_EQUAL,
        };
        let (target, union) = match &cmp.target {
            CmpTarget::Version(v) => (proto::TARGET_VERSION, TargetUnion::Version(*v)),
            CmpTarget::CreateRevision(r) => (proto::TARGET_CREATE, TargetUnion::CreateRevision(*r)),
            CmpTarget::ModRevision(r) => (proto::TARGET_MOD, TargetUnion::ModRevision(*r)),
            CmpTarget::Value(v) => (proto::TARGET_VALUE, TargetUnion::Value(v.clone())),
            CmpTarget::Lease(l) => (proto::TARGET_LEASE, TargetUnion::Lease(*l)),
        };
        proto::Compare {
            result,
            target,
            key: cmp.key.clone(),
            target_union: Some(union),
            range_end: Vec::new(),
        }
    }
}

impl From<TxnOp> for proto::RequestOp {
    fn from(op: TxnOp) -> Self {
        use proto::request_op::Request;

        let request = match op {
            TxnOp::Range(req) => Request::RequestRange(req.into()),
            TxnOp::Put(req) => Request::RequestPut(req.into()),
            TxnOp::Delete(req) => Request::RequestDeleteRange(req.into()),
        };
        proto::RequestOp {
            request: Some(request),
        }
    }
}

fn txn_result(resp: proto::TxnResponse) -> TxnResult {
    use proto::response_op::Response;

    let revision = header_revision(&resp.header);
    let responses = resp
        .responses
        .into_iter()
        .filter_map(|op| op.response)
        .map(|response| match response {
            Response::ResponseRange(r) => TxnOpResult::Range(r.into()),
            Response::ResponsePut(r) => TxnOpResult::Put(PutResult {
                revision,
                ..PutResult::from(r)
            }),
            Response::ResponseDeleteRange(r) => TxnOpResult::Delete(DeleteResult {
                revision,
                ..DeleteResult::from(r)
            }),
        })
        .collect();
    TxnResult {
        succeeded: resp.succeeded,
        revision,
        responses,
    }
}

fn watch_batch(resp: proto::WatchResponse) -> WatchBatch {
    let events = resp
        .events
        .into_iter()
        .map(|event| Event {
            event_type: if event.r#type == proto::EVENT_DELETE {
                EventType::Delete
            } else {
                EventType::Put
            },
            kv: event.kv.map(KeyValue::from).unwrap_or_default(),
            prev_kv: event.prev_kv.map(KeyValue::from),
        })
        .collect();
    WatchBatch {
        revision: header_revision(&resp.header),
        events,
        compact_revision: resp.compact_revision,
        canceled: resp.canceled,
        cancel_reason: resp.cancel_reason,
    }
}

/// Connection to one etcd member.
#[derive(Clone, Debug)]
pub struct GrpcStore {
    channel: Channel,
    endpoint: String,
}

impl GrpcStore {
    pub async fn connect(endpoint: &str, dial_timeout: Duration) -> StoreResult<Self> {
        let url = normalize_endpoint(endpoint);
        let channel = Endpoint::from_shared(url.clone())
            .map_err(|e| StoreError::InvalidArgument(format!("invalid endpoint {url}: {e}")))?
            .connect_timeout(dial_timeout)
            .tcp_nodelay(true)
            .connect()
            .await
            .map_err(|e| StoreError::Transport(format!("dial {url}: {e}")))?;
        Ok(Self {
            channel,
            endpoint: url,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn client(&self) -> Result<Grpc<Channel>, Status> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, req: Req) -> Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(Request::new(req), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    async fn streaming<S, Req, Resp>(
        &self,
        path: &'static str,
        outbound: S,
    ) -> Result<Streaming<Resp>, Status>
    where
        S: Stream<Item = Req> + Send + 'static,
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .streaming(Request::new(outbound), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl RangeReader for GrpcStore {
    async fn range(&self, req: RangeRequest) -> StoreResult<RangeResult> {
        let revision = req.revision;
        let resp: proto::RangeResponse = self
            .unary(KV_RANGE, proto::RangeRequest::from(req))
            .await
            .map_err(|s| map_status(s, revision))?;
        Ok(resp.into())
    }
}

#[async_trait]
impl KvStore for GrpcStore {
    async fn put(&self, req: PutRequest) -> StoreResult<PutResult> {
        let lease = req.lease;
        let resp: proto::PutResponse = self
            .unary(KV_PUT, proto::PutRequest::from(req))
            .await
            .map_err(|s| map_status(s, lease))?;
        Ok(resp.into())
    }

    async fn delete_range(&self, req: DeleteRequest) -> StoreResult<DeleteResult> {
        let resp: proto::DeleteRangeResponse = self
            .unary(KV_DELETE_RANGE, proto::DeleteRangeRequest::from(req))
            .await
            .map_err(|s| map_status(s, 0))?;
        Ok(resp.into())
    }

    async fn txn(&self, req: TxnRequest) -> StoreResult<TxnResult> {
        let wire = proto::TxnRequest {
            compare: req.compares.iter().map(proto::Compare::from).collect(),
            success: req.success.into_iter().map(proto::RequestOp::from).collect(),
            failure: req.failure.into_iter().map(proto::RequestOp::from).collect(),
        };
        let resp: proto::TxnResponse = self
            .unary(KV_TXN, wire)
            .await
            .map_err(|s| map_status(s, 0))?;
        Ok(txn_result(resp))
    }

    async fn compact(&self, revision: i64) -> StoreResult<()> {
        let _: proto::CompactionResponse = self
            .unary(
                KV_COMPACT,
                proto::CompactionRequest {
                    revision,
                    physical: false,
                },
            )
            .await
            .map_err(|s| map_status(s, revision))?;
        Ok(())
    }

    async fn lease_grant(&self, ttl: i64) -> StoreResult<LeaseGrant> {
        let resp: proto::LeaseGrantResponse = self
            .unary(LEASE_GRANT, proto::LeaseGrantRequest { ttl, id: 0 })
            .await
            .map_err(|s| map_status(s, 0))?;
        if !resp.error.is_empty() {
            return Err(StoreError::Internal(resp.error));
        }
        Ok(LeaseGrant {
            id: resp.id,
            ttl: resp.ttl,
        })
    }

    async fn lease_keep_alive(&self, id: i64) -> StoreResult<i64> {
        let outbound = tokio_stream::iter([proto::LeaseKeepAliveRequest { id }]);
        let mut inbound: Streaming<proto::LeaseKeepAliveResponse> = self
            .streaming(LEASE_KEEP_ALIVE, outbound)
            .await
            .map_err(|s| map_status(s, id))?;
        match inbound.message().await.map_err(|s| map_status(s, id))? {
            Some(resp) if resp.ttl > 0 => Ok(resp.ttl),
            _ => Err(StoreError::LeaseNotFound(id)),
        }
    }

    async fn lease_revoke(&self, id: i64) -> StoreResult<()> {
        let _: proto::LeaseRevokeResponse = self
            .unary(LEASE_REVOKE, proto::LeaseRevokeRequest { id })
            .await
            .map_err(|s| map_status(s, id))?;
        Ok(())
    }

    async fn lease_time_to_live(&self, id: i64) -> StoreResult<LeaseTtl> {
        let resp: proto::LeaseTimeToLiveResponse = self
            .unary(LEASE_TIME_TO_LIVE, proto::LeaseTimeToLiveRequest { id, keys: false })
            .await
            .map_err(|s| map_status(s, id))?;
        Ok(LeaseTtl {
            id,
            ttl: resp.ttl,
            granted_ttl: resp.granted_ttl,
        })
    }

    async fn watch(&self, req: WatchRequest) -> StoreResult<WatchStream> {
        use proto::watch_request::RequestUnion;

        let start_revision = req.start_revision;
        let (req_tx, req_rx) = mpsc::channel(1);
        let create = proto::WatchRequest {
            request_union: Some(RequestUnion::CreateRequest(proto::WatchCreateRequest {
                key: req.key,
                range_end: req.range_end,
                start_revision,
                prev_kv: req.prev_kv,
                ..Default::default()
            })),
        };
        req_tx
            .send(create)
            .await
            .map_err(|_| StoreError::Transport("watch request stream closed".into()))?;

        let mut inbound: Streaming<proto::WatchResponse> = self
            .streaming(WATCH, ReceiverStream::new(req_rx))
            .await
            .map_err(|s| map_status(s, start_revision))?;

        // Wait for the creation ack so the subscription is in place on return.
        let created = inbound
            .message()
            .await
            .map_err(|s| map_status(s, start_revision))?
            .ok_or_else(|| StoreError::Transport("watch stream closed before creation".into()))?;
        if created.canceled {
            return Err(if created.compact_revision > 0 {
                StoreError::Compacted(start_revision)
            } else {
                StoreError::InvalidArgument(created.cancel_reason)
            });
        }
        let watch_id = created.watch_id;
        debug!(watch_id, endpoint = %self.endpoint, "watch created");

        let (tx, rx) = mpsc::unbounded_channel();
        if !created.events.is_empty() {
            let _ = tx.send(Ok(watch_batch(created)));
        }

        let task = tokio::spawn(async move {
            // Dropping the request half would end the stream on the server side.
            let _req_tx = req_tx;
            loop {
                let resp = match inbound.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(status) => {
                        warn!(watch_id, error = %status, "watch stream failed");
                        let _ = tx.send(Err(map_status(status, start_revision)));
                        break;
                    }
                };
                let canceled = resp.canceled;
                if resp.events.is_empty() && !canceled {
                    continue;
                }
                if tx.send(Ok(watch_batch(resp))).is_err() || canceled {
                    break;
                }
            }
            debug!(watch_id, "watch stream finished");
        });

        Ok(WatchStream::new(rx).on_drop(move || task.abort()))
    }

    async fn member_list(&self) -> StoreResult<Vec<Member>> {
        let resp: proto::MemberListResponse = self
            .unary(MEMBER_LIST, proto::MemberListRequest { linearizable: false })
            .await
            .map_err(|s| map_status(s, 0))?;
        Ok(resp
            .members
            .into_iter()
            .map(|m| Member {
                id: m.id,
                name: m.name,
                peer_urls: m.peer_urls,
                client_urls: m.client_urls,
                is_learner: m.is_learner,
            })
            .collect())
    }
}

/// Dials the first reachable endpoint of the list.
#[derive(Clone, Copy, Debug, Default)]
pub struct GrpcConnector;

#[async_trait]
impl Connector for GrpcConnector {
    async fn connect(
        &self,
        endpoints: &[String],
        dial_timeout: Duration,
    ) -> StoreResult<Arc<dyn KvStore>> {
        let mut last_error =
            StoreError::InvalidArgument("no endpoints configured".to_string());
        for endpoint in endpoints {
            match GrpcStore::connect(endpoint, dial_timeout).await {
                Ok(store) => {
                    debug!(endpoint = %store.endpoint(), "connected");
                    return Ok(Arc::new(store));
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "endpoint unreachable");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}
