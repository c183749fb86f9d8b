//! etcd v3 backend over gRPC.
//!
//! - [`proto`] - Wire messages for the KV and Watch services
//!
//! Calls go through `tonic::client::Grpc` with a prost codec, so no
//! generated service stubs are needed. Conditional puts are expressed as a
//! single-compare transaction on the key's create revision.

pub mod proto;

use super::{KeyValue, KvBackend, Precondition, RangeResult, WatchEvent, WatchItem, WatchStream};
use crate::core::error::{TrellisError, TrellisResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

const RANGE_PATH: &str = "/etcdserverpb.KV/Range";
const PUT_PATH: &str = "/etcdserverpb.KV/Put";
const DELETE_RANGE_PATH: &str = "/etcdserverpb.KV/DeleteRange";
const TXN_PATH: &str = "/etcdserverpb.KV/Txn";
const WATCH_PATH: &str = "/etcdserverpb.Watch/Watch";

/// etcd cluster connection.
#[derive(Debug, Clone)]
pub struct EtcdBackend {
    channel: Channel,
}

impl EtcdBackend {
    /// Build a load-balanced channel over `endpoints`.
    ///
    /// The channel connects lazily; the first request surfaces an
    /// unreachable cluster as `StoreUnavailable`.
    pub async fn connect(endpoints: &[String], connect_timeout: Duration) -> TrellisResult<Self> {
        if endpoints.is_empty() {
            return Err(TrellisError::unavailable("no etcd endpoints configured"));
        }

        let mut targets = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            let uri = if endpoint.contains("://") {
                endpoint.clone()
            } else {
                format!("http://{}", endpoint)
            };
            let target = Endpoint::from_shared(uri.clone())
                .map_err(|e| TrellisError::unavailable(format!("invalid endpoint {}: {}", uri, e)))?
                .connect_timeout(connect_timeout)
                .tcp_nodelay(true);
            targets.push(target);
        }

        tracing::debug!(endpoints = ?endpoints, "etcd channel configured");
        Ok(Self {
            channel: Channel::balance_list(targets.into_iter()),
        })
    }

    async fn client(&self) -> TrellisResult<Grpc<Channel>> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| TrellisError::unavailable(format!("etcd not ready: {}", e)))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> TrellisResult<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(status_to_error)?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl KvBackend for EtcdBackend {
    async fn range(&self, prefix: &str) -> TrellisResult<RangeResult> {
        let request = proto::RangeRequest {
            key: prefix.as_bytes().to_vec(),
            range_end: proto::prefix_range_end(prefix.as_bytes()),
            ..Default::default()
        };
        let response: proto::RangeResponse = self.unary(RANGE_PATH, request).await?;
        let revision = header_revision(response.header.as_ref());
        let kvs = response
            .kvs
            .into_iter()
            .map(convert_kv)
            .collect::<TrellisResult<Vec<_>>>()?;
        Ok(RangeResult { kvs, revision })
    }

    async fn get(&self, key: &str) -> TrellisResult<Option<KeyValue>> {
        let request = proto::RangeRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        };
        let response: proto::RangeResponse = self.unary(RANGE_PATH, request).await?;
        response.kvs.into_iter().next().map(convert_kv).transpose()
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        precondition: Option<Precondition>,
    ) -> TrellisResult<u64> {
        let put = proto::PutRequest {
            key: key.as_bytes().to_vec(),
            value: value.to_vec(),
        };

        let Some(precondition) = precondition else {
            let response: proto::PutResponse = self.unary(PUT_PATH, put).await?;
            return Ok(header_revision(response.header.as_ref()));
        };

        let request = proto::TxnRequest {
            compare: vec![compare_for(key, precondition)],
            success: vec![proto::RequestOp {
                request: Some(proto::Request::RequestPut(put)),
            }],
            failure: Vec::new(),
        };
        let response: proto::TxnResponse = self.unary(TXN_PATH, request).await?;
        if !response.succeeded {
            return Err(TrellisError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        Ok(header_revision(response.header.as_ref()))
    }

    async fn delete(&self, key: &str) -> TrellisResult<u64> {
        let request = proto::DeleteRangeRequest {
            key: key.as_bytes().to_vec(),
            ..Default::default()
        };
        let response: proto::DeleteRangeResponse =
            self.unary(DELETE_RANGE_PATH, request).await?;
        if response.deleted == 0 {
            return Err(TrellisError::not_found(key));
        }
        Ok(header_revision(response.header.as_ref()))
    }

    async fn watch(&self, prefix: &str, start_revision: u64) -> TrellisResult<WatchStream> {
        let (req_tx, req_rx) = mpsc::channel::<proto::WatchRequest>(4);
        let create = proto::WatchRequest {
            request_union: Some(proto::RequestUnion::CreateRequest(
                proto::WatchCreateRequest {
                    key: prefix.as_bytes().to_vec(),
                    range_end: proto::prefix_range_end(prefix.as_bytes()),
                    start_revision: start_revision as i64,
                },
            )),
        };
        req_tx
            .send(create)
            .await
            .map_err(|_| TrellisError::unavailable("watch request channel closed"))?;

        let mut grpc = self.client().await?;
        let codec: ProstCodec<proto::WatchRequest, proto::WatchResponse> = ProstCodec::default();
        let response = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(req_rx)),
                PathAndQuery::from_static(WATCH_PATH),
                codec,
            )
            .await
            .map_err(status_to_error)?;
        let mut inbound = response.into_inner();

        let (tx, stream) = WatchStream::channel();
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            // Dropping the request sender half-closes the stream server-side.
            let _req_tx = req_tx;
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    message = inbound.message() => {
                        let item = match message {
                            Ok(Some(response)) => match translate(response, start_revision) {
                                Some(item) => item,
                                None => continue,
                            },
                            Ok(None) => Err(TrellisError::unavailable("watch stream closed by server")),
                            Err(status) => Err(status_to_error(status)),
                        };
                        let terminal = item.is_err();
                        if tx.send(item).is_err() || terminal {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(prefix = %prefix, "etcd watch bridge stopped");
        });

        Ok(stream)
    }
}

/// Turn one watch response into a batch, an error, or nothing.
fn translate(response: proto::WatchResponse, start_revision: u64) -> Option<WatchItem> {
    if response.compact_revision > 0 {
        return Some(Err(TrellisError::StreamCompacted {
            requested: start_revision,
            compact_revision: response.compact_revision as u64,
        }));
    }
    if response.canceled {
        return Some(Err(TrellisError::unavailable(format!(
            "watch canceled: {}",
            response.cancel_reason
        ))));
    }
    if response.events.is_empty() {
        return None;
    }

    let mut events = Vec::with_capacity(response.events.len());
    for event in response.events {
        let Some(kv) = event.kv else {
            continue;
        };
        let key = match String::from_utf8(kv.key) {
            Ok(key) => key,
            Err(e) => return Some(Err(TrellisError::codec(format!("non-utf8 key: {}", e)))),
        };
        let revision = kv.mod_revision.max(0) as u64;
        if event.r#type == proto::EventType::Delete as i32 {
            events.push(WatchEvent::delete(key, revision));
        } else {
            events.push(WatchEvent::put(key, Bytes::from(kv.value), revision));
        }
    }
    Some(Ok(events))
}

fn convert_kv(kv: proto::KeyValue) -> TrellisResult<KeyValue> {
    let key = String::from_utf8(kv.key)
        .map_err(|e| TrellisError::codec(format!("non-utf8 key: {}", e)))?;
    Ok(KeyValue {
        key,
        value: Bytes::from(kv.value),
        create_revision: kv.create_revision.max(0) as u64,
        mod_revision: kv.mod_revision.max(0) as u64,
    })
}

/// Txn guard for a conditional put.
fn compare_for(key: &str, precondition: Precondition) -> proto::Compare {
    let (result, target, target_union) = match precondition {
        Precondition::MustNotExist => (
            proto::CompareResult::Equal,
            proto::CompareTarget::Create,
            proto::TargetUnion::CreateRevision(0),
        ),
        Precondition::MustExist => (
            proto::CompareResult::Greater,
            proto::CompareTarget::Create,
            proto::TargetUnion::CreateRevision(0),
        ),
        Precondition::ModRevision(revision) => (
            proto::CompareResult::Equal,
            proto::CompareTarget::Mod,
            proto::TargetUnion::ModRevision(revision as i64),
        ),
    };
    proto::Compare {
        result: result as i32,
        target: target as i32,
        key: key.as_bytes().to_vec(),
        target_union: Some(target_union),
        range_end: Vec::new(),
    }
}

fn header_revision(header: Option<&proto::ResponseHeader>) -> u64 {
    header.map_or(0, |h| h.revision.max(0) as u64)
}

fn status_to_error(status: Status) -> TrellisError {
    match status.code() {
        Code::InvalidArgument | Code::FailedPrecondition => {
            TrellisError::validation(status.message().to_string())
        }
        code => TrellisError::unavailable(format!("{:?}: {}", code, status.message())),
    }
}
