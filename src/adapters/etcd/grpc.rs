//! gRPC server implementation for the etcd v3 KV and Watch services.
//!
//! The services are wired to tonic by hand instead of through generated
//! stubs: each wrapper implements `tonic::codegen::Service` and routes on
//! the request path, decoding with the prost messages from
//! [`super::proto`].

use super::kv::KvService;
use super::proto;
use super::watch::{WatchResponseStream, WatchService};
use crate::core::error::{BlobKvError, BlobKvResult};
use crate::kv::{Revision, Store};
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codec::ProstCodec;
use tonic::codegen::{http, Body, BoxFuture, Service, StdError};
use tonic::server::{Grpc, NamedService, StreamingService, UnaryService};
use tonic::Status;
use tracing::{debug, info, warn};

/// Default outbound buffer per watch stream.
pub const DEFAULT_STREAM_BUFFER: usize = 128;

/// Shared state for the gRPC services.
#[derive(Clone, Debug)]
pub struct SharedState {
    /// Key-value store.
    pub store: Store,
    /// Cluster ID for response headers.
    pub cluster_id: u64,
    /// Member ID for response headers.
    pub member_id: u64,
    /// Shutdown signal receiver.
    pub shutdown_rx: watch::Receiver<bool>,
    /// Outbound responses buffered per watch stream.
    pub stream_buffer: usize,
}

impl SharedState {
    /// Create a new shared state.
    pub fn new(store: Store, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            store,
            cluster_id: 1,
            member_id: 1,
            shutdown_rx,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Set the identifiers reported in response headers.
    pub fn with_ids(mut self, cluster_id: u64, member_id: u64) -> Self {
        self.cluster_id = cluster_id;
        self.member_id = member_id;
        self
    }

    /// Set the per-stream outbound buffer.
    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer;
        self
    }

    /// Create a response header at `revision`.
    pub fn response_header(&self, revision: Revision) -> proto::ResponseHeader {
        proto::ResponseHeader {
            cluster_id: self.cluster_id,
            member_id: self.member_id,
            revision,
            raft_term: 1,
        }
    }

    /// Create a response header at the committed revision.
    pub fn current_header(&self) -> proto::ResponseHeader {
        self.response_header(self.store.revision())
    }
}

/// gRPC server for the etcd v3 API.
pub struct EtcdGrpcServer {
    /// Bind address.
    bind_addr: SocketAddr,
    /// Shared state.
    state: SharedState,
}

impl EtcdGrpcServer {
    /// Create a new gRPC server.
    pub fn new(bind_addr: SocketAddr, state: SharedState) -> Self {
        Self { bind_addr, state }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Get a reference to the shared state.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> BlobKvResult<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            BlobKvError::unavailable(format!("failed to bind {}: {}", self.bind_addr, e))
        })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> BlobKvResult<()> {
        use tonic::transport::Server;

        let addr = listener.local_addr().unwrap_or(self.bind_addr);
        let mut shutdown_rx = self.state.shutdown_rx.clone();

        info!(%addr, "starting etcd gRPC server");

        Server::builder()
            .add_service(EtcdKvServer::new(KvService::new(self.state.clone())))
            .add_service(EtcdWatchServer::new(WatchService::new(self.state.clone())))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                loop {
                    if *shutdown_rx.borrow_and_update() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("gRPC server shutting down");
            })
            .await
            .map_err(|e| BlobKvError::unavailable(format!("gRPC server error: {}", e)))
    }
}

// ============================================================================
// Tonic Service Wrappers
// ============================================================================

type Handler<Req, Resp> = fn(KvService, Req) -> BoxFuture<Resp, BlobKvError>;

/// One unary KV method bound to its handler.
struct UnaryMethod<Req, Resp> {
    service: KvService,
    handler: Handler<Req, Resp>,
    _marker: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> UnaryMethod<Req, Resp> {
    fn new(service: KvService, handler: Handler<Req, Resp>) -> Self {
        Self {
            service,
            handler,
            _marker: PhantomData,
        }
    }
}

impl<Req, Resp> UnaryService<Req> for UnaryMethod<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type Future = BoxFuture<tonic::Response<Resp>, Status>;

    fn call(&mut self, request: tonic::Request<Req>) -> Self::Future {
        let pending = (self.handler)(self.service.clone(), request.into_inner());
        Box::pin(async move {
            match pending.await {
                Ok(response) => Ok(tonic::Response::new(response)),
                Err(e) => {
                    if e.is_retriable() {
                        warn!(error = %e, "KV request failed");
                    } else {
                        debug!(error = %e, "KV request rejected");
                    }
                    Err(Status::from(e))
                }
            }
        })
    }
}

fn range_handler(
    service: KvService,
    req: proto::RangeRequest,
) -> BoxFuture<proto::RangeResponse, BlobKvError> {
    Box::pin(async move { service.range(req).await })
}

fn put_handler(
    service: KvService,
    req: proto::PutRequest,
) -> BoxFuture<proto::PutResponse, BlobKvError> {
    Box::pin(async move { service.put(req).await })
}

fn delete_range_handler(
    service: KvService,
    req: proto::DeleteRangeRequest,
) -> BoxFuture<proto::DeleteRangeResponse, BlobKvError> {
    Box::pin(async move { service.delete_range(req).await })
}

fn unimplemented_response(path: &str) -> http::Response<tonic::body::BoxBody> {
    warn!(path = %path, "unknown method");
    Status::unimplemented(format!("Unknown method: {}", path)).into_http()
}

/// Wrapper to make KvService work with tonic's server.
#[derive(Clone)]
pub struct EtcdKvServer {
    inner: KvService,
}

impl EtcdKvServer {
    pub fn new(inner: KvService) -> Self {
        Self { inner }
    }
}

impl NamedService for EtcdKvServer {
    const NAME: &'static str = "etcdserverpb.KV";
}

impl<B> Service<http::Request<B>> for EtcdKvServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let service = self.inner.clone();
        match req.uri().path() {
            "/etcdserverpb.KV/Range" => Box::pin(async move {
                let method = UnaryMethod::new(service, range_handler);
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.unary(method, req).await)
            }),
            "/etcdserverpb.KV/Put" => Box::pin(async move {
                let method = UnaryMethod::new(service, put_handler);
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.unary(method, req).await)
            }),
            "/etcdserverpb.KV/DeleteRange" => Box::pin(async move {
                let method = UnaryMethod::new(service, delete_range_handler);
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.unary(method, req).await)
            }),
            path => {
                let response = unimplemented_response(path);
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// The bidirectional Watch method.
struct WatchMethod {
    service: WatchService,
}

impl StreamingService<proto::WatchRequest> for WatchMethod {
    type Response = proto::WatchResponse;
    type ResponseStream = WatchResponseStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(
        &mut self,
        request: tonic::Request<tonic::Streaming<proto::WatchRequest>>,
    ) -> Self::Future {
        let responses = self.service.open(request.into_inner());
        Box::pin(async move { Ok(tonic::Response::new(responses)) })
    }
}

/// Wrapper to make WatchService work with tonic's server.
#[derive(Clone)]
pub struct EtcdWatchServer {
    inner: WatchService,
}

impl EtcdWatchServer {
    pub fn new(inner: WatchService) -> Self {
        Self { inner }
    }
}

impl NamedService for EtcdWatchServer {
    const NAME: &'static str = "etcdserverpb.Watch";
}

impl<B> Service<http::Request<B>> for EtcdWatchServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        match req.uri().path() {
            "/etcdserverpb.Watch/Watch" => {
                let method = WatchMethod {
                    service: self.inner.clone(),
                };
                Box::pin(async move {
                    let mut grpc = Grpc::new(ProstCodec::default());
                    Ok(grpc.streaming(method, req).await)
                })
            }
            path => {
                let response = unimplemented_response(path);
                Box::pin(async move { Ok(response) })
            }
        }
    }
}
