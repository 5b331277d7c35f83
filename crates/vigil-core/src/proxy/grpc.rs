//! Transparent gRPC proxy.
//!
//! The listener is a raw HTTP/2 server whose single service handles *every*
//! inbound method: the method path is lifted off the request URI, the
//! selector picks a backend, and the request is bridged with the opaque
//! [`RawCodec`] into a bidirectional client stream against the backend. The
//! two one-way forwarders of the bridge are stream adapters: the inbound
//! message stream feeds the client call, and the backend's response stream is
//! returned (wrapped for error tracking) as the server's response stream. A
//! client EOF closes the send side; a backend EOF ends the response; an error
//! on either side tears the whole exchange down, and the underlying transport
//! unwinds the surviving direction.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use futures_util::StreamExt;
use http::uri::PathAndQuery;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tonic::body::BoxBody;
use tonic::server::StreamingService;
use tonic::transport::Channel;
use tonic::{Code, Request, Response, Status, Streaming};

use super::codec::RawCodec;
use crate::checker::grpc::build_channel;
use crate::config::{ConfigHandle, DEFAULT_GRPC_MSG_SIZE};
use crate::metrics;
use crate::selector::Selector;
use crate::storage::ExternalEndpointStore;
use crate::types::{Protocol, EXTERNAL_PREFIX};

/// gRPC status codes treated as the 5xx equivalent for external endpoint
/// error tracking.
pub(crate) fn is_failover_code(code: Code) -> bool {
    matches!(code, Code::Internal | Code::Unavailable | Code::DataLoss | Code::Unknown)
}

/// Transparent gRPC proxy for one network.
pub struct GrpcProxy {
    network: String,
    selector: Arc<Selector>,
    endpoints: Arc<ExternalEndpointStore>,
    config: Arc<ConfigHandle>,
    channels: DashMap<String, Channel>,
}

impl GrpcProxy {
    #[must_use]
    pub fn new(
        network: String,
        selector: Arc<Selector>,
        endpoints: Arc<ExternalEndpointStore>,
        config: Arc<ConfigHandle>,
    ) -> Arc<Self> {
        Arc::new(Self { network, selector, endpoints, config, channels: DashMap::new() })
    }

    /// Accept loop. Each connection is served as HTTP/2 with this proxy as
    /// the catch-all service; on shutdown the loop stops accepting and then
    /// awaits in-flight connections.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "grpc accept failed");
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let proxy = Arc::clone(&self);
                    connections.spawn(async move {
                        let service = hyper::service::service_fn(move |req| {
                            let proxy = Arc::clone(&proxy);
                            async move {
                                Ok::<_, std::convert::Infallible>(proxy.handle(req).await)
                            }
                        });

                        if let Err(e) = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            tracing::debug!(peer = %peer, error = %e, "grpc connection closed with error");
                        }
                    });
                }
            }
        }

        tracing::info!(network = %self.network, "grpc proxy draining in-flight connections");
        while connections.join_next().await.is_some() {}
    }

    /// Handles one inbound gRPC call of any method.
    async fn handle(
        self: Arc<Self>,
        req: http::Request<hyper::body::Incoming>,
    ) -> http::Response<BoxBody> {
        let start = Instant::now();
        let method = req.uri().path().to_string();

        tracing::debug!(method = %method, network = %self.network, "grpc proxy request received");

        let Some((_, node_name, decision)) = self.selector.best_node(&self.network, Protocol::Grpc)
        else {
            return status_response(&Status::unavailable("no available nodes"));
        };

        let Some(target) = self.selector.resolve_endpoint(&node_name, Protocol::Grpc) else {
            tracing::error!(node = %node_name, "failed to resolve grpc endpoint");
            return status_response(&Status::internal("failed to resolve endpoint"));
        };
        let is_external = node_name.starts_with(EXTERNAL_PREFIX);

        let Ok(path) = PathAndQuery::try_from(method.clone()) else {
            return status_response(&Status::internal("invalid method path"));
        };

        let cfg = self.config.snapshot();
        let (max_recv, max_send) = cfg
            .network(&self.network)
            .map_or((DEFAULT_GRPC_MSG_SIZE, DEFAULT_GRPC_MSG_SIZE), |n| n.grpc_message_sizes());
        let insecure = cfg.grpc_insecure_for(&self.network, &node_name);

        let channel = match self.connection(&target, insecure) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::error!(target = %target, error = %e, "failed to dial grpc backend");
                metrics::proxy_error(&self.network, &node_name, Protocol::Grpc, "unavailable", "dial_error");
                return status_response(&Status::unavailable("failed to connect to backend"));
            }
        };

        tracing::debug!(
            network = %self.network,
            node = %node_name,
            target = %target,
            method = %method,
            reason = decision.reason.as_str(),
            "grpc routing decision made"
        );
        metrics::node_request(&self.network, &node_name, Protocol::Grpc, &method);

        let context = ForwardContext {
            endpoints: Arc::clone(&self.endpoints),
            network: self.network.clone(),
            node: node_name,
            target,
            method,
            is_external,
            start,
        };

        let service =
            ForwardService { channel, path, max_recv, max_send, context: Arc::new(context) };

        let mut server = tonic::server::Grpc::new(RawCodec)
            .max_decoding_message_size(max_recv)
            .max_encoding_message_size(max_send);

        server.streaming(service, req).await
    }

    /// Pooled backend channel; channels reconnect lazily on failure, so a
    /// cache hit is always usable.
    fn connection(&self, target: &str, insecure: bool) -> Result<Channel, crate::checker::CheckError> {
        if let Some(existing) = self.channels.get(target) {
            return Ok(existing.clone());
        }
        let channel = build_channel(target, insecure)?;
        self.channels.insert(target.to_string(), channel.clone());
        Ok(channel)
    }

    /// Drops pooled channels. Called last during shutdown.
    pub fn close(&self) {
        self.channels.clear();
    }
}

/// Everything the error-tracking path needs once the exchange is running.
struct ForwardContext {
    endpoints: Arc<ExternalEndpointStore>,
    network: String,
    node: String,
    target: String,
    method: String,
    is_external: bool,
    start: Instant,
}

impl ForwardContext {
    /// Classifies a terminal error and feeds the endpoint store when the
    /// candidate was external and the code is a 5xx equivalent.
    fn observe_error(&self, status: &Status) {
        let code_label = (status.code() as i32).to_string();
        metrics::proxy_error(&self.network, &self.node, Protocol::Grpc, &code_label, "proxy_error");
        tracing::warn!(
            method = %self.method,
            node = %self.node,
            code = ?status.code(),
            message = %status.message(),
            "grpc proxy error"
        );

        if self.is_external && is_failover_code(status.code()) {
            if self.endpoints.track_proxy_error(&self.network, Protocol::Grpc, &self.target) {
                tracing::info!(
                    target = %self.target,
                    network = %self.network,
                    code = ?status.code(),
                    "tracked grpc 5xx-equivalent error for external endpoint"
                );
            }
        }
    }

    fn observe_end(&self, code: Code) {
        let duration = self.start.elapsed();
        metrics::proxy_request_duration(
            &self.network,
            &self.node,
            Protocol::Grpc,
            &(code as i32).to_string(),
            duration,
        );
        tracing::debug!(
            method = %self.method,
            node = %self.node,
            duration_ms = duration.as_millis() as u64,
            "grpc request completed"
        );
    }
}

/// Bridges one inbound stream onto the backend.
struct ForwardService {
    channel: Channel,
    path: PathAndQuery,
    max_recv: usize,
    max_send: usize,
    context: Arc<ForwardContext>,
}

impl StreamingService<Bytes> for ForwardService {
    type Response = Bytes;
    type ResponseStream = TrackedStream;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Response<TrackedStream>, Status>> + Send>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let mut client = tonic::client::Grpc::new(self.channel.clone())
            .max_decoding_message_size(self.max_recv)
            .max_encoding_message_size(self.max_send);
        let path = self.path.clone();
        let context = Arc::clone(&self.context);

        Box::pin(async move {
            client.ready().await.map_err(|e| {
                let status = Status::unavailable(format!("backend not ready: {e}"));
                context.observe_error(&status);
                status
            })?;

            let (metadata, _extensions, inbound) = request.into_parts();

            // Inbound → backend forwarder. An inbound EOF ends this stream,
            // which closes the client call's send side. An inbound error is
            // reported like any other direction's error — classified and fed
            // into the endpoint error counter — before the stream ends; the
            // backend side then unwinds and records the exchange's terminal
            // outcome.
            let inbound_context = Arc::clone(&context);
            let outbound = inbound.scan((), move |_, item| {
                futures::future::ready(match item {
                    Ok(frame) => Some(frame),
                    Err(status) => {
                        inbound_context.observe_error(&status);
                        None
                    }
                })
            });

            let mut outbound_request = Request::new(outbound);
            *outbound_request.metadata_mut() = metadata;

            let response =
                client.streaming(outbound_request, path, RawCodec).await.map_err(|status| {
                    context.observe_error(&status);
                    context.observe_end(status.code());
                    status
                })?;

            let (metadata, backend_stream, _extensions) = response.into_parts();

            let mut proxied = Response::new(TrackedStream {
                inner: backend_stream,
                context,
                finished: false,
            });
            *proxied.metadata_mut() = metadata;
            Ok(proxied)
        })
    }
}

/// Backend → inbound forwarder: passes frames through and records the final
/// outcome (EOF or error status) exactly once.
struct TrackedStream {
    inner: Streaming<Bytes>,
    context: Arc<ForwardContext>,
    finished: bool,
}

impl Stream for TrackedStream {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Err(status))) => {
                if !self.finished {
                    self.finished = true;
                    self.context.observe_error(&status);
                    self.context.observe_end(status.code());
                }
                Poll::Ready(Some(Err(status)))
            }
            Poll::Ready(None) => {
                if !self.finished {
                    self.finished = true;
                    self.context.observe_end(Code::Ok);
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

/// Builds the trailers-only HTTP response for a locally-generated status.
fn status_response(status: &Status) -> http::Response<BoxBody> {
    let mut response = http::Response::new(tonic::body::empty_body());
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    response.headers_mut().insert("grpc-status", http::HeaderValue::from(status.code() as i32));
    if let Ok(message) = http::HeaderValue::from_str(status.message()) {
        response.headers_mut().insert("grpc-message", message);
    }
    response
}
