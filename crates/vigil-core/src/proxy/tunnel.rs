//! Raw WebSocket tunnel: hijack the client connection, speak the upgrade to
//! the backend ourselves, then shuttle bytes both ways until either side
//! closes.
//!
//! The tunnel never interprets WebSocket frames. The client's original
//! upgrade request is re-serialized with the Host rewritten, the backend's
//! response head is forwarded verbatim, and from then on two one-way copiers
//! run until the first one finishes or errors; dropping both sockets unwinds
//! the other direction.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::http::HttpProxy;
use crate::metrics;
use crate::types::Protocol;

/// Upper bound on the backend's response head. Anything larger is broken.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Handles a WebSocket upgrade request end to end.
///
/// The candidate has already been selected and its `websocket_available`
/// flag checked by the caller.
pub(crate) async fn proxy_websocket(
    proxy: Arc<HttpProxy>,
    mut req: Request,
    target_url: &str,
    node_name: &str,
    start: Instant,
) -> Response {
    let network = proxy.network().to_string();
    let protocol = proxy.protocol();

    let Ok(target) = url::Url::parse(target_url) else {
        tracing::error!(url = %target_url, "failed to parse tunnel target URL");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
    };
    let Some(host) = target.host_str().map(str::to_string) else {
        tracing::error!(url = %target_url, "tunnel target URL has no host");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
    };
    let tls = target.scheme() == "https" || target.scheme() == "wss";
    let port = target.port().unwrap_or(if tls { 443 } else { 80 });
    let host_header = if target.port().is_some() { format!("{host}:{port}") } else { host.clone() };

    // The upgrade handle must come off the request before the head is
    // consumed; without it there is no client connection to hijack.
    let Some(on_upgrade) = req.extensions_mut().remove::<hyper::upgrade::OnUpgrade>() else {
        tracing::error!("client connection does not support upgrades");
        return (StatusCode::INTERNAL_SERVER_ERROR, "WebSocket not supported").into_response();
    };

    let mut backend: Box<dyn AsyncStream> = match connect_backend(&host, port, tls).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(host = %host, port, error = %e, "failed to connect to backend");
            metrics::proxy_error(&network, node_name, protocol, "502", "backend_connect_error");
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    let head = serialize_upgrade_request(&req, &host_header);
    if let Err(e) = backend.write_all(head.as_bytes()).await {
        tracing::error!(error = %e, "failed to write upgrade request to backend");
        metrics::proxy_error(&network, node_name, protocol, "502", "upgrade_forward_error");
        return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
    }

    let mut reader = BufReader::new(backend);
    let (status, headers) = match read_response_head(&mut reader).await {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::error!(error = %e, "failed to read upgrade response from backend");
            metrics::proxy_error(&network, node_name, protocol, "502", "upgrade_response_error");
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    // Forward the backend's response head to the client as-is. Only a 101
    // switches protocols; anything else terminates the exchange here.
    let mut builder = http::Response::builder().status(status);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let response = builder
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());

    if status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        tracing::warn!(status, "backend refused websocket upgrade");
        metrics::node_request(&network, node_name, protocol, "WEBSOCKET");
        return response;
    }

    let node = node_name.to_string();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                tracing::error!(error = %e, "client upgrade failed after 101");
                return;
            }
        };
        let client = TokioIo::new(upgraded);

        // Frames the backend sent together with its response head are
        // sitting in the buffered reader; flush them to the client before
        // the copiers start.
        let leftover = reader.buffer().to_vec();
        let backend = reader.into_inner();

        run_tunnel(client, backend, leftover, &network, &node, protocol, start).await;
    });

    response
}

async fn connect_backend(
    host: &str,
    port: u16,
    tls: bool,
) -> std::io::Result<Box<dyn AsyncStream>> {
    let tcp = TcpStream::connect((host, port)).await?;
    tcp.set_nodelay(true)?;

    if !tls {
        return Ok(Box::new(tcp));
    }

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    Ok(Box::new(connector.connect(server_name, tcp).await?))
}

/// Re-serializes the client's upgrade request with the Host rewritten to the
/// backend. Upgrade requests carry no body.
fn serialize_upgrade_request(req: &Request, host_header: &str) -> String {
    let path_and_query =
        req.uri().path_and_query().map(http::uri::PathAndQuery::as_str).unwrap_or("/");

    let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", req.method(), path_and_query, host_header);
    for (name, value) in req.headers() {
        if name == http::header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
    }
    head.push_str("\r\n");
    head
}

/// Reads an HTTP/1.1 response head (status line + headers) off the backend.
async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> std::io::Result<(u16, Vec<(String, String)>)> {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;

    let status = parse_status_line(&status_line)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad status line"))?;

    let mut headers = Vec::new();
    let mut total = status_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "backend closed during response head",
            ));
        }
        total += n;
        if total > MAX_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "response head too large",
            ));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok((status, headers))
}

fn parse_status_line(line: &str) -> Option<u16> {
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Runs the two one-way copiers until either direction finishes or errors.
async fn run_tunnel<C, B>(
    client: C,
    backend: B,
    leftover: Vec<u8>,
    network: &str,
    node: &str,
    protocol: Protocol,
    start: Instant,
) where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    if !leftover.is_empty() {
        if let Err(e) = client_write.write_all(&leftover).await {
            tracing::debug!(error = %e, "failed to flush buffered backend bytes to client");
            return;
        }
    }

    let client_to_backend = async {
        let mut buf = [0u8; 8 * 1024];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    if let Err(e) = backend_write.write_all(&buf[..n]).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    };

    let backend_to_client = async {
        let mut buf = [0u8; 8 * 1024];
        loop {
            match backend_read.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    if let Err(e) = client_write.write_all(&buf[..n]).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    };

    // First direction to finish wins; both sockets drop on return, which
    // unwinds whichever copier was still running.
    let result = tokio::select! {
        r = client_to_backend => r,
        r = backend_to_client => r,
    };

    let duration = start.elapsed();
    metrics::node_request(network, node, protocol, "WEBSOCKET");
    metrics::proxy_request_duration(network, node, protocol, "101", duration);

    match result {
        Ok(()) => {
            tracing::debug!(
                network,
                node,
                duration_ms = duration.as_millis() as u64,
                "websocket tunnel closed normally"
            );
        }
        Err(e) => {
            metrics::proxy_error(network, node, protocol, "101", "websocket_error");
            tracing::debug!(
                network,
                node,
                error = %e,
                duration_ms = duration.as_millis() as u64,
                "websocket tunnel closed with error"
            );
        }
    }
}
