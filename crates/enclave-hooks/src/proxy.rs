//! Pod subresource proxying and virtual API passthrough.
//!
//! exec/attach/portforward arrive as WebSocket upgrades speaking the
//! Kubernetes channel protocol; they are name-translated and bridged to
//! the host cluster with kube-rs, so the host kubelet serves the actual
//! streams. Logs stream over plain HTTP. Every other request falls through
//! to the virtual API server untouched.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, LogParams, TerminalSize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::error::Error;
use crate::server::HookState;

/// Kubernetes WebSocket subprotocols, newest first. Without the
/// negotiation kubectl drops the connection right after the upgrade.
const K8S_PROTOCOLS: [&str; 5] = [
    "v5.channel.k8s.io",
    "v4.channel.k8s.io",
    "v3.channel.k8s.io",
    "v2.channel.k8s.io",
    "channel.k8s.io",
];

/// Channel bytes of the Kubernetes streaming protocol
mod channel {
    pub const STDIN: u8 = 0;
    pub const STDOUT: u8 = 1;
    pub const STDERR: u8 = 2;
    pub const ERROR: u8 = 3;
    pub const RESIZE: u8 = 4;
}

/// Maximum buffered request body for passthrough (matches the apiserver's
/// own request size limit ballpark)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

// =============================================================================
// Passthrough to the virtual API server
// =============================================================================

/// A request forwarded to the virtual API server
#[derive(Clone, Debug)]
pub struct UpstreamRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

/// A streamed response from the virtual API server
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: BoxStream<'static, Result<Bytes, std::io::Error>>,
}

/// Client for the virtual API server behind the hooks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Forward one request, streaming the response body (watch requests
    /// stay open indefinitely)
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, Error>;
}

/// [`UpstreamClient`] backed by reqwest.
pub struct ReqwestUpstream {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestUpstream {
    /// Build a client for the given base URL, trusting the provided CA
    /// bundle (the virtual control plane's self-signed CA).
    pub fn new(base_url: impl Into<String>, ca_pem: Option<&[u8]>) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::Internal(format!("invalid upstream CA: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("failed to build upstream client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstream {
    async fn forward(&self, request: UpstreamRequest) -> Result<UpstreamResponse, Error> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::BadRequest(format!("invalid method: {}", request.method)))?;
        let url = format!("{}{}", self.base_url, request.path_and_query);

        let mut builder = self.client.request(method, &url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_slice());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("virtual API server: {}", e)))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
            .collect();
        let body = response.bytes_stream().map_err(std::io::Error::other).boxed();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Fallback handler: everything the hooks do not intercept goes to the
/// virtual API server unchanged.
pub async fn passthrough(
    State(state): State<Arc<HookState>>,
    request: Request<Body>,
) -> Result<Response, Error> {
    let method = request.method().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let headers = forwardable_headers(request.headers());
    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| Error::BadRequest(format!("failed to read request body: {}", e)))?;

    debug!(method = %method, path = %path_and_query, "passing through to virtual API server");

    let upstream = state
        .upstream
        .forward(UpstreamRequest {
            method,
            path_and_query,
            headers,
            body: body.to_vec(),
        })
        .await?;

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in &upstream.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_bytes(value),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from_stream(upstream.body))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}

fn forwardable_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.to_string(), value.as_bytes().to_vec()))
        .collect()
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "upgrade"
            | "keep-alive"
            | "proxy-authorization"
            | "proxy-authenticate"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "host"
            | "content-length"
    )
}

// =============================================================================
// Pod subresources: exec / attach
// =============================================================================

/// POST-or-GET /api/v1/namespaces/{ns}/pods/{name}/exec
pub async fn pod_exec(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HookState>>,
    Path((namespace, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let query = query.unwrap_or_default();
    ws.protocols(K8S_PROTOCOLS).on_upgrade(move |socket| {
        bridge_exec(socket, state, namespace, name, query, Subresource::Exec)
    })
}

/// POST-or-GET /api/v1/namespaces/{ns}/pods/{name}/attach
pub async fn pod_attach(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HookState>>,
    Path((namespace, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let query = query.unwrap_or_default();
    ws.protocols(K8S_PROTOCOLS).on_upgrade(move |socket| {
        bridge_exec(socket, state, namespace, name, query, Subresource::Attach)
    })
}

#[derive(Clone, Copy, Debug)]
enum Subresource {
    Exec,
    Attach,
}

/// Bridge a client WebSocket to an exec/attach session against the host
/// pod, translating the virtual identity on the way.
async fn bridge_exec(
    socket: WebSocket,
    state: Arc<HookState>,
    namespace: String,
    name: String,
    query: String,
    subresource: Subresource,
) {
    let host_namespace = state.translator.host_namespace(&namespace);
    let host_name = state.translator.host_name(&name, &namespace);

    info!(
        pod = %format!("{}/{}", namespace, name),
        host_pod = %format!("{}/{}", host_namespace, host_name),
        ?subresource,
        "bridging pod session to host"
    );

    let (mut sender, mut receiver) = socket.split();
    let pods: Api<Pod> = Api::namespaced(state.host_client.clone(), &host_namespace);

    let params = attach_params(&query);
    let command = query_values(&query, "command");

    let attached = match subresource {
        Subresource::Exec => pods.exec(&host_name, command, &params).await,
        Subresource::Attach => pods.attach(&host_name, &params).await,
    };
    let mut attached = match attached {
        Ok(attached) => attached,
        Err(e) => {
            error!(error = %e, "failed to start host session");
            send_error_and_close(&mut sender, &format!("host session failed: {}", e)).await;
            return;
        }
    };

    let (output_tx, mut output_rx) = tokio::sync::mpsc::channel::<(u8, Vec<u8>)>(64);

    if let Some(stdout) = attached.stdout() {
        let tx = output_tx.clone();
        tokio::spawn(pump_reader(stdout, tx, channel::STDOUT));
    }
    if let Some(stderr) = attached.stderr() {
        let tx = output_tx.clone();
        tokio::spawn(pump_reader(stderr, tx, channel::STDERR));
    }
    drop(output_tx);

    let mut stdin = attached.stdin();
    let mut terminal_size = attached.terminal_size();

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Binary(frame))) => {
                        let Some((ch, payload)) = split_frame(&frame) else { continue };
                        match ch {
                            channel::STDIN => {
                                if let Some(writer) = stdin.as_mut() {
                                    if writer.write_all(payload).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            channel::RESIZE => {
                                if let (Some(tx), Some(size)) =
                                    (terminal_size.as_mut(), parse_resize(payload))
                                {
                                    let _ = tx.send(size).await;
                                }
                            }
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "client websocket error");
                        break;
                    }
                }
            }
            outgoing = output_rx.recv() => {
                match outgoing {
                    Some((ch, data)) => {
                        if sender.send(Message::Binary(build_frame(ch, &data).into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
    if let Err(e) = attached.join().await {
        debug!(error = %e, "host session ended with error");
    }
}

async fn pump_reader(
    mut reader: impl AsyncRead + Unpin,
    tx: tokio::sync::mpsc::Sender<(u8, Vec<u8>)>,
    ch: u8,
) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send((ch, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
        }
    }
}

// =============================================================================
// Pod subresource: port-forward
// =============================================================================

/// GET /api/v1/namespaces/{ns}/pods/{name}/portforward
pub async fn pod_portforward(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HookState>>,
    Path((namespace, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> impl IntoResponse {
    let query = query.unwrap_or_default();
    ws.protocols(["v4.channel.k8s.io", "v3.channel.k8s.io"])
        .on_upgrade(move |socket| bridge_portforward(socket, state, namespace, name, query))
}

/// Bridge the WebSocket port-forward protocol: each requested port owns a
/// data channel (2n) and an error channel (2n+1), and the first frame on
/// each carries the port number, little-endian.
async fn bridge_portforward(
    socket: WebSocket,
    state: Arc<HookState>,
    namespace: String,
    name: String,
    query: String,
) {
    let host_namespace = state.translator.host_namespace(&namespace);
    let host_name = state.translator.host_name(&name, &namespace);

    let ports: Vec<u16> = query_values(&query, "ports")
        .iter()
        .flat_map(|v| v.split(','))
        .filter_map(|p| p.parse().ok())
        .collect();

    let (mut sender, mut receiver) = socket.split();
    if ports.is_empty() {
        send_error_and_close(&mut sender, "no ports requested").await;
        return;
    }

    info!(
        pod = %format!("{}/{}", namespace, name),
        ?ports,
        "bridging port-forward to host"
    );

    let pods: Api<Pod> = Api::namespaced(state.host_client.clone(), &host_namespace);
    let mut forwarder = match pods.portforward(&host_name, &ports).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            error!(error = %e, "failed to start host port-forward");
            send_error_and_close(&mut sender, &format!("port-forward failed: {}", e)).await;
            return;
        }
    };

    // announce each channel with its port number
    for (index, port) in ports.iter().enumerate() {
        let announce = port.to_le_bytes();
        for offset in [0u8, 1u8] {
            let frame = build_frame(index as u8 * 2 + offset, &announce);
            if sender.send(Message::Binary(frame.into())).await.is_err() {
                return;
            }
        }
    }

    let (output_tx, mut output_rx) = tokio::sync::mpsc::channel::<(u8, Vec<u8>)>(64);
    let mut writers = Vec::new();

    for (index, port) in ports.iter().enumerate() {
        let Some(stream) = forwarder.take_stream(*port) else {
            send_error_and_close(&mut sender, &format!("port {} unavailable", port)).await;
            return;
        };
        let (read_half, write_half) = tokio::io::split(stream);
        let tx = output_tx.clone();
        tokio::spawn(pump_reader(read_half, tx, index as u8 * 2));
        writers.push(write_half);
    }
    drop(output_tx);

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Binary(frame))) => {
                        let Some((ch, payload)) = split_frame(&frame) else { continue };
                        // even channels carry data; odd ones are error streams
                        if ch % 2 != 0 {
                            continue;
                        }
                        let index = (ch / 2) as usize;
                        if let Some(writer) = writers.get_mut(index) {
                            if writer.write_all(payload).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            outgoing = output_rx.recv() => {
                match outgoing {
                    Some((ch, data)) => {
                        if sender.send(Message::Binary(build_frame(ch, &data).into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// =============================================================================
// Pod subresource: logs
// =============================================================================

/// GET /api/v1/namespaces/{ns}/pods/{name}/log
pub async fn pod_logs(
    State(state): State<Arc<HookState>>,
    Path((namespace, name)): Path<(String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response, Error> {
    let query = query.unwrap_or_default();
    let host_namespace = state.translator.host_namespace(&namespace);
    let host_name = state.translator.host_name(&name, &namespace);

    let params = log_params(&query);
    let pods: Api<Pod> = Api::namespaced(state.host_client.clone(), &host_namespace);
    let stream = pods.log_stream(&host_name, &params).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/plain")
        .body(Body::from_stream(ReaderStream::new(stream.compat())))
        .map_err(|e| Error::Internal(format!("failed to build log response: {}", e)))
}

// =============================================================================
// Query parsing and channel framing
// =============================================================================

fn attach_params(query: &str) -> AttachParams {
    AttachParams {
        stdin: query_flag(query, "stdin"),
        stdout: query_flag(query, "stdout"),
        stderr: query_flag(query, "stderr"),
        tty: query_flag(query, "tty"),
        container: query_values(query, "container").into_iter().next(),
        ..Default::default()
    }
}

fn log_params(query: &str) -> LogParams {
    LogParams {
        container: query_values(query, "container").into_iter().next(),
        follow: query_flag(query, "follow"),
        previous: query_flag(query, "previous"),
        timestamps: query_flag(query, "timestamps"),
        tail_lines: query_values(query, "tailLines")
            .into_iter()
            .next()
            .and_then(|v| v.parse().ok()),
        since_seconds: query_values(query, "sinceSeconds")
            .into_iter()
            .next()
            .and_then(|v| v.parse().ok()),
        ..Default::default()
    }
}

/// All values of a repeated query parameter, percent-decoded.
fn query_values(query: &str, key: &str) -> Vec<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .filter(|(k, _)| *k == key)
        .map(|(_, v)| percent_decode(v))
        .collect()
}

fn query_flag(query: &str, key: &str) -> bool {
    query_values(query, key)
        .first()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn build_frame(ch: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(ch);
    frame.extend_from_slice(payload);
    frame
}

fn split_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    let (first, rest) = frame.split_first()?;
    Some((*first, rest))
}

fn parse_resize(payload: &[u8]) -> Option<TerminalSize> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    Some(TerminalSize {
        width: value.get("Width")?.as_u64()? as u16,
        height: value.get("Height")?.as_u64()? as u16,
    })
}

async fn send_error_and_close(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: &str,
) {
    warn!(message = %message, "closing client websocket with error");
    let frame = build_frame(channel::ERROR, message.as_bytes());
    let _ = sender.send(Message::Binary(frame.into())).await;
    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_handles_repeats_and_decoding() {
        let query = "command=sh&command=-c&command=echo%20hi&container=app&stdin=true";
        assert_eq!(query_values(query, "command"), vec!["sh", "-c", "echo hi"]);
        assert_eq!(query_values(query, "container"), vec!["app"]);
        assert!(query_flag(query, "stdin"));
        assert!(!query_flag(query, "tty"));
    }

    #[test]
    fn attach_params_reflect_the_query() {
        let params = attach_params("stdin=true&stdout=true&tty=true&container=main");
        assert!(params.stdin);
        assert!(params.stdout);
        assert!(params.tty);
        assert_eq!(params.container.as_deref(), Some("main"));
        assert!(!params.stderr);
    }

    #[test]
    fn log_params_reflect_the_query() {
        let params = log_params("follow=true&tailLines=100&container=app");
        assert!(params.follow);
        assert_eq!(params.tail_lines, Some(100));
        assert_eq!(params.container.as_deref(), Some("app"));
        assert!(!params.previous);
    }

    #[test]
    fn frames_round_trip() {
        let frame = build_frame(channel::STDOUT, b"hello");
        let (ch, payload) = split_frame(&frame).unwrap();
        assert_eq!(ch, channel::STDOUT);
        assert_eq!(payload, b"hello");
        assert!(split_frame(&[]).is_none());
    }

    #[test]
    fn resize_messages_parse() {
        let size = parse_resize(br#"{"Width": 120, "Height": 40}"#).unwrap();
        assert_eq!(size.width, 120);
        assert_eq!(size.height, 40);
        assert!(parse_resize(b"junk").is_none());
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("authorization"));
        assert!(!is_hop_by_hop("accept"));
    }

    #[test]
    fn percent_decoding_is_safe_on_malformed_input() {
        assert_eq!(percent_decode("a%2Fb"), "a/b");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("broken%2"), "broken%2");
        assert_eq!(percent_decode("broken%zz"), "broken%zz");
    }
}
