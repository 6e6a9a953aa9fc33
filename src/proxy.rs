//! The dispatcher, wired into pingora's proxy lifecycle.
//!
//! Unlike the round-robin tutorial this is grounded in (chapter 04 of
//! the pingora-learning pack), the whole per-request decision —
//! templating, ring lookup, retry loop, relay — is resolved inside
//! `request_filter` and the handler always short-circuits there
//! (`Ok(true)`). This mirrors the Go original's dispatcher, which
//! builds its own outbound `http.Client` request per candidate rather
//! than delegating to a generic streaming-proxy engine; pingora here
//! plays the role Go's `net/http.ListenAndServe` played — accept loop
//! and response writer, nothing more.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora::proxy::{ProxyHttp, Session};

use crate::config::OptionsConfig;
use crate::dispatch::{resolve_hash_key, retry_order, start_index, DispatchError};
use crate::metrics::MetricsPool;
use crate::ring::HashRing;
use crate::template::{self, ConnectionExtra, RequestFacts};

const DEFAULT_BACKEND_REQUEST_TIMEOUT_MS: u64 = 40;

/// Ties together the pieces a single listener needs: its ring (read
/// side), its options, and the shared metrics surface. The proxy's
/// health flag lives with the supervisor instead (see `main.rs`) since
/// nothing in the request path ever needs to read or flip it.
pub struct HashRingProxy {
    pub proxy_name: String,
    pub ring: Arc<HashRing>,
    pub options: OptionsConfig,
    pub hash_key_pattern: String,
    pub show_access_logs: bool,
    pub access_logs_fields: Vec<String>,
    pub enable_request_body_logs: bool,
    pub enable_request_body_logs_json_parsing: bool,
    pub metrics: Arc<MetricsPool>,
    backend_client: reqwest::Client,
}

impl HashRingProxy {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        proxy_name: String,
        ring: Arc<HashRing>,
        options: OptionsConfig,
        hash_key_pattern: String,
        show_access_logs: bool,
        access_logs_fields: Vec<String>,
        enable_request_body_logs: bool,
        enable_request_body_logs_json_parsing: bool,
        metrics: Arc<MetricsPool>,
    ) -> Self {
        let backend_client = build_backend_client(&options);
        Self {
            proxy_name,
            ring,
            options,
            hash_key_pattern,
            show_access_logs,
            access_logs_fields,
            enable_request_body_logs,
            enable_request_body_logs_json_parsing,
            metrics,
            backend_client,
        }
    }

    fn backend_request_timeout(&self) -> Duration {
        if self.options.http_backend_request_timeout_ms > 0 {
            Duration::from_millis(self.options.http_backend_request_timeout_ms)
        } else {
            Duration::from_millis(DEFAULT_BACKEND_REQUEST_TIMEOUT_MS)
        }
    }

    /// Apply `http_server_read_timeout_ms`/`write_timeout_ms`/
    /// `disable_keep_alives` to the downstream connection this request
    /// arrived on. Called once at the top of `request_filter`, before
    /// any backend work starts, so a slow client can't hold a listener
    /// thread open past what's configured.
    fn apply_server_options(&self, session: &mut Session) {
        if self.options.http_server_read_timeout_ms > 0 {
            session.set_read_timeout(Some(Duration::from_millis(
                self.options.http_server_read_timeout_ms,
            )));
        }
        if self.options.http_server_write_timeout_ms > 0 {
            session.set_write_timeout(Some(Duration::from_millis(
                self.options.http_server_write_timeout_ms,
            )));
        }
        if self.options.http_server_disable_keep_alives {
            session.set_keepalive(None);
        }
    }
}

fn build_backend_client(options: &OptionsConfig) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    if options.http_backend_dial_timeout_ms > 0 {
        builder = builder.connect_timeout(Duration::from_millis(options.http_backend_dial_timeout_ms));
    }
    if options.http_backend_disable_keep_alives {
        builder = builder.pool_max_idle_per_host(0);
    } else if options.http_backend_keep_alive_ms > 0 {
        builder = builder.pool_idle_timeout(Duration::from_millis(options.http_backend_keep_alive_ms));
    }
    builder.build().expect("valid backend http client configuration")
}

fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn normalized_headers(headers: &pingora::http::RequestHeader) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (name, value) in headers.headers.iter() {
        let normalized = template::capitalize_header_name(name.as_str());
        if let Ok(value) = value.to_str() {
            map.insert(normalized, value.to_string());
        }
    }
    map
}

fn normalized_response_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (name, value) in headers.iter() {
        let normalized = template::capitalize_header_name(name.as_str());
        if let Ok(value) = value.to_str() {
            map.insert(normalized, value.to_string());
        }
    }
    map
}

fn request_facts(session: &Session) -> RequestFacts {
    let header = session.req_header();
    let uri = &header.uri;
    RequestFacts {
        scheme: uri.scheme_str().unwrap_or("http").to_string(),
        host: uri.host().unwrap_or_default().to_string(),
        port: uri.port_u16().map(|p| p.to_string()).unwrap_or_default(),
        path: uri.path().to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        method: header.method.to_string(),
        proto: format!("{:?}", header.version),
    }
}

/// The inbound body read once as a chunk list (no contiguous-copy
/// concatenation, so the same chunks are cheaply reusable across retry
/// candidates), plus an optional capture of the same bytes for the
/// request log. The capture buffer is only ever allocated when request
/// body logging is on; when it's off the body is still read through to
/// the outbound request, but nothing extra is kept around for it.
struct TeeBody {
    chunks: Vec<Bytes>,
    capture: Option<Vec<u8>>,
}

async fn read_body_with_tee(session: &mut Session, capture_enabled: bool) -> pingora::Result<TeeBody> {
    let mut chunks = Vec::new();
    let mut capture = capture_enabled.then(Vec::new);

    while let Some(chunk) = session.read_request_body().await? {
        if let Some(buf) = capture.as_mut() {
            buf.extend_from_slice(&chunk);
        }
        chunks.push(chunk);
    }

    Ok(TeeBody { chunks, capture })
}

fn body_stream(chunks: Vec<Bytes>) -> reqwest::Body {
    reqwest::Body::wrap_stream(futures::stream::iter(
        chunks.into_iter().map(Ok::<Bytes, std::io::Error>),
    ))
}

/// Render a captured request body for the access log: parsed and
/// re-serialized as JSON when `json_parsing` is on and the bytes
/// actually are JSON, otherwise the raw (lossily-decoded) text.
fn render_captured_body(bytes: &[u8], json_parsing: bool) -> String {
    if json_parsing {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
            return value.to_string();
        }
    }
    String::from_utf8_lossy(bytes).into_owned()
}

async fn write_direct_response(
    session: &mut Session,
    status: u16,
    reason: &str,
) -> pingora::Result<()> {
    let message = format!("{status} {reason}\n");

    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header("Content-Type", "text/plain")?;
    header.insert_header("Content-Length", message.len().to_string())?;

    session.write_response_header(Box::new(header), false).await?;
    session
        .write_response_body(Some(Bytes::from(message)), true)
        .await?;
    Ok(())
}

pub struct DispatchCtx;

#[async_trait]
impl ProxyHttp for HashRingProxy {
    type CTX = DispatchCtx;

    fn new_ctx(&self) -> Self::CTX {
        DispatchCtx
    }

    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        self.apply_server_options(session);

        let request_id = generate_request_id();
        let facts = request_facts(session);
        let method = facts.method.clone();
        let request_headers = normalized_headers(session.req_header());
        let outbound_headers = session.req_header().headers.clone();

        let expanded_hash_key = template::expand_hash_key(&self.hash_key_pattern, &facts, &request_headers);
        let hash_key = match resolve_hash_key(&expanded_hash_key) {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(proxy = %self.proxy_name, request_id, "error calculating hash_key");
                self.metrics
                    .observe_request(&self.proxy_name, &method, 500, err.as_label());
                write_direct_response(session, 500, "Internal Server Error").await?;
                return Ok(true);
            }
        };

        let mut extra = ConnectionExtra {
            request_id: request_id.clone(),
            hash_key: hash_key.clone(),
            backend: "none".to_string(),
        };

        let primary = self.ring.lookup(&hash_key);
        let pool = self.ring.servers();

        if pool.is_empty() {
            tracing::error!(proxy = %self.proxy_name, request_id, "failed connecting to all backend servers: no backends found");
            self.metrics
                .observe_request(&self.proxy_name, &method, 503, DispatchError::NoBackendsFound.as_label());
            write_direct_response(session, 503, "Service Unavailable").await?;
            return Ok(true);
        }

        let start = start_index(&pool, primary.as_deref());
        let order = retry_order(&pool, start);

        let tee = read_body_with_tee(session, self.enable_request_body_logs).await?;
        let body_chunks = tee.chunks;
        let backend_timeout = self.backend_request_timeout();

        let mut success: Option<(String, reqwest::Response)> = None;

        for candidate in &order {
            let url = format!(
                "http://{}{}?{}",
                candidate, facts.path, facts.query
            );

            let mut builder = self
                .backend_client
                .request(
                    reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET),
                    &url,
                )
                .timeout(backend_timeout)
                .body(body_stream(body_chunks.clone()));

            for (name, value) in outbound_headers.iter() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }

            match builder.send().await {
                Ok(resp) => {
                    success = Some((candidate.clone(), resp));
                    break;
                }
                Err(err) => {
                    tracing::debug!(proxy = %self.proxy_name, request_id, backend = %candidate, error = %err, "failed connecting to backend");
                    self.metrics.observe_backend_failure(&self.proxy_name, &method);

                    if !self.options.try_another_backend_on_failure {
                        tracing::info!(proxy = %self.proxy_name, request_id, "try_another_backend_on_failure disabled, skip trying another backend");
                        break;
                    }
                }
            }
        }

        let Some((backend, resp)) = success else {
            tracing::error!(proxy = %self.proxy_name, request_id, "failed connecting to all backend servers");
            self.metrics
                .observe_request(&self.proxy_name, &method, 503, DispatchError::AllBackendsFailed.as_label());
            write_direct_response(session, 503, "Service Unavailable").await?;
            return Ok(true);
        };

        extra.backend = backend;

        if self.show_access_logs {
            let mut fields = template::request_log_fields(&self.access_logs_fields, &facts, &request_headers, &extra);
            if let Some(captured) = &tee.capture {
                let body = render_captured_body(captured, self.enable_request_body_logs_json_parsing);
                fields.push(("request_body".to_string(), body));
            }
            tracing::info!(proxy = %self.proxy_name, event = "request", ?fields);
        }

        let status = resp.status().as_u16();
        let response_headers = normalized_response_headers(resp.headers());

        let mut header = ResponseHeader::build(status, None)?;
        for (name, value) in resp.headers().iter() {
            header.append_header(name.as_str().to_string(), value.as_bytes().to_vec())?;
        }
        session.write_response_header(Box::new(header), false).await?;

        let mut error_label = DispatchError::None;
        let mut stream = resp.bytes_stream();
        use futures::StreamExt;
        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if let Err(err) = session.write_response_body(Some(chunk), false).await {
                        tracing::error!(proxy = %self.proxy_name, request_id, error = %err, "failed copying body to the frontend");
                        error_label = DispatchError::BodyCopyFailed;
                        break;
                    }
                }
                Some(Err(err)) => {
                    tracing::error!(proxy = %self.proxy_name, request_id, error = %err, "failed copying body to the frontend");
                    error_label = DispatchError::BodyCopyFailed;
                    break;
                }
                None => break,
            }
        }
        let _ = session.write_response_body(None, true).await;

        self.metrics
            .observe_request(&self.proxy_name, &method, status, error_label.as_label());

        if self.show_access_logs {
            let fields = template::response_log_fields(&self.access_logs_fields, &response_headers, &extra, status);
            tracing::info!(proxy = %self.proxy_name, event = "response", ?fields);
        }

        Ok(true)
    }

    /// Never reached: `request_filter` always resolves the response
    /// itself and returns `Ok(true)`.
    async fn upstream_peer(&self, _session: &mut Session, _ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        Err(Error::new(ErrorType::InternalError))
    }
}
