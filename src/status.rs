//! Status flag and the `/health` + `/metrics` HTTP surface.
//!
//! The Go original keeps a package-level `globals.Application.ProxyPool`
//! singleton for `proxyHealthHandleFunc` to read. DESIGN NOTES §9 asks
//! for a registry object instead; `ProxyRegistry` is that object, built
//! once in the supervisor and handed both to each engine (as the
//! writer) and to this webserver (as the reader).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, TextEncoder};

use crate::metrics::MetricsPool;

/// A single proxy's health flag: false until its listener has bound
/// successfully, false again if its serve loop ever returns an error.
#[derive(Debug, Default)]
pub struct ProxyStatus {
    is_healthy: RwLock<bool>,
}

impl ProxyStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.is_healthy.write().expect("status lock poisoned") = healthy;
    }

    pub fn is_healthy(&self) -> bool {
        *self.is_healthy.read().expect("status lock poisoned")
    }
}

/// Name -> status lookup for every configured proxy, shared by the
/// supervisor, every engine, and the `/health` handler.
#[derive(Debug, Default, Clone)]
pub struct ProxyRegistry {
    proxies: Arc<HashMap<String, Arc<ProxyStatus>>>,
}

impl ProxyRegistry {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        let proxies = names
            .into_iter()
            .map(|name| (name, Arc::new(ProxyStatus::new())))
            .collect();
        Self {
            proxies: Arc::new(proxies),
        }
    }

    /// Build a registry from statuses the caller already owns, so the
    /// same `Arc<ProxyStatus>` can be handed to both an engine (writer)
    /// and this registry (reader) for the same proxy.
    pub fn from_statuses(statuses: impl IntoIterator<Item = (String, Arc<ProxyStatus>)>) -> Self {
        Self {
            proxies: Arc::new(statuses.into_iter().collect()),
        }
    }

    pub fn status(&self, name: &str) -> Option<Arc<ProxyStatus>> {
        self.proxies.get(name).cloned()
    }
}

fn health_response(registry: &ProxyRegistry, proxy_name: &str) -> Response<Body> {
    match registry.status(proxy_name) {
        None => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("NOT FOUND"))
            .unwrap(),
        Some(status) if !status.is_healthy() => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(Body::from("SERVICE UNAVAILABLE"))
            .unwrap(),
        Some(_) => Response::builder()
            .status(StatusCode::OK)
            .body(Body::from("OK"))
            .unwrap(),
    }
}

fn metrics_response(metrics: &MetricsPool) -> Response<Body> {
    let encoder = TextEncoder::new();
    let families = metrics.registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .expect("encode prometheus metrics");

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap()
}

async fn route(
    req: Request<Body>,
    registry: ProxyRegistry,
    metrics: Arc<MetricsPool>,
) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_string();

    if req.method() != Method::GET {
        return Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Body::empty())
            .unwrap());
    }

    if path == "/metrics" {
        return Ok(metrics_response(&metrics));
    }

    if let Some(name) = path
        .strip_prefix('/')
        .and_then(|rest| rest.strip_suffix("/health"))
    {
        return Ok(health_response(&registry, name));
    }

    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("NOT FOUND"))
        .unwrap())
}

/// Serve `/metrics` and `GET /{name}/health` on `addr` until the
/// process exits. Intended to be spawned as its own long-lived task by
/// the supervisor.
pub async fn run_status_webserver(
    addr: std::net::SocketAddr,
    registry: ProxyRegistry,
    metrics: Arc<MetricsPool>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                route(req, registry.clone(), metrics.clone())
            }))
        }
    });

    tracing::info!(%addr, "starting status/metrics webserver");
    Server::bind(&addr).serve(make_svc).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_proxy_is_not_found() {
        let registry = ProxyRegistry::new(["demo".to_string()]);
        let resp = health_response(&registry, "missing");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unhealthy_proxy_is_service_unavailable() {
        let registry = ProxyRegistry::new(["demo".to_string()]);
        let resp = health_response(&registry, "demo");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn healthy_proxy_is_ok() {
        let registry = ProxyRegistry::new(["demo".to_string()]);
        registry.status("demo").unwrap().set_healthy(true);
        let resp = health_response(&registry, "demo");
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
