//! Synchronizer reconciliation scenarios (S5/S6), driven against real
//! local health-check servers instead of mocking `reqwest`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hashring_proxy::config::{HealthCheckConfig, StaticBackendConfig};
use hashring_proxy::ring::HashRing;
use hashring_proxy::synchronizer::Synchronizer;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};

async fn spawn_health_server(healthy: bool) -> std::net::SocketAddr {
    let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
    let make_svc = make_service_fn(move |_conn| async move {
        Ok::<_, Infallible>(service_fn(move |_req: Request<Body>| async move {
            let status = if healthy {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            Ok::<_, Infallible>(
                Response::builder()
                    .status(status)
                    .body(Body::empty())
                    .unwrap(),
            )
        }))
    });

    let server = Server::bind(&addr).serve(make_svc);
    let bound_addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.await;
    });
    bound_addr
}

#[tokio::test]
async fn s6_unhealthy_candidate_is_excluded_after_one_cycle() {
    let healthy_addr = spawn_health_server(true).await;
    let unhealthy_addr = spawn_health_server(false).await;

    let health = HealthCheckConfig {
        timeout: Duration::from_millis(200),
        retries: 1,
        path: "/".to_string(),
    };

    let backends = vec![
        StaticBackendConfig {
            name: "a".to_string(),
            host: unhealthy_addr.to_string(),
            healthcheck: health.clone(),
        },
        StaticBackendConfig {
            name: "b".to_string(),
            host: healthy_addr.to_string(),
            healthcheck: health,
        },
    ];

    let ring = Arc::new(HashRing::new());
    let synchronizer = Synchronizer::new(
        "demo".to_string(),
        Arc::clone(&ring),
        hashring_proxy::config::BackendSource::Static(backends),
        Duration::from_secs(60),
    );

    synchronizer.run_once().await;

    assert_eq!(ring.servers(), vec![healthy_addr.to_string()]);
}

#[tokio::test]
async fn s6_healthy_candidates_are_both_admitted() {
    let a = spawn_health_server(true).await;
    let b = spawn_health_server(true).await;

    let health = HealthCheckConfig {
        timeout: Duration::from_millis(200),
        retries: 1,
        path: "/".to_string(),
    };

    let backends = vec![
        StaticBackendConfig {
            name: "a".to_string(),
            host: a.to_string(),
            healthcheck: health.clone(),
        },
        StaticBackendConfig {
            name: "b".to_string(),
            host: b.to_string(),
            healthcheck: health,
        },
    ];

    let ring = Arc::new(HashRing::new());
    let synchronizer = Synchronizer::new(
        "demo".to_string(),
        Arc::clone(&ring),
        hashring_proxy::config::BackendSource::Static(backends),
        Duration::from_secs(60),
    );

    synchronizer.run_once().await;

    let mut servers = ring.servers();
    servers.sort();
    let mut expected = vec![a.to_string(), b.to_string()];
    expected.sort();
    assert_eq!(servers, expected);
}
