//! Process supervisor: parses the CLI, loads config, and wires one
//! pingora service plus one synchronizer task per configured proxy,
//! and the shared status/metrics webserver.
//!
//! Each proxy gets its own `Server` on its own dedicated thread, run
//! inside a retry loop: `run_forever` owns that thread for as long as
//! the listener is healthy, and a fatal failure there flips the
//! proxy's status back to unhealthy, logs, waits, and rebuilds the
//! server rather than taking the whole process down. This mirrors the
//! original's per-proxy `Run` goroutine, which does the same
//! log-unhealthy-sleep-retry loop around its own `RunHttp` call. The
//! synchronizers and the status webserver are ambient async work that
//! doesn't fit that model, so they run on a separate, dedicated tokio
//! runtime in a background thread of their own.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pingora::prelude::*;
use pingora::proxy::http_proxy_service;

use hashring_proxy::cli::{Cli, Command, RunArgs, CRATE_VERSION};
use hashring_proxy::config;
use hashring_proxy::metrics::MetricsPool;
use hashring_proxy::proxy::HashRingProxy;
use hashring_proxy::ring::HashRing;
use hashring_proxy::status::{ProxyRegistry, ProxyStatus};
use hashring_proxy::synchronizer::Synchronizer;

/// Time to wait between starting two consecutive proxy services, and
/// also the backoff between a failed listener and its next retry.
/// The original reuses the same 2s literal in both of these places
/// (`RunHttp`'s own retry sleep, and the launch loop's sleep between
/// `go proxyObj.Run(...)` calls) without unifying them into a shared
/// constant; this crate does unify them, since nothing distinguishes
/// the two uses here.
const STARTUP_STAGGER: Duration = Duration::from_secs(2);

fn init_tracing(log_level: &str, disable_trace: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if disable_trace {
        subscriber.without_time().init();
    } else {
        subscriber.init();
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Version => println!("hashring-proxy {CRATE_VERSION}"),
        Command::Run(args) => run(args),
    }
}

/// One configured proxy, with the shared state its engine and its
/// synchronizer both need a handle to.
struct Engine {
    proxy: config::ProxyConfig,
    ring: Arc<HashRing>,
    status: Arc<ProxyStatus>,
}

fn run(args: RunArgs) {
    init_tracing(&args.log_level, args.disable_trace);

    let raw = match config::read_file(&args.config) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(MetricsPool::new());

    let mut valid = Vec::new();
    for raw_proxy in raw.proxies {
        let name = raw_proxy.name.clone();
        match config::ProxyConfig::try_from_raw(raw_proxy) {
            Ok(proxy) => valid.push(proxy),
            Err(err) => {
                tracing::error!(proxy = %name, error = %err, "skipping misconfigured proxy")
            }
        }
    }

    if valid.is_empty() {
        tracing::error!("no valid proxies configured, exiting");
        std::process::exit(1);
    }

    let show_access_logs = raw.common.logs.show_access_logs;
    let access_logs_fields = raw.common.logs.access_logs_fields;
    let enable_request_body_logs = raw.common.logs.enable_request_body_logs;
    let enable_request_body_logs_json_parsing = raw.common.logs.enable_request_body_logs_json_parsing;

    let engines: Vec<Engine> = valid
        .into_iter()
        .map(|proxy| Engine {
            ring: Arc::new(HashRing::new()),
            status: Arc::new(ProxyStatus::new()),
            proxy,
        })
        .collect();

    let registry = ProxyRegistry::from_statuses(
        engines
            .iter()
            .map(|e| (e.proxy.name.clone(), Arc::clone(&e.status))),
    );

    spawn_ambient_tasks(&engines, registry, Arc::clone(&metrics), args.status_address);

    let logs = LogsSettings {
        show_access_logs,
        access_logs_fields,
        enable_request_body_logs,
        enable_request_body_logs_json_parsing,
    };

    let mut handles = Vec::new();
    for engine in engines {
        let logs = logs.clone();
        let metrics = Arc::clone(&metrics);
        handles.push(std::thread::spawn(move || {
            run_proxy_forever(engine, logs, metrics);
        }));
        std::thread::sleep(STARTUP_STAGGER);
    }

    for handle in handles {
        if let Err(panic) = handle.join() {
            tracing::error!(reason = %panic_message(&panic), "proxy supervisor thread panicked");
        }
    }
}

/// The subset of `common.logs` every engine needs; cloned once per
/// proxy thread rather than re-reading `raw.common.logs` from a shared
/// reference, since each thread owns its `Engine` outright.
#[derive(Clone)]
struct LogsSettings {
    show_access_logs: bool,
    access_logs_fields: Vec<String>,
    enable_request_body_logs: bool,
    enable_request_body_logs_json_parsing: bool,
}

/// Run one proxy's pingora server forever, retrying on a fatal
/// failure. `Server::run_forever` never hands back a `Result` for a
/// fatal bind/accept error — to the caller it just never returns
/// normally — so `catch_unwind` is the closest available hook to
/// observe that failure without bringing every other proxy down with
/// it. Mirrors the original's `ProxyT.Run`: flip the status flag
/// unhealthy, log, sleep, rebuild, retry.
fn run_proxy_forever(engine: Engine, logs: LogsSettings, metrics: Arc<MetricsPool>) {
    let listen_addr = format!(
        "{}:{}",
        engine.proxy.listener.address, engine.proxy.listener.port
    );

    loop {
        let hash_ring_proxy = HashRingProxy::new(
            engine.proxy.name.clone(),
            Arc::clone(&engine.ring),
            engine.proxy.options.clone(),
            engine.proxy.hash_key_pattern.clone(),
            logs.show_access_logs,
            logs.access_logs_fields.clone(),
            logs.enable_request_body_logs,
            logs.enable_request_body_logs_json_parsing,
            Arc::clone(&metrics),
        );

        let mut server = Server::new(None).expect("build pingora server");
        server.bootstrap();

        let mut service = http_proxy_service(&server.configuration, hash_ring_proxy);
        service.add_tcp(&listen_addr);
        server.add_service(service);

        // Flips true right before the listener is handed to the
        // server, not after a confirmed successful bind — matches the
        // original's own optimistic ordering in its proxy run loop.
        engine.status.set_healthy(true);
        tracing::info!(proxy = %engine.proxy.name, address = %listen_addr, "starting proxy listener");

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            server.run_forever();
        }));

        engine.status.set_healthy(false);
        match outcome {
            Err(panic) => tracing::error!(
                proxy = %engine.proxy.name,
                reason = %panic_message(&panic),
                "proxy listener failed, retrying in {:?}",
                STARTUP_STAGGER,
            ),
            Ok(()) => tracing::error!(
                proxy = %engine.proxy.name,
                "proxy listener returned, retrying in {:?}",
                STARTUP_STAGGER,
            ),
        }
        std::thread::sleep(STARTUP_STAGGER);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn the synchronizers (one per proxy) and the shared status
/// webserver on a dedicated tokio runtime, detached from the thread
/// that will go on to call `server.run_forever()`.
fn spawn_ambient_tasks(
    engines: &[Engine],
    registry: ProxyRegistry,
    metrics: Arc<MetricsPool>,
    status_address: String,
) {
    let synchronizers: Vec<(String, Arc<HashRing>, config::BackendSource, Duration)> = engines
        .iter()
        .map(|e| {
            (
                e.proxy.name.clone(),
                Arc::clone(&e.ring),
                e.proxy.backend_source.clone(),
                e.proxy.synchronization,
            )
        })
        .collect();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().expect("build ambient-task runtime");
        rt.block_on(async move {
            for (name, ring, backend_source, interval) in synchronizers {
                let synchronizer = Synchronizer::new(name, ring, backend_source, interval);
                tokio::spawn(async move { synchronizer.run().await });
            }

            let addr: std::net::SocketAddr = status_address
                .parse()
                .expect("status_address must be a valid socket address");
            tokio::spawn(async move {
                if let Err(err) =
                    hashring_proxy::status::run_status_webserver(addr, registry, metrics).await
                {
                    tracing::error!(error = %err, "status webserver exited");
                }
            });

            std::future::pending::<()>().await
        });
    });
}
