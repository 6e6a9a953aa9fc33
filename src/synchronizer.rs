//! Backend synchronizer: discovers candidates, health-checks them, and
//! reconciles the hash ring to match. Runs as a periodic background
//! task, one per proxy, never overlapping with itself.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendSource, HealthCheckConfig};
use crate::ring::HashRing;

/// A backend discovered this cycle, not yet admitted.
#[derive(Debug, Clone)]
pub struct BackendCandidate {
    pub host: String,
    pub health: HealthCheckConfig,
}

/// Owns the pieces needed to run reconciliation cycles for one proxy.
pub struct Synchronizer {
    proxy_name: String,
    ring: Arc<HashRing>,
    backend_source: BackendSource,
    interval: Duration,
    http_client: reqwest::Client,
}

impl Synchronizer {
    pub fn new(proxy_name: String, ring: Arc<HashRing>, backend_source: BackendSource, interval: Duration) -> Self {
        Self {
            proxy_name,
            ring,
            backend_source,
            interval,
            http_client: reqwest::Client::new(),
        }
    }

    /// Run reconciliation cycles forever, sleeping `interval` between
    /// each. Intended to be spawned as its own long-lived task.
    pub async fn run(&self) {
        loop {
            self.run_once().await;
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Perform exactly one gather -> probe -> reconcile cycle.
    pub async fn run_once(&self) {
        let candidates = self.gather_candidates().await;
        let admitted = self.probe_candidates(&candidates).await;
        self.reconcile(admitted);
    }

    async fn gather_candidates(&self) -> Vec<BackendCandidate> {
        match &self.backend_source {
            BackendSource::Static(backends) => backends
                .iter()
                .map(|b| BackendCandidate {
                    host: b.host.clone(),
                    health: b.healthcheck.clone(),
                })
                .collect(),
            BackendSource::Dns(dns) => {
                tracing::info!(proxy = %self.proxy_name, domain = %dns.domain, "syncing hashring with DNS");

                let lookup_target = format!("{}:0", dns.domain);
                let resolved = match tokio::net::lookup_host(&lookup_target).await {
                    Ok(addrs) => addrs.map(|a| a.ip()).collect::<Vec<IpAddr>>(),
                    Err(err) => {
                        tracing::error!(proxy = %self.proxy_name, domain = %dns.domain, error = %err, "dns lookup failed");
                        Vec::new()
                    }
                };

                resolved
                    .into_iter()
                    .map(|ip| {
                        let host = if ip.is_ipv6() {
                            format!("[{ip}]:{}", dns.port)
                        } else {
                            format!("{ip}:{}", dns.port)
                        };
                        BackendCandidate {
                            host,
                            health: dns.healthcheck.clone(),
                        }
                    })
                    .collect()
            }
        }
    }

    async fn probe_candidates(&self, candidates: &[BackendCandidate]) -> Vec<String> {
        let mut admitted = Vec::new();

        for candidate in candidates {
            if candidate.health.is_zero() {
                admitted.push(candidate.host.clone());
                continue;
            }

            let url = format!("http://{}{}", candidate.host, candidate.health.path);
            let mut ok = false;

            for _ in 0..candidate.health.retries {
                let request = self.http_client.get(&url).timeout(candidate.health.timeout);
                match request.send().await {
                    Ok(resp) if resp.status().as_u16() == 200 => {
                        ok = true;
                        break;
                    }
                    Ok(resp) => {
                        tracing::error!(
                            proxy = %self.proxy_name,
                            host = %candidate.host,
                            status = %resp.status(),
                            "healthcheck failed"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            proxy = %self.proxy_name,
                            host = %candidate.host,
                            error = %err,
                            "unable to perform healthcheck"
                        );
                    }
                }
            }

            if ok {
                admitted.push(candidate.host.clone());
            }
        }

        admitted
    }

    fn reconcile(&self, admitted: Vec<String>) {
        let current = self.ring.servers();

        let to_add: Vec<&String> = admitted.iter().filter(|s| !current.contains(s)).collect();
        let to_remove: Vec<&String> = current.iter().filter(|s| !admitted.contains(s)).collect();

        for server in to_add {
            self.ring.add(server);
        }
        for server in to_remove {
            self.ring.remove(server);
        }

        tracing::debug!(proxy = %self.proxy_name, servers = ?self.ring.servers(), "reconciled hashring");
    }
}
