//! Configuration schema and loading.
//!
//! Mirrors the YAML shape of the Go original (`api/config_types.go`)
//! but parses the raw, both-optional `static`/`dns` shape into a
//! `BackendSource` tagged union at construction time, per DESIGN NOTES
//! §9: "the 'both set' configuration error then cannot be represented
//! post-parse."

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub common: CommonConfig,
    pub proxies: Vec<RawProxyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommonConfig {
    #[serde(default)]
    pub logs: LogsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsConfig {
    #[serde(default)]
    pub show_access_logs: bool,
    #[serde(default)]
    pub access_logs_fields: Vec<String>,
    #[serde(default)]
    pub enable_request_body_logs: bool,
    #[serde(default)]
    pub enable_request_body_logs_json_parsing: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProxyConfig {
    pub name: String,
    pub listener: ListenerConfig,
    pub backends: RawBackendsConfig,
    pub hash_key: HashKeyConfig,
    #[serde(default)]
    pub options: OptionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBackendsConfig {
    #[serde(with = "humantime_serde")]
    pub synchronization: Duration,
    #[serde(default)]
    pub r#static: Option<Vec<StaticBackendConfig>>,
    #[serde(default)]
    pub dns: Option<DnsBackendConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticBackendConfig {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub healthcheck: HealthCheckConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsBackendConfig {
    pub name: String,
    pub domain: String,
    pub port: u16,
    #[serde(default)]
    pub healthcheck: HealthCheckConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default, with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub path: String,
}

impl HealthCheckConfig {
    /// A zero-valued health check means "no probing; treat as healthy".
    pub fn is_zero(&self) -> bool {
        self.timeout.is_zero() && self.retries == 0 && self.path.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashKeyConfig {
    pub pattern: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionsConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub tls_certificate: String,
    #[serde(default)]
    pub tls_key: String,
    #[serde(default)]
    pub http_server_read_timeout_ms: u64,
    #[serde(default)]
    pub http_server_write_timeout_ms: u64,
    #[serde(default)]
    pub http_server_disable_keep_alives: bool,
    #[serde(default)]
    pub http_backend_dial_timeout_ms: u64,
    #[serde(default = "default_backend_keep_alive_ms")]
    pub http_backend_keep_alive_ms: u64,
    #[serde(default)]
    pub http_backend_request_timeout_ms: u64,
    #[serde(default)]
    pub http_backend_disable_keep_alives: bool,
    #[serde(default)]
    pub try_another_backend_on_failure: bool,
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_backend_keep_alive_ms() -> u64 {
    15_000
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            tls_certificate: String::new(),
            tls_key: String::new(),
            http_server_read_timeout_ms: 0,
            http_server_write_timeout_ms: 0,
            http_server_disable_keep_alives: false,
            http_backend_dial_timeout_ms: 0,
            http_backend_keep_alive_ms: default_backend_keep_alive_ms(),
            http_backend_request_timeout_ms: 0,
            http_backend_disable_keep_alives: false,
            try_another_backend_on_failure: false,
        }
    }
}

/// The validated, tagged-union shape of a proxy's backend source.
/// Construction-time invariant: exactly one variant, never both, never
/// neither.
#[derive(Debug, Clone)]
pub enum BackendSource {
    Static(Vec<StaticBackendConfig>),
    Dns(DnsBackendConfig),
}

/// A fully validated proxy configuration, ready to build an engine
/// from.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub listener: ListenerConfig,
    pub synchronization: Duration,
    pub backend_source: BackendSource,
    pub hash_key_pattern: String,
    pub options: OptionsConfig,
}

impl ProxyConfig {
    /// Validate a raw, serde-deserialized proxy entry into the tagged
    /// union shape. Mirrors the Go original's runtime check (both
    /// `Static` and `Dns` set is a misconfiguration) but catches it
    /// before an engine is ever built from it.
    pub fn try_from_raw(raw: RawProxyConfig) -> Result<Self, ConfigError> {
        let backend_source = match (raw.backends.r#static, raw.backends.dns) {
            (Some(static_list), None) => BackendSource::Static(static_list),
            (None, Some(dns)) => BackendSource::Dns(dns),
            (Some(_), Some(_)) => {
                return Err(ConfigError::AmbiguousBackendSource {
                    name: raw.name,
                    found: "static and dns",
                })
            }
            (None, None) => {
                return Err(ConfigError::MissingBackendSource { name: raw.name })
            }
        };

        if raw.hash_key.pattern.trim().is_empty() {
            return Err(ConfigError::EmptyHashKeyPattern { name: raw.name });
        }

        Ok(Self {
            name: raw.name,
            listener: raw.listener,
            synchronization: raw.backends.synchronization,
            backend_source,
            hash_key_pattern: raw.hash_key.pattern,
            options: raw.options,
        })
    }
}

/// Parse a YAML document into the raw config shape.
pub fn parse(contents: &str) -> Result<Config, serde_yaml::Error> {
    serde_yaml::from_str(contents)
}

/// Read and parse a config file from disk.
pub fn read_file(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    parse(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
common:
  logs:
    show_access_logs: true
    access_logs_fields: ["${REQUEST:path}", "${EXTRA:backend}"]
proxies:
  - name: demo
    listener: { address: "0.0.0.0", port: 8080 }
    backends:
      synchronization: "5s"
      static:
        - name: a
          host: "127.0.0.1:9001"
    hash_key: { pattern: "${REQUEST:path}" }
    options:
      try_another_backend_on_failure: true
"#;

    #[test]
    fn parses_static_backend_config() {
        let cfg = parse(SAMPLE).unwrap();
        assert_eq!(cfg.proxies.len(), 1);
        let proxy = ProxyConfig::try_from_raw(cfg.proxies[0].clone()).unwrap();
        assert_eq!(proxy.synchronization, Duration::from_secs(5));
        match proxy.backend_source {
            BackendSource::Static(backends) => assert_eq!(backends.len(), 1),
            BackendSource::Dns(_) => panic!("expected static source"),
        }
        assert!(proxy.options.try_another_backend_on_failure);
    }

    #[test]
    fn both_static_and_dns_is_rejected() {
        let mut cfg = parse(SAMPLE).unwrap();
        cfg.proxies[0].backends.dns = Some(DnsBackendConfig {
            name: "d".into(),
            domain: "example.com".into(),
            port: 80,
            healthcheck: HealthCheckConfig::default(),
        });
        let err = ProxyConfig::try_from_raw(cfg.proxies[0].clone()).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousBackendSource { .. }));
    }

    #[test]
    fn neither_static_nor_dns_is_rejected() {
        let mut cfg = parse(SAMPLE).unwrap();
        cfg.proxies[0].backends.r#static = None;
        let err = ProxyConfig::try_from_raw(cfg.proxies[0].clone()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingBackendSource { .. }));
    }

    #[test]
    fn zero_valued_healthcheck_means_always_healthy() {
        let hc = HealthCheckConfig::default();
        assert!(hc.is_zero());
    }
}
