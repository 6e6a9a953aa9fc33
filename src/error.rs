//! Error types surfaced at configuration time.
//!
//! Everything past startup (template expansion, backend selection, body
//! relay) is handled inline as logged, non-fatal outcomes per the
//! propagation policy: the dispatcher never panics on a client or
//! backend fault.

use thiserror::Error;

/// Errors that can prevent a single proxy from being constructed.
///
/// A `ConfigError` for one proxy entry never aborts the rest of the
/// config; the caller logs it and skips that proxy.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("proxy '{name}' must declare exactly one backend source (static or dns), found {found}")]
    AmbiguousBackendSource { name: String, found: &'static str },

    #[error("proxy '{name}' declares neither a static nor a dns backend source")]
    MissingBackendSource { name: String },

    #[error("proxy '{name}' has an empty hash_key pattern")]
    EmptyHashKeyPattern { name: String },

    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
