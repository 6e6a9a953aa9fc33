//! Template grammar for hash-key patterns and access-log fields.
//!
//! Four tag families of the form `${FAMILY:selector}`: `REQUEST`,
//! `REQUEST_HEADER`, `RESPONSE_HEADER`, `EXTRA`. Unknown selectors
//! expand to the empty string; a literal `${...}` belonging to no
//! known family is left untouched.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static REQUEST_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{REQUEST:([^}]+)\}").unwrap());
static REQUEST_HEADER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{REQUEST_HEADER:([^}]+)\}").unwrap());
static RESPONSE_HEADER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{RESPONSE_HEADER:([^}]+)\}").unwrap());
static EXTRA_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{EXTRA:([^}]+)\}").unwrap());

/// Fields of the inbound request relevant to `${REQUEST:...}`.
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    pub scheme: String,
    pub host: String,
    pub port: String,
    pub path: String,
    pub query: String,
    pub method: String,
    pub proto: String,
}

/// Per-connection values backing `${EXTRA:...}`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionExtra {
    pub request_id: String,
    pub hash_key: String,
    pub backend: String,
}

/// Normalize a header name to `Title-Case-With-Dashes`, e.g.
/// `x-foo-bar` -> `X-Foo-Bar`. Matches the Go original's
/// `CapitalizeWords`, used so header lookups are case-insensitive in
/// effect.
pub fn capitalize_header_name(input: &str) -> String {
    input
        .split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Expand `${REQUEST:<part>}` tags against `facts`.
pub fn expand_request_tags(text: &str, facts: &RequestFacts) -> String {
    REQUEST_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            match &caps[1] {
                "scheme" => facts.scheme.clone(),
                "host" => facts.host.clone(),
                "port" => facts.port.clone(),
                "path" => facts.path.clone(),
                "query" => facts.query.clone(),
                "method" => facts.method.clone(),
                "proto" => facts.proto.clone(),
                _ => String::new(),
            }
        })
        .into_owned()
}

/// Expand `${REQUEST_HEADER:<name>}` tags by looking `name` up (after
/// normalization) in `headers`, which must already be keyed by
/// normalized name.
pub fn expand_request_header_tags(text: &str, headers: &BTreeMap<String, String>) -> String {
    REQUEST_HEADER_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            let name = capitalize_header_name(&caps[1]);
            headers.get(&name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Expand `${RESPONSE_HEADER:<name>}` tags, same normalization rule.
pub fn expand_response_header_tags(text: &str, headers: &BTreeMap<String, String>) -> String {
    RESPONSE_HEADER_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            let name = capitalize_header_name(&caps[1]);
            headers.get(&name).cloned().unwrap_or_default()
        })
        .into_owned()
}

/// Expand `${EXTRA:<field>}` tags against connection context.
pub fn expand_extra_tags(text: &str, extra: &ConnectionExtra) -> String {
    EXTRA_PATTERN
        .replace_all(text, |caps: &regex::Captures| match &caps[1] {
            "request-id" => extra.request_id.clone(),
            "hashkey" => extra.hash_key.clone(),
            "backend" => extra.backend.clone(),
            _ => String::new(),
        })
        .into_owned()
}

/// Fully expand a hash-key pattern against request facts, request
/// headers and extra context (the only families a hash key may use
/// before a backend/response exists).
pub fn expand_hash_key(
    pattern: &str,
    facts: &RequestFacts,
    headers: &BTreeMap<String, String>,
) -> String {
    let expanded = expand_request_tags(pattern, facts);
    expand_request_header_tags(&expanded, headers)
}

/// Build the ordered (field, value) pairs for a request access-log
/// line, skipping fields whose expansion left them unchanged (i.e.
/// they referenced no recognized tag at all).
pub fn request_log_fields(
    fields: &[String],
    facts: &RequestFacts,
    headers: &BTreeMap<String, String>,
    extra: &ConnectionExtra,
) -> Vec<(String, String)> {
    fields
        .iter()
        .filter_map(|field| {
            let mut result = expand_request_tags(field, facts);
            result = expand_request_header_tags(&result, headers);
            result = expand_extra_tags(&result, extra);

            if &result == field {
                return None;
            }

            let name = strip_tag_wrapper(field);
            Some((name, result))
        })
        .collect()
}

/// Same as [`request_log_fields`] but against response headers plus a
/// trailing `status` field, for the post-relay "response" log event.
pub fn response_log_fields(
    fields: &[String],
    headers: &BTreeMap<String, String>,
    extra: &ConnectionExtra,
    status: u16,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = fields
        .iter()
        .filter_map(|field| {
            let mut result = expand_response_header_tags(field, headers);
            result = expand_extra_tags(&result, extra);

            if &result == field {
                return None;
            }

            let name = strip_tag_wrapper(field);
            Some((name, result))
        })
        .collect();

    out.push(("status".to_string(), status.to_string()));
    out
}

fn strip_tag_wrapper(field: &str) -> String {
    for prefix in ["${REQUEST:", "${REQUEST_HEADER:", "${RESPONSE_HEADER:", "${EXTRA:"] {
        if let Some(rest) = field.strip_prefix(prefix) {
            return rest.strip_suffix('}').unwrap_or(rest).to_string();
        }
    }
    field.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_selector_expands_to_empty_string() {
        let facts = RequestFacts::default();
        assert_eq!(expand_request_tags("${REQUEST:nope}", &facts), "");
    }

    #[test]
    fn pattern_with_no_tags_round_trips_unchanged() {
        let facts = RequestFacts {
            path: "/a".into(),
            ..Default::default()
        };
        let headers = BTreeMap::new();
        let pattern = "a static string";
        assert_eq!(expand_hash_key(pattern, &facts, &headers), pattern);
    }

    #[test]
    fn header_lookup_is_case_insensitive_via_normalization() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Foo-Bar".to_string(), "42".to_string());

        for pattern in [
            "${REQUEST_HEADER:x-foo-bar}",
            "${REQUEST_HEADER:X-FOO-BAR}",
            "${REQUEST_HEADER:X-Foo-Bar}",
        ] {
            assert_eq!(expand_request_header_tags(pattern, &headers), "42");
        }
    }

    #[test]
    fn missing_header_expands_empty() {
        let headers = BTreeMap::new();
        assert_eq!(
            expand_request_header_tags("${REQUEST_HEADER:X-Shard}", &headers),
            ""
        );
    }

    #[test]
    fn extra_tags_pull_from_connection_context() {
        let extra = ConnectionExtra {
            request_id: "abc123".into(),
            hash_key: "/a".into(),
            backend: "10.0.0.1:9001".into(),
        };
        assert_eq!(
            expand_extra_tags("${EXTRA:request-id}", &extra),
            "abc123"
        );
        assert_eq!(expand_extra_tags("${EXTRA:backend}", &extra), "10.0.0.1:9001");
        assert_eq!(expand_extra_tags("${EXTRA:unknown}", &extra), "");
    }

    #[test]
    fn path_pattern_expands_path() {
        let facts = RequestFacts {
            path: "/a".into(),
            ..Default::default()
        };
        let headers = BTreeMap::new();
        assert_eq!(expand_hash_key("${REQUEST:path}", &facts, &headers), "/a");
    }
}
