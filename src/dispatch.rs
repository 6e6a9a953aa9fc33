//! Pure request-dispatch logic shared by the pingora-facing proxy glue.
//!
//! Kept free of any pingora/reqwest types so the retry-order arithmetic
//! and outcome classification can be unit tested directly, per DESIGN
//! NOTES §9: "`(start + i) mod len(pool)` over a fresh snapshot; do not
//! mutate `pool` during the loop."

/// The outcome label attached to `http_requests_total{error=...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    None,
    HashKeyCalculationFailed,
    NoBackendsFound,
    AllBackendsFailed,
    BodyCopyFailed,
}

impl DispatchError {
    pub fn as_label(&self) -> &'static str {
        match self {
            DispatchError::None => "none",
            DispatchError::HashKeyCalculationFailed => "hash_key_calculation_failed",
            DispatchError::NoBackendsFound => "no_backends_found",
            DispatchError::AllBackendsFailed => "all_backends_failed",
            DispatchError::BodyCopyFailed => "body_copy_failed",
        }
    }
}

/// Build the ordered list of candidates to try, starting at `start`
/// and wrapping around `pool` exactly once. An empty pool yields an
/// empty order.
pub fn retry_order(pool: &[String], start: usize) -> Vec<String> {
    let len = pool.len();
    if len == 0 {
        return Vec::new();
    }
    (0..len).map(|i| pool[(start + i) % len].clone()).collect()
}

/// Find the index of `primary` within `pool`, defaulting to 0 if it is
/// absent (can happen if the ring mutated between `lookup` and
/// `servers` snapshots).
pub fn start_index(pool: &[String], primary: Option<&str>) -> usize {
    match primary {
        Some(server) => pool.iter().position(|s| s == server).unwrap_or(0),
        None => 0,
    }
}

/// Trim an expanded hash key and classify it as usable or not. An
/// all-whitespace expansion is a calculation failure, not a valid
/// (if unusual) lookup key.
pub fn resolve_hash_key(expanded: &str) -> Result<String, DispatchError> {
    let trimmed = expanded.trim().to_string();
    if trimmed.is_empty() {
        Err(DispatchError::HashKeyCalculationFailed)
    } else {
        Ok(trimmed)
    }
}
