//! Pipeline-wide tuning constants.

use std::time::Duration;

/// Maximum in-run retries for a failed source fetch.
pub const CRAWL_MAX_RETRIES: u32 = 3;

/// Initial in-run backoff; doubles each retry (1s, 2s, 4s).
pub const CRAWL_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Crawl budget for a single site.
pub const CRAWL_MAX_PAGES: usize = 50;
pub const CRAWL_MAX_DEPTH: u32 = 3;
pub const CRAWL_TIMEOUT_TOTAL: Duration = Duration::from_secs(90);
pub const CRAWL_DELAY_BETWEEN_REQUESTS: Duration = Duration::from_millis(500);

/// In-flight page fetches against a single origin.
pub const CRAWL_MAX_CONCURRENCY: usize = 10;

/// Default worker pool size (charities processed concurrently).
pub const DEFAULT_WORKERS: usize = 20;

/// Per-source TTL in days before re-fetching.
pub fn source_ttl_days(source: &str) -> i64 {
    match source {
        "propublica" => 365,       // 990s filed annually
        "charity_navigator" => 90, // scores update quarterly
        "candid" => 90,
        "form990_grants" => 365, // immutable once filed
        "website" => 30,         // content changes frequently
        "bbb" => 90,
        _ => 30,
    }
}

/// Cross-run backoff hours by retry count; after the table is exhausted the
/// source is a permanent failure until its row is deleted.
pub fn retry_backoff_hours(retry_count: u32) -> i64 {
    match retry_count {
        0 | 1 => 1,
        2 => 4,
        _ => 24,
    }
}

const RETRYABLE_MARKERS: &[&str] = &[
    "timeout",
    "connection",
    "rate limit",
    "429",
    "502",
    "503",
    "504",
    "temporary",
    "overloaded",
    "too many requests",
    "network",
    "ssl",
    "reset by peer",
];

/// Classify an error message as transient (worth retrying) or not.
/// `VALIDATION_ERROR:`-prefixed messages are always permanent.
pub fn is_retryable_error(message: &str) -> bool {
    if message.starts_with("VALIDATION_ERROR:") {
        return false;
    }
    let lower = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Scoring ceiling: 90 base + 5 zakat bonus.
pub const MAX_AMAL_SCORE: f64 = 95.0;
pub const BASE_AMAL_SCORE: f64 = 90.0;
pub const ZAKAT_BONUS: f64 = 5.0;

/// Default judge threshold for export eligibility.
pub const DEFAULT_JUDGE_THRESHOLD: f64 = 80.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_never_retryable() {
        assert!(!is_retryable_error("VALIDATION_ERROR: EIN mismatch"));
        // Even when the message also contains a transient marker.
        assert!(!is_retryable_error("VALIDATION_ERROR: timeout field out of range"));
    }

    #[test]
    fn transient_markers_are_retryable() {
        assert!(is_retryable_error("Request timeout after 30s"));
        assert!(is_retryable_error("HTTP 503"));
        assert!(is_retryable_error("connection reset by peer"));
        assert!(is_retryable_error("Rate limited (429). Retry after 60s"));
        assert!(!is_retryable_error("HTTP 404"));
        assert!(!is_retryable_error("Organization not found"));
    }

    #[test]
    fn backoff_table_caps_at_24h() {
        assert_eq!(retry_backoff_hours(1), 1);
        assert_eq!(retry_backoff_hours(2), 4);
        assert_eq!(retry_backoff_hours(3), 24);
        assert_eq!(retry_backoff_hours(7), 24);
    }
}
