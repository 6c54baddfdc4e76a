//! Per-source collection orchestration.
//!
//! For every source a charity could have, decide skip / reuse / attempt:
//! fresh rows inside the per-source TTL are reused, rows in a cross-run
//! backoff window are skipped, rows at the retry ceiling are permanent
//! failures, and everything else is fetched with in-run exponential backoff.
//! Collectors never raise past this boundary; the orchestrator returns a
//! per-source report.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use goodmeasure_core::constants::{
    is_retryable_error, retry_backoff_hours, source_ttl_days, CRAWL_INITIAL_BACKOFF,
    CRAWL_MAX_RETRIES,
};
use goodmeasure_core::types::{Charity, RawRecord};
use goodmeasure_store::Store;

use crate::delta::{compute_field_delta, FieldDelta};
use crate::{CollectOptions, CollectOutcome, Collector};

/// Sources that must succeed for a crawl to count as complete, in collection
/// order. The website source joins when a URL is known; a BBB "not found" is
/// an optional miss.
const REQUIRED_SOURCES: &[&str] = &["propublica", "charity_navigator", "candid", "form990_grants", "bbb"];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub skip_sources: Vec<String>,
    pub max_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { skip_sources: Vec::new(), max_retries: CRAWL_MAX_RETRIES }
    }
}

#[derive(Debug, Default)]
pub struct CollectionReport {
    pub ein: String,
    pub sources_attempted: Vec<String>,
    pub sources_succeeded: Vec<String>,
    pub sources_skipped: Vec<String>,
    pub sources_failed: BTreeMap<String, String>,
    pub sources_optional_missing: Vec<String>,
    pub missing_required_sources: Vec<String>,
    pub field_delta: Option<FieldDelta>,
    pub llm_cost_usd: f64,
}

pub struct Orchestrator {
    store: Store,
    collectors: Vec<Arc<dyn Collector>>,
    website: Option<Arc<dyn Collector>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// `collectors` are the API/HTML sources in collection order; the
    /// website collector is separate because it needs a URL and runs last.
    pub fn new(
        store: Store,
        collectors: Vec<Arc<dyn Collector>>,
        website: Option<Arc<dyn Collector>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { store, collectors, website, config }
    }

    fn is_skipped(&self, source: &str) -> bool {
        self.config.skip_sources.iter().any(|s| s == source)
    }

    /// Fresh = a successful row within the source's TTL.
    async fn is_data_fresh(&self, ein: &str, source: &str) -> bool {
        let Ok(Some(row)) = self.store.get_raw(ein, source).await else {
            return false;
        };
        if !row.success {
            return false;
        }
        let age = Utc::now() - row.scraped_at;
        age < ChronoDuration::days(source_ttl_days(source))
    }

    /// (skip, reason) for previously failed sources: permanent after the
    /// retry ceiling, otherwise skip inside the backoff window.
    async fn should_skip_failed(&self, ein: &str, source: &str) -> (bool, String) {
        let Ok(Some(row)) = self.store.get_raw(ein, source).await else {
            return (false, String::new());
        };
        if row.success {
            return (false, String::new());
        }
        if row.retry_count >= self.config.max_retries {
            return (true, format!("permanent failure (retry_count={})", row.retry_count));
        }
        // Validation failures are permanent regardless of retry count.
        if let Some(message) = &row.error_message {
            if message.starts_with("VALIDATION_ERROR:") {
                return (true, message.clone());
            }
        }
        if row.retry_count == 0 {
            return (false, String::new());
        }
        let backoff = ChronoDuration::hours(retry_backoff_hours(row.retry_count));
        let age = Utc::now() - row.scraped_at;
        if age < backoff {
            let remaining_h = (backoff - age).num_minutes() as f64 / 60.0;
            (true, format!("within backoff window ({remaining_h:.1}h remaining)"))
        } else {
            (false, String::new())
        }
    }

    async fn get_or_create_charity(
        &self,
        ein: &str,
        name: Option<&str>,
        website: Option<&str>,
    ) -> anyhow::Result<()> {
        self.store
            .upsert_charity(&Charity {
                ein: ein.to_string(),
                name: name.unwrap_or("Unknown").to_string(),
                website: website.map(str::to_string),
            })
            .await
    }

    async fn store_success(&self, ein: &str, source: &str, outcome: &CollectOutcome) {
        let record = RawRecord {
            charity_ein: ein.to_string(),
            source: source.to_string(),
            raw_payload: outcome.raw.clone(),
            parsed_payload: outcome.parsed.clone(),
            success: true,
            error_message: None,
            retry_count: 0,
            scraped_at: Utc::now(),
        };
        if let Err(e) = self.store.upsert_raw(&record).await {
            error!(ein, source, "raw record store failed: {e}");
        }
    }

    /// One source end to end: skip checks, then the in-run retry loop with
    /// exponential backoff (1s, 2s, 4s) for transient errors only.
    async fn collect_source(
        &self,
        collector: &Arc<dyn Collector>,
        ein: &str,
        opts: &CollectOptions,
        report: &mut CollectionReport,
    ) {
        let source = collector.source_name();

        if self.is_skipped(source) {
            info!(ein, source, "skipping (configured)");
            report.sources_skipped.push(source.to_string());
            return;
        }
        if self.is_data_fresh(ein, source).await {
            debug!(ein, source, "using cached data (within TTL)");
            report.sources_skipped.push(format!("{source} (cached)"));
            report.sources_succeeded.push(source.to_string());
            return;
        }
        let (skip, reason) = self.should_skip_failed(ein, source).await;
        if skip {
            debug!(ein, source, reason, "skipping failed source");
            report.sources_failed.insert(source.to_string(), reason);
            return;
        }

        report.sources_attempted.push(source.to_string());

        let mut last_error = String::from("unknown error");
        for attempt in 0..=self.config.max_retries {
            let outcome = collector.collect(ein, opts).await;
            if outcome.success {
                self.store_success(ein, source, &outcome).await;
                report.sources_succeeded.push(source.to_string());
                report.llm_cost_usd += outcome.cost_usd;
                info!(ein, source, "source collected");
                return;
            }

            last_error = outcome.error.unwrap_or_else(|| "unknown error".into());

            if last_error.starts_with("VALIDATION_ERROR:") {
                // Permanent: keep the row failed but do not consume the
                // cross-run retry budget.
                warn!(ein, source, error = %last_error, "validation failure (not retried)");
                report.sources_failed.insert(source.to_string(), last_error.clone());
                if let Err(e) = self.store.record_failure(ein, source, &last_error).await {
                    error!(ein, source, "failure record failed: {e}");
                }
                return;
            }

            if is_retryable_error(&last_error) && attempt < self.config.max_retries {
                let backoff = CRAWL_INITIAL_BACKOFF * 2u32.pow(attempt);
                warn!(
                    ein, source, attempt = attempt + 1,
                    "retrying after {:.1}s (error: {last_error})",
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
            break;
        }

        report.sources_failed.insert(source.to_string(), last_error.clone());
        match self.store.increment_retry(ein, source, &last_error).await {
            Ok(count) => debug!(ein, source, retry_count = count, "retry count incremented"),
            Err(e) => error!(ein, source, "retry increment failed: {e}"),
        }
    }

    /// Previous successful aggregate for field-delta reporting.
    async fn previous_aggregate(&self, ein: &str) -> Option<Value> {
        let rows = self.store.get_raw_for_charity(ein).await.ok()?;
        let mut aggregate = serde_json::Map::new();
        for row in rows {
            if !row.success {
                continue;
            }
            if let Some(parsed) = row.parsed_payload {
                if let Value::Object(map) = parsed {
                    for (k, v) in map {
                        aggregate.insert(k, v);
                    }
                }
            }
        }
        if aggregate.is_empty() {
            None
        } else {
            Some(Value::Object(aggregate))
        }
    }

    /// Collect every source for one charity. Success requires all required
    /// sources (BBB not-found is an optional miss).
    pub async fn collect_charity_data(
        &self,
        ein: &str,
        website_url: Option<&str>,
        charity_name: Option<&str>,
    ) -> (bool, CollectionReport) {
        let mut report = CollectionReport { ein: ein.to_string(), ..Default::default() };

        if let Err(e) = self.get_or_create_charity(ein, charity_name, website_url).await {
            report.sources_failed.insert("storage".into(), e.to_string());
            return (false, report);
        }

        let previous = self.previous_aggregate(ein).await;

        let opts = CollectOptions {
            website_url: website_url.map(str::to_string),
            charity_name: charity_name.map(str::to_string),
        };

        for collector in &self.collectors {
            self.collect_source(collector, ein, &opts, &mut report).await;
        }

        // Website runs last so a missing URL can be filled from the
        // charities table (synced at startup from the charities file).
        let mut effective_website = opts.website_url.clone();
        if effective_website.is_none() {
            if let Ok(Some(charity)) = self.store.get_charity(ein).await {
                effective_website = charity.website;
            }
        }
        if let (Some(website_collector), Some(url)) = (&self.website, effective_website.as_deref()) {
            let website_opts = CollectOptions {
                website_url: Some(url.to_string()),
                charity_name: opts.charity_name.clone(),
            };
            self.collect_source(website_collector, ein, &website_opts, &mut report).await;
        }

        // Completeness check.
        let mut required: Vec<&str> = REQUIRED_SOURCES
            .iter()
            .filter(|s| !self.is_skipped(s))
            .copied()
            .collect();
        if self.website.is_some() && effective_website.is_some() && !self.is_skipped("website") {
            required.push("website");
        }
        if required.contains(&"bbb") {
            if let Some(error) = report.sources_failed.get("bbb") {
                if error.to_lowercase().contains("not found") {
                    required.retain(|s| *s != "bbb");
                    report.sources_optional_missing.push("bbb:not_found".into());
                }
            }
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|s| !report.sources_succeeded.iter().any(|ok| ok == *s))
            .map(|s| s.to_string())
            .collect();

        if let Some(current) = self.previous_aggregate(ein).await {
            report.field_delta = Some(compute_field_delta(previous.as_ref(), &current));
        }

        if !missing.is_empty() {
            error!(ein, ?missing, "crawl incomplete: required sources failed");
            report.missing_required_sources = missing;
            return (false, report);
        }
        (true, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use goodmeasure_core::types::{ContentType, FetchOutput, ParseOutput};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted collector: a queue of outcomes, then the last repeats.
    struct StubCollector {
        name: &'static str,
        outcomes: Vec<CollectOutcome>,
        calls: AtomicUsize,
    }

    impl StubCollector {
        fn new(name: &'static str, outcomes: Vec<CollectOutcome>) -> Arc<Self> {
            Arc::new(Self { name, outcomes, calls: AtomicUsize::new(0) })
        }

        fn ok_outcome(key: &str) -> CollectOutcome {
            CollectOutcome {
                success: true,
                raw: Some("{}".into()),
                parsed: Some(json!({ key: {"ok": true} })),
                error: None,
                cost_usd: 0.0,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Collector for StubCollector {
        fn source_name(&self) -> &'static str {
            self.name
        }
        fn schema_key(&self) -> &'static str {
            self.name
        }
        async fn fetch(&self, _ein: &str, _opts: &CollectOptions) -> FetchOutput {
            FetchOutput::ok("{}".into(), ContentType::Json)
        }
        async fn parse(&self, _raw: &str, _ein: &str, _opts: &CollectOptions) -> ParseOutput {
            ParseOutput::ok(json!({}))
        }
        async fn collect(&self, _ein: &str, _opts: &CollectOptions) -> CollectOutcome {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes[i.min(self.outcomes.len() - 1)].clone()
        }
    }

    async fn store() -> Store {
        let s = Store::in_memory().await.unwrap();
        s.run_migrations().await.unwrap();
        s
    }

    fn config_only(sources: &[&str]) -> OrchestratorConfig {
        // Skip everything except the sources under test.
        let mut all: Vec<&str> = REQUIRED_SOURCES.to_vec();
        all.push("website");
        let skip = all
            .into_iter()
            .filter(|s| !sources.contains(s))
            .map(String::from)
            .collect();
        OrchestratorConfig { skip_sources: skip, max_retries: 3 }
    }

    const EIN: &str = "12-3456789";

    #[tokio::test]
    async fn fresh_cache_skips_fetch() {
        let store = store().await;
        let stub = StubCollector::new("propublica", vec![StubCollector::ok_outcome("propublica_990")]);

        // Seed a fresh successful row.
        store
            .upsert_raw(&RawRecord {
                charity_ein: EIN.into(),
                source: "propublica".into(),
                raw_payload: Some("{}".into()),
                parsed_payload: Some(json!({"propublica_990": {}})),
                success: true,
                error_message: None,
                retry_count: 0,
                scraped_at: Utc::now(),
            })
            .await
            .unwrap();

        let orch = Orchestrator::new(
            store,
            vec![stub.clone() as Arc<dyn Collector>],
            None,
            config_only(&["propublica"]),
        );
        let (ok, report) = orch.collect_charity_data(EIN, None, Some("Example")).await;
        assert!(ok, "{:?}", report.missing_required_sources);
        assert_eq!(stub.calls(), 0, "no network call for fresh cache");
        assert!(report.sources_skipped.iter().any(|s| s.contains("cached")));
    }

    #[tokio::test]
    async fn permanent_failure_skips_without_calling() {
        let store = store().await;
        for _ in 0..3 {
            store.increment_retry(EIN, "propublica", "HTTP 503").await.unwrap();
        }
        let stub = StubCollector::new("propublica", vec![StubCollector::ok_outcome("propublica_990")]);
        let orch = Orchestrator::new(
            store,
            vec![stub.clone() as Arc<dyn Collector>],
            None,
            config_only(&["propublica"]),
        );
        let (ok, report) = orch.collect_charity_data(EIN, None, None).await;
        assert!(!ok);
        assert_eq!(stub.calls(), 0);
        assert!(report.sources_failed["propublica"].contains("permanent failure"));
    }

    #[tokio::test]
    async fn transient_failures_retry_within_run() {
        let store = store().await;
        let stub = StubCollector::new(
            "propublica",
            vec![
                CollectOutcome::failure("HTTP 503"),
                CollectOutcome::failure("Request timeout"),
                StubCollector::ok_outcome("propublica_990"),
            ],
        );
        let orch = Orchestrator::new(
            store.clone(),
            vec![stub.clone() as Arc<dyn Collector>],
            None,
            config_only(&["propublica"]),
        );
        let (ok, _) = orch.collect_charity_data(EIN, None, None).await;
        assert!(ok);
        assert_eq!(stub.calls(), 3, "two transient failures then success");
        let row = store.get_raw(EIN, "propublica").await.unwrap().unwrap();
        assert!(row.success);
        assert_eq!(row.retry_count, 0);
    }

    #[tokio::test]
    async fn validation_error_is_never_retried() {
        let store = store().await;
        let stub = StubCollector::new(
            "propublica",
            vec![CollectOutcome::failure(
                "VALIDATION_ERROR: EIN mismatch: requested 12-3456789 but API returned 99-9999999",
            )],
        );
        let orch = Orchestrator::new(
            store.clone(),
            vec![stub.clone() as Arc<dyn Collector>],
            None,
            config_only(&["propublica"]),
        );
        let (ok, report) = orch.collect_charity_data(EIN, None, None).await;
        assert!(!ok);
        assert_eq!(stub.calls(), 1, "validation errors get exactly one attempt");
        assert!(report.sources_failed["propublica"].starts_with("VALIDATION_ERROR"));

        // retry_count must NOT increment; the row holds the message.
        let row = store.get_raw(EIN, "propublica").await.unwrap().unwrap();
        assert_eq!(row.retry_count, 0);
        assert!(!row.success);
        assert!(row.error_message.unwrap().starts_with("VALIDATION_ERROR"));
    }

    #[tokio::test]
    async fn exhausted_transient_failures_increment_retry_count() {
        let store = store().await;
        let stub = StubCollector::new("propublica", vec![CollectOutcome::failure("HTTP 503")]);
        let orch = Orchestrator::new(
            store.clone(),
            vec![stub.clone() as Arc<dyn Collector>],
            None,
            OrchestratorConfig {
                skip_sources: config_only(&["propublica"]).skip_sources,
                max_retries: 1,
            },
        );
        let (ok, _) = orch.collect_charity_data(EIN, None, None).await;
        assert!(!ok);
        assert_eq!(stub.calls(), 2, "initial attempt plus one retry");
        let row = store.get_raw(EIN, "propublica").await.unwrap().unwrap();
        assert_eq!(row.retry_count, 1);
    }

    #[tokio::test]
    async fn bbb_not_found_is_an_optional_miss() {
        let store = store().await;
        let propublica =
            StubCollector::new("propublica", vec![StubCollector::ok_outcome("propublica_990")]);
        let bbb = StubCollector::new(
            "bbb",
            vec![CollectOutcome::failure("Organization not found on BBB: Example")],
        );
        let orch = Orchestrator::new(
            store,
            vec![propublica as Arc<dyn Collector>, bbb as Arc<dyn Collector>],
            None,
            config_only(&["propublica", "bbb"]),
        );
        let (ok, report) = orch.collect_charity_data(EIN, None, Some("Example")).await;
        assert!(ok, "{:?}", report.missing_required_sources);
        assert_eq!(report.sources_optional_missing, vec!["bbb:not_found".to_string()]);
    }

    #[tokio::test]
    async fn missing_required_source_fails_the_crawl() {
        let store = store().await;
        let propublica = StubCollector::new("propublica", vec![CollectOutcome::failure("HTTP 404")]);
        let orch = Orchestrator::new(
            store,
            vec![propublica as Arc<dyn Collector>],
            None,
            config_only(&["propublica"]),
        );
        let (ok, report) = orch.collect_charity_data(EIN, None, None).await;
        assert!(!ok);
        assert_eq!(report.missing_required_sources, vec!["propublica".to_string()]);
    }

    #[tokio::test]
    async fn field_delta_reports_new_data() {
        let store = store().await;
        let stub = StubCollector::new("propublica", vec![StubCollector::ok_outcome("propublica_990")]);
        let orch = Orchestrator::new(
            store,
            vec![stub as Arc<dyn Collector>],
            None,
            config_only(&["propublica"]),
        );
        let (_, report) = orch.collect_charity_data(EIN, None, None).await;
        let delta = report.field_delta.unwrap();
        assert!(delta.found_new_data);
    }
}
