//! Source collectors.
//!
//! Every third-party source implements [`Collector`]: a raw `fetch` (wire IO
//! only) and a schema-binding `parse`, with a default `collect` that chains
//! them. Collectors never raise past the orchestrator boundary; failures
//! come back as result structs with message strings.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use goodmeasure_core::types::{FetchOutput, ParseOutput};

pub mod bbb;
pub mod candid;
pub mod charity_navigator;
pub mod delta;
pub mod form990_grants;
pub mod orchestrator;
pub mod propublica;
pub mod schema;
pub mod website;

pub use orchestrator::{CollectionReport, Orchestrator, OrchestratorConfig};

/// Source-specific inputs the orchestrator threads through.
#[derive(Debug, Default, Clone)]
pub struct CollectOptions {
    pub website_url: Option<String>,
    pub charity_name: Option<String>,
}

/// Outcome of a full collect: raw payload for storage plus the parsed,
/// schema-keyed document.
#[derive(Debug, Clone)]
pub struct CollectOutcome {
    pub success: bool,
    pub raw: Option<String>,
    pub parsed: Option<Value>,
    pub error: Option<String>,
    pub cost_usd: f64,
}

impl CollectOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Self { success: false, raw: None, parsed: None, error: Some(error.into()), cost_usd: 0.0 }
    }
}

#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable source id (`propublica`, `candid`, ...).
    fn source_name(&self) -> &'static str;

    /// Key the parsed document is wrapped under (`propublica_990`, ...).
    fn schema_key(&self) -> &'static str;

    /// Raw wire fetch; no parsing.
    async fn fetch(&self, ein: &str, opts: &CollectOptions) -> FetchOutput;

    /// Bind a raw payload to the validated schema.
    async fn parse(&self, raw: &str, ein: &str, opts: &CollectOptions) -> ParseOutput;

    /// Fetch then parse. Collectors with combined pipelines override this.
    async fn collect(&self, ein: &str, opts: &CollectOptions) -> CollectOutcome {
        let fetched = self.fetch(ein, opts).await;
        if !fetched.success {
            return CollectOutcome::failure(fetched.error.unwrap_or_else(|| "fetch failed".into()));
        }
        let raw = fetched.raw_data.unwrap_or_default();
        let parsed = self.parse(&raw, ein, opts).await;
        if !parsed.success {
            return CollectOutcome {
                success: false,
                raw: Some(raw),
                parsed: None,
                error: parsed.error,
                cost_usd: 0.0,
            };
        }
        let mut document = parsed.parsed_data.unwrap_or(Value::Null);
        if let Value::Object(map) = &mut document {
            map.insert("fetch_timestamp".into(), Value::String(Utc::now().to_rfc3339()));
        }
        CollectOutcome { success: true, raw: Some(raw), parsed: Some(document), error: None, cost_usd: 0.0 }
    }
}

/// Registry of collectors by source name, in required-source order.
pub type CollectorRegistry = HashMap<&'static str, Arc<dyn Collector>>;

pub fn registry_from(collectors: Vec<Arc<dyn Collector>>) -> CollectorRegistry {
    collectors.into_iter().map(|c| (c.source_name(), c)).collect()
}
