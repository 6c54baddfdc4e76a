use std::path::PathBuf;

use serde::Deserialize;

use crate::error::PipelineError;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub crawl: CrawlConfig,
    pub llm: LlmConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Root for the HTML cache and crawl state (`<cache_root>/html`, `<cache_root>/state`).
    pub cache_dir: String,
    /// SQLite database path.
    pub db_path: String,
    /// Downloaded PDFs land under `<pdf_dir>/<charity_ein>/`.
    pub pdf_dir: String,
    /// Immutable 990 XML cache (`<xml_cache_dir>/<object_id>.xml`).
    pub xml_cache_dir: String,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_timeout_total")]
    pub timeout_total_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_site_delay_ms")]
    pub site_delay_ms: u64,
    #[serde(default = "default_html_ttl_days")]
    pub html_ttl_days: i64,
    #[serde(default = "default_max_pdf_downloads")]
    pub max_pdf_downloads: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConfig {
    pub export_dir: String,
    #[serde(default = "default_judge_threshold")]
    pub judge_threshold: f64,
}

fn default_checkpoint_every() -> usize { 0 }
fn default_max_pages() -> usize { 50 }
fn default_max_depth() -> u32 { 3 }
fn default_timeout_total() -> u64 { 90 }
fn default_request_timeout() -> u64 { 30 }
fn default_site_delay_ms() -> u64 { 500 }
fn default_html_ttl_days() -> i64 { 30 }
fn default_max_pdf_downloads() -> usize { 5 }
fn default_judge_threshold() -> f64 { 80.0 }
fn default_llm_timeout() -> u64 { 120 }
fn default_model() -> String { "gemini-2.5-flash".to_string() }

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; GoodMeasureBot/1.0; +https://amal.charity)".to_string()
}

impl AppConfig {
    pub fn from_toml(raw: &str) -> Result<Self, PipelineError> {
        toml::from_str(raw).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Environment overrides applied after the TOML load. `GOOGLE_API_KEY` is
    /// validated separately at startup so its absence produces a diagnostic
    /// rather than a mid-run failure.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GOODMEASURE_CACHE_DIR") {
            self.general.cache_dir = v;
        }
        if let Ok(v) = std::env::var("GOODMEASURE_DB") {
            self.general.db_path = v;
        }
        if let Ok(v) = std::env::var("GOODMEASURE_EXPORT_DIR") {
            self.export.export_dir = v;
        }
        if let Ok(v) = std::env::var("GOOGLE_API_KEY") {
            self.llm.api_key = Some(v);
        }
    }

    /// Missing required environment produces exit 1 with a diagnostic listing
    /// every absent variable, not just the first.
    pub fn require_env(&self) -> Result<(), PipelineError> {
        let mut missing = Vec::new();
        if self.llm.api_key.as_deref().unwrap_or("").is_empty() {
            missing.push("GOOGLE_API_KEY");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Config(format!(
                "missing required environment variables: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        PathBuf::from(&self.general.cache_dir)
    }

    pub fn export_root(&self) -> PathBuf {
        PathBuf::from(&self.export.export_dir)
    }
}
