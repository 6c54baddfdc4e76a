//! On-disk response cache and per-site crawl state.
//!
//! Layout under the cache root:
//!   html/<md5(url)>.json           cached responses (schema below)
//!   state/<md5(origin)>.json       per-site crawl memory
//!   state/cloudflare_profiles.json learned host -> bypass profile

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Bump when the LLM extraction schema gains fields; cached pages below this
/// version are re-extracted on the next crawl.
pub const CURRENT_SCHEMA_VERSION: &str = "2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlCacheEntry {
    pub url: String,
    pub html: String,
    pub final_url: String,
    pub cached_at: String,
    #[serde(default)]
    pub had_data: bool,
    #[serde(default)]
    pub extraction_methods_tried: Vec<String>,
    pub content_hash: String,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub fields_extracted: Vec<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    pub js_rendering_needed: bool,
    #[serde(default)]
    pub extraction_failure_reason: Option<String>,
}

fn default_schema_version() -> String {
    "1.0".to_string()
}

impl HtmlCacheEntry {
    /// Entries written without timezone info are treated as UTC.
    pub fn cached_at_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(&self.cached_at) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.cached_at, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }
}

pub fn content_hash(html: &str) -> String {
    hex::encode(Sha256::digest(html.as_bytes()))
}

fn url_key(url: &str) -> String {
    format!("{:x}", md5::compute(url.as_bytes()))
}

/// Arguments for a full cache write. `had_data` and friends start false/empty
/// at fetch time and are patched in once extraction has run.
#[derive(Debug, Default, Clone)]
pub struct CachePut<'a> {
    pub html: &'a str,
    pub final_url: &'a str,
    pub had_data: bool,
    pub extraction_methods_tried: Vec<String>,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
    pub js_rendering_needed: bool,
    pub extraction_failure_reason: Option<String>,
}

pub struct CrawlerCache {
    html_dir: PathBuf,
    state_dir: PathBuf,
    ttl_days: i64,
}

impl CrawlerCache {
    pub fn new(cache_root: impl AsRef<Path>, ttl_days: i64) -> std::io::Result<Self> {
        let root = cache_root.as_ref();
        let html_dir = root.join("html");
        let state_dir = root.join("state");
        fs::create_dir_all(&html_dir)?;
        fs::create_dir_all(&state_dir)?;
        Ok(Self { html_dir, state_dir, ttl_days })
    }

    pub fn ttl_days(&self) -> i64 {
        self.ttl_days
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn entry_path(&self, url: &str) -> PathBuf {
        self.html_dir.join(format!("{}.json", url_key(url)))
    }

    fn read_entry(&self, url: &str) -> Option<HtmlCacheEntry> {
        let path = self.entry_path(url);
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(url, "unreadable cache entry: {e}");
                None
            }
        }
    }

    /// TTL-checked read. Expired entries return None but stay on disk so
    /// their conditional-GET headers remain available via `http_headers`.
    pub fn get(&self, url: &str) -> Option<HtmlCacheEntry> {
        let entry = self.read_entry(url)?;
        let cached_at = entry.cached_at_utc()?;
        let age_days = (Utc::now() - cached_at).num_days();
        if age_days > self.ttl_days {
            debug!(url, age_days, "cache expired");
            return None;
        }
        Some(entry)
    }

    /// Write an entry. A write with content identical to the stored entry is
    /// skipped so repeated crawls do not touch the file.
    pub fn put(&self, url: &str, put: CachePut<'_>) {
        let new_hash = content_hash(put.html);
        if let Some(existing) = self.read_entry(url) {
            if existing.content_hash == new_hash {
                debug!(url, "cache write skipped (hash unchanged)");
                return;
            }
        }
        let entry = HtmlCacheEntry {
            url: url.to_string(),
            html: put.html.to_string(),
            final_url: put.final_url.to_string(),
            cached_at: Utc::now().to_rfc3339(),
            had_data: put.had_data,
            extraction_methods_tried: put.extraction_methods_tried,
            content_hash: new_hash,
            last_modified: put.last_modified,
            etag: put.etag,
            fields_extracted: Vec::new(),
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            js_rendering_needed: put.js_rendering_needed,
            extraction_failure_reason: put.extraction_failure_reason,
        };
        self.write_entry(url, &entry);
    }

    fn write_entry(&self, url: &str, entry: &HtmlCacheEntry) {
        let path = self.entry_path(url);
        match serde_json::to_string(entry) {
            Ok(raw) => {
                if let Err(e) = fs::write(&path, raw) {
                    warn!(url, "cache write failed: {e}");
                }
            }
            Err(e) => warn!(url, "cache serialize failed: {e}"),
        }
    }

    /// Patch extraction outcome onto an existing entry without rewriting the
    /// HTML body timestamps.
    pub fn update_had_data(
        &self,
        url: &str,
        had_data: bool,
        methods: &[String],
        js_rendering_needed: bool,
        extraction_failure_reason: Option<&str>,
    ) {
        let Some(mut entry) = self.read_entry(url) else {
            return;
        };
        entry.had_data = had_data;
        if !methods.is_empty() {
            entry.extraction_methods_tried = methods.to_vec();
        }
        if js_rendering_needed {
            entry.js_rendering_needed = true;
        }
        if let Some(reason) = extraction_failure_reason {
            entry.extraction_failure_reason = Some(reason.to_string());
        }
        self.write_entry(url, &entry);
    }

    pub fn update_fields_extracted(&self, url: &str, fields: &[String]) {
        let Some(mut entry) = self.read_entry(url) else {
            return;
        };
        entry.fields_extracted = fields.to_vec();
        self.write_entry(url, &entry);
    }

    /// Decide whether a URL needs a network round trip.
    pub fn should_refetch(&self, url: &str, force: bool) -> (bool, String) {
        if force {
            return (true, "force flag set".into());
        }
        let Some(entry) = self.read_entry(url) else {
            return (true, "not in cache".into());
        };
        let Some(cached_at) = entry.cached_at_utc() else {
            return (true, "unreadable timestamp".into());
        };
        let age_days = (Utc::now() - cached_at).num_days();
        if age_days > self.ttl_days {
            return (true, format!("cache expired (age {age_days}d > {}d)", self.ttl_days));
        }
        if entry.last_modified.is_some() || entry.etag.is_some() {
            return (false, "cache valid, has headers for conditional GET".into());
        }
        (false, format!("cache valid (age {age_days}d)"))
    }

    /// Cached pages extracted under an older schema need LLM re-extraction.
    pub fn needs_llm_reprocessing(&self, url: &str) -> (bool, String) {
        let Some(entry) = self.read_entry(url) else {
            return (true, "not in cache".into());
        };
        if entry.schema_version.as_str() < CURRENT_SCHEMA_VERSION {
            (
                true,
                format!("schema outdated ({} < {CURRENT_SCHEMA_VERSION})", entry.schema_version),
            )
        } else {
            (false, format!("schema current ({})", entry.schema_version))
        }
    }

    pub fn has_content_changed(&self, url: &str, new_html: &str) -> bool {
        match self.read_entry(url) {
            Some(entry) => entry.content_hash != content_hash(new_html),
            None => true,
        }
    }

    /// Stored conditional-GET headers: (last_modified, etag). Read without a
    /// TTL check; stale validators are still valid validators.
    pub fn http_headers(&self, url: &str) -> (Option<String>, Option<String>) {
        match self.read_entry(url) {
            Some(entry) => (entry.last_modified, entry.etag),
            None => (None, None),
        }
    }
}

// === per-site crawl state ===

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CrawlState {
    pub origin: String,
    #[serde(default)]
    pub tried_urls: HashSet<String>,
    #[serde(default)]
    pub pages_with_data: HashSet<String>,
    #[serde(default)]
    pub pages_with_no_data: HashSet<String>,
    #[serde(default)]
    pub pages_needing_js: HashSet<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl CrawlState {
    pub fn load(state_dir: &Path, origin: &str) -> Self {
        let path = Self::path(state_dir, origin);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(origin, "unreadable crawl state: {e}");
                Self { origin: origin.to_string(), ..Default::default() }
            }),
            Err(_) => Self { origin: origin.to_string(), ..Default::default() },
        }
    }

    /// Persisted at end-of-crawl, including failed crawls.
    pub fn save(&mut self, state_dir: &Path) {
        self.updated_at = Some(Utc::now().to_rfc3339());
        let path = Self::path(state_dir, &self.origin);
        match serde_json::to_string_pretty(self) {
            Ok(raw) => {
                if let Err(e) = fs::write(&path, raw) {
                    warn!(origin = %self.origin, "crawl state write failed: {e}");
                }
            }
            Err(e) => warn!(origin = %self.origin, "crawl state serialize failed: {e}"),
        }
    }

    pub fn record_outcome(&mut self, url: &str, had_data: bool, needs_js: bool) {
        self.tried_urls.insert(url.to_string());
        if had_data {
            self.pages_with_data.insert(url.to_string());
            self.pages_with_no_data.remove(url);
        } else {
            self.pages_with_no_data.insert(url.to_string());
            self.pages_with_data.remove(url);
        }
        if needs_js {
            self.pages_needing_js.insert(url.to_string());
        }
    }

    fn path(state_dir: &Path, origin: &str) -> PathBuf {
        state_dir.join(format!("{}.json", url_key(origin)))
    }
}

// === learned bot-bypass profiles ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub profile: String,
    pub updated_at: String,
}

/// `domain -> profile` map shared by all workers; reads are lock-free,
/// writes persist the whole file under the map entry lock.
pub struct CloudflareProfiles {
    path: PathBuf,
    map: dashmap::DashMap<String, ProfileEntry>,
}

impl CloudflareProfiles {
    pub fn load(state_dir: &Path) -> Self {
        let path = state_dir.join("cloudflare_profiles.json");
        let map = dashmap::DashMap::new();
        if let Ok(raw) = fs::read_to_string(&path) {
            if let Ok(entries) =
                serde_json::from_str::<std::collections::HashMap<String, ProfileEntry>>(&raw)
            {
                for (domain, entry) in entries {
                    map.insert(domain, entry);
                }
            }
        }
        Self { path, map }
    }

    pub fn get(&self, domain: &str) -> Option<String> {
        self.map.get(domain).map(|e| e.profile.clone())
    }

    pub fn set(&self, domain: &str, profile: &str) {
        self.map.insert(
            domain.to_string(),
            ProfileEntry { profile: profile.to_string(), updated_at: Utc::now().to_rfc3339() },
        );
        self.persist();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn persist(&self) {
        let snapshot: std::collections::HashMap<String, ProfileEntry> = self
            .map
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        match serde_json::to_string_pretty(&snapshot) {
            Ok(raw) => {
                if let Err(e) = fs::write(&self.path, raw) {
                    warn!("cloudflare profile write failed: {e}");
                }
            }
            Err(e) => warn!("cloudflare profile serialize failed: {e}"),
        }
    }
}
