//! BBB Wise Giving Alliance accreditation reports.
//!
//! give.org renders report bodies through an admin-ajax endpoint: the shell
//! page carries a nonce and a pair of ids, and a POST returns the real HTML.
//! Fetched report HTML must pass a substance-marker check; empty shells are
//! logged and treated as a miss rather than an error.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use goodmeasure_core::types::{ContentType, FetchOutput, ParseOutput, RawPayload};
use goodmeasure_crawl::RateLimiter;

use crate::{CollectOptions, Collector};

const BASE_URL: &str = "https://give.org";
const RATE_LIMIT_KEY: &str = "bbb";
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(2);

/// Real report bodies always carry at least one of these; their absence
/// means we got a pre-AJAX shell.
const SUBSTANCE_MARKERS: &[&str] = &[
    "Standards for Charity Accountability",
    "meets the 20 standards",
    "did not meet",
    "Accredited Charity",
    "Standards Not Met",
    "unable to verify",
];

static NONCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""nonce"\s*:\s*"([^"]+)""#).expect("nonce"));
static CHARITY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""charity_?[Ii]d"\s*:\s*"?(\d+)"?"#).expect("charity id"));
static REPORT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""report_?[Ii]d"\s*:\s*"?(\d+)"?"#).expect("report id"));

pub struct BbbCollector {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl BbbCollector {
    pub fn new(limiter: Arc<RateLimiter>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/120.0.0.0 Safari/537.36",
            )
            .build()
            .expect("reqwest client");
        Self { http, limiter, base_url: BASE_URL.to_string() }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Token-set name matching for search results; exact ordering varies.
    fn names_match(expected: &str, found: &str) -> bool {
        fn tokens(name: &str) -> HashSet<String> {
            name.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| t.len() > 2)
                .filter(|t| !matches!(*t, "the" | "inc" | "incorporated" | "foundation" | "fund" | "and" | "for" | "org"))
                .map(str::to_string)
                .collect()
        }
        let expected_tokens = tokens(expected);
        let found_tokens = tokens(found);
        if expected_tokens.is_empty() || found_tokens.is_empty() {
            return false;
        }
        let shared = expected_tokens.intersection(&found_tokens).count();
        shared * 2 >= expected_tokens.len()
    }

    async fn search_charity(&self, charity_name: &str) -> Result<Option<String>, String> {
        let url = format!("{}/search?q={}", self.base_url, urlencode(charity_name));
        self.limiter.wait(RATE_LIMIT_KEY, RATE_LIMIT_DELAY).await;
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if response.status().as_u16() != 200 {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }
        let body = response.text().await.map_err(|e| format!("body read failed: {e}"))?;

        let document = Html::parse_document(&body);
        let Ok(sel) = Selector::parse("a[href*='/charity-reviews/']") else {
            return Ok(None);
        };
        for el in document.select(&sel) {
            let text = el.text().collect::<String>();
            if Self::names_match(charity_name, text.trim()) {
                let href = el.value().attr("href").unwrap_or_default();
                let full = if href.starts_with('/') {
                    format!("{}{href}", self.base_url)
                } else {
                    href.to_string()
                };
                return Ok(Some(full));
            }
        }
        Ok(None)
    }

    async fn fetch_report_html(&self, review_url: &str) -> Result<(String, Value), String> {
        self.limiter.wait(RATE_LIMIT_KEY, RATE_LIMIT_DELAY).await;
        let response = self
            .http
            .get(review_url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if response.status().as_u16() != 200 {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }
        let shell = response.text().await.map_err(|e| format!("body read failed: {e}"))?;

        let nonce = NONCE_RE.captures(&shell).map(|c| c[1].to_string());
        let charity_id = CHARITY_ID_RE.captures(&shell).map(|c| c[1].to_string());
        let report_id = REPORT_ID_RE.captures(&shell).map(|c| c[1].to_string());

        let metadata = json!({
            "review_url": review_url,
            "charity_id": charity_id,
            "report_id": report_id,
        });

        let (Some(nonce), Some(charity_id), Some(report_id)) = (nonce, charity_id, report_id) else {
            warn!(review_url, "could not extract nonce/ids; returning shell HTML");
            return Ok((shell, metadata));
        };

        self.limiter.wait(RATE_LIMIT_KEY, RATE_LIMIT_DELAY).await;
        let ajax = self
            .http
            .post(format!("{}/wp-admin/admin-ajax.php", self.base_url))
            .form(&[
                ("action", "give_charity_report"),
                ("nonce", nonce.as_str()),
                ("charity_id", charity_id.as_str()),
                ("report_id", report_id.as_str()),
            ])
            .send()
            .await
            .map_err(|e| format!("AJAX request failed: {e}"))?;
        if ajax.status().as_u16() != 200 {
            warn!(review_url, status = ajax.status().as_u16(), "AJAX call failed; using shell");
            return Ok((shell, metadata));
        }
        let ajax_json: Value = match ajax.json().await {
            Ok(v) => v,
            Err(_) => return Ok((shell, metadata)),
        };
        if ajax_json["success"] == true {
            if let Some(html) = ajax_json["data"]["html"].as_str() {
                return Ok((html.to_string(), metadata));
            }
        }
        Ok((shell, metadata))
    }

    fn has_substance(html: &str) -> bool {
        SUBSTANCE_MARKERS.iter().any(|m| html.contains(m))
    }

    fn parse_report(html: &str) -> Map<String, Value> {
        let mut profile = Map::new();
        let accredited = html.contains("Accredited Charity")
            || html.contains("meets the 20 standards");
        profile.insert("accredited".into(), json!(accredited));

        if html.contains("Standards Not Met") || html.contains("did not meet") {
            profile.insert("standards_status".into(), json!("not_met"));
        } else if accredited {
            profile.insert("standards_status".into(), json!("met"));
        } else if html.contains("unable to verify") {
            profile.insert("standards_status".into(), json!("unverifiable"));
        }

        let document = Html::parse_document(html);
        if let Ok(sel) = Selector::parse("h1, h2.charity-name") {
            if let Some(el) = document.select(&sel).next() {
                let name = el.text().collect::<String>().trim().to_string();
                if !name.is_empty() {
                    profile.insert("name".into(), json!(name));
                }
            }
        }
        profile
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_string()
            } else if c == ' ' {
                "+".to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

#[async_trait]
impl Collector for BbbCollector {
    fn source_name(&self) -> &'static str {
        "bbb"
    }

    fn schema_key(&self) -> &'static str {
        "bbb_profile"
    }

    async fn fetch(&self, ein: &str, opts: &CollectOptions) -> FetchOutput {
        let Some(charity_name) = opts.charity_name.as_deref().filter(|n| !n.is_empty()) else {
            return FetchOutput::err(ContentType::Html, "charity name required for BBB lookup");
        };
        debug!(ein, charity_name, "searching BBB");

        let review_url = match self.search_charity(charity_name).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                return FetchOutput::err(
                    ContentType::Html,
                    format!("Organization not found on BBB: {charity_name}"),
                )
            }
            Err(e) => return FetchOutput::err(ContentType::Html, e),
        };

        match self.fetch_report_html(&review_url).await {
            Ok((html, metadata)) => {
                FetchOutput::ok(RawPayload::new(metadata, html).encode(), ContentType::Html)
            }
            Err(e) => FetchOutput::err(ContentType::Html, e),
        }
    }

    async fn parse(&self, raw: &str, _ein: &str, _opts: &CollectOptions) -> ParseOutput {
        let payload = RawPayload::decode(raw);
        if !Self::has_substance(&payload.body) {
            // JS-rendered shell with no report content. Logged and surfaced
            // as a miss, not an error the orchestrator should retry.
            debug!("BBB report lacks substance markers; treating as not found");
            return ParseOutput::err("Organization not found: report shell had no substance");
        }
        let mut profile = Self::parse_report(&payload.body);
        if let Some(url) = payload.metadata.get("review_url") {
            profile.insert("review_url".into(), url.clone());
        }
        ParseOutput::ok(json!({ "bbb_profile": Value::Object(profile) }))
    }
}
