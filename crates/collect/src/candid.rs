//! Candid (GuideStar) profile scraping.
//!
//! Fully deterministic HTML parsing. Candid renders placeholder copy into
//! empty profile sections, so every extracted text runs through the
//! placeholder filter. Seal level is read only from title attributes or the
//! seal section id; CSS classes are default styling on every profile and
//! have produced false positives before.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};
use tracing::debug;

use goodmeasure_core::types::{ContentType, FetchOutput, ParseOutput};
use goodmeasure_core::{ein_digits, normalize_ein};
use goodmeasure_crawl::RateLimiter;

use crate::schema::check_enum;
use crate::{CollectOptions, Collector};

const BASE_URL: &str = "https://www.guidestar.org/profile";
const RATE_LIMIT_KEY: &str = "candid";
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(2);

const PLACEHOLDER_PATTERNS: &[&str] = &[
    "this organization has not provided",
    "not available",
    "no information available",
    "mission not available",
    "data not available",
    "add your organization",
    "claim your profile",
];

static SEAL_TITLE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(platinum|gold|silver|bronze)\s+(?:seal|transparency)").expect("seal title")
});

pub struct CandidCollector {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl CandidCollector {
    pub fn new(limiter: Arc<RateLimiter>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                 (KHTML, like Gecko) Version/15.5 Safari/605.1.15",
            )
            .build()
            .expect("reqwest client");
        Self { http, limiter, base_url: BASE_URL.to_string() }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn is_placeholder(text: &str) -> bool {
        let lower = text.to_lowercase();
        PLACEHOLDER_PATTERNS.iter().any(|p| lower.contains(p))
    }

    fn clean_text(text: &str) -> Option<String> {
        let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if cleaned.is_empty() || Self::is_placeholder(&cleaned) {
            None
        } else {
            Some(cleaned)
        }
    }

    fn select_first_text(document: &Html, selectors: &[&str]) -> Option<String> {
        for sel_str in selectors {
            let Ok(sel) = Selector::parse(sel_str) else { continue };
            for el in document.select(&sel) {
                if let Some(text) = Self::clean_text(&el.text().collect::<String>()) {
                    return Some(text);
                }
            }
        }
        None
    }

    fn select_list(document: &Html, selectors: &[&str]) -> Vec<String> {
        for sel_str in selectors {
            let Ok(sel) = Selector::parse(sel_str) else { continue };
            let items: Vec<String> = document
                .select(&sel)
                .filter_map(|el| Self::clean_text(&el.text().collect::<String>()))
                .collect();
            if !items.is_empty() {
                let mut deduped = items;
                deduped.dedup();
                return deduped;
            }
        }
        Vec::new()
    }

    /// Seal level via title attribute or the seal section, never CSS classes.
    fn extract_seal(document: &Html) -> Option<String> {
        if let Ok(sel) = Selector::parse("img[title], [title*='Seal'], [title*='seal']") {
            for el in document.select(&sel) {
                if let Some(title) = el.value().attr("title") {
                    if let Some(caps) = SEAL_TITLE_RE.captures(title) {
                        return Some(caps[1].to_lowercase());
                    }
                }
            }
        }
        if let Ok(sel) = Selector::parse("#seal-of-transparency, [id*='seal-of-transparency']") {
            for el in document.select(&sel) {
                let text = el.text().collect::<String>();
                if let Some(caps) = SEAL_TITLE_RE.captures(&text) {
                    return Some(caps[1].to_lowercase());
                }
            }
        }
        None
    }

    fn extract_ein_on_page(document: &Html) -> Option<String> {
        let sel = Selector::parse("[data-ein], .ein, #ein").ok()?;
        for el in document.select(&sel) {
            if let Some(attr) = el.value().attr("data-ein") {
                if let Ok(ein) = normalize_ein(attr) {
                    return Some(ein);
                }
            }
            let text = el.text().collect::<String>();
            let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() == 9 {
                return normalize_ein(&digits).ok();
            }
        }
        None
    }
}

#[async_trait]
impl Collector for CandidCollector {
    fn source_name(&self) -> &'static str {
        "candid"
    }

    fn schema_key(&self) -> &'static str {
        "candid_profile"
    }

    async fn fetch(&self, ein: &str, _opts: &CollectOptions) -> FetchOutput {
        let digits = ein_digits(ein);
        if digits.len() != 9 {
            return FetchOutput::err(ContentType::Html, format!("Invalid EIN format: {ein}"));
        }
        let url = format!("{}/{}-{}", self.base_url, &digits[..2], &digits[2..]);
        debug!(ein, "fetching Candid profile");

        self.limiter.wait(RATE_LIMIT_KEY, RATE_LIMIT_DELAY).await;

        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return FetchOutput::err(ContentType::Html, "Request timeout".to_string())
            }
            Err(e) => return FetchOutput::err(ContentType::Html, format!("Request failed: {e}")),
        };
        match response.status().as_u16() {
            200 => match response.text().await {
                Ok(body) => FetchOutput::ok(body, ContentType::Html),
                Err(e) => FetchOutput::err(ContentType::Html, format!("body read failed: {e}")),
            },
            404 => FetchOutput::err(ContentType::Html, format!("No profile found for EIN {ein}")),
            other => FetchOutput::err(ContentType::Html, format!("HTTP {other}")),
        }
    }

    async fn parse(&self, raw: &str, ein: &str, _opts: &CollectOptions) -> ParseOutput {
        let document = Html::parse_document(raw);
        let mut profile = Map::new();

        let normalized = normalize_ein(ein).unwrap_or_else(|_| ein.to_string());
        profile.insert("ein".into(), json!(normalized));

        if let Some(page_ein) = Self::extract_ein_on_page(&document) {
            if !goodmeasure_core::ein_matches(&page_ein, ein) {
                return ParseOutput::validation_err(format!(
                    "EIN mismatch: requested {ein} but profile shows {page_ein}"
                ));
            }
        }

        if let Some(name) = Self::select_first_text(&document, &["h1", ".org-name", "[itemprop='name']"]) {
            profile.insert("name".into(), json!(name));
        }
        if let Some(mission) = Self::select_first_text(
            &document,
            &["#mission-statement", ".mission-statement", "[data-section='mission'] p", "#mission p"],
        ) {
            profile.insert("mission".into(), json!(mission));
        }
        if let Some(tagline) = Self::select_first_text(&document, &[".tagline", "#tagline"]) {
            profile.insert("tagline".into(), json!(tagline));
        }

        let programs = Self::select_list(
            &document,
            &["#programs h3", ".program-name", "[data-section='programs'] h3"],
        );
        if !programs.is_empty() {
            profile.insert("programs".into(), json!(programs));
        }
        let populations = Self::select_list(
            &document,
            &["#populations-served li", ".populations-served li"],
        );
        if !populations.is_empty() {
            profile.insert("populations_served".into(), json!(populations));
        }
        let areas = Self::select_list(&document, &["#areas-served li", ".areas-served li"]);
        if !areas.is_empty() {
            profile.insert("areas_served".into(), json!(areas));
        }
        let aka = Self::select_list(&document, &["#aka-names li", ".also-known-as li"]);
        if !aka.is_empty() {
            profile.insert("aka_names".into(), json!(aka));
        }

        if let Some(ceo) = Self::select_first_text(
            &document,
            &["#principal-officer", ".principal-officer-name", "[data-section='leadership'] h4"],
        ) {
            profile.insert("ceo_name".into(), json!(ceo));
        }

        if let Some(seal) = Self::extract_seal(&document) {
            profile.insert("seal_level".into(), json!(seal));
        }

        let profile = Value::Object(profile);
        if let Err(e) = check_enum(&profile, "seal_level", &["platinum", "gold", "silver", "bronze"]) {
            return ParseOutput::validation_err(e);
        }
        ParseOutput::ok(json!({ "candid_profile": profile }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> CandidCollector {
        CandidCollector::new(Arc::new(RateLimiter::new()), Duration::from_secs(5))
    }

    const PROFILE_PAGE: &str = r#"<html><body>
        <h1>Example Relief Foundation</h1>
        <div id="mission-statement">To provide emergency relief to families in need.</div>
        <div id="programs"><h3>Food Security</h3><h3>Refugee Services</h3></div>
        <ul id="populations-served"><li>Refugees</li><li>Low-income families</li></ul>
        <img title="Platinum Seal of Transparency" src="/seal.png" class="bb-gold" />
    </body></html>"#;

    #[tokio::test]
    async fn parses_profile_fields() {
        let parsed = collector().parse(PROFILE_PAGE, "95-4453134", &CollectOptions::default()).await;
        assert!(parsed.success, "{:?}", parsed.error);
        let profile = &parsed.parsed_data.unwrap()["candid_profile"];
        assert_eq!(profile["name"], "Example Relief Foundation");
        assert_eq!(profile["programs"].as_array().unwrap().len(), 2);
        assert_eq!(profile["populations_served"][0], "Refugees");
    }

    #[tokio::test]
    async fn seal_comes_from_title_not_css_class() {
        // The img carries a misleading bb-gold class; the title attribute is
        // authoritative.
        let parsed = collector().parse(PROFILE_PAGE, "95-4453134", &CollectOptions::default()).await;
        let profile = parsed.parsed_data.unwrap();
        assert_eq!(profile["candid_profile"]["seal_level"], "platinum");
    }

    #[tokio::test]
    async fn css_class_alone_yields_no_seal() {
        let html = r#"<html><body><h1>Org</h1>
            <div class="bb-gold seal-widget">Transparency</div></body></html>"#;
        let parsed = collector().parse(html, "95-4453134", &CollectOptions::default()).await;
        let profile = parsed.parsed_data.unwrap();
        assert!(profile["candid_profile"].get("seal_level").is_none());
    }

    #[tokio::test]
    async fn placeholder_text_is_filtered() {
        let html = r#"<html><body><h1>Org</h1>
            <div id="mission-statement">This organization has not provided information.</div>
        </body></html>"#;
        let parsed = collector().parse(html, "95-4453134", &CollectOptions::default()).await;
        let profile = parsed.parsed_data.unwrap();
        assert!(profile["candid_profile"].get("mission").is_none());
    }

    #[tokio::test]
    async fn page_ein_mismatch_fails_validation() {
        let html = r#"<html><body><h1>Org</h1><span class="ein">30-0298794</span></body></html>"#;
        let parsed = collector().parse(html, "95-4453134", &CollectOptions::default()).await;
        assert!(!parsed.success);
        assert!(parsed.error.unwrap().starts_with("VALIDATION_ERROR"));
    }
}
