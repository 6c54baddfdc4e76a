//! Charity Navigator profile scraping.
//!
//! The profile page is a next-generation framework app; the reliable data
//! lives in its embedded JSON payload. Star-rating markup is the fallback,
//! and the LLM fills only fields both passes missed, with its numeric output
//! checked against plausibility bounds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use goodmeasure_core::types::{ContentType, FetchOutput, ParseOutput};
use goodmeasure_core::ein_digits;
use goodmeasure_crawl::RateLimiter;
use goodmeasure_llm::GeminiClient;

use crate::schema::{check_bounds, check_url};
use crate::{CollectOptions, Collector};

const BASE_URL: &str = "https://www.charitynavigator.org/ein";
const RATE_LIMIT_KEY: &str = "charity_navigator";
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

static STAR_RATING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)([0-4])\s*-?\s*star(?:s)?\s+(?:charity|rating)").expect("stars"));

static SCORE_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?:overall_?[Ss]core|score)"\s*:\s*([0-9]{1,3}(?:\.[0-9]+)?)"#).expect("score key")
});

static BEACON_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#""(accountability_?(?:and_?)?finance|impact_?(?:and_?)?(?:results|measurement)|leadership_?(?:and_?)?adaptability|culture_?(?:and_?)?community)_?score"\s*:\s*([0-9]{1,3}(?:\.[0-9]+)?)"#,
    )
    .expect("beacon")
});

static ENCOMPASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)"encompass(?:_?rating)?"\s*:\s*(true|\{)"#).expect("encompass"));

static CEO_COMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""(?:ceo_?compensation|compensation)"\s*:\s*([0-9]{4,9})"#).expect("ceo comp")
});

pub struct CharityNavigatorCollector {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    llm: Option<GeminiClient>,
    base_url: String,
}

impl CharityNavigatorCollector {
    pub fn new(limiter: Arc<RateLimiter>, llm: Option<GeminiClient>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
                 Chrome/120.0.0.0 Safari/537.36",
            )
            .build()
            .expect("reqwest client");
        Self { http, limiter, llm, base_url: BASE_URL.to_string() }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Pull score data out of the page's embedded JSON payload.
    fn extract_from_embedded_json(html: &str, profile: &mut Map<String, Value>) {
        let document = Html::parse_document(html);
        let mut blobs: Vec<String> = Vec::new();
        if let Ok(sel) = Selector::parse("script#__NEXT_DATA__, script[type='application/json']") {
            for el in document.select(&sel) {
                blobs.push(el.text().collect());
            }
        }
        // Frameworks also inline state into ordinary script tags.
        if blobs.is_empty() {
            if let Ok(sel) = Selector::parse("script") {
                for el in document.select(&sel) {
                    let text: String = el.text().collect();
                    if text.contains("\"score\"") || text.contains("Score\"") {
                        blobs.push(text);
                    }
                }
            }
        }

        for blob in &blobs {
            if !profile.contains_key("overall_score") {
                if let Some(caps) = SCORE_KEY_RE.captures(blob) {
                    if let Ok(score) = caps[1].parse::<f64>() {
                        if (0.0..=100.0).contains(&score) {
                            profile.insert("overall_score".into(), json!(score));
                        }
                    }
                }
            }
            for caps in BEACON_RE.captures_iter(blob) {
                let key = normalize_beacon_key(&caps[1]);
                if let Ok(score) = caps[2].parse::<f64>() {
                    if (0.0..=100.0).contains(&score) {
                        profile.entry(key.to_string()).or_insert(json!(score));
                    }
                }
            }
            if !profile.contains_key("cn_has_encompass_award") && ENCOMPASS_RE.is_match(blob) {
                // Encompass presence is treated as "has a rating".
                profile.insert("cn_has_encompass_award".into(), json!(true));
            }
            if !profile.contains_key("ceo_compensation") {
                if let Some(caps) = CEO_COMP_RE.captures(blob) {
                    if let Ok(comp) = caps[1].parse::<f64>() {
                        if (0.0..=20_000_000.0).contains(&comp) {
                            profile.insert("ceo_compensation".into(), json!(comp));
                        }
                    }
                }
            }
        }
    }

    /// Star-rating fallback when the JSON payload gave us nothing.
    fn extract_star_fallback(html: &str, profile: &mut Map<String, Value>) {
        if profile.contains_key("overall_score") {
            return;
        }
        if let Some(caps) = STAR_RATING_RE.captures(html) {
            if let Ok(stars) = caps[1].parse::<f64>() {
                profile.insert("star_rating".into(), json!(stars));
                profile.insert("overall_score".into(), json!(stars / 4.0 * 100.0));
            }
        }
    }

    fn extract_basics(html: &str, profile: &mut Map<String, Value>) {
        let document = Html::parse_document(html);
        if let Ok(sel) = Selector::parse("h1") {
            if let Some(el) = document.select(&sel).next() {
                let name = el.text().collect::<String>().trim().to_string();
                if !name.is_empty() {
                    profile.insert("name".into(), json!(name));
                }
            }
        }
        if let Ok(sel) = Selector::parse("a[href^='http']") {
            for el in document.select(&sel) {
                let text = el.text().collect::<String>().to_lowercase();
                if text.contains("visit website") || text.contains("official website") {
                    if let Some(href) = el.value().attr("href") {
                        profile.insert("website_url".into(), json!(href));
                        break;
                    }
                }
            }
        }
    }

    /// LLM fill for fields the deterministic passes missed. Numeric outputs
    /// go through the same bounds as the deterministic path.
    async fn fill_missing_with_llm(&self, html: &str, profile: &mut Map<String, Value>) -> f64 {
        let Some(client) = &self.llm else { return 0.0 };
        let missing: Vec<&str> = ["overall_score", "ceo_name", "ceo_compensation"]
            .into_iter()
            .filter(|k| !profile.contains_key(*k))
            .collect();
        if missing.is_empty() {
            return 0.0;
        }
        let text = match goodmeasure_extract::clean_for_llm(html) {
            goodmeasure_extract::Cleaned::Text(t) => t,
            goodmeasure_extract::Cleaned::NeedsJs => return 0.0,
        };
        let schema = json!({
            "type": "OBJECT",
            "properties": {
                "overall_score": {"type": "NUMBER", "nullable": true},
                "ceo_name": {"type": "STRING", "nullable": true},
                "ceo_compensation": {"type": "NUMBER", "nullable": true}
            }
        });
        let mut end = text.len().min(8_000);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let prompt = format!(
            "From this charity rating page, report only: {}. Use null when not stated.\n\n{}",
            missing.join(", "),
            &text[..end]
        );
        match client.generate_json(None, &prompt, schema).await {
            Ok((value, response)) => {
                if let Some(score) = value.get("overall_score").and_then(Value::as_f64) {
                    if (0.0..=100.0).contains(&score) && missing.contains(&"overall_score") {
                        profile.insert("overall_score".into(), json!(score));
                    }
                }
                if let Some(name) = value.get("ceo_name").and_then(Value::as_str) {
                    if missing.contains(&"ceo_name") && !name.is_empty() {
                        profile.insert("ceo_name".into(), json!(name));
                    }
                }
                if let Some(comp) = value.get("ceo_compensation").and_then(Value::as_f64) {
                    if (0.0..=20_000_000.0).contains(&comp) && missing.contains(&"ceo_compensation") {
                        profile.insert("ceo_compensation".into(), json!(comp));
                    }
                }
                response.cost_usd
            }
            Err(e) => {
                warn!("LLM fill failed: {e}");
                0.0
            }
        }
    }

    fn validate(profile: &Value) -> Result<(), String> {
        check_bounds(profile, "overall_score", 0.0, 100.0)?;
        for beacon in [
            "accountability_finance_score",
            "impact_results_score",
            "leadership_adaptability_score",
            "culture_community_score",
        ] {
            check_bounds(profile, beacon, 0.0, 100.0)?;
        }
        check_bounds(profile, "ceo_compensation", 0.0, 20_000_000.0)?;
        check_url(profile, "website_url")?;
        Ok(())
    }
}

fn normalize_beacon_key(raw: &str) -> &'static str {
    let lower = raw.to_lowercase();
    if lower.contains("accountability") {
        "accountability_finance_score"
    } else if lower.contains("impact") {
        "impact_results_score"
    } else if lower.contains("leadership") {
        "leadership_adaptability_score"
    } else {
        "culture_community_score"
    }
}

#[async_trait]
impl Collector for CharityNavigatorCollector {
    fn source_name(&self) -> &'static str {
        "charity_navigator"
    }

    fn schema_key(&self) -> &'static str {
        "cn_profile"
    }

    async fn fetch(&self, ein: &str, _opts: &CollectOptions) -> FetchOutput {
        let digits = ein_digits(ein);
        if digits.len() != 9 {
            return FetchOutput::err(ContentType::Html, format!("Invalid EIN format: {ein}"));
        }
        let url = format!("{}/{digits}", self.base_url);
        debug!(ein, "fetching Charity Navigator profile");

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
            404 => FetchOutput::err(ContentType::Html, format!("No rating found for EIN {ein}")),
            other => FetchOutput::err(ContentType::Html, format!("HTTP {other}")),
        }
    }

    async fn parse(&self, raw: &str, ein: &str, _opts: &CollectOptions) -> ParseOutput {
        let mut profile = Map::new();
        profile.insert("ein".into(), json!(goodmeasure_core::normalize_ein(ein).unwrap_or_else(|_| ein.to_string())));

        Self::extract_from_embedded_json(raw, &mut profile);
        Self::extract_star_fallback(raw, &mut profile);
        Self::extract_basics(raw, &mut profile);
        let llm_cost = self.fill_missing_with_llm(raw, &mut profile).await;
        if llm_cost > 0.0 {
            profile.insert("llm_cost_usd".into(), json!(llm_cost));
        }

        let profile = Value::Object(profile);
        if let Err(e) = Self::validate(&profile) {
            return ParseOutput::validation_err(e);
        }
        ParseOutput::ok(json!({ "cn_profile": profile }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> CharityNavigatorCollector {
        CharityNavigatorCollector::new(Arc::new(RateLimiter::new()), None, Duration::from_secs(5))
    }

    const NEXT_DATA_PAGE: &str = r#"<html><body>
        <h1>Example Relief Foundation</h1>
        <script id="__NEXT_DATA__" type="application/json">
        {"props":{"pageProps":{"rating":{"score":91.5,
          "accountability_and_finance_score":95,
          "impact_and_results_score":88,
          "leadership_adaptability_score":82.5,
          "culture_community_score":90,
          "encompass_rating":{"publication":"2025"},
          "ceo_compensation":185000}}}}
        </script>
    </body></html>"#;

    #[tokio::test]
    async fn embedded_json_beats_star_markup() {
        let parsed = collector()
            .parse(NEXT_DATA_PAGE, "95-4453134", &CollectOptions::default())
            .await;
        assert!(parsed.success, "{:?}", parsed.error);
        let profile = &parsed.parsed_data.unwrap()["cn_profile"];
        assert_eq!(profile["overall_score"], 91.5);
        assert_eq!(profile["accountability_finance_score"], 95.0);
        assert_eq!(profile["impact_results_score"], 88.0);
        assert_eq!(profile["cn_has_encompass_award"], true);
        assert_eq!(profile["ceo_compensation"], 185000.0);
        assert_eq!(profile["name"], "Example Relief Foundation");
    }

    #[tokio::test]
    async fn star_markup_is_the_fallback() {
        let html = r#"<html><body><h1>Org</h1><p>This is a 4-star charity.</p></body></html>"#;
        let parsed = collector().parse(html, "95-4453134", &CollectOptions::default()).await;
        assert!(parsed.success);
        let profile = &parsed.parsed_data.unwrap()["cn_profile"];
        assert_eq!(profile["star_rating"], 4.0);
        assert_eq!(profile["overall_score"], 100.0);
    }

    #[tokio::test]
    async fn implausible_embedded_score_is_ignored() {
        let html = r#"<script id="__NEXT_DATA__" type="application/json">{"score": 910}</script>"#;
        let parsed = collector().parse(html, "95-4453134", &CollectOptions::default()).await;
        assert!(parsed.success, "{:?}", parsed.error);
        let profile = &parsed.parsed_data.unwrap()["cn_profile"];
        assert!(profile.get("overall_score").is_none());
    }
}
