//! Schedule I / Schedule F grant data from IRS 990 XML filings.
//!
//! Filing object ids are scraped from the ProPublica organization page, the
//! XML is downloaded (and cached forever; filed 990s never change), and the
//! grant tables are parsed with per-grant plausibility bounds.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use goodmeasure_core::types::{ContentType, FetchOutput, ParseOutput, RawPayload};
use goodmeasure_core::ein_digits;
use goodmeasure_crawl::RateLimiter;

use crate::{CollectOptions, Collector};

const ORG_PAGE_URL: &str = "https://projects.propublica.org/nonprofits/organizations";
const XML_URL: &str = "https://projects.propublica.org/nonprofits/download-xml";
const RATE_LIMIT_KEY: &str = "propublica";
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(2);
const MAX_FILINGS: usize = 3;
const RATE_LIMIT_WAIT: Duration = Duration::from_secs(65);

/// Single grants larger than this (or negative) are parse errors, not data.
const MAX_GRANT_USD: f64 = 10_000_000_000.0;

const FILING_SEPARATOR: &str = "\n<!-- NEXT_FILING -->\n";

static OBJECT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"download-xml\?object_id=(\d+)").expect("object id"));

pub struct Form990GrantsCollector {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    xml_cache_dir: PathBuf,
    org_page_url: String,
    xml_url: String,
}

impl Form990GrantsCollector {
    pub fn new(limiter: Arc<RateLimiter>, xml_cache_dir: PathBuf, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .expect("reqwest client");
        if let Err(e) = std::fs::create_dir_all(&xml_cache_dir) {
            warn!("could not create 990 XML cache dir: {e}");
        }
        Self {
            http,
            limiter,
            xml_cache_dir,
            org_page_url: ORG_PAGE_URL.to_string(),
            xml_url: XML_URL.to_string(),
        }
    }

    pub fn with_urls(mut self, org_page_url: impl Into<String>, xml_url: impl Into<String>) -> Self {
        self.org_page_url = org_page_url.into();
        self.xml_url = xml_url.into();
        self
    }

    async fn filing_object_ids(&self, ein: &str) -> Result<Vec<String>, String> {
        let digits = ein_digits(ein);
        let url = format!("{}/{digits}", self.org_page_url);
        self.limiter.wait(RATE_LIMIT_KEY, RATE_LIMIT_DELAY).await;
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("Request failed: {e}"))?;
        if response.status().as_u16() == 404 {
            return Err(format!("Organization not found for EIN {ein}"));
        }
        if response.status().as_u16() != 200 {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }
        let body = response.text().await.map_err(|e| format!("body read failed: {e}"))?;

        let mut ids: Vec<String> = Vec::new();
        for caps in OBJECT_ID_RE.captures_iter(&body) {
            let id = caps[1].to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
            if ids.len() >= MAX_FILINGS {
                break;
            }
        }
        Ok(ids)
    }

    fn cache_path(&self, object_id: &str) -> PathBuf {
        self.xml_cache_dir.join(format!("{object_id}.xml"))
    }

    /// Filed XML is immutable, so the cache has no TTL.
    async fn fetch_xml(&self, object_id: &str) -> Result<String, String> {
        let cache_path = self.cache_path(object_id);
        if let Ok(cached) = std::fs::read_to_string(&cache_path) {
            debug!(object_id, "990 XML cache hit");
            return Ok(cached);
        }

        let url = format!("{}?object_id={object_id}", self.xml_url);
        for attempt in 0..2 {
            self.limiter.wait(RATE_LIMIT_KEY, RATE_LIMIT_DELAY).await;
            let response = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| format!("Request failed: {e}"))?;
            match response.status().as_u16() {
                200 => {
                    let body = response.text().await.map_err(|e| format!("body read failed: {e}"))?;
                    if let Err(e) = std::fs::write(&cache_path, &body) {
                        warn!(object_id, "990 XML cache write failed: {e}");
                    }
                    return Ok(body);
                }
                429 if attempt == 0 => {
                    info!(object_id, "rate limited on XML download; waiting 65s");
                    tokio::time::sleep(RATE_LIMIT_WAIT).await;
                }
                other => return Err(format!("HTTP {other}")),
            }
        }
        Err("Rate limited (429) after retry".to_string())
    }
}

#[derive(Debug, Default)]
struct GrantRow {
    recipient: Option<String>,
    region: Option<String>,
    purpose: Option<String>,
    amount: Option<f64>,
}

impl GrantRow {
    fn into_value(self) -> Value {
        json!({
            "recipient": self.recipient,
            "region": self.region,
            "purpose": self.purpose,
            "amount": self.amount,
        })
    }
}

/// Parse one filing's Schedule I (domestic) and Schedule F (foreign) grant
/// tables. Amounts outside [0, $10B] are dropped.
fn parse_grant_tables(xml: &str) -> (Vec<Value>, Vec<Value>) {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut domestic: Vec<Value> = Vec::new();
    let mut foreign: Vec<Value> = Vec::new();

    // Element groups: RecipientTable rows are Schedule I, the
    // outside-US groups are Schedule F.
    let mut current: Option<(bool, GrantRow)> = None;
    let mut text_target: Option<&'static str> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().local_name().as_ref() {
                b"RecipientTable" => current = Some((false, GrantRow::default())),
                b"GrantsToOrgOutsideUSGrp" | b"ForeignIndividualsGrantsGrp" => {
                    current = Some((true, GrantRow::default()))
                }
                b"BusinessNameLine1Txt" | b"RecipientNameBusiness" => {
                    text_target = Some("recipient")
                }
                b"RegionTxt" => text_target = Some("region"),
                b"PurposeOfGrantTxt" | b"GrantTypeTxt" => text_target = Some("purpose"),
                b"CashGrantAmt" | b"AmountOfCashGrant" => text_target = Some("amount"),
                _ => {}
            },
            Ok(Event::End(e)) => match e.name().local_name().as_ref() {
                b"RecipientTable" | b"GrantsToOrgOutsideUSGrp" | b"ForeignIndividualsGrantsGrp" => {
                    if let Some((is_foreign, row)) = current.take() {
                        match row.amount {
                            Some(amount) if !(0.0..=MAX_GRANT_USD).contains(&amount) => {
                                warn!(amount, "grant amount outside bounds; dropping row");
                            }
                            _ => {
                                if is_foreign {
                                    foreign.push(row.into_value());
                                } else {
                                    domestic.push(row.into_value());
                                }
                            }
                        }
                    }
                }
                b"BusinessNameLine1Txt" | b"RecipientNameBusiness" | b"RegionTxt"
                | b"PurposeOfGrantTxt" | b"GrantTypeTxt" | b"CashGrantAmt"
                | b"AmountOfCashGrant" => text_target = None,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if let (Some(target), Some((_, row))) = (text_target, current.as_mut()) {
                    if let Ok(text) = t.unescape() {
                        let text = text.trim().to_string();
                        match target {
                            "recipient" => row.recipient = Some(text),
                            "region" => row.region = Some(text),
                            "purpose" => row.purpose = Some(text),
                            "amount" => row.amount = text.parse().ok(),
                            _ => {}
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("990 XML parse error: {e}");
                break;
            }
        }
        buf.clear();
    }
    (domestic, foreign)
}

#[async_trait]
impl Collector for Form990GrantsCollector {
    fn source_name(&self) -> &'static str {
        "form990_grants"
    }

    fn schema_key(&self) -> &'static str {
        "grants_profile"
    }

    async fn fetch(&self, ein: &str, _opts: &CollectOptions) -> FetchOutput {
        let digits = ein_digits(ein);
        if digits.len() != 9 {
            return FetchOutput::err(ContentType::Xml, format!("Invalid EIN format: {ein}"));
        }

        let object_ids = match self.filing_object_ids(ein).await {
            Ok(ids) if ids.is_empty() => {
                return FetchOutput::err(ContentType::Xml, format!("No 990 XML filings for EIN {ein}"))
            }
            Ok(ids) => ids,
            Err(e) => return FetchOutput::err(ContentType::Xml, e),
        };

        let mut bodies: Vec<String> = Vec::new();
        for object_id in &object_ids {
            match self.fetch_xml(object_id).await {
                Ok(xml) => bodies.push(xml),
                Err(e) => warn!(object_id, "XML fetch failed: {e}"),
            }
        }
        if bodies.is_empty() {
            return FetchOutput::err(ContentType::Xml, "All XML downloads failed");
        }

        let payload = RawPayload::new(
            json!({ "object_ids": object_ids }),
            bodies.join(FILING_SEPARATOR),
        );
        FetchOutput::ok(payload.encode(), ContentType::Xml)
    }

    async fn parse(&self, raw: &str, _ein: &str, _opts: &CollectOptions) -> ParseOutput {
        let payload = RawPayload::decode(raw);
        let mut domestic: Vec<Value> = Vec::new();
        let mut foreign: Vec<Value> = Vec::new();

        for filing in payload.body.split(FILING_SEPARATOR) {
            let (d, f) = parse_grant_tables(filing);
            domestic.extend(d);
            foreign.extend(f);
        }

        let total: f64 = domestic
            .iter()
            .chain(foreign.iter())
            .filter_map(|g| g["amount"].as_f64())
            .sum();

        let mut profile = Map::new();
        profile.insert("object_ids".into(), payload.metadata.get("object_ids").cloned().unwrap_or(json!([])));
        profile.insert("grant_count".into(), json!(domestic.len() + foreign.len()));
        profile.insert("total_grants_usd".into(), json!(total));
        profile.insert("domestic_grants".into(), Value::Array(domestic));
        profile.insert("foreign_grants".into(), Value::Array(foreign));

        ParseOutput::ok(json!({ "grants_profile": Value::Object(profile) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn collector(dir: &TempDir) -> Form990GrantsCollector {
        Form990GrantsCollector::new(
            Arc::new(RateLimiter::new()),
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        )
    }

    const SCHEDULE_I_XML: &str = r#"<?xml version="1.0"?>
<Return xmlns="http://www.irs.gov/efile">
  <IRS990ScheduleI>
    <RecipientTable>
      <RecipientBusinessName><BusinessNameLine1Txt>Local Food Bank</BusinessNameLine1Txt></RecipientBusinessName>
      <PurposeOfGrantTxt>Food distribution</PurposeOfGrantTxt>
      <CashGrantAmt>250000</CashGrantAmt>
    </RecipientTable>
    <RecipientTable>
      <RecipientBusinessName><BusinessNameLine1Txt>Bad Row Org</BusinessNameLine1Txt></RecipientBusinessName>
      <CashGrantAmt>99999999999999</CashGrantAmt>
    </RecipientTable>
  </IRS990ScheduleI>
  <IRS990ScheduleF>
    <GrantsToOrgOutsideUSGrp>
      <RegionTxt>East Africa</RegionTxt>
      <PurposeOfGrantTxt>Water wells</PurposeOfGrantTxt>
      <CashGrantAmt>400000</CashGrantAmt>
    </GrantsToOrgOutsideUSGrp>
  </IRS990ScheduleF>
</Return>"#;

    #[test]
    fn grant_tables_parse_with_bounds() {
        let (domestic, foreign) = parse_grant_tables(SCHEDULE_I_XML);
        assert_eq!(domestic.len(), 1, "out-of-bounds row must be dropped");
        assert_eq!(domestic[0]["recipient"], "Local Food Bank");
        assert_eq!(domestic[0]["amount"], 250000.0);
        assert_eq!(foreign.len(), 1);
        assert_eq!(foreign[0]["region"], "East Africa");
    }

    #[tokio::test]
    async fn parse_aggregates_multiple_filings() {
        let dir = TempDir::new().unwrap();
        let raw = RawPayload::new(
            json!({"object_ids": ["111", "222"]}),
            format!("{SCHEDULE_I_XML}{FILING_SEPARATOR}{SCHEDULE_I_XML}"),
        )
        .encode();
        let parsed = collector(&dir).parse(&raw, "95-4453134", &CollectOptions::default()).await;
        assert!(parsed.success);
        let profile = &parsed.parsed_data.unwrap()["grants_profile"];
        assert_eq!(profile["grant_count"], 4);
        assert_eq!(profile["total_grants_usd"], 1300000.0);
        assert_eq!(profile["object_ids"][0], "111");
    }

    #[test]
    fn malformed_xml_yields_empty_tables() {
        let (domestic, foreign) = parse_grant_tables("<Return><RecipientTable><unclosed");
        assert!(domestic.is_empty());
        assert!(foreign.is_empty());
    }
}
