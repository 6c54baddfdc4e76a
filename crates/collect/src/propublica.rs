//! IRS Form 990 data from the ProPublica Nonprofit Explorer API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use goodmeasure_core::types::{ContentType, FetchOutput, ParseOutput};
use goodmeasure_core::ein_digits;
use goodmeasure_crawl::RateLimiter;

use crate::schema::{check_bounds, check_ein_matches, check_non_negative, check_required_string};
use crate::{CollectOptions, Collector};

const BASE_URL: &str = "https://projects.propublica.org/nonprofits/api/v2";
const RATE_LIMIT_KEY: &str = "propublica";
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(2);
const MAX_FILING_HISTORY: usize = 3;

pub struct ProPublicaCollector {
    http: reqwest::Client,
    limiter: Arc<RateLimiter>,
    base_url: String,
}

impl ProPublicaCollector {
    pub fn new(limiter: Arc<RateLimiter>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { http, limiter, base_url: BASE_URL.to_string() }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn filing_history_entry(filing: &Value) -> Value {
        json!({
            "tax_year": filing.get("tax_prd_yr"),
            "total_revenue": filing.get("totrevenue"),
            "total_expenses": filing.get("totfuncexpns"),
            "program_expenses": filing.get("progrmservexp"),
            "admin_expenses": filing.get("mgmtandgeneral"),
            "fundraising_expenses": filing.get("fundfees"),
            "total_assets": filing.get("totassetsend"),
            "net_assets": filing.get("totnetassetend"),
            "employees_count": filing.get("totemploy"),
            "form_type": filing.get("formtype"),
        })
    }

    /// `filing_requirement_code == 0` means the org is not required to file;
    /// NTEE `X*` codes are religious organizations.
    fn exempt_status(org: &Value) -> (bool, Option<&'static str>) {
        let exempt = org
            .get("filing_requirement_code")
            .and_then(Value::as_i64)
            .map(|c| c == 0)
            .unwrap_or(false);
        if !exempt {
            return (false, None);
        }
        let religious = org
            .get("ntee_code")
            .and_then(Value::as_str)
            .map(|c| c.starts_with('X'))
            .unwrap_or(false);
        if religious {
            (true, Some("Religious organization"))
        } else {
            (true, Some("Exempt from Form 990 filing"))
        }
    }

    fn ruling_year(org: &Value) -> Value {
        let Some(ruling_date) = org.get("ruling_date").and_then(Value::as_str) else {
            return Value::Null;
        };
        let year_str = ruling_date.split('-').next().unwrap_or(ruling_date);
        match year_str.parse::<i64>() {
            Ok(year) if (1800..=2100).contains(&year) => Value::from(year),
            _ => Value::Null,
        }
    }

    fn code_as_string(org: &Value, key: &str) -> Value {
        match org.get(key) {
            Some(Value::Null) | None => Value::Null,
            Some(Value::String(s)) => Value::String(s.clone()),
            Some(other) => Value::String(other.to_string()),
        }
    }

    fn build_profile(ein: &str, org: &Value, filings: &[Value]) -> Value {
        let digits = ein_digits(ein);
        let (exempt, exempt_reason) = Self::exempt_status(org);

        let mut profile = Map::new();
        profile.insert("ein".into(), json!(format!("{}-{}", &digits[..2], &digits[2..])));
        profile.insert(
            "name".into(),
            org.get("name").cloned().unwrap_or_else(|| json!("Unknown")),
        );
        profile.insert("address".into(), org.get("address").cloned().unwrap_or(Value::Null));
        profile.insert("city".into(), org.get("city").cloned().unwrap_or(Value::Null));
        profile.insert("state".into(), org.get("state").cloned().unwrap_or(Value::Null));
        profile.insert("zip".into(), org.get("zipcode").cloned().unwrap_or(Value::Null));
        profile.insert("ntee_code".into(), org.get("ntee_code").cloned().unwrap_or(Value::Null));
        profile.insert("subsection_code".into(), Self::code_as_string(org, "subsection_code"));
        profile.insert("affiliation_code".into(), Self::code_as_string(org, "affiliation_code"));
        profile.insert("foundation_code".into(), Self::code_as_string(org, "foundation_code"));
        profile.insert("irs_ruling_year".into(), Self::ruling_year(org));
        profile.insert("form_990_exempt".into(), json!(exempt));
        profile.insert("form_990_exempt_reason".into(), json!(exempt_reason));

        if filings.is_empty() {
            profile.insert("filing_history".into(), json!([]));
            profile.insert("no_filings".into(), json!(true));
            return Value::Object(profile);
        }

        let most_recent = &filings[0];
        profile.insert("tax_year".into(), most_recent.get("tax_prd_yr").cloned().unwrap_or(Value::Null));
        for (field, key) in [
            ("total_revenue", "totrevenue"),
            ("total_expenses", "totfuncexpns"),
            ("program_expenses", "progrmservexp"),
            ("admin_expenses", "mgmtandgeneral"),
            ("fundraising_expenses", "fundfees"),
            ("total_assets", "totassetsend"),
            ("total_liabilities", "totliabend"),
            ("net_assets", "totnetassetend"),
            ("total_contributions", "totcntrbgfts"),
            ("program_service_revenue", "totprgmrevnue"),
            ("investment_income", "invstmntinc"),
            ("other_revenue", "othrevnue"),
            ("employees_count", "totemploy"),
            ("volunteers_count", "totvolunteers"),
            ("compensation_current_officers", "compnsatncurrofcr"),
        ] {
            profile.insert(field.into(), most_recent.get(key).cloned().unwrap_or(Value::Null));
        }
        profile.insert(
            "filing_type".into(),
            Self::code_as_string(most_recent, "formtype"),
        );
        profile.insert(
            "filing_history".into(),
            Value::Array(
                filings
                    .iter()
                    .take(MAX_FILING_HISTORY)
                    .map(Self::filing_history_entry)
                    .collect(),
            ),
        );
        profile.insert("no_filings".into(), json!(false));
        Value::Object(profile)
    }

    fn validate(profile: &Value, ein: &str) -> Result<(), String> {
        check_ein_matches(profile, "ein", ein)?;
        check_required_string(profile, "name", 1)?;
        check_bounds(profile, "tax_year", 1900.0, 2100.0)?;
        check_bounds(profile, "total_expenses", 0.0, 1.0e12)?;
        for field in [
            "total_revenue",
            "program_expenses",
            "admin_expenses",
            "fundraising_expenses",
            "total_assets",
            "employees_count",
            "volunteers_count",
            "compensation_current_officers",
        ] {
            check_non_negative(profile, field)?;
        }
        check_bounds(profile, "irs_ruling_year", 1800.0, 2100.0)?;
        Ok(())
    }
}

#[async_trait]
impl Collector for ProPublicaCollector {
    fn source_name(&self) -> &'static str {
        "propublica"
    }

    fn schema_key(&self) -> &'static str {
        "propublica_990"
    }

    async fn fetch(&self, ein: &str, _opts: &CollectOptions) -> FetchOutput {
        let digits = ein_digits(ein);
        if digits.len() != 9 {
            return FetchOutput::err(ContentType::Json, format!("Invalid EIN format: {ein}"));
        }
        let url = format!("{}/organizations/{digits}.json", self.base_url);
        debug!(ein, "fetching ProPublica 990 data");

        self.limiter.wait(RATE_LIMIT_KEY, RATE_LIMIT_DELAY).await;

        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return FetchOutput::err(ContentType::Json, "Request timeout".to_string())
            }
            Err(e) => return FetchOutput::err(ContentType::Json, format!("Request failed: {e}")),
        };

        match response.status().as_u16() {
            200 => match response.text().await {
                Ok(body) => FetchOutput::ok(body, ContentType::Json),
                Err(e) => FetchOutput::err(ContentType::Json, format!("body read failed: {e}")),
            },
            404 => FetchOutput::err(
                ContentType::Json,
                format!("Organization not found for EIN {ein}"),
            ),
            429 => {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("60")
                    .to_string();
                FetchOutput::err(
                    ContentType::Json,
                    format!("Rate limited (429). Retry after {retry_after}s"),
                )
            }
            other => FetchOutput::err(ContentType::Json, format!("HTTP {other}")),
        }
    }

    async fn parse(&self, raw: &str, ein: &str, _opts: &CollectOptions) -> ParseOutput {
        let data: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return ParseOutput::err(format!("Invalid JSON: {e}")),
        };
        let Some(org) = data.get("organization") else {
            return ParseOutput::err("Invalid API response structure");
        };

        // The API echoes the EIN it actually resolved; a mismatch means we
        // were served a different organization.
        if let Some(api_ein) = org.get("ein") {
            let api_ein = match api_ein {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !goodmeasure_core::ein_matches(&api_ein, ein) {
                return ParseOutput::validation_err(format!(
                    "EIN mismatch: requested {ein} but API returned {api_ein}"
                ));
            }
        }

        let filings: Vec<Value> = data
            .get("filings_with_data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let profile = Self::build_profile(ein, org, &filings);
        if let Err(e) = Self::validate(&profile, ein) {
            return ParseOutput::validation_err(e);
        }
        ParseOutput::ok(json!({ "propublica_990": profile }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector() -> ProPublicaCollector {
        ProPublicaCollector::new(Arc::new(RateLimiter::new()), Duration::from_secs(5))
    }

    fn sample_response() -> String {
        json!({
            "organization": {
                "ein": 954453134u64,
                "name": "Example Relief Foundation",
                "address": "1 Charity Way",
                "city": "Dearborn",
                "state": "MI",
                "zipcode": "48126",
                "ntee_code": "P20",
                "subsection_code": 3,
                "filing_requirement_code": 1,
                "ruling_date": "1994-06"
            },
            "filings_with_data": [
                {
                    "tax_prd_yr": 2023,
                    "totrevenue": 12845000,
                    "totfuncexpns": 11900000,
                    "progrmservexp": 10100000,
                    "mgmtandgeneral": 1200000,
                    "fundfees": 600000,
                    "totassetsend": 6900000,
                    "totnetassetend": 4200000,
                    "totemploy": 142,
                    "formtype": 0
                },
                {"tax_prd_yr": 2022, "totrevenue": 11000000, "totfuncexpns": 10400000},
                {"tax_prd_yr": 2021, "totrevenue": 9000000, "totfuncexpns": 8800000},
                {"tax_prd_yr": 2020, "totrevenue": 7000000, "totfuncexpns": 6900000}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn parses_profile_with_three_year_history() {
        let parsed = collector()
            .parse(&sample_response(), "95-4453134", &CollectOptions::default())
            .await;
        assert!(parsed.success, "{:?}", parsed.error);
        let doc = parsed.parsed_data.unwrap();
        let profile = &doc["propublica_990"];
        assert_eq!(profile["ein"], "95-4453134");
        assert_eq!(profile["tax_year"], 2023);
        assert_eq!(profile["total_revenue"], 12845000);
        assert_eq!(profile["irs_ruling_year"], 1994);
        assert_eq!(profile["filing_history"].as_array().unwrap().len(), 3);
        assert_eq!(profile["no_filings"], false);
        assert_eq!(profile["subsection_code"], "3");
    }

    #[tokio::test]
    async fn ein_mismatch_is_a_validation_error() {
        let parsed = collector()
            .parse(&sample_response(), "99-9999999", &CollectOptions::default())
            .await;
        assert!(!parsed.success);
        let error = parsed.error.unwrap();
        assert!(error.starts_with("VALIDATION_ERROR: EIN mismatch"), "{error}");
    }

    #[tokio::test]
    async fn org_without_filings_still_profiles() {
        let raw = json!({
            "organization": {
                "ein": "954453134",
                "name": "New Org",
                "filing_requirement_code": 0,
                "ntee_code": "X20"
            },
            "filings_with_data": []
        })
        .to_string();
        let parsed = collector().parse(&raw, "95-4453134", &CollectOptions::default()).await;
        assert!(parsed.success, "{:?}", parsed.error);
        let profile = &parsed.parsed_data.unwrap()["propublica_990"];
        assert_eq!(profile["no_filings"], true);
        assert_eq!(profile["form_990_exempt"], true);
        assert_eq!(profile["form_990_exempt_reason"], "Religious organization");
    }

    #[tokio::test]
    async fn malformed_json_is_a_parse_error() {
        let parsed = collector().parse("{oops", "95-4453134", &CollectOptions::default()).await;
        assert!(!parsed.success);
        assert!(parsed.error.unwrap().starts_with("Invalid JSON"));
    }
}
