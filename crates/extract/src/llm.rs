//! LLM-assisted page extraction.
//!
//! Pages are cleaned to compact text, classified by URL into a page type,
//! and sent to the model with a page-type-conditioned prompt and a typed
//! response schema. Every extracted field carries provenance and the call's
//! cost is attached to the result.

use serde_json::{json, Value};
use tracing::{debug, warn};

use goodmeasure_core::types::{ExtractionResult, PageType};
use goodmeasure_llm::GeminiClient;

use crate::clean::{clean_for_llm, Cleaned};

const MAX_PROMPT_CHARS: usize = 12_000;
const LLM_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Default)]
pub struct LlmExtraction {
    pub results: Vec<ExtractionResult>,
    pub cost_usd: f64,
    /// Pages whose cleaned text was too short to extract from.
    pub js_needed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

pub struct WebsiteExtractor {
    client: GeminiClient,
}

impl WebsiteExtractor {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }

    /// Extract from a batch of `(url, html)` pages. Individual page failures
    /// are recorded and do not abort the batch.
    pub async fn extract_pages(&self, pages: &[(String, String)]) -> LlmExtraction {
        let mut extraction = LlmExtraction::default();
        for (url, html) in pages {
            let text = match clean_for_llm(html) {
                Cleaned::Text(t) => t,
                Cleaned::NeedsJs => {
                    debug!(url, "cleaned text too short; marking js_rendering_needed");
                    extraction.js_needed.push(url.clone());
                    continue;
                }
            };
            let page_type = page_type_for_url(url);
            match self.extract_one(url, &text, page_type).await {
                Ok((results, cost)) => {
                    extraction.results.extend(results);
                    extraction.cost_usd += cost;
                }
                Err(e) => {
                    warn!(url, "LLM extraction failed: {e}");
                    extraction.errors.push((url.clone(), e));
                }
            }
        }
        extraction
    }

    async fn extract_one(
        &self,
        url: &str,
        text: &str,
        page_type: PageType,
    ) -> Result<(Vec<ExtractionResult>, f64), String> {
        let mut clipped = text;
        if clipped.len() > MAX_PROMPT_CHARS {
            let mut end = MAX_PROMPT_CHARS;
            while !clipped.is_char_boundary(end) {
                end -= 1;
            }
            clipped = &clipped[..end];
        }

        let prompt = format!(
            "{}\n\nPage URL: {url}\n\nPage content:\n{clipped}",
            page_prompt(page_type)
        );
        let (value, response) = self
            .client
            .generate_json(Some(SYSTEM_PROMPT), &prompt, extraction_schema())
            .await
            .map_err(|e| e.to_string())?;

        let source = format!("llm-{}", page_type.as_str());
        let mut results = Vec::new();
        if let Value::Object(map) = value {
            for (field, field_value) in map {
                if is_empty_value(&field_value) {
                    continue;
                }
                results.push(ExtractionResult::new(
                    field,
                    field_value,
                    source.clone(),
                    LLM_CONFIDENCE,
                    url,
                ));
            }
        }
        Ok((results, response.cost_usd))
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

const SYSTEM_PROMPT: &str = "You extract structured facts about charitable organizations from \
their web pages. Only report information stated on the page. Use null for anything the page \
does not state. Never invent values.";

fn page_prompt(page_type: PageType) -> &'static str {
    match page_type {
        PageType::Homepage => {
            "This is the organization's homepage. Extract its name, mission, tagline, main \
             programs, and any contact or donation details shown."
        }
        PageType::Zakat => {
            "This page discusses zakat. Determine whether the organization states it accepts \
             zakat or is zakat-eligible, and quote the exact supporting sentence in \
             zakat_evidence."
        }
        PageType::About => {
            "This is an about/mission page. Extract the mission, vision, values, founding \
             details, and leadership names with titles."
        }
        PageType::Programs => {
            "This page describes programs. List each distinct program, the populations it \
             serves, and the geographic areas covered."
        }
        PageType::Impact => {
            "This page reports impact. Extract concrete impact metrics (numbers with their \
             units and years) and beneficiary counts. Quote figures exactly as stated."
        }
        PageType::Donate => {
            "This is a donation page. Extract accepted donation methods, whether donations \
             are tax-deductible, any EIN shown, and whether zakat is mentioned."
        }
        PageType::Contact => {
            "This is a contact page. Extract the contact email, phone number, and mailing \
             address."
        }
        _ => {
            "Extract any factual organization details on this page: mission, programs, \
             impact metrics, contact information, and zakat or tax-deductibility mentions."
        }
    }
}

/// Response schema in Gemini's OpenAPI subset. All fields nullable so the
/// model can decline per field.
fn extraction_schema() -> Value {
    fn s(desc: &str) -> Value {
        json!({"type": "STRING", "nullable": true, "description": desc})
    }
    fn arr(desc: &str) -> Value {
        json!({"type": "ARRAY", "nullable": true, "description": desc, "items": {"type": "STRING"}})
    }
    json!({
        "type": "OBJECT",
        "properties": {
            "name": s("Official organization name"),
            "mission": s("Mission statement as written"),
            "vision": s("Vision statement"),
            "tagline": s("Short tagline or slogan"),
            "values": arr("Stated organizational values"),
            "programs": arr("Distinct program names"),
            "target_populations": arr("Populations served"),
            "geographic_coverage": arr("Countries or regions served"),
            "impact_metrics": arr("Concrete impact figures, quoted exactly"),
            "beneficiaries": s("Total beneficiaries served, with year if stated"),
            "leadership": {
                "type": "ARRAY", "nullable": true,
                "items": {
                    "type": "OBJECT",
                    "properties": {"name": {"type": "STRING"}, "title": {"type": "STRING"}},
                    "required": ["name", "title"]
                }
            },
            "ein": s("Tax identifier if shown (XX-XXXXXXX)"),
            "contact_email": s("Contact email address"),
            "contact_phone": s("Contact phone number"),
            "address": s("Mailing address"),
            "donate_url": s("Donation page URL if linked"),
            "tax_deductible": {"type": "BOOLEAN", "nullable": true},
            "accepts_zakat": {"type": "BOOLEAN", "nullable": true},
            "zakat_evidence": s("Exact sentence supporting zakat eligibility"),
            "additional_info": s("Other notable facts")
        }
    })
}

/// URL-based page typing for prompt selection. Thin wrapper so this crate
/// does not depend on the crawler; the keyword logic matches the URL scorer.
fn page_type_for_url(url: &str) -> PageType {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_lowercase())
        .unwrap_or_else(|_| url.to_lowercase());
    if path.is_empty() || path == "/" {
        PageType::Homepage
    } else if path.contains("zakat") || path.contains("zakaat") {
        PageType::Zakat
    } else if path.contains("donate") || path.contains("give") || path.contains("ways-to-") {
        PageType::Donate
    } else if path.contains("contact") {
        PageType::Contact
    } else if path.contains("impact") || path.contains("outcome") || path.contains("results") {
        PageType::Impact
    } else if path.contains("program") || path.contains("what-we-do") || path.contains("our-work") {
        PageType::Programs
    } else if path.contains("about") || path.contains("mission") || path.contains("who-we-are") {
        PageType::About
    } else {
        PageType::Other
    }
}
