use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result of a collector's raw fetch. No parsing has happened yet; `raw_data`
/// is whatever the wire gave us (JSON, HTML, or XML).
#[derive(Debug, Clone)]
pub struct FetchOutput {
    pub success: bool,
    pub raw_data: Option<String>,
    pub content_type: ContentType,
    pub error: Option<String>,
}

impl FetchOutput {
    pub fn ok(raw_data: String, content_type: ContentType) -> Self {
        Self { success: true, raw_data: Some(raw_data), content_type, error: None }
    }

    pub fn err(content_type: ContentType, error: impl Into<String>) -> Self {
        Self { success: false, raw_data: None, content_type, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Json,
    Html,
    Xml,
}

/// Result of schema-binding a raw payload. `parsed_data` is wrapped under the
/// collector's schema key, e.g. `{"propublica_990": {...}}`.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub success: bool,
    pub parsed_data: Option<Value>,
    pub error: Option<String>,
}

impl ParseOutput {
    pub fn ok(parsed_data: Value) -> Self {
        Self { success: true, parsed_data: Some(parsed_data), error: None }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self { success: false, parsed_data: None, error: Some(error.into()) }
    }

    pub fn validation_err(error: impl std::fmt::Display) -> Self {
        Self::err(format!("VALIDATION_ERROR: {error}"))
    }
}

/// A charity as stored in the `charities` table. The normalized EIN is the
/// stable key everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charity {
    pub ein: String,
    pub name: String,
    pub website: Option<String>,
}

/// One row per charity per source in `raw_scraped_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub charity_ein: String,
    pub source: String,
    pub raw_payload: Option<String>,
    pub parsed_payload: Option<Value>,
    pub success: bool,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub scraped_at: DateTime<Utc>,
}

/// Raw payloads that must carry out-of-band metadata (a review URL, a filing
/// object id, multi-filing separators) are stored as this wrapper. The legacy
/// form was a leading HTML-comment marker on the body; `decode` accepts both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    #[serde(default)]
    pub metadata: Value,
    pub body: String,
}

impl RawPayload {
    pub fn new(metadata: Value, body: impl Into<String>) -> Self {
        Self { metadata, body: body.into() }
    }

    pub fn bare(body: impl Into<String>) -> Self {
        Self { metadata: Value::Null, body: body.into() }
    }

    pub fn encode(&self) -> String {
        if self.metadata.is_null() {
            return self.body.clone();
        }
        serde_json::to_string(self).unwrap_or_else(|_| self.body.clone())
    }

    /// Decode a stored payload. Accepts the structured wrapper, the legacy
    /// `<!-- NAME: {...} -->\nbody` comment-marker form, and bare bodies.
    pub fn decode(stored: &str) -> Self {
        if stored.starts_with('{') {
            if let Ok(wrapper) = serde_json::from_str::<RawPayload>(stored) {
                return wrapper;
            }
        }
        if let Some(rest) = stored.strip_prefix("<!--") {
            if let Some(end) = rest.find("-->") {
                let comment = &rest[..end];
                let body = rest[end + 3..].trim_start_matches('\n').to_string();
                if let Some(colon) = comment.find(':') {
                    if let Ok(meta) = serde_json::from_str::<Value>(comment[colon + 1..].trim()) {
                        return Self { metadata: meta, body };
                    }
                }
            }
        }
        Self::bare(stored)
    }
}

/// Entry in the `phase_cache` table deciding skip vs re-run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseCacheEntry {
    pub charity_ein: String,
    pub phase: String,
    pub fingerprint: String,
    pub ran_at: DateTime<Utc>,
    pub cost_usd: f64,
}

/// Synthesized per-charity document plus field-level provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharityDocument {
    pub charity_ein: String,
    pub data: Value,
    /// field name -> winning extraction source
    pub sources: Value,
    pub synthesized_at: DateTime<Utc>,
}

/// Final classification label attached by the scorer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletTag {
    #[serde(rename = "ZAKAT-ELIGIBLE")]
    ZakatEligible,
    #[serde(rename = "SADAQAH-ELIGIBLE")]
    SadaqahEligible,
    #[serde(rename = "SADAQAH-STRATEGIC")]
    SadaqahStrategic,
    #[serde(rename = "SADAQAH-GENERAL")]
    SadaqahGeneral,
    #[serde(rename = "INSUFFICIENT-DATA")]
    InsufficientData,
}

impl WalletTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletTag::ZakatEligible => "ZAKAT-ELIGIBLE",
            WalletTag::SadaqahEligible => "SADAQAH-ELIGIBLE",
            WalletTag::SadaqahStrategic => "SADAQAH-STRATEGIC",
            WalletTag::SadaqahGeneral => "SADAQAH-GENERAL",
            WalletTag::InsufficientData => "INSUFFICIENT-DATA",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceScores {
    pub impact: f64,
    pub alignment: f64,
    pub data_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineNarrative {
    pub headline: String,
    pub summary: String,
    pub strengths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub source_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichNarrative {
    pub body: String,
    pub all_citations: Vec<Citation>,
}

/// Row in `evaluations`, updated by the baseline/rich/judge phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub charity_ein: String,
    pub amal_score: f64,
    pub confidence_scores: ConfidenceScores,
    pub wallet_tag: WalletTag,
    pub baseline_narrative: Option<BaselineNarrative>,
    pub rich_narrative: Option<RichNarrative>,
    pub judge_score: Option<f64>,
    pub issues: Vec<String>,
    pub llm_cost_usd: f64,
    pub updated_at: DateTime<Utc>,
}

/// Page types aligned with the scoring dimensions; used to pick the LLM
/// extraction prompt for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    Homepage,
    Trust,
    Evidence,
    Effectiveness,
    Fit,
    Donate,
    Zakat,
    About,
    Programs,
    Impact,
    Contact,
    Other,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::Homepage => "homepage",
            PageType::Trust => "trust",
            PageType::Evidence => "evidence",
            PageType::Effectiveness => "effectiveness",
            PageType::Fit => "fit",
            PageType::Donate => "donate",
            PageType::Zakat => "zakat",
            PageType::About => "about",
            PageType::Programs => "programs",
            PageType::Impact => "impact",
            PageType::Contact => "contact",
            PageType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Trust,
    Evidence,
    Effectiveness,
    Fit,
    None,
}

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Trust => "trust",
            Dimension::Evidence => "evidence",
            Dimension::Effectiveness => "effectiveness",
            Dimension::Fit => "fit",
            Dimension::None => "none",
        }
    }
}

/// A single extracted field with provenance, produced per page and fed to the
/// merge engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub field_name: String,
    pub field_value: Value,
    pub extraction_source: String,
    pub confidence: f64,
    pub page_url: String,
    pub timestamp: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn new(
        field_name: impl Into<String>,
        field_value: Value,
        extraction_source: impl Into<String>,
        confidence: f64,
        page_url: impl Into<String>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            field_value,
            extraction_source: extraction_source.into(),
            confidence,
            page_url: page_url.into(),
            timestamp: Utc::now(),
        }
    }
}

/// PDF document classification, ordered by evaluation value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Form990,
    AuditReport,
    FinancialStatement,
    ImpactReport,
    EvaluationReport,
    TheoryOfChange,
    AnnualReport,
    ProgramReport,
    StrategicPlan,
    Governance,
    Other,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Form990 => "form_990",
            DocumentType::AuditReport => "audit_report",
            DocumentType::FinancialStatement => "financial_statement",
            DocumentType::ImpactReport => "impact_report",
            DocumentType::EvaluationReport => "evaluation_report",
            DocumentType::TheoryOfChange => "theory_of_change",
            DocumentType::AnnualReport => "annual_report",
            DocumentType::ProgramReport => "program_report",
            DocumentType::StrategicPlan => "strategic_plan",
            DocumentType::Governance => "governance",
            DocumentType::Other => "other",
        }
    }

    /// Lower is more valuable when prioritizing downloads.
    pub fn priority(&self) -> u32 {
        match self {
            DocumentType::Form990 => 0,
            DocumentType::AuditReport => 1,
            DocumentType::FinancialStatement => 2,
            DocumentType::ImpactReport => 3,
            DocumentType::EvaluationReport => 4,
            DocumentType::TheoryOfChange => 5,
            DocumentType::AnnualReport => 6,
            DocumentType::ProgramReport => 7,
            DocumentType::StrategicPlan => 8,
            DocumentType::Governance => 9,
            DocumentType::Other => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A discovered-and-downloaded PDF attached to a charity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdfRecord {
    pub charity_ein: String,
    pub source_url: String,
    pub document_type: DocumentType,
    pub fiscal_year: Option<i32>,
    pub file_path: Option<String>,
    pub file_hash: Option<String>,
    pub download_status: TransferStatus,
    pub extraction_status: ExtractionStatus,
    pub extracted_data: Option<Value>,
}
