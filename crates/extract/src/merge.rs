//! Field merge with source precedence.
//!
//! Factual fields trust structured data over regex over the LLM; semantic
//! fields invert that. The winning source is kept per field for provenance.

use std::collections::HashMap;

use serde_json::{Map, Value};

use goodmeasure_core::types::ExtractionResult;

const FACTUAL_FIELDS: &[&str] = &[
    "ein", "contact_email", "contact_phone", "address", "social_media", "donate_url",
    "volunteer_url", "logo_url", "name", "url", "founded_year", "tax_deductible",
];

const SEMANTIC_FIELDS: &[&str] = &[
    "mission", "vision", "tagline", "values", "programs", "target_populations",
    "geographic_coverage", "impact_metrics", "beneficiaries", "leadership", "additional_info",
    "accepts_zakat", "zakat_evidence",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    Structured,
    Deterministic,
    Llm,
}

fn source_kind(source: &str) -> SourceKind {
    if source.starts_with("llm-") || source == "llm" {
        SourceKind::Llm
    } else if source.starts_with("regex-") || source == "regex" {
        SourceKind::Deterministic
    } else {
        // json-ld, opengraph, microdata, rdfa
        SourceKind::Structured
    }
}

fn priority(field: &str, source: &str) -> u8 {
    let kind = source_kind(source);
    let semantic = SEMANTIC_FIELDS.contains(&field);
    // Unknown fields default to factual precedence.
    if semantic {
        match kind {
            SourceKind::Llm => 3,
            SourceKind::Structured => 2,
            SourceKind::Deterministic => 1,
        }
    } else {
        match kind {
            SourceKind::Structured => 3,
            SourceKind::Deterministic => 2,
            SourceKind::Llm => 1,
        }
    }
}

#[derive(Debug, Default)]
pub struct MergedData {
    pub merged: Map<String, Value>,
    /// field name -> winning extraction source
    pub sources: Map<String, Value>,
}

/// Merge one field's candidates: highest `(priority, confidence)` wins.
pub fn merge_field(field: &str, candidates: &[&ExtractionResult]) -> Option<(Value, String)> {
    let winner = candidates.iter().filter(|r| !r.field_value.is_null()).max_by(|a, b| {
        let pa = priority(field, &a.extraction_source);
        let pb = priority(field, &b.extraction_source);
        pa.cmp(&pb)
            .then_with(|| a.confidence.partial_cmp(&b.confidence).unwrap_or(std::cmp::Ordering::Equal))
    })?;
    Some((winner.field_value.clone(), winner.extraction_source.clone()))
}

/// Merge everything from a crawl. Exactly one result is selected per field.
pub fn merge_all(results: &[ExtractionResult]) -> MergedData {
    let mut by_field: HashMap<&str, Vec<&ExtractionResult>> = HashMap::new();
    for result in results {
        by_field.entry(result.field_name.as_str()).or_default().push(result);
    }

    let mut merged = MergedData::default();
    for (field, candidates) in by_field {
        if let Some((value, source)) = merge_field(field, &candidates) {
            merged.merged.insert(field.to_string(), value);
            merged.sources.insert(field.to_string(), Value::String(source));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(field: &str, value: Value, source: &str, confidence: f64) -> ExtractionResult {
        ExtractionResult::new(field, value, source, confidence, "https://c.org/")
    }

    #[test]
    fn factual_fields_prefer_structured() {
        let results = vec![
            result("ein", json!("A"), "json-ld", 1.0),
            result("ein", json!("B"), "regex-ein", 0.9),
            result("ein", json!("C"), "llm-about", 0.95),
        ];
        let merged = merge_all(&results);
        assert_eq!(merged.merged["ein"], "A");
        assert_eq!(merged.sources["ein"], "json-ld");
    }

    #[test]
    fn semantic_fields_prefer_llm() {
        let results = vec![
            result("mission", json!("A"), "json-ld", 1.0),
            result("mission", json!("B"), "regex-contact", 0.9),
            result("mission", json!("C"), "llm-about", 0.8),
        ];
        let merged = merge_all(&results);
        assert_eq!(merged.merged["mission"], "C");
        assert_eq!(merged.sources["mission"], "llm-about");
    }

    #[test]
    fn graceful_degradation_when_sources_absent() {
        // Factual field with only an LLM candidate still merges.
        let results = vec![result("ein", json!("C"), "llm-homepage", 0.8)];
        let merged = merge_all(&results);
        assert_eq!(merged.merged["ein"], "C");

        // Semantic field with only structured data still merges.
        let results = vec![result("mission", json!("A"), "opengraph", 0.7)];
        let merged = merge_all(&results);
        assert_eq!(merged.merged["mission"], "A");
    }

    #[test]
    fn confidence_breaks_priority_ties() {
        let results = vec![
            result("contact_email", json!("low@x.org"), "regex-contact", 0.5),
            result("contact_email", json!("high@x.org"), "regex-contact", 0.9),
        ];
        let merged = merge_all(&results);
        assert_eq!(merged.merged["contact_email"], "high@x.org");
    }

    #[test]
    fn unknown_fields_use_factual_precedence() {
        let results = vec![
            result("mystery", json!("structured"), "microdata", 0.9),
            result("mystery", json!("llm"), "llm-homepage", 1.0),
        ];
        let merged = merge_all(&results);
        assert_eq!(merged.merged["mystery"], "structured");
    }

    #[test]
    fn null_values_never_win() {
        let results = vec![
            result("ein", Value::Null, "json-ld", 1.0),
            result("ein", json!("12-3456789"), "regex-ein", 0.9),
        ];
        let merged = merge_all(&results);
        assert_eq!(merged.merged["ein"], "12-3456789");
    }
}
