//! Inline quality judges.
//!
//! Each phase's output is checked by a deterministic validator immediately
//! after it materializes. Any ERROR-severity issue aborts the charity's
//! pipeline and the phase's cache entry is deleted so the next run retries.

use serde_json::Value;

use crate::fingerprint::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Default, Clone)]
pub struct Verdict {
    pub issues: Vec<Issue>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warn)
            .map(|i| format!("{}: {}", i.field, i.message))
            .collect()
    }

    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.issues.push(Issue { severity: Severity::Error, field: field.into(), message: message.into() });
    }

    fn warn(&mut self, field: &str, message: impl Into<String>) {
        self.issues.push(Issue { severity: Severity::Warn, field: field.into(), message: message.into() });
    }
}

/// Run the deterministic judge for a phase against its materialized output.
pub fn judge_phase_output(phase: Phase, output: &Value) -> Verdict {
    match phase {
        Phase::Crawl => judge_crawl(output),
        Phase::Extract => judge_extract(output),
        Phase::Discover => judge_discover(output),
        Phase::Synthesize => judge_synthesize(output),
        Phase::Baseline => judge_baseline(output),
        Phase::Rich => judge_rich(output),
        Phase::Judge => Verdict::default(),
        Phase::Export => judge_export(output),
    }
}

fn judge_crawl(output: &Value) -> Verdict {
    let mut verdict = Verdict::default();
    let succeeded = output["sources_succeeded"].as_array().map(|a| a.len()).unwrap_or(0);
    if succeeded == 0 {
        verdict.error("sources_succeeded", "no source collected successfully");
    }
    if let Some(optional) = output["sources_optional_missing"].as_array() {
        for miss in optional {
            verdict.warn("sources_optional_missing", miss.as_str().unwrap_or("?").to_string());
        }
    }
    verdict
}

fn judge_extract(output: &Value) -> Verdict {
    let mut verdict = Verdict::default();
    let parsed = output["sources_parsed"].as_u64().unwrap_or(0);
    if parsed == 0 {
        verdict.error("sources_parsed", "no raw payload produced a validated schema");
    }
    if let Some(failures) = output["validation_failures"].as_array() {
        for failure in failures {
            verdict.warn("validation_failures", failure.as_str().unwrap_or("?").to_string());
        }
    }
    verdict
}

fn judge_discover(output: &Value) -> Verdict {
    let mut verdict = Verdict::default();
    if output["skipped_empty"] == true {
        verdict.warn("sections", "no discovery section returned data");
    }
    verdict
}

fn judge_synthesize(output: &Value) -> Verdict {
    let mut verdict = Verdict::default();
    let data = &output["data"];
    if !data.is_object() || data.as_object().map(|o| o.is_empty()).unwrap_or(true) {
        verdict.error("data", "synthesized document is empty");
        return verdict;
    }
    if data.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
        verdict.warn("name", "no canonical name synthesized");
    }
    if data.get("mission").is_none() {
        verdict.warn("mission", "no mission synthesized");
    }
    verdict
}

fn judge_baseline(output: &Value) -> Verdict {
    let mut verdict = Verdict::default();
    let score = output["amal_score"].as_f64().unwrap_or(-1.0);
    if !(0.0..=100.0).contains(&score) {
        verdict.error("amal_score", format!("score out of range: {score}"));
    }
    let impact = output["confidence_scores"]["impact"].as_f64().unwrap_or(-1.0);
    let alignment = output["confidence_scores"]["alignment"].as_f64().unwrap_or(-1.0);
    let data_confidence = output["confidence_scores"]["data_confidence"].as_f64().unwrap_or(-1.0);
    if !(0.0..=50.0).contains(&impact) {
        verdict.error("confidence_scores.impact", format!("out of range: {impact}"));
    }
    if !(0.0..=50.0).contains(&alignment) {
        verdict.error("confidence_scores.alignment", format!("out of range: {alignment}"));
    }
    if !(0.0..=1.0).contains(&data_confidence) {
        verdict.error("confidence_scores.data_confidence", format!("out of range: {data_confidence}"));
    }
    let narrative = &output["baseline_narrative"];
    if narrative["headline"].as_str().unwrap_or("").is_empty()
        || narrative["summary"].as_str().unwrap_or("").is_empty()
    {
        verdict.error("baseline_narrative", "headline and summary are required");
    }
    verdict
}

fn judge_rich(output: &Value) -> Verdict {
    let mut verdict = Verdict::default();
    if output["rich_narrative"].is_null() {
        verdict.warn("rich_narrative", "no rich narrative generated");
        return verdict;
    }
    let citations = output["rich_narrative"]["all_citations"]
        .as_array()
        .map(|a| a.len())
        .unwrap_or(0);
    if citations == 0 {
        verdict.warn("all_citations", "rich narrative has no citations");
    }
    verdict
}

/// Index/detail consistency is a hard failure: a summary that disagrees with
/// its detail file on name, tier, score, or wallet tag corrupts the site.
fn judge_export(output: &Value) -> Verdict {
    let mut verdict = Verdict::default();
    if output["skipped"] == true {
        verdict.warn("export", "below judge threshold; not exported");
        return verdict;
    }
    let (Some(detail), Some(summary)) = (output.get("detail"), output.get("summary")) else {
        verdict.error("export", "missing detail or summary document");
        return verdict;
    };
    for (detail_path, summary_key) in [
        (vec!["name"], "name"),
        (vec!["tier"], "tier"),
        (vec!["amalEvaluation", "amal_score"], "amal_score"),
        (vec!["amalEvaluation", "wallet_tag"], "wallet_tag"),
    ] {
        let mut detail_value = detail;
        for key in &detail_path {
            detail_value = &detail_value[*key];
        }
        if detail_value != &summary[summary_key] {
            verdict.error(
                summary_key,
                format!("index/detail mismatch: {detail_value} != {}", summary[summary_key]),
            );
        }
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn crawl_judge_requires_a_source() {
        let verdict = judge_phase_output(Phase::Crawl, &json!({"sources_succeeded": []}));
        assert!(!verdict.passed());
        let verdict = judge_phase_output(
            Phase::Crawl,
            &json!({"sources_succeeded": ["propublica"], "sources_optional_missing": ["bbb:not_found"]}),
        );
        assert!(verdict.passed());
        assert_eq!(verdict.warnings().len(), 1);
    }

    #[test]
    fn baseline_judge_bounds_scores() {
        let good = json!({
            "amal_score": 82.0,
            "confidence_scores": {"impact": 40.0, "alignment": 42.0, "data_confidence": 0.8},
            "baseline_narrative": {"headline": "h", "summary": "s", "strengths": []}
        });
        assert!(judge_phase_output(Phase::Baseline, &good).passed());

        let bad = json!({
            "amal_score": 120.0,
            "confidence_scores": {"impact": 40.0, "alignment": 42.0, "data_confidence": 0.8},
            "baseline_narrative": {"headline": "h", "summary": "s", "strengths": []}
        });
        assert!(!judge_phase_output(Phase::Baseline, &bad).passed());
    }

    #[test]
    fn export_judge_catches_index_drift() {
        let consistent = json!({
            "detail": {"name": "Org", "tier": "gold",
                        "amalEvaluation": {"amal_score": 85.0, "wallet_tag": "ZAKAT-ELIGIBLE"}},
            "summary": {"name": "Org", "tier": "gold", "amal_score": 85.0, "wallet_tag": "ZAKAT-ELIGIBLE"}
        });
        assert!(judge_phase_output(Phase::Export, &consistent).passed());

        let drifted = json!({
            "detail": {"name": "Org", "tier": "gold",
                        "amalEvaluation": {"amal_score": 85.0, "wallet_tag": "ZAKAT-ELIGIBLE"}},
            "summary": {"name": "Org", "tier": "silver", "amal_score": 85.0, "wallet_tag": "ZAKAT-ELIGIBLE"}
        });
        assert!(!judge_phase_output(Phase::Export, &drifted).passed());
    }

    #[test]
    fn empty_discover_is_a_warning_not_an_error() {
        let verdict = judge_phase_output(Phase::Discover, &json!({"skipped_empty": true}));
        assert!(verdict.passed());
        assert_eq!(verdict.warnings().len(), 1);
    }
}
