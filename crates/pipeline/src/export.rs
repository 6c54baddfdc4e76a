//! Static export: per-charity artifacts plus the index.
//!
//! Detail files are written atomically (temp file then rename). The index
//! rebuild is additive: previously exported summaries survive a run in which
//! their charity was not re-exported, and a rebuild that cannot export any
//! eligible charity is a hard error.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use goodmeasure_core::types::Evaluation;
use goodmeasure_core::PipelineError;
use goodmeasure_store::Store;

pub struct Exporter {
    export_root: PathBuf,
    judge_threshold: f64,
}

impl Exporter {
    pub fn new(export_root: impl AsRef<Path>, judge_threshold: f64) -> std::io::Result<Self> {
        let export_root = export_root.as_ref().to_path_buf();
        fs::create_dir_all(export_root.join("charities"))?;
        Ok(Self { export_root, judge_threshold })
    }

    pub fn detail_path(&self, ein: &str) -> PathBuf {
        self.export_root.join("charities").join(format!("charity-{ein}.json"))
    }

    pub fn index_path(&self) -> PathBuf {
        self.export_root.join("charities.json")
    }

    fn tier_for(amal_score: f64) -> &'static str {
        if amal_score >= 85.0 {
            "exceptional"
        } else if amal_score >= 70.0 {
            "strong"
        } else if amal_score >= 50.0 {
            "promising"
        } else {
            "developing"
        }
    }

    fn category_for(document: &Value) -> &'static str {
        let ntee = document["financials"]["ntee_code"].as_str().unwrap_or("");
        match ntee.chars().next() {
            Some('A') => "arts-culture",
            Some('B') => "education",
            Some('E') | Some('F') | Some('G') | Some('H') => "health",
            Some('K') => "food-agriculture",
            Some('L') => "housing",
            Some('M') | Some('P') => "human-services",
            Some('Q') => "international",
            Some('X') => "religion",
            _ => "other",
        }
    }

    /// Build the per-charity detail document.
    pub fn build_detail(document: &Value, evaluation: &Evaluation) -> Value {
        let ein = &evaluation.charity_ein;
        let mut detail = Map::new();
        detail.insert("id".into(), json!(goodmeasure_core::ein_digits(ein)));
        detail.insert("ein".into(), json!(ein));
        detail.insert(
            "name".into(),
            document.get("name").cloned().unwrap_or_else(|| json!("Unknown")),
        );
        detail.insert("category".into(), json!(Self::category_for(document)));
        detail.insert("tier".into(), json!(Self::tier_for(evaluation.amal_score)));
        detail.insert("mission".into(), document.get("mission").cloned().unwrap_or(Value::Null));

        let mut amal = Map::new();
        amal.insert("amal_score".into(), json!(evaluation.amal_score));
        amal.insert(
            "confidence_scores".into(),
            json!({
                "impact": evaluation.confidence_scores.impact,
                "alignment": evaluation.confidence_scores.alignment,
                "data_confidence": evaluation.confidence_scores.data_confidence,
            }),
        );
        amal.insert("wallet_tag".into(), json!(evaluation.wallet_tag.as_str()));
        if let Some(narrative) = &evaluation.baseline_narrative {
            amal.insert(
                "baseline_narrative".into(),
                json!({
                    "headline": narrative.headline,
                    "summary": narrative.summary,
                    "strengths": narrative.strengths,
                }),
            );
        }
        if let Some(rich) = &evaluation.rich_narrative {
            amal.insert(
                "rich_narrative".into(),
                json!({
                    "body": rich.body,
                    "all_citations": rich.all_citations.iter()
                        .map(|c| json!({"id": c.id, "source_url": c.source_url}))
                        .collect::<Vec<_>>(),
                }),
            );
        }
        if let Some(judge_score) = evaluation.judge_score {
            amal.insert("judge_score".into(), json!(judge_score));
        }
        detail.insert("amalEvaluation".into(), Value::Object(amal));

        detail.insert(
            "ui_signals_v1".into(),
            json!({
                "zakat_verified": evaluation.wallet_tag.as_str() == "ZAKAT-ELIGIBLE",
                "has_rich_narrative": evaluation.rich_narrative.is_some(),
                "data_confidence_band": if evaluation.confidence_scores.data_confidence >= 0.7 {
                    "high"
                } else if evaluation.confidence_scores.data_confidence >= 0.4 {
                    "medium"
                } else {
                    "low"
                },
            }),
        );
        Value::Object(detail)
    }

    /// Index entries are a projection of the detail file.
    pub fn build_summary(detail: &Value) -> Value {
        json!({
            "id": detail["id"],
            "ein": detail["ein"],
            "name": detail["name"],
            "category": detail["category"],
            "tier": detail["tier"],
            "amal_score": detail["amalEvaluation"]["amal_score"],
            "wallet_tag": detail["amalEvaluation"]["wallet_tag"],
        })
    }

    /// Atomic write: temp file in the target directory, then rename.
    fn write_atomic(&self, path: &Path, value: &Value) -> Result<(), PipelineError> {
        let raw = serde_json::to_string_pretty(value)
            .map_err(|e| PipelineError::Export(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, raw).map_err(|e| PipelineError::Export(format!("write {tmp:?}: {e}")))?;
        fs::rename(&tmp, path).map_err(|e| PipelineError::Export(format!("rename {path:?}: {e}")))?;
        Ok(())
    }

    /// Export one charity's detail file. Below-threshold evaluations skip
    /// with a marker output rather than failing.
    pub fn export_charity(
        &self,
        document: &Value,
        evaluation: &Evaluation,
    ) -> Result<Value, PipelineError> {
        let eligible = evaluation.judge_score.unwrap_or(0.0) >= self.judge_threshold;
        if !eligible {
            info!(
                ein = %evaluation.charity_ein,
                judge_score = evaluation.judge_score,
                threshold = self.judge_threshold,
                "below judge threshold; not exporting"
            );
            return Ok(json!({"skipped": true, "reason": "below judge threshold"}));
        }
        let detail = Self::build_detail(document, evaluation);
        let summary = Self::build_summary(&detail);
        self.write_atomic(&self.detail_path(&evaluation.charity_ein), &detail)?;
        info!(ein = %evaluation.charity_ein, "exported detail file");
        Ok(json!({"skipped": false, "detail": detail, "summary": summary}))
    }

    fn previous_index_entries(&self) -> Vec<Value> {
        let Ok(raw) = fs::read_to_string(self.index_path()) else {
            return Vec::new();
        };
        serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|v| v.get("charities").and_then(Value::as_array).cloned())
            .unwrap_or_default()
    }

    /// Rebuild `charities.json` from every eligible evaluation whose detail
    /// file exists, retaining previously indexed charities that were not
    /// re-exported this run.
    pub async fn rebuild_index(&self, store: &Store) -> Result<Value, PipelineError> {
        let evaluations = store
            .all_evaluations()
            .await
            .map_err(|e| PipelineError::Export(e.to_string()))?;
        let eligible: Vec<&Evaluation> = evaluations
            .iter()
            .filter(|e| e.judge_score.unwrap_or(0.0) >= self.judge_threshold)
            .collect();

        let mut entries: Vec<Value> = Vec::new();
        let mut seen_eins: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut export_failures = 0usize;

        for evaluation in &eligible {
            let path = self.detail_path(&evaluation.charity_ein);
            match fs::read_to_string(&path) {
                Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                    Ok(detail) => {
                        seen_eins.insert(evaluation.charity_ein.clone());
                        entries.push(Self::build_summary(&detail));
                    }
                    Err(e) => {
                        warn!(ein = %evaluation.charity_ein, "unreadable detail file: {e}");
                        export_failures += 1;
                    }
                },
                Err(_) => {
                    warn!(ein = %evaluation.charity_ein, "detail file missing; eligible but not exported");
                    export_failures += 1;
                }
            }
        }

        // Additive rebuild: keep prior entries for charities that failed to
        // re-export this run.
        for previous in self.previous_index_entries() {
            if let Some(ein) = previous.get("ein").and_then(Value::as_str) {
                if !seen_eins.contains(ein) && self.detail_path(ein).exists() {
                    seen_eins.insert(ein.to_string());
                    entries.push(previous);
                }
            }
        }

        if !eligible.is_empty() && entries.is_empty() {
            return Err(PipelineError::Export(format!(
                "index rebuild produced no entries ({export_failures} eligible charities failed to export)"
            )));
        }

        entries.sort_by(|a, b| {
            a.get("ein")
                .and_then(Value::as_str)
                .unwrap_or("")
                .cmp(b.get("ein").and_then(Value::as_str).unwrap_or(""))
        });

        let source_commit = store
            .latest_commit()
            .await
            .map_err(|e| PipelineError::Export(e.to_string()))?;
        let index = json!({
            "source_commit": source_commit,
            "charities": entries,
        });
        self.write_atomic(&self.index_path(), &index)?;
        info!(
            count = index["charities"].as_array().map(|a| a.len()).unwrap_or(0),
            "index rebuilt"
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use goodmeasure_core::types::{BaselineNarrative, ConfidenceScores, WalletTag};
    use tempfile::TempDir;

    fn evaluation(ein: &str, judge_score: f64) -> Evaluation {
        Evaluation {
            charity_ein: ein.to_string(),
            amal_score: 88.0,
            confidence_scores: ConfidenceScores { impact: 45.0, alignment: 43.0, data_confidence: 0.9 },
            wallet_tag: WalletTag::ZakatEligible,
            baseline_narrative: Some(BaselineNarrative {
                headline: "Strong evaluation".into(),
                summary: "A well documented organization doing verifiable work.".into(),
                strengths: vec!["Zakat eligible".into()],
            }),
            rich_narrative: None,
            judge_score: Some(judge_score),
            issues: vec![],
            llm_cost_usd: 0.12,
            updated_at: Utc::now(),
        }
    }

    fn document(name: &str) -> Value {
        json!({"name": name, "mission": "Feed families", "financials": {"ntee_code": "K31"}})
    }

    async fn seeded_store() -> Store {
        let s = Store::in_memory().await.unwrap();
        s.run_migrations().await.unwrap();
        s
    }

    #[tokio::test]
    async fn detail_file_is_written_atomically_and_projects() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path(), 80.0).unwrap();
        let output = exporter
            .export_charity(&document("Example"), &evaluation("12-3456789", 90.0))
            .unwrap();
        assert_eq!(output["skipped"], false);

        let written: Value = serde_json::from_str(
            &fs::read_to_string(exporter.detail_path("12-3456789")).unwrap(),
        )
        .unwrap();
        assert_eq!(written["ein"], "12-3456789");
        assert_eq!(written["category"], "food-agriculture");
        assert_eq!(written["tier"], "exceptional");
        assert_eq!(written["amalEvaluation"]["wallet_tag"], "ZAKAT-ELIGIBLE");
        // No stray temp files left behind.
        assert!(!exporter.detail_path("12-3456789").with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn below_threshold_is_skipped_not_failed() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path(), 80.0).unwrap();
        let output = exporter
            .export_charity(&document("Example"), &evaluation("12-3456789", 60.0))
            .unwrap();
        assert_eq!(output["skipped"], true);
        assert!(!exporter.detail_path("12-3456789").exists());
    }

    #[tokio::test]
    async fn index_rebuild_retains_preseeded_charities() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path(), 80.0).unwrap();
        let store = seeded_store().await;

        // Pre-seed three exported charities (detail + evaluation rows).
        for ein in ["11-1111111", "22-2222222", "33-3333333"] {
            let eval = evaluation(ein, 90.0);
            store.upsert_evaluation(&eval).await.unwrap();
            exporter.export_charity(&document("Seeded"), &eval).unwrap();
        }
        // Process a fourth charity this run.
        let fourth = evaluation("44-4444444", 92.0);
        store.upsert_evaluation(&fourth).await.unwrap();
        exporter.export_charity(&document("Fresh"), &fourth).unwrap();

        let index = exporter.rebuild_index(&store).await.unwrap();
        assert_eq!(index["charities"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn index_retains_entries_when_reexport_fails() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path(), 80.0).unwrap();
        let store = seeded_store().await;

        let first = evaluation("11-1111111", 90.0);
        store.upsert_evaluation(&first).await.unwrap();
        exporter.export_charity(&document("Seeded"), &first).unwrap();
        exporter.rebuild_index(&store).await.unwrap();

        // A later run has an eligible evaluation whose detail file vanished;
        // the index keeps going with what exists.
        let ghost = evaluation("99-9999999", 95.0);
        store.upsert_evaluation(&ghost).await.unwrap();
        let index = exporter.rebuild_index(&store).await.unwrap();
        let eins: Vec<&str> = index["charities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["ein"].as_str().unwrap())
            .collect();
        assert_eq!(eins, vec!["11-1111111"]);
    }

    #[tokio::test]
    async fn rebuild_with_zero_exports_is_an_error() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path(), 80.0).unwrap();
        let store = seeded_store().await;

        // Eligible evaluation but no detail file was ever written.
        store.upsert_evaluation(&evaluation("99-9999999", 95.0)).await.unwrap();
        let result = exporter.rebuild_index(&store).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn index_and_details_agree() {
        let dir = TempDir::new().unwrap();
        let exporter = Exporter::new(dir.path(), 0.0).unwrap();
        let store = seeded_store().await;
        let eval = evaluation("12-3456789", 85.0);
        store.upsert_evaluation(&eval).await.unwrap();
        exporter.export_charity(&document("Example"), &eval).unwrap();
        let index = exporter.rebuild_index(&store).await.unwrap();

        for entry in index["charities"].as_array().unwrap() {
            let detail: Value = serde_json::from_str(
                &fs::read_to_string(exporter.detail_path(entry["ein"].as_str().unwrap())).unwrap(),
            )
            .unwrap();
            assert_eq!(entry["name"], detail["name"]);
            assert_eq!(entry["tier"], detail["tier"]);
            assert_eq!(entry["amal_score"], detail["amalEvaluation"]["amal_score"]);
            assert_eq!(entry["wallet_tag"], detail["amalEvaluation"]["wallet_tag"]);
        }
    }
}
