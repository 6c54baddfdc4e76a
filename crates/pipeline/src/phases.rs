//! Downstream phase implementations: extract, discover, synthesize,
//! baseline, rich, and judge. Each returns its materialized output as JSON
//! (for the inline quality judge) plus any LLM spend.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use goodmeasure_collect::{CollectOptions, CollectorRegistry};
use goodmeasure_core::constants::{BASE_AMAL_SCORE, MAX_AMAL_SCORE, ZAKAT_BONUS};
use goodmeasure_core::types::{
    BaselineNarrative, CharityDocument, Citation, ConfidenceScores, Evaluation, RawRecord,
    RichNarrative, WalletTag,
};
use goodmeasure_llm::GeminiClient;
use goodmeasure_store::Store;

pub struct PhaseOutput {
    pub output: Value,
    pub cost_usd: f64,
}

impl PhaseOutput {
    fn free(output: Value) -> Self {
        Self { output, cost_usd: 0.0 }
    }
}

// === extract ===

/// Re-parse stored raw payloads into validated schemas. Raw rows survive the
/// crawl, so schema changes re-bind without refetching.
pub async fn run_extract(
    store: &Store,
    registry: &CollectorRegistry,
    ein: &str,
    website_url: Option<&str>,
) -> anyhow::Result<PhaseOutput> {
    let rows = store.get_raw_for_charity(ein).await?;
    let opts = CollectOptions {
        website_url: website_url.map(str::to_string),
        charity_name: None,
    };

    let mut parsed_count = 0u64;
    let mut validation_failures: Vec<String> = Vec::new();

    for row in rows {
        if row.source == "discovery" {
            continue;
        }
        let Some(raw) = row.raw_payload.as_deref() else {
            continue;
        };
        let Some(collector) = registry.get(row.source.as_str()) else {
            debug!(source = %row.source, "no collector registered; leaving row as-is");
            continue;
        };
        let result = collector.parse(raw, ein, &opts).await;
        if result.success {
            store
                .set_parsed(ein, &row.source, result.parsed_data.as_ref(), true, None)
                .await?;
            parsed_count += 1;
        } else {
            let error = result.error.unwrap_or_else(|| "parse failed".into());
            // Validation failures keep the row, flagged so the orchestrator
            // never retries them as transient.
            store.set_parsed(ein, &row.source, None, false, Some(&error)).await?;
            validation_failures.push(format!("{}: {error}", row.source));
        }
    }

    Ok(PhaseOutput::free(json!({
        "sources_parsed": parsed_count,
        "validation_failures": validation_failures,
    })))
}

// === discover ===

const DISCOVERY_SECTIONS: &[(&str, &str)] = &[
    ("zakat_verification", "Does {name} ({website}) accept zakat donations or state zakat eligibility? Cite the official source."),
    ("outcomes", "What measurable outcomes has the charity {name} ({website}) reported in the last three years?"),
    ("evidence", "What independent evaluations, audits, or research cover the charity {name}?"),
    ("theory_of_change", "What is the theory of change or program model of the charity {name}?"),
    ("awards", "What awards, accreditations, or third-party recognitions has the charity {name} received?"),
];

/// Search-grounded queries for facts that rarely appear on the charity's own
/// site. A run where every section comes back empty is a success-with-skip:
/// nothing is stored and the phase cache entry is withheld so the next run
/// retries.
pub async fn run_discover(
    store: &Store,
    llm: Option<&GeminiClient>,
    ein: &str,
    name: &str,
    website: Option<&str>,
) -> anyhow::Result<PhaseOutput> {
    let Some(client) = llm else {
        return Ok(PhaseOutput::free(json!({"skipped_empty": true, "sections": {}})));
    };

    let website = website.unwrap_or("website unknown");
    let queries = DISCOVERY_SECTIONS.iter().map(|(section, template)| {
        let prompt = template.replace("{name}", name).replace("{website}", website);
        async move { (*section, client.generate_grounded(&prompt).await) }
    });
    let responses = futures::future::join_all(queries).await;

    let mut sections = Map::new();
    let mut cost = 0.0;
    for (section, response) in responses {
        match response {
            Ok(grounded) => {
                cost += grounded.cost_usd;
                if grounded.text.trim().is_empty() {
                    continue;
                }
                let sources: Vec<Value> = grounded
                    .sources
                    .iter()
                    .map(|(uri, title)| json!({"url": uri, "title": title}))
                    .collect();
                sections.insert(
                    section.to_string(),
                    json!({"text": grounded.text, "sources": sources}),
                );
            }
            Err(e) => warn!(ein, section, "discovery query failed: {e}"),
        }
    }

    if sections.is_empty() {
        info!(ein, "discover found nothing; success-with-skip");
        return Ok(PhaseOutput { output: json!({"skipped_empty": true, "sections": {}}), cost_usd: cost });
    }

    let parsed = json!({"discovery": Value::Object(sections.clone())});
    store
        .upsert_raw(&RawRecord {
            charity_ein: ein.to_string(),
            source: "discovery".into(),
            raw_payload: None,
            parsed_payload: Some(parsed),
            success: true,
            error_message: None,
            retry_count: 0,
            scraped_at: Utc::now(),
        })
        .await?;

    Ok(PhaseOutput {
        output: json!({"skipped_empty": false, "sections": Value::Object(sections)}),
        cost_usd: cost,
    })
}

// === synthesize ===

fn parsed_section<'a>(rows: &'a [RawRecord], source: &str, key: &str) -> Option<&'a Value> {
    rows.iter()
        .find(|r| r.source == source && r.success)
        .and_then(|r| r.parsed_payload.as_ref())
        .and_then(|p| p.get(key))
}

/// Merge every source's validated payload into one normalized document with
/// per-field provenance.
pub async fn run_synthesize(store: &Store, ein: &str) -> anyhow::Result<PhaseOutput> {
    let rows = store.get_raw_for_charity(ein).await?;

    let propublica = parsed_section(&rows, "propublica", "propublica_990");
    let cn = parsed_section(&rows, "charity_navigator", "cn_profile");
    let candid = parsed_section(&rows, "candid", "candid_profile");
    let bbb = parsed_section(&rows, "bbb", "bbb_profile");
    let grants = parsed_section(&rows, "form990_grants", "grants_profile");
    let website = parsed_section(&rows, "website", "website_profile");
    let discovery = parsed_section(&rows, "discovery", "discovery");

    fn set(
        data: &mut Map<String, Value>,
        sources: &mut Map<String, Value>,
        field: &str,
        value: Option<&Value>,
        source: &str,
    ) {
        if let Some(v) = value {
            if !v.is_null() {
                data.insert(field.to_string(), v.clone());
                sources.insert(field.to_string(), json!(source));
            }
        }
    }

    let mut data = Map::new();
    let mut sources = Map::new();

    // Canonical identity: the IRS record wins, the website fills gaps.
    set(&mut data, &mut sources, "ein", propublica.and_then(|p| p.get("ein")), "propublica");
    if !data.contains_key("ein") {
        data.insert("ein".into(), json!(ein));
        sources.insert("ein".into(), json!("input"));
    }
    let name = propublica
        .and_then(|p| p.get("name"))
        .or_else(|| website.and_then(|w| w.get("name")))
        .or_else(|| candid.and_then(|c| c.get("name")));
    set(&mut data, &mut sources, "name", name, "propublica");

    let mission = website
        .and_then(|w| w.get("mission"))
        .or_else(|| candid.and_then(|c| c.get("mission")));
    set(&mut data, &mut sources, "mission", mission, "website");
    set(&mut data, &mut sources, "website_profile", website, "website");
    set(&mut data, &mut sources, "financials", propublica, "propublica");
    set(&mut data, &mut sources, "ratings", cn, "charity_navigator");
    set(&mut data, &mut sources, "candid_profile", candid, "candid");
    set(&mut data, &mut sources, "accreditation", bbb, "bbb");
    set(&mut data, &mut sources, "grants", grants, "form990_grants");
    set(&mut data, &mut sources, "discovery", discovery, "discovery");

    let document = CharityDocument {
        charity_ein: ein.to_string(),
        data: Value::Object(data.clone()),
        sources: Value::Object(sources.clone()),
        synthesized_at: Utc::now(),
    };
    store.upsert_document(&document).await?;

    Ok(PhaseOutput::free(json!({
        "data": Value::Object(data),
        "sources": Value::Object(sources),
    })))
}

// === baseline ===

fn ratio_points(doc: &Value) -> f64 {
    // Program expense ratio drives up to 25 points: 85%+ earns full marks.
    let program = doc["financials"]["program_expenses"].as_f64();
    let total = doc["financials"]["total_expenses"].as_f64();
    match (program, total) {
        (Some(p), Some(t)) if t > 0.0 => {
            let ratio = (p / t).clamp(0.0, 1.0);
            (ratio / 0.85 * 25.0).min(25.0)
        }
        _ => 0.0,
    }
}

fn accepts_zakat(doc: &Value) -> bool {
    doc["website_profile"]["accepts_zakat"] == true
        || doc["discovery"]["zakat_verification"]["text"]
            .as_str()
            .map(|t| {
                let lower = t.to_lowercase();
                lower.contains("accepts zakat") || lower.contains("zakat-eligible") || lower.contains("zakat eligible")
            })
            .unwrap_or(false)
}

pub struct BaselineScores {
    pub impact: f64,
    pub alignment: f64,
    pub data_confidence: f64,
    pub amal_score: f64,
    pub wallet_tag: WalletTag,
    pub zakat: bool,
}

/// Deterministic scoring over the synthesized document. Narrative prompt
/// engineering is out of scope; this keeps the pipeline runnable end to end
/// with the 90+5 ceiling and wallet-tag mapping intact.
pub fn score_baseline(doc: &Value, sources_present: usize) -> BaselineScores {
    let mut impact = ratio_points(doc);
    if doc["website_profile"]["impact_metrics"].is_array() {
        impact += 10.0;
    }
    if doc["discovery"]["outcomes"].is_object() {
        impact += 10.0;
    }
    if let Some(beacon) = doc["ratings"]["impact_results_score"].as_f64() {
        impact += beacon / 100.0 * 5.0;
    }
    let impact = impact.clamp(0.0, 50.0);

    let zakat = accepts_zakat(doc);
    let mut alignment = 0.0;
    if zakat {
        alignment += 20.0;
    }
    if doc.get("mission").is_some() {
        alignment += 10.0;
    }
    if doc["accreditation"]["accredited"] == true {
        alignment += 10.0;
    }
    if doc["candid_profile"]["seal_level"].is_string() {
        alignment += 10.0;
    }
    if let Some(score) = doc["ratings"]["overall_score"].as_f64() {
        alignment += score / 100.0 * 5.0;
    }
    let alignment = alignment.clamp(0.0, 50.0);

    let data_confidence = (sources_present as f64 / 6.0).clamp(0.0, 1.0);

    let mut amal = (impact + alignment).min(BASE_AMAL_SCORE);
    if zakat {
        amal += ZAKAT_BONUS;
    }
    let amal_score = amal.clamp(0.0, MAX_AMAL_SCORE.min(100.0));

    let wallet_tag = if data_confidence < 0.4 {
        WalletTag::InsufficientData
    } else if zakat {
        WalletTag::ZakatEligible
    } else if amal_score >= 80.0 {
        WalletTag::SadaqahEligible
    } else if amal_score >= 65.0 {
        WalletTag::SadaqahStrategic
    } else {
        WalletTag::SadaqahGeneral
    };

    BaselineScores { impact, alignment, data_confidence, amal_score, wallet_tag, zakat }
}

fn template_narrative(doc: &Value, scores: &BaselineScores) -> BaselineNarrative {
    let name = doc["name"].as_str().unwrap_or("This organization");
    let mission = doc["mission"].as_str().unwrap_or("");
    let mut strengths = Vec::new();
    if scores.zakat {
        strengths.push("States zakat eligibility".to_string());
    }
    if doc["accreditation"]["accredited"] == true {
        strengths.push("BBB accredited".to_string());
    }
    if let Some(seal) = doc["candid_profile"]["seal_level"].as_str() {
        strengths.push(format!("Candid {seal} seal"));
    }
    if doc["financials"]["program_expenses"].is_number() {
        strengths.push("Audited program financials on file".to_string());
    }
    BaselineNarrative {
        headline: format!("{name} evaluation"),
        summary: if mission.is_empty() {
            format!("{name} scored {:.0} out of 100 across impact and alignment.", scores.amal_score)
        } else {
            format!("{name}: {mission}")
        },
        strengths,
    }
}

async fn llm_narrative(
    client: &GeminiClient,
    doc: &Value,
    scores: &BaselineScores,
) -> Option<(BaselineNarrative, f64)> {
    let schema = json!({
        "type": "OBJECT",
        "properties": {
            "headline": {"type": "STRING"},
            "summary": {"type": "STRING"},
            "strengths": {"type": "ARRAY", "items": {"type": "STRING"}}
        },
        "required": ["headline", "summary", "strengths"]
    });
    let prompt = format!(
        "Write a donor-facing baseline narrative for this charity evaluation. Score: {:.0}/100. \
         Data:\n{}",
        scores.amal_score,
        serde_json::to_string(doc).unwrap_or_default()
    );
    match client
        .generate_json(Some("You summarize charity evaluations factually, without hype."), &prompt, schema)
        .await
    {
        Ok((value, response)) => {
            let narrative = BaselineNarrative {
                headline: value["headline"].as_str().unwrap_or_default().to_string(),
                summary: value["summary"].as_str().unwrap_or_default().to_string(),
                strengths: value["strengths"]
                    .as_array()
                    .map(|a| a.iter().filter_map(|s| s.as_str().map(String::from)).collect())
                    .unwrap_or_default(),
            };
            if narrative.headline.is_empty() || narrative.summary.is_empty() {
                None
            } else {
                Some((narrative, response.cost_usd))
            }
        }
        Err(e) => {
            warn!("baseline narrative generation failed: {e}");
            None
        }
    }
}

pub async fn run_baseline(
    store: &Store,
    llm: Option<&GeminiClient>,
    ein: &str,
) -> anyhow::Result<PhaseOutput> {
    let document = store
        .get_document(ein)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no synthesized document for {ein}"))?;
    let rows = store.get_raw_for_charity(ein).await?;
    let sources_present = rows.iter().filter(|r| r.success && r.source != "discovery").count();

    let scores = score_baseline(&document.data, sources_present);

    let mut cost = 0.0;
    let narrative = match llm {
        Some(client) => match llm_narrative(client, &document.data, &scores).await {
            Some((narrative, narrative_cost)) => {
                cost += narrative_cost;
                narrative
            }
            None => template_narrative(&document.data, &scores),
        },
        None => template_narrative(&document.data, &scores),
    };

    let existing_cost = store
        .get_evaluation(ein)
        .await?
        .map(|e| e.llm_cost_usd)
        .unwrap_or(0.0);

    let evaluation = Evaluation {
        charity_ein: ein.to_string(),
        amal_score: scores.amal_score,
        confidence_scores: ConfidenceScores {
            impact: scores.impact,
            alignment: scores.alignment,
            data_confidence: scores.data_confidence,
        },
        wallet_tag: scores.wallet_tag,
        baseline_narrative: Some(narrative.clone()),
        rich_narrative: None,
        judge_score: None,
        issues: Vec::new(),
        llm_cost_usd: existing_cost + cost,
        updated_at: Utc::now(),
    };
    store.upsert_evaluation(&evaluation).await?;

    Ok(PhaseOutput {
        output: json!({
            "amal_score": scores.amal_score,
            "confidence_scores": {
                "impact": scores.impact,
                "alignment": scores.alignment,
                "data_confidence": scores.data_confidence,
            },
            "wallet_tag": scores.wallet_tag.as_str(),
            "baseline_narrative": {
                "headline": narrative.headline,
                "summary": narrative.summary,
                "strengths": narrative.strengths,
            },
        }),
        cost_usd: cost,
    })
}

// === rich ===

/// Citation-backed long-form narrative from the discovery sources. Optional:
/// without an LLM or discovery data the phase records a warning and moves on.
pub async fn run_rich(
    store: &Store,
    llm: Option<&GeminiClient>,
    ein: &str,
) -> anyhow::Result<PhaseOutput> {
    let document = store
        .get_document(ein)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no synthesized document for {ein}"))?;
    let mut evaluation = store
        .get_evaluation(ein)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no evaluation for {ein}"))?;

    // Citations come from discovery grounding sources, deduped by URL.
    let mut citations: Vec<Citation> = Vec::new();
    let mut seen: BTreeMap<String, ()> = BTreeMap::new();
    if let Some(sections) = document.data["discovery"].as_object() {
        for section in sections.values() {
            if let Some(section_sources) = section["sources"].as_array() {
                for source in section_sources {
                    if let Some(url) = source["url"].as_str() {
                        if seen.insert(url.to_string(), ()).is_none() {
                            citations.push(Citation {
                                id: format!("c{}", citations.len() + 1),
                                source_url: url.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    let (Some(client), false) = (llm, citations.is_empty()) else {
        debug!(ein, "rich narrative skipped (no LLM or no citations)");
        return Ok(PhaseOutput::free(json!({"rich_narrative": Value::Null})));
    };

    let prompt = format!(
        "Write a detailed, citation-backed narrative about this charity. Reference sources by \
         their ids ({}). Data:\n{}",
        citations.iter().map(|c| c.id.as_str()).collect::<Vec<_>>().join(", "),
        serde_json::to_string(&document.data).unwrap_or_default()
    );
    let response = match client.generate(None, &prompt).await {
        Ok(r) => r,
        Err(e) => {
            // Optional service: warn and continue without a rich narrative.
            warn!(ein, "rich narrative generation failed: {e}");
            return Ok(PhaseOutput::free(json!({"rich_narrative": Value::Null})));
        }
    };

    let rich = RichNarrative { body: response.text.clone(), all_citations: citations.clone() };
    evaluation.rich_narrative = Some(rich);
    evaluation.llm_cost_usd += response.cost_usd;
    evaluation.updated_at = Utc::now();
    store.upsert_evaluation(&evaluation).await?;

    let citation_pairs: Vec<(String, String)> =
        citations.iter().map(|c| (c.id.clone(), c.source_url.clone())).collect();
    store.replace_citations(ein, &citation_pairs).await?;

    Ok(PhaseOutput {
        output: json!({
            "rich_narrative": {
                "body": response.text,
                "all_citations": citations.iter().map(|c| json!({"id": c.id, "source_url": c.source_url})).collect::<Vec<_>>(),
            }
        }),
        cost_usd: response.cost_usd,
    })
}

// === judge ===

/// Deterministic final review of the evaluation. Issues reduce the judge
/// score; the export phase applies the eligibility threshold.
pub async fn run_judge(store: &Store, ein: &str) -> anyhow::Result<PhaseOutput> {
    let document = store
        .get_document(ein)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no synthesized document for {ein}"))?;
    let mut evaluation = store
        .get_evaluation(ein)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no evaluation for {ein}"))?;

    let mut issues: Vec<String> = Vec::new();
    if document.data.get("name").and_then(Value::as_str).unwrap_or("").is_empty() {
        issues.push("missing canonical name".into());
    }
    if document.data.get("mission").is_none() {
        issues.push("missing mission".into());
    }
    if let Some(narrative) = &evaluation.baseline_narrative {
        if narrative.summary.split_whitespace().count() < 5 {
            issues.push("baseline summary too short".into());
        }
    } else {
        issues.push("missing baseline narrative".into());
    }
    if evaluation.amal_score >= 80.0 && evaluation.confidence_scores.data_confidence < 0.5 {
        issues.push("high score on low data confidence".into());
    }
    if document.data.get("financials").is_none() {
        issues.push("no IRS financials".into());
    }

    let judge_score = (100.0 - issues.len() as f64 * 10.0).clamp(0.0, 100.0);
    evaluation.judge_score = Some(judge_score);
    evaluation.issues = issues.clone();
    evaluation.updated_at = Utc::now();
    store.upsert_evaluation(&evaluation).await?;

    Ok(PhaseOutput::free(json!({
        "judge_score": judge_score,
        "issues": issues,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rich_doc() -> Value {
        json!({
            "name": "Example Relief",
            "mission": "Feed families",
            "financials": {"program_expenses": 8_500_000.0, "total_expenses": 10_000_000.0},
            "ratings": {"overall_score": 90.0, "impact_results_score": 80.0},
            "accreditation": {"accredited": true},
            "candid_profile": {"seal_level": "gold"},
            "website_profile": {"accepts_zakat": true, "impact_metrics": ["1M meals"]},
            "discovery": {"outcomes": {"text": "served 1M meals", "sources": []}}
        })
    }

    #[test]
    fn full_profile_scores_high_with_zakat_bonus() {
        let scores = score_baseline(&rich_doc(), 6);
        // 25 (ratio) + 10 (metrics) + 10 (outcomes) + 4 (beacon).
        assert!((scores.impact - 49.0).abs() < 1e-9, "impact {}", scores.impact);
        assert!(scores.alignment > 45.0);
        assert!(scores.zakat);
        // 90 base cap + 5 zakat bonus.
        assert!(scores.amal_score <= 95.0);
        assert!(scores.amal_score >= 90.0);
        assert_eq!(scores.wallet_tag, WalletTag::ZakatEligible);
    }

    #[test]
    fn sparse_profile_is_insufficient_data() {
        let doc = json!({"name": "Tiny Org"});
        let scores = score_baseline(&doc, 2);
        assert_eq!(scores.wallet_tag, WalletTag::InsufficientData);
        assert!(scores.amal_score < 20.0);
    }

    #[test]
    fn no_zakat_maps_to_sadaqah_tags() {
        let mut doc = rich_doc();
        doc["website_profile"]["accepts_zakat"] = json!(false);
        doc["discovery"] = json!({});
        let scores = score_baseline(&doc, 6);
        assert!(!scores.zakat);
        assert_ne!(scores.wallet_tag, WalletTag::ZakatEligible);
        // Still a strong org: sadaqah-eligible at 80+.
        assert!(matches!(
            scores.wallet_tag,
            WalletTag::SadaqahEligible | WalletTag::SadaqahStrategic
        ));
    }

    #[test]
    fn template_narrative_carries_strengths() {
        let scores = score_baseline(&rich_doc(), 6);
        let narrative = template_narrative(&rich_doc(), &scores);
        assert!(!narrative.headline.is_empty());
        assert!(narrative.strengths.iter().any(|s| s.contains("zakat")));
        assert!(narrative.strengths.iter().any(|s| s.contains("gold")));
    }
}
