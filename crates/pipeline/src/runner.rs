//! The per-charity phase runner.
//!
//! Each charity walks the DAG in order. A phase is skipped only when nothing
//! forced it, no upstream phase ran this session, and its cache entry still
//! matches the current fingerprint inside its TTL. Successful phases update
//! the phase cache; failed phases (including inline-judge errors) delete it
//! so the next run retries instead of trusting a bad state.

use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, error, info, warn};

use goodmeasure_collect::{CollectorRegistry, Orchestrator};
use goodmeasure_core::types::PhaseCacheEntry;
use goodmeasure_llm::GeminiClient;
use goodmeasure_store::Store;

use crate::export::Exporter;
use crate::fingerprint::{Fingerprints, Phase, PHASE_ORDER};
use crate::judges::judge_phase_output;
use crate::phases;

#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    pub force_all: bool,
    pub force_phases: Vec<Phase>,
    pub skip_export: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct CharityInput {
    pub name: String,
    pub ein: String,
    pub website: Option<String>,
}

#[derive(Debug, Default)]
pub struct CharityResult {
    pub ein: String,
    pub name: String,
    pub success: bool,
    pub error: Option<String>,
    pub cached_phases: Vec<&'static str>,
    pub ran_phases: Vec<&'static str>,
    pub warnings: Vec<String>,
    pub amal_score: Option<f64>,
    pub cost_usd: f64,
    pub phase_costs: Vec<(&'static str, f64)>,
}

/// Why a phase is (or is not) about to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Forced,
    Cascade,
    Cached,
    Stale(String),
}

/// Pure cache decision: force beats cascade beats cache validity.
pub fn decide_phase(
    phase: Phase,
    force_all: bool,
    force_phases: &[Phase],
    upstream_ran: bool,
    entry: Option<&PhaseCacheEntry>,
    current_fingerprint: &str,
) -> Decision {
    if force_all || force_phases.contains(&phase) {
        return Decision::Forced;
    }
    if upstream_ran {
        return Decision::Cascade;
    }
    let Some(entry) = entry else {
        return Decision::Stale("no cache entry".into());
    };
    if entry.fingerprint != current_fingerprint {
        return Decision::Stale("fingerprint changed".into());
    }
    if let Some(ttl_days) = phase.ttl_days() {
        let age = Utc::now() - entry.ran_at;
        if age > ChronoDuration::days(ttl_days) {
            return Decision::Stale(format!("TTL expired ({}d)", age.num_days()));
        }
    }
    Decision::Cached
}

pub struct PhaseRunner {
    store: Store,
    orchestrator: Orchestrator,
    registry: CollectorRegistry,
    llm: Option<GeminiClient>,
    fingerprints: Fingerprints,
    exporter: Exporter,
    options: RunnerOptions,
}

impl PhaseRunner {
    pub fn new(
        store: Store,
        orchestrator: Orchestrator,
        registry: CollectorRegistry,
        llm: Option<GeminiClient>,
        fingerprints: Fingerprints,
        exporter: Exporter,
        options: RunnerOptions,
    ) -> Self {
        Self { store, orchestrator, registry, llm, fingerprints, exporter, options }
    }

    pub fn exporter(&self) -> &Exporter {
        &self.exporter
    }

    /// Run one charity through all phases. Returns rather than propagates:
    /// the worker pool aggregates results.
    pub async fn run_charity(&self, input: &CharityInput) -> CharityResult {
        let mut result = CharityResult {
            ein: input.ein.clone(),
            name: input.name.clone(),
            ..Default::default()
        };
        let mut ran: HashSet<Phase> = HashSet::new();

        for &phase in PHASE_ORDER {
            if phase == Phase::Export && self.options.skip_export {
                continue;
            }

            let upstream_ran = phase.upstream().iter().any(|up| ran.contains(up));
            let entry = match self.store.get_phase_cache(&input.ein, phase.as_str()).await {
                Ok(entry) => entry,
                Err(e) => {
                    result.error = Some(format!("phase cache read failed: {e}"));
                    return result;
                }
            };
            let decision = decide_phase(
                phase,
                self.options.force_all,
                &self.options.force_phases,
                upstream_ran,
                entry.as_ref(),
                self.fingerprints.get(phase),
            );

            if decision == Decision::Cached {
                debug!(ein = %input.ein, phase = phase.as_str(), "phase cached");
                result.cached_phases.push(phase.as_str());
                continue;
            }

            if self.options.dry_run {
                info!(ein = %input.ein, phase = phase.as_str(), ?decision, "dry run: would execute");
                result.ran_phases.push(phase.as_str());
                ran.insert(phase);
                continue;
            }

            debug!(ein = %input.ein, phase = phase.as_str(), ?decision, "running phase");
            let outcome = self.execute_phase(phase, input).await;
            let phase_output = match outcome {
                Ok(output) => output,
                Err(e) => {
                    error!(ein = %input.ein, phase = phase.as_str(), "phase failed: {e}");
                    let _ = self.store.delete_phase_cache(&input.ein, phase.as_str()).await;
                    result.error = Some(format!("{} failed: {e}", phase.as_str()));
                    return result;
                }
            };

            // Inline quality judge gates promotion of the phase output.
            let verdict = judge_phase_output(phase, &phase_output.output);
            result.warnings.extend(
                verdict
                    .warnings()
                    .into_iter()
                    .map(|w| format!("{}: {w}", phase.as_str())),
            );
            if !verdict.passed() {
                let messages: Vec<String> = verdict
                    .issues
                    .iter()
                    .filter(|i| i.severity == crate::judges::Severity::Error)
                    .map(|i| format!("{}: {}", i.field, i.message))
                    .collect();
                error!(ein = %input.ein, phase = phase.as_str(), ?messages, "quality judge rejected output");
                let _ = self.store.delete_phase_cache(&input.ein, phase.as_str()).await;
                result.error = Some(format!("{} quality check failed: {}", phase.as_str(), messages.join("; ")));
                return result;
            }

            result.cost_usd += phase_output.cost_usd;
            if phase_output.cost_usd > 0.0 {
                result.phase_costs.push((phase.as_str(), phase_output.cost_usd));
            }
            result.ran_phases.push(phase.as_str());
            ran.insert(phase);

            // An empty discover succeeds but withholds its cache entry so the
            // next run retries the searches.
            let withhold_cache =
                phase == Phase::Discover && phase_output.output["skipped_empty"] == true;
            if withhold_cache {
                continue;
            }

            let cache_entry = PhaseCacheEntry {
                charity_ein: input.ein.clone(),
                phase: phase.as_str().to_string(),
                fingerprint: self.fingerprints.get(phase).to_string(),
                ran_at: Utc::now(),
                cost_usd: phase_output.cost_usd,
            };
            if let Err(e) = self.store.upsert_phase_cache(&cache_entry).await {
                warn!(ein = %input.ein, phase = phase.as_str(), "phase cache write failed: {e}");
            }
        }

        if let Ok(Some(evaluation)) = self.store.get_evaluation(&input.ein).await {
            result.amal_score = Some(evaluation.amal_score);
        }
        result.success = true;
        result
    }

    async fn execute_phase(
        &self,
        phase: Phase,
        input: &CharityInput,
    ) -> anyhow::Result<phases::PhaseOutput> {
        match phase {
            Phase::Crawl => {
                let (ok, report) = self
                    .orchestrator
                    .collect_charity_data(&input.ein, input.website.as_deref(), Some(&input.name))
                    .await;
                let output = serde_json::json!({
                    "sources_succeeded": report.sources_succeeded,
                    "sources_failed": report.sources_failed,
                    "sources_skipped": report.sources_skipped,
                    "sources_optional_missing": report.sources_optional_missing,
                });
                if !ok {
                    anyhow::bail!(
                        "required sources failed: {}",
                        report.missing_required_sources.join(", ")
                    );
                }
                Ok(phases::PhaseOutput { output, cost_usd: report.llm_cost_usd })
            }
            Phase::Extract => {
                phases::run_extract(&self.store, &self.registry, &input.ein, input.website.as_deref())
                    .await
            }
            Phase::Discover => {
                phases::run_discover(
                    &self.store,
                    self.llm.as_ref(),
                    &input.ein,
                    &input.name,
                    input.website.as_deref(),
                )
                .await
            }
            Phase::Synthesize => phases::run_synthesize(&self.store, &input.ein).await,
            Phase::Baseline => {
                phases::run_baseline(&self.store, self.llm.as_ref(), &input.ein).await
            }
            Phase::Rich => phases::run_rich(&self.store, self.llm.as_ref(), &input.ein).await,
            Phase::Judge => phases::run_judge(&self.store, &input.ein).await,
            Phase::Export => {
                let document = self
                    .store
                    .get_document(&input.ein)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no synthesized document"))?;
                let evaluation = self
                    .store
                    .get_evaluation(&input.ein)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("no evaluation"))?;
                let output = self.exporter.export_charity(&document.data, &evaluation)?;
                Ok(phases::PhaseOutput { output, cost_usd: 0.0 })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use goodmeasure_collect::{CollectOptions, CollectOutcome, Collector, OrchestratorConfig};
    use goodmeasure_core::types::{ContentType, FetchOutput, ParseOutput, RawRecord};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    const EIN: &str = "12-3456789";

    struct ReparseStub;

    #[async_trait]
    impl Collector for ReparseStub {
        fn source_name(&self) -> &'static str {
            "propublica"
        }
        fn schema_key(&self) -> &'static str {
            "propublica_990"
        }
        async fn fetch(&self, _ein: &str, _opts: &CollectOptions) -> FetchOutput {
            FetchOutput::ok("{}".into(), ContentType::Json)
        }
        async fn parse(&self, _raw: &str, _ein: &str, _opts: &CollectOptions) -> ParseOutput {
            ParseOutput::ok(json!({"propublica_990": {
                "ein": EIN, "name": "Example", "program_expenses": 8.0, "total_expenses": 10.0
            }}))
        }
        async fn collect(&self, _ein: &str, _opts: &CollectOptions) -> CollectOutcome {
            CollectOutcome {
                success: true,
                raw: Some("{}".into()),
                parsed: Some(json!({"propublica_990": {"ein": EIN, "name": "Example"}})),
                error: None,
                cost_usd: 0.0,
            }
        }
    }

    async fn seeded_runner(dir: &TempDir, options: RunnerOptions) -> PhaseRunner {
        let store = Store::in_memory().await.unwrap();
        store.run_migrations().await.unwrap();

        // A successful crawl's leftovers: one raw row with raw + parsed.
        store
            .upsert_raw(&RawRecord {
                charity_ein: EIN.into(),
                source: "propublica".into(),
                raw_payload: Some("{}".into()),
                parsed_payload: Some(json!({"propublica_990": {"ein": EIN, "name": "Example"}})),
                success: true,
                error_message: None,
                retry_count: 0,
                scraped_at: Utc::now(),
            })
            .await
            .unwrap();

        let fingerprints = Fingerprints::new("gemini-2.5-flash", 0.0);
        // Cache entries for every phase, fresh and fingerprint-matched.
        for &phase in PHASE_ORDER {
            store
                .upsert_phase_cache(&PhaseCacheEntry {
                    charity_ein: EIN.into(),
                    phase: phase.as_str().into(),
                    fingerprint: fingerprints.get(phase).to_string(),
                    ran_at: Utc::now(),
                    cost_usd: 0.0,
                })
                .await
                .unwrap();
        }

        let stub: Arc<dyn Collector> = Arc::new(ReparseStub);
        let registry = goodmeasure_collect::registry_from(vec![stub]);
        let orchestrator = Orchestrator::new(
            store.clone(),
            vec![],
            None,
            OrchestratorConfig::default(),
        );
        let exporter = Exporter::new(dir.path(), 0.0).unwrap();
        PhaseRunner::new(store, orchestrator, registry, None, fingerprints, exporter, options)
    }

    fn input() -> CharityInput {
        CharityInput { name: "Example".into(), ein: EIN.into(), website: None }
    }

    #[tokio::test]
    async fn fully_cached_run_executes_nothing() {
        let dir = TempDir::new().unwrap();
        let runner = seeded_runner(&dir, RunnerOptions::default()).await;
        let result = runner.run_charity(&input()).await;
        assert!(result.success, "{:?}", result.error);
        assert!(result.ran_phases.is_empty(), "{:?}", result.ran_phases);
        assert_eq!(result.cached_phases.len(), PHASE_ORDER.len());
        assert_eq!(result.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn forcing_extract_cascades_downstream() {
        let dir = TempDir::new().unwrap();
        let runner = seeded_runner(
            &dir,
            RunnerOptions { force_phases: vec![Phase::Extract], ..Default::default() },
        )
        .await;
        let result = runner.run_charity(&input()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.cached_phases, vec!["crawl", "discover"]);
        assert_eq!(
            result.ran_phases,
            vec!["extract", "synthesize", "baseline", "rich", "judge", "export"]
        );
        // Export actually wrote the artifact.
        assert!(dir.path().join("charities").join(format!("charity-{EIN}.json")).exists());
    }

    #[tokio::test]
    async fn stale_fingerprint_forces_rerun() {
        let dir = TempDir::new().unwrap();
        let runner = seeded_runner(&dir, RunnerOptions::default()).await;
        // Corrupt the synthesize fingerprint: synthesize and everything
        // downstream must re-run.
        runner
            .store
            .upsert_phase_cache(&PhaseCacheEntry {
                charity_ein: EIN.into(),
                phase: "synthesize".into(),
                fingerprint: "stale".into(),
                ran_at: Utc::now(),
                cost_usd: 0.0,
            })
            .await
            .unwrap();
        let result = runner.run_charity(&input()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.ran_phases,
            vec!["synthesize", "baseline", "rich", "judge", "export"]
        );
    }

    #[test]
    fn decision_ttl_semantics() {
        let fp = "abc";
        let fresh = PhaseCacheEntry {
            charity_ein: EIN.into(),
            phase: "crawl".into(),
            fingerprint: fp.into(),
            ran_at: Utc::now() - ChronoDuration::days(29),
            cost_usd: 0.0,
        };
        assert_eq!(
            decide_phase(Phase::Crawl, false, &[], false, Some(&fresh), fp),
            Decision::Cached
        );

        let expired = PhaseCacheEntry { ran_at: Utc::now() - ChronoDuration::days(31), ..fresh.clone() };
        assert!(matches!(
            decide_phase(Phase::Crawl, false, &[], false, Some(&expired), fp),
            Decision::Stale(_)
        ));

        // Extract has no TTL: only the fingerprint matters.
        let old_extract = PhaseCacheEntry {
            phase: "extract".into(),
            ran_at: Utc::now() - ChronoDuration::days(400),
            ..fresh.clone()
        };
        assert_eq!(
            decide_phase(Phase::Extract, false, &[], false, Some(&old_extract), fp),
            Decision::Cached
        );
    }

    #[test]
    fn decision_priority_order() {
        let fp = "abc";
        let fresh = PhaseCacheEntry {
            charity_ein: EIN.into(),
            phase: "baseline".into(),
            fingerprint: fp.into(),
            ran_at: Utc::now(),
            cost_usd: 0.0,
        };
        assert_eq!(
            decide_phase(Phase::Baseline, true, &[], false, Some(&fresh), fp),
            Decision::Forced
        );
        assert_eq!(
            decide_phase(Phase::Baseline, false, &[Phase::Baseline], false, Some(&fresh), fp),
            Decision::Forced
        );
        // Cascade overrides an otherwise valid cache entry.
        assert_eq!(
            decide_phase(Phase::Baseline, false, &[], true, Some(&fresh), fp),
            Decision::Cascade
        );
        assert!(matches!(
            decide_phase(Phase::Baseline, false, &[], false, None, fp),
            Decision::Stale(_)
        ));
    }
}
