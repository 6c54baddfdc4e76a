//! The worker pool and run-level reporting.
//!
//! A bounded pool pulls charities from the input list; each worker runs one
//! charity to completion through all phases before taking the next, which
//! bounds memory and avoids charities stuck mid-pipeline. Results are
//! collated by arrival.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info};

use goodmeasure_pipeline::{CharityInput, CharityResult, PhaseRunner};
use goodmeasure_store::Store;

pub struct RunSummary {
    pub results: Vec<CharityResult>,
    pub completed: usize,
    pub failed: usize,
    pub total_cost_usd: f64,
    pub phase_costs: BTreeMap<&'static str, f64>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

fn progress_line(index: usize, total: usize, result: &CharityResult) -> String {
    if result.success {
        let score = result
            .amal_score
            .map(|s| format!("{s:.0}"))
            .unwrap_or_else(|| "-".into());
        let cache_note = if result.cached_phases.is_empty() {
            String::new()
        } else {
            format!(" [cache:{}]", result.cached_phases.join(","))
        };
        format!(
            "[{index}/{total}] ✓ {} - A:{score} (${:.4}){cache_note}",
            result.name, result.cost_usd
        )
    } else {
        format!(
            "[{index}/{total}] ✗ {} - Error: {}",
            result.name,
            result.error.as_deref().unwrap_or("unknown")
        )
    }
}

pub async fn run_all(
    runner: Arc<PhaseRunner>,
    store: Store,
    charities: Vec<CharityInput>,
    workers: usize,
    checkpoint_every: usize,
) -> RunSummary {
    let total = charities.len();
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    // Checkpoint commits are serialized globally.
    let checkpoint_lock = Arc::new(Mutex::new(()));

    let mut set: JoinSet<CharityResult> = JoinSet::new();
    for charity in charities {
        let runner = Arc::clone(&runner);
        let semaphore = Arc::clone(&semaphore);
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore");
            runner.run_charity(&charity).await
        });
    }

    let mut summary = RunSummary {
        results: Vec::with_capacity(total),
        completed: 0,
        failed: 0,
        total_cost_usd: 0.0,
        phase_costs: BTreeMap::new(),
    };

    let mut done = 0usize;
    while let Some(joined) = set.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(e) => {
                error!("worker panicked: {e}");
                summary.failed += 1;
                continue;
            }
        };
        done += 1;
        println!("{}", progress_line(done, total, &result));
        for warning in &result.warnings {
            info!(ein = %result.ein, "warning: {warning}");
        }

        if result.success {
            summary.completed += 1;
        } else {
            summary.failed += 1;
        }
        summary.total_cost_usd += result.cost_usd;
        for (phase, cost) in &result.phase_costs {
            *summary.phase_costs.entry(*phase).or_insert(0.0) += *cost;
        }
        summary.results.push(result);

        if checkpoint_every > 0 && done % checkpoint_every == 0 {
            let _guard = checkpoint_lock.lock().await;
            match store
                .commit(&format!("checkpoint: {done}/{total} charities processed"))
                .await
            {
                Ok(hash) => info!(hash = %&hash[..12], done, "checkpoint committed"),
                Err(e) => error!("checkpoint commit failed: {e}"),
            }
        }
    }
    summary
}

pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("=== Run summary ===");
    println!("processed: {}", summary.results.len());
    println!("succeeded: {}", summary.completed);
    println!("failed:    {}", summary.failed);
    println!("LLM cost:  ${:.4}", summary.total_cost_usd);
    if !summary.phase_costs.is_empty() {
        println!("cost by phase:");
        for (phase, cost) in &summary.phase_costs {
            println!("  {phase:<12} ${cost:.4}");
        }
    }
    for result in summary.results.iter().filter(|r| !r.success) {
        println!(
            "  ✗ {} ({}): {}",
            result.name,
            result.ein,
            result.error.as_deref().unwrap_or("unknown")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool) -> CharityResult {
        CharityResult {
            ein: "12-3456789".into(),
            name: "Example".into(),
            success,
            error: (!success).then(|| "Error: required sources failed: propublica".into()),
            cached_phases: vec!["crawl", "extract"],
            ran_phases: vec![],
            warnings: vec![],
            amal_score: success.then_some(88.0),
            cost_usd: 0.1234,
            phase_costs: vec![("baseline", 0.1234)],
        }
    }

    #[test]
    fn progress_lines_match_expected_shape() {
        let ok = progress_line(1, 4, &result(true));
        assert!(ok.starts_with("[1/4] ✓ Example - A:88 ($0.1234)"));
        assert!(ok.contains("[cache:crawl,extract]"));

        let bad = progress_line(2, 4, &result(false));
        assert!(bad.starts_with("[2/4] ✗ Example - Error:"));
    }
}
