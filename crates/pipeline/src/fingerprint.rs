//! Phase identity: the DAG, per-phase fingerprints, and TTLs.
//!
//! A fingerprint digests everything that defines a phase's behavior (a
//! hand-bumped version tag, the model, prompt versions). A cache entry is
//! valid only while its fingerprint matches and its TTL holds, and cascade
//! invalidation re-runs every phase downstream of one that ran this session.

use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Crawl,
    Extract,
    Discover,
    Synthesize,
    Baseline,
    Rich,
    Judge,
    Export,
}

/// Execution order; every phase's upstreams precede it.
pub const PHASE_ORDER: &[Phase] = &[
    Phase::Crawl,
    Phase::Extract,
    Phase::Discover,
    Phase::Synthesize,
    Phase::Baseline,
    Phase::Rich,
    Phase::Judge,
    Phase::Export,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Crawl => "crawl",
            Phase::Extract => "extract",
            Phase::Discover => "discover",
            Phase::Synthesize => "synthesize",
            Phase::Baseline => "baseline",
            Phase::Rich => "rich",
            Phase::Judge => "judge",
            Phase::Export => "export",
        }
    }

    pub fn from_str(s: &str) -> Option<Phase> {
        PHASE_ORDER.iter().copied().find(|p| p.as_str() == s)
    }

    /// Direct upstream dependencies.
    pub fn upstream(&self) -> &'static [Phase] {
        match self {
            Phase::Crawl => &[],
            Phase::Extract => &[Phase::Crawl],
            Phase::Discover => &[Phase::Crawl],
            Phase::Synthesize => &[Phase::Extract, Phase::Discover],
            Phase::Baseline => &[Phase::Synthesize],
            Phase::Rich => &[Phase::Baseline],
            Phase::Judge => &[Phase::Rich],
            Phase::Export => &[Phase::Judge],
        }
    }

    /// Cache TTL in days; None = valid until the fingerprint changes.
    pub fn ttl_days(&self) -> Option<i64> {
        match self {
            Phase::Crawl => Some(30),
            Phase::Extract => None,
            Phase::Discover => Some(90),
            Phase::Synthesize => None,
            Phase::Baseline => Some(90),
            Phase::Rich => Some(90),
            Phase::Judge => None,
            Phase::Export => None,
        }
    }

    /// Bumped by hand when a phase's code or prompts change behavior.
    fn version_tag(&self) -> &'static str {
        match self {
            Phase::Crawl => "crawl-v3",
            Phase::Extract => "extract-v2",
            Phase::Discover => "discover-v2",
            Phase::Synthesize => "synthesize-v2",
            Phase::Baseline => "baseline-v3",
            Phase::Rich => "rich-v1",
            Phase::Judge => "judge-v2",
            Phase::Export => "export-v2",
        }
    }
}

/// Whether `candidate` is at or downstream of `origin` in the DAG.
pub fn is_downstream_of(candidate: Phase, origin: Phase) -> bool {
    if candidate == origin {
        return true;
    }
    candidate
        .upstream()
        .iter()
        .any(|&up| is_downstream_of(up, origin))
}

/// Precomputed fingerprints for one run configuration.
#[derive(Debug, Clone)]
pub struct Fingerprints {
    by_phase: HashMap<Phase, String>,
}

impl Fingerprints {
    pub fn new(model: &str, judge_threshold: f64) -> Self {
        let mut by_phase = HashMap::new();
        for &phase in PHASE_ORDER {
            let mut hasher = Sha256::new();
            hasher.update(phase.version_tag().as_bytes());
            // LLM-dependent phases change behavior with the model.
            if matches!(phase, Phase::Discover | Phase::Baseline | Phase::Rich) {
                hasher.update(model.as_bytes());
            }
            if matches!(phase, Phase::Judge | Phase::Export) {
                hasher.update(judge_threshold.to_le_bytes());
            }
            by_phase.insert(phase, hex::encode(hasher.finalize()));
        }
        Self { by_phase }
    }

    pub fn get(&self, phase: Phase) -> &str {
        &self.by_phase[&phase]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_respects_dependencies() {
        for (i, phase) in PHASE_ORDER.iter().enumerate() {
            for upstream in phase.upstream() {
                let pos = PHASE_ORDER.iter().position(|p| p == upstream).unwrap();
                assert!(pos < i, "{upstream:?} must precede {phase:?}");
            }
        }
    }

    #[test]
    fn downstream_reachability() {
        assert!(is_downstream_of(Phase::Export, Phase::Crawl));
        assert!(is_downstream_of(Phase::Synthesize, Phase::Extract));
        assert!(is_downstream_of(Phase::Synthesize, Phase::Discover));
        assert!(!is_downstream_of(Phase::Crawl, Phase::Extract));
        assert!(!is_downstream_of(Phase::Discover, Phase::Extract));
    }

    #[test]
    fn fingerprints_vary_by_model_only_for_llm_phases() {
        let a = Fingerprints::new("gemini-2.5-flash", 80.0);
        let b = Fingerprints::new("gemini-2.5-pro", 80.0);
        assert_eq!(a.get(Phase::Crawl), b.get(Phase::Crawl));
        assert_eq!(a.get(Phase::Extract), b.get(Phase::Extract));
        assert_ne!(a.get(Phase::Baseline), b.get(Phase::Baseline));
        assert_ne!(a.get(Phase::Discover), b.get(Phase::Discover));
    }

    #[test]
    fn threshold_changes_judge_fingerprint() {
        let a = Fingerprints::new("gemini-2.5-flash", 80.0);
        let b = Fingerprints::new("gemini-2.5-flash", 70.0);
        assert_ne!(a.get(Phase::Judge), b.get(Phase::Judge));
        assert_eq!(a.get(Phase::Baseline), b.get(Phase::Baseline));
    }

    #[test]
    fn phase_names_round_trip() {
        for &phase in PHASE_ORDER {
            assert_eq!(Phase::from_str(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::from_str("nope"), None);
    }
}
