pub mod export;
pub mod fingerprint;
pub mod judges;
pub mod phases;
pub mod runner;

pub use export::Exporter;
pub use fingerprint::{is_downstream_of, Fingerprints, Phase, PHASE_ORDER};
pub use judges::{judge_phase_output, Issue, Severity, Verdict};
pub use runner::{CharityInput, CharityResult, Decision, PhaseRunner, RunnerOptions};
