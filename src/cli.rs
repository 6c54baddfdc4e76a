use clap::Parser;

/// Evaluate charities end to end: collect, extract, discover, synthesize,
/// score, narrate, judge, and export.
#[derive(Parser, Debug)]
#[command(name = "streaming_runner", about = "Charity evaluation pipeline")]
pub struct Cli {
    /// Charities file: one `Name|EIN|website` per line
    #[arg(long, conflicts_with = "ein")]
    pub charities: Option<String>,

    /// Process a single charity by EIN
    #[arg(long)]
    pub ein: Option<String>,

    /// Concurrent charity workers
    #[arg(long, default_value = "20")]
    pub workers: usize,

    /// LLM model name
    #[arg(long)]
    pub model: Option<String>,

    /// Debug-level logging
    #[arg(long)]
    pub verbose: bool,

    /// Delete each charity's pipeline data before processing
    #[arg(long)]
    pub clean: bool,

    /// Minimum judge score for export eligibility
    #[arg(long)]
    pub judge_threshold: Option<f64>,

    /// Skip the export phase and index rebuild
    #[arg(long)]
    pub skip_export: bool,

    /// Re-run every phase regardless of cache state
    #[arg(long)]
    pub force_all: bool,

    /// Re-run a specific phase (repeatable); downstream phases cascade
    #[arg(long = "force-phase")]
    pub force_phase: Vec<String>,

    /// Report what would run without executing
    #[arg(long)]
    pub dry_run: bool,

    /// Print per-charity phase cache state and exit
    #[arg(long)]
    pub cache_status: bool,

    /// Commit a checkpoint every N completed charities (0 = only at end)
    #[arg(long)]
    pub checkpoint: Option<usize>,

    /// Tag name for the final commit
    #[arg(long, conflicts_with = "no_tag")]
    pub tag: Option<String>,

    /// Skip tagging the final commit
    #[arg(long)]
    pub no_tag: bool,

    /// Config file path
    #[arg(long, default_value = "config/default.toml")]
    pub config: String,
}
