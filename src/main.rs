mod charities;
mod cli;
mod run;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use goodmeasure_collect::bbb::BbbCollector;
use goodmeasure_collect::candid::CandidCollector;
use goodmeasure_collect::charity_navigator::CharityNavigatorCollector;
use goodmeasure_collect::form990_grants::Form990GrantsCollector;
use goodmeasure_collect::propublica::ProPublicaCollector;
use goodmeasure_collect::website::WebsiteCollector;
use goodmeasure_collect::{registry_from, Collector, Orchestrator, OrchestratorConfig};
use goodmeasure_core::AppConfig;
use goodmeasure_crawl::{
    CloudflareProfiles, Crawler, CrawlerCache, CrawlerConfig, Fetcher, PdfDownloader, RateLimiter,
};
use goodmeasure_llm::GeminiClient;
use goodmeasure_pipeline::{
    CharityInput, Exporter, Fingerprints, Phase, PhaseRunner, RunnerOptions, PHASE_ORDER,
};
use goodmeasure_store::Store;

use crate::cli::Cli;

fn main() -> ExitCode {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    runtime.block_on(async_main())
}

async fn async_main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "info" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    // Invalid input is exit 2; everything downstream is 0 or 1.
    let charities = match load_inputs(&cli) {
        Ok(charities) => charities,
        Err(e) => {
            eprintln!("invalid input: {e:#}");
            return ExitCode::from(2);
        }
    };

    match run(cli, charities).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn load_inputs(cli: &Cli) -> Result<Vec<CharityInput>> {
    match (&cli.charities, &cli.ein) {
        (Some(path), None) => charities::load_charities_file(path),
        (None, Some(ein)) => {
            let normalized = goodmeasure_core::normalize_ein(ein)?;
            Ok(vec![CharityInput { name: normalized.clone(), ein: normalized, website: None }])
        }
        _ => anyhow::bail!("provide exactly one of --charities <file> or --ein <ID>"),
    }
}

fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).display().to_string();
        }
    }
    path.to_string()
}

async fn run(cli: Cli, charities: Vec<CharityInput>) -> Result<bool> {
    let mut config = load_config(&cli)?;
    config.apply_env_overrides();
    if let Some(model) = &cli.model {
        config.llm.model = model.clone();
    }
    if let Some(threshold) = cli.judge_threshold {
        config.export.judge_threshold = threshold;
    }
    if let Some(checkpoint) = cli.checkpoint {
        config.general.checkpoint_every = checkpoint;
    }
    config.require_env()?;

    let db_path = expand_home(&config.general.db_path);
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Store::open(&db_path).await.context("opening store")?;
    store.run_migrations().await.context("running migrations")?;

    if cli.cache_status {
        print_cache_status(&store, &charities, &config).await?;
        return Ok(true);
    }

    if cli.clean {
        for charity in &charities {
            let deleted = store.clean_charity(&charity.ein).await?;
            for (table, count) in deleted {
                info!(ein = %charity.ein, table, count, "cleaned");
            }
        }
    }

    // Websites from the charities file backfill rows whose stored website is
    // missing or not scheme-qualified.
    for charity in &charities {
        if let Some(website) = &charity.website {
            if store.sync_charity_website(&charity.ein, website).await? {
                info!(ein = %charity.ein, website, "synced website from charities file");
            }
        }
    }

    let runner = Arc::new(build_runner(&cli, &config, store.clone())?);

    println!(
        "processing {} charit{} with {} workers (model: {})",
        charities.len(),
        if charities.len() == 1 { "y" } else { "ies" },
        cli.workers,
        config.llm.model
    );

    let summary = run::run_all(
        Arc::clone(&runner),
        store.clone(),
        charities,
        cli.workers,
        config.general.checkpoint_every,
    )
    .await;

    // Final durable commit, optionally tagged.
    let commit_hash = store
        .commit(&format!(
            "run complete: {} succeeded, {} failed",
            summary.completed, summary.failed
        ))
        .await?;
    if !cli.no_tag {
        let tag_name = cli
            .tag
            .clone()
            .unwrap_or_else(|| format!("run-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S")));
        store.tag(&tag_name, "pipeline run", &commit_hash).await?;
        info!(tag = %tag_name, "tagged commit");
    }

    // Comprehensive export rebuild. Failure here is a run failure even when
    // every charity succeeded.
    let mut export_ok = true;
    if !cli.skip_export && !cli.dry_run {
        match runner.exporter().rebuild_index(&store).await {
            Ok(index) => {
                let count = index["charities"].as_array().map(|a| a.len()).unwrap_or(0);
                println!("index rebuilt: {count} charities exportable");
            }
            Err(e) => {
                error!("export rebuild failed: {e}");
                export_ok = false;
            }
        }
    }

    run::print_summary(&summary);
    Ok(summary.all_succeeded() && export_ok)
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let raw = match std::fs::read_to_string(&cli.config) {
        Ok(raw) => raw,
        Err(_) => {
            info!(path = %cli.config, "config file not found, using built-in defaults");
            include_str!("../config/default.toml").to_string()
        }
    };
    Ok(AppConfig::from_toml(&raw)?)
}

fn build_runner(cli: &Cli, config: &AppConfig, store: Store) -> Result<PhaseRunner> {
    let request_timeout = Duration::from_secs(config.crawl.request_timeout_seconds);
    let limiter = Arc::new(RateLimiter::new());
    let cache = Arc::new(CrawlerCache::new(
        expand_home(&config.general.cache_dir),
        config.crawl.html_ttl_days,
    )?);
    let profiles = Arc::new(CloudflareProfiles::load(cache.state_dir()));
    if !profiles.is_empty() {
        info!(count = profiles.len(), "loaded persisted bot-bypass profiles");
    }
    let fetcher = Arc::new(Fetcher::new(
        Arc::clone(&cache),
        Arc::clone(&profiles),
        Arc::clone(&limiter),
        config.crawl.user_agent.clone(),
        request_timeout,
        Duration::from_millis(config.crawl.site_delay_ms),
    ));
    let crawler = Arc::new(Crawler::new(
        Arc::clone(&fetcher),
        &config.crawl.user_agent,
        CrawlerConfig {
            max_pages: config.crawl.max_pages,
            max_depth: config.crawl.max_depth,
            timeout_total: Duration::from_secs(config.crawl.timeout_total_seconds),
            max_concurrency: goodmeasure_core::constants::CRAWL_MAX_CONCURRENCY,
        },
    ));

    let api_key = config.llm.api_key.clone().unwrap_or_default();
    let llm = GeminiClient::new(
        api_key,
        config.llm.model.clone(),
        Duration::from_secs(config.llm.request_timeout_seconds),
    );

    let pdf_downloader = PdfDownloader::new(expand_home(&config.general.pdf_dir))?;
    let website: Arc<dyn Collector> = Arc::new(WebsiteCollector::new(
        crawler,
        fetcher,
        cache,
        pdf_downloader,
        Some(llm.clone()),
        store.clone(),
        config.crawl.max_pdf_downloads,
    ));

    let collectors: Vec<Arc<dyn Collector>> = vec![
        Arc::new(ProPublicaCollector::new(Arc::clone(&limiter), request_timeout)),
        Arc::new(CharityNavigatorCollector::new(
            Arc::clone(&limiter),
            Some(llm.clone()),
            request_timeout,
        )),
        Arc::new(CandidCollector::new(Arc::clone(&limiter), request_timeout)),
        Arc::new(Form990GrantsCollector::new(
            Arc::clone(&limiter),
            PathBuf::from(expand_home(&config.general.xml_cache_dir)),
            request_timeout,
        )),
        Arc::new(BbbCollector::new(Arc::clone(&limiter), request_timeout)),
    ];

    let mut registry_collectors = collectors.clone();
    registry_collectors.push(Arc::clone(&website));
    let registry = registry_from(registry_collectors);

    let orchestrator = Orchestrator::new(
        store.clone(),
        collectors,
        Some(website),
        OrchestratorConfig::default(),
    );

    let fingerprints = Fingerprints::new(&config.llm.model, config.export.judge_threshold);
    let exporter = Exporter::new(
        expand_home(&config.export.export_dir),
        config.export.judge_threshold,
    )?;

    let force_phases: Vec<Phase> = cli
        .force_phase
        .iter()
        .map(|name| {
            Phase::from_str(name).ok_or_else(|| anyhow::anyhow!("unknown phase: {name}"))
        })
        .collect::<Result<_>>()?;

    Ok(PhaseRunner::new(
        store,
        orchestrator,
        registry,
        Some(llm),
        fingerprints,
        exporter,
        RunnerOptions {
            force_all: cli.force_all,
            force_phases,
            skip_export: cli.skip_export,
            dry_run: cli.dry_run,
        },
    ))
}

async fn print_cache_status(
    store: &Store,
    charities: &[CharityInput],
    config: &AppConfig,
) -> Result<()> {
    let fingerprints = Fingerprints::new(&config.llm.model, config.export.judge_threshold);
    for charity in charities {
        println!("{} ({})", charity.name, charity.ein);
        for &phase in PHASE_ORDER {
            match store.get_phase_cache(&charity.ein, phase.as_str()).await? {
                Some(entry) => {
                    let current = entry.fingerprint == fingerprints.get(phase);
                    let age_days = (chrono::Utc::now() - entry.ran_at).num_days();
                    println!(
                        "  {:<12} cached {age_days}d ago, fingerprint {} (${:.4})",
                        phase.as_str(),
                        if current { "current" } else { "STALE" },
                        entry.cost_usd
                    );
                }
                None => println!("  {:<12} not cached", phase.as_str()),
            }
        }
    }
    Ok(())
}
