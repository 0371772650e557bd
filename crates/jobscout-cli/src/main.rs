use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobscout_core::JobPosting;
use jobscout_storage::JobStore;
use jobscout_sync::{
    load_skill_vocabulary, CacheOutcome, JobCache, RefreshReport, ScrapeOrchestrator, SourceRegistry, SyncConfig,
    DEFAULT_MAX_JOBS,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "jobscout-cli")]
#[command(about = "Job Scout command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every enabled source now and persist what was found
    Scrape {
        #[arg(required = true, num_args = 1..)]
        keywords: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_JOBS)]
        max: usize,
        /// Fills `{location}` in source URLs instead of each source's default
        #[arg(long)]
        location: Option<String>,
        /// Render browser-preferring sources with headless Chrome
        #[arg(long)]
        browser: bool,
        /// Show the browser window
        #[arg(long)]
        headed: bool,
    },
    /// Read through the cache; scrapes only when the store is empty
    Cached {
        #[arg(required = true, num_args = 1..)]
        keywords: Vec<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_JOBS)]
        max: usize,
        #[arg(long)]
        location: Option<String>,
    },
    Count,
    Clear {
        #[arg(long)]
        yes: bool,
    },
    List {
        #[arg(long)]
        source: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        #[arg(long)]
        offset: Option<u32>,
    },
    Search {
        #[arg(required = true, num_args = 1..)]
        skills: Vec<String>,
        #[arg(long)]
        limit: Option<u32>,
    },
    Sources,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn build_cache(config: &SyncConfig) -> Result<JobCache<ScrapeOrchestrator>> {
    let registry = SourceRegistry::load(&config.sources_path).await?;
    let vocabulary = load_skill_vocabulary(&config.skills_path).await?;
    let orchestrator = ScrapeOrchestrator::from_config(config, registry, vocabulary)?;

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current source");
            token.cancel();
        }
    });

    let store = open_store(config).await?;
    Ok(JobCache::new(store, orchestrator))
}

async fn open_store(config: &SyncConfig) -> Result<JobStore> {
    JobStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening job store at {}", config.db_path.display()))
}

fn print_jobs(jobs: &[JobPosting]) {
    for job in jobs {
        let skills = job.skills.iter().map(String::as_str).collect::<Vec<_>>().join(",");
        println!(
            "{} | {} | {} | {} | [{}] | {} | {}",
            job.title,
            job.company,
            job.location.as_deref().unwrap_or("-"),
            job.experience_level,
            skills,
            job.salary.as_deref().unwrap_or("-"),
            job.url
        );
    }
}

fn print_refresh(report: &RefreshReport) {
    for outcome in &report.pass.outcomes {
        println!(
            "{:<12} {:<8} pages={} kept={} dupes={} dropped={}{} state={}",
            outcome.source_id,
            outcome.strategy.to_string(),
            outcome.pages_fetched,
            outcome.kept,
            outcome.duplicates,
            outcome.dropped,
            if outcome.truncated { " (truncated)" } else { "" },
            outcome.state
        );
    }
    println!(
        "scrape complete: run_id={} jobs={} inserted={} updated={} failed={} browser={}",
        report.pass.run_id,
        report.pass.jobs.len(),
        report.saved.inserted,
        report.saved.updated,
        report.saved.failed,
        report.pass.browser_available
    );
    if report.pass.jobs.is_empty() {
        println!("no jobs found");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Count) {
        Commands::Scrape {
            keywords,
            max,
            location,
            browser,
            headed,
        } => {
            config.location = location.or(config.location);
            config.use_browser |= browser;
            config.headless &= !headed;
            let cache = build_cache(&config).await?;
            let report = cache.refresh(&keywords.join(" "), max).await?;
            print_refresh(&report);
        }
        Commands::Cached { keywords, max, location } => {
            config.location = location.or(config.location);
            let cache = build_cache(&config).await?;
            let lookup = cache.lookup(&keywords.join(" "), max).await?;
            match &lookup.outcome {
                CacheOutcome::Hit => info!(jobs = lookup.jobs.len(), "served from cache"),
                CacheOutcome::Miss { report } => print_refresh(report),
            }
            print_jobs(&lookup.jobs);
        }
        Commands::Count => {
            let store = open_store(&config).await?;
            println!("{}", store.count_jobs().await?);
        }
        Commands::Clear { yes } => {
            if !yes {
                bail!("refusing to clear {} without --yes", config.db_path.display());
            }
            let store = open_store(&config).await?;
            println!("deleted {} jobs", store.clear_jobs().await?);
        }
        Commands::List { source, limit, offset } => {
            let store = open_store(&config).await?;
            let jobs = match source {
                Some(source_id) => store
                    .get_jobs_by_source(&source_id)
                    .await?
                    .into_iter()
                    .skip(offset.unwrap_or(0) as usize)
                    .take(limit.map(|l| l as usize).unwrap_or(usize::MAX))
                    .collect(),
                None => store.get_all_jobs(limit, offset).await?,
            };
            print_jobs(&jobs);
        }
        Commands::Search { skills, limit } => {
            let store = open_store(&config).await?;
            print_jobs(&store.search_jobs_by_skills(skills.as_slice(), limit).await?);
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.sources_path).await?;
            for source in &registry.sources {
                println!(
                    "{:<12} enabled={:<5} strategy={:<7} pages={} {}",
                    source.source_id,
                    source.enabled,
                    source.strategy.to_string(),
                    source.pages,
                    source.url_template
                );
            }
        }
    }

    Ok(())
}
