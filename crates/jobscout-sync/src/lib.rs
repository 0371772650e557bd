//! Scrape orchestration: source registry, the per-source scrape state machine and the cache gateway.

pub mod cache;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscout_adapters::{parse, ParseError};
use jobscout_core::{
    JobPosting, Normalizer, Politeness, SearchQuery, SkillVocabulary, SourceConfig, StrategyKind,
};
use jobscout_fetch::{
    BrowserLauncher, ChromeLauncher, FetchError, FetchStrategy, HttpClientConfig, HttpFetchStrategy, RawContent,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use cache::{
    discover_jobs_for_resume, CacheLookup, CacheOutcome, CompatibilityScorer, DiscoveryError, JobCache,
    RankedJob, RefreshReport, ResumeDiscovery,
};

pub const CRATE_NAME: &str = "jobscout-sync";

pub const DEFAULT_MAX_JOBS: usize = 50;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !ids.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {}", source.source_id);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

const SKILLS_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize)]
struct SkillsFile {
    version: u32,
    #[serde(default)]
    skills: Vec<String>,
}

/// Reads `rules/skills.yaml`. A missing file or an empty list means the built-in vocabulary.
pub async fn load_skill_vocabulary(path: &Path) -> Result<SkillVocabulary> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no skills file; using built-in vocabulary");
            return Ok(SkillVocabulary::default());
        }
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let file: SkillsFile = serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if file.version != SKILLS_FILE_VERSION {
        bail!(
            "unsupported skills file version {} in {} (expected {SKILLS_FILE_VERSION})",
            file.version,
            path.display()
        );
    }
    if file.skills.is_empty() {
        warn!(path = %path.display(), "skills file is empty; using built-in vocabulary");
        return Ok(SkillVocabulary::default());
    }
    Ok(SkillVocabulary::from_terms(file.skills))
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub sources_path: PathBuf,
    pub skills_path: PathBuf,
    pub http_timeout_secs: u64,
    pub use_browser: bool,
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
    pub location: Option<String>,
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("JOBSCOUT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./jobs.db")),
            sources_path: std::env::var("JOBSCOUT_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            skills_path: std::env::var("JOBSCOUT_SKILLS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rules/skills.yaml")),
            http_timeout_secs: std::env::var("JOBSCOUT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            use_browser: env_flag("JOBSCOUT_USE_BROWSER", false),
            headless: env_flag("JOBSCOUT_HEADLESS", true),
            chrome_path: std::env::var("JOBSCOUT_CHROME_PATH")
                .or_else(|_| std::env::var("CHROME_PATH"))
                .ok()
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
            location: std::env::var("JOBSCOUT_LOCATION")
                .ok()
                .filter(|l| !l.trim().is_empty()),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn chrome_launcher(&self) -> ChromeLauncher {
        ChromeLauncher {
            chrome_path: self.chrome_path.clone(),
            headless: self.headless,
            timeout: self.http_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Fetch(FetchError),
    Parse(ParseError),
    MaxJobsReached,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(err) => write!(f, "fetch failed: {err}"),
            Self::Parse(err) => write!(f, "parse failed: {err}"),
            Self::MaxJobsReached => f.write_str("max jobs reached"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceState {
    Pending,
    Fetching,
    Parsing,
    Normalizing,
    Done,
    Skipped(SkipReason),
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Fetching => f.write_str("fetching"),
            Self::Parsing => f.write_str("parsing"),
            Self::Normalizing => f.write_str("normalizing"),
            Self::Done => f.write_str("done"),
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

/// What happened to one source during a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceOutcome {
    pub source_id: String,
    pub state: SourceState,
    pub strategy: StrategyKind,
    pub pages_fetched: u32,
    pub candidates: usize,
    pub dropped: usize,
    pub duplicates: usize,
    pub kept: usize,
    /// A later page failed; earlier pages were kept.
    pub truncated: bool,
}

impl SourceOutcome {
    fn new(source_id: &str, strategy: StrategyKind) -> Self {
        Self {
            source_id: source_id.to_string(),
            state: SourceState::Pending,
            strategy,
            pages_fetched: 0,
            candidates: 0,
            dropped: 0,
            duplicates: 0,
            kept: 0,
            truncated: false,
        }
    }

    fn transition(&mut self, next: SourceState) {
        debug!(source_id = %self.source_id, from = %self.state, to = %next, "source state");
        self.state = next;
    }

    fn skip(mut self, reason: SkipReason) -> Self {
        self.transition(SourceState::Skipped(reason));
        self
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.state, SourceState::Skipped(_))
    }
}

#[derive(Debug, Clone)]
pub struct ScrapePass {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<JobPosting>,
    pub outcomes: Vec<SourceOutcome>,
    pub browser_available: bool,
}

impl ScrapePass {
    pub fn outcome(&self, source_id: &str) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.source_id == source_id)
    }

    pub fn skipped_sources(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_skipped()).count()
    }
}

/// Anything that can run a scrape pass. Scrape failures never surface here;
/// they show up as skipped sources in the pass.
#[async_trait]
pub trait ScrapeRunner: Send + Sync {
    async fn run_pass(&self, keywords: &str, max_jobs: usize) -> ScrapePass;

    async fn scrape_all_sources(&self, keywords: &str, max_jobs: usize) -> Vec<JobPosting> {
        self.run_pass(keywords, max_jobs).await.jobs
    }
}

/// Uniform draw from the politeness window. A reversed window is read as `[max, min]`.
pub fn politeness_delay(politeness: &Politeness) -> Duration {
    let lo = politeness.min_delay_ms.min(politeness.max_delay_ms);
    let hi = politeness.min_delay_ms.max(politeness.max_delay_ms);
    if hi == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// Jobs collected so far in a pass, deduplicated by identity.
#[derive(Default)]
struct PassProgress {
    jobs: Vec<JobPosting>,
    seen: HashSet<String>,
    fetched_any: bool,
}

pub struct ScrapeOrchestrator {
    sources: Vec<SourceConfig>,
    http: Arc<dyn FetchStrategy>,
    browser: Option<Arc<dyn BrowserLauncher>>,
    normalizer: Normalizer,
    location: Option<String>,
    cancel: CancellationToken,
}

impl ScrapeOrchestrator {
    pub fn new(sources: Vec<SourceConfig>, http: Arc<dyn FetchStrategy>) -> Self {
        Self {
            sources,
            http,
            browser: None,
            normalizer: Normalizer::default(),
            location: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &SyncConfig, registry: SourceRegistry, vocabulary: SkillVocabulary) -> Result<Self> {
        let http = HttpFetchStrategy::new(HttpClientConfig {
            timeout: config.http_timeout(),
        })
        .context("building http client")?;
        let orchestrator = Self::new(registry.sources, Arc::new(http))
            .with_normalizer(Normalizer::new(vocabulary))
            .with_location(config.location.clone());
        Ok(if config.use_browser {
            orchestrator.with_browser_launcher(Arc::new(config.chrome_launcher()))
        } else {
            orchestrator
        })
    }

    pub fn with_browser_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.browser = Some(launcher);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Location for every source's `{location}` slot; blank or `None` falls back to each
    /// source's `default_location`.
    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location.filter(|l| !l.trim().is_empty());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sources(&self) -> &[SourceConfig] {
        &self.sources
    }

    pub async fn run_pass(&self, keywords: &str, max_jobs: usize) -> ScrapePass {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("scrape_pass", %run_id, keywords, max_jobs);

        async move {
            let enabled = self.sources.iter().filter(|s| s.enabled).collect::<Vec<_>>();
            let browser = self.negotiate_browser(&enabled).await;
            let mut progress = PassProgress::default();
            let mut outcomes = Vec::with_capacity(enabled.len());

            for source in enabled {
                let strategy = match (source.strategy, &browser) {
                    (StrategyKind::Browser, Some(browser)) => browser,
                    _ => &self.http,
                };
                let outcome = SourceOutcome::new(&source.source_id, strategy.kind());
                if self.cancel.is_cancelled() {
                    outcomes.push(outcome.skip(SkipReason::Cancelled));
                    continue;
                }
                if progress.jobs.len() >= max_jobs {
                    outcomes.push(outcome.skip(SkipReason::MaxJobsReached));
                    continue;
                }
                let outcome = self
                    .scrape_source(source, strategy.as_ref(), keywords, max_jobs, outcome, &mut progress)
                    .await;
                outcomes.push(outcome);
            }

            let mut jobs = progress.jobs;
            jobs.truncate(max_jobs);
            let pass = ScrapePass {
                run_id,
                started_at,
                finished_at: Utc::now(),
                jobs,
                outcomes,
                browser_available: browser.is_some(),
            };
            info!(
                jobs = pass.jobs.len(),
                sources = pass.outcomes.len(),
                skipped = pass.skipped_sources(),
                "scrape pass finished"
            );
            pass
        }
        .instrument(span)
        .await
    }

    /// Launch the browser once, only if some enabled source wants it.
    async fn negotiate_browser(&self, sources: &[&SourceConfig]) -> Option<Arc<dyn FetchStrategy>> {
        if !sources.iter().any(|s| s.strategy == StrategyKind::Browser) {
            return None;
        }
        let Some(launcher) = self.browser.clone() else {
            debug!("no browser launcher configured; browser sources use http");
            return None;
        };
        match tokio::task::spawn_blocking(move || launcher.launch()).await {
            Ok(Ok(strategy)) => {
                info!("browser strategy ready");
                Some(strategy)
            }
            Ok(Err(err)) => {
                warn!(error = %err, "browser unavailable; browser sources fall back to http");
                None
            }
            Err(err) => {
                warn!(error = %err, "browser launch task failed; browser sources fall back to http");
                None
            }
        }
    }

    /// Sleeps before every fetch but the first of the pass. Returns false if cancelled meanwhile.
    async fn polite_pause(&self, source: &SourceConfig, progress: &mut PassProgress) -> bool {
        if !std::mem::replace(&mut progress.fetched_any, true) {
            return true;
        }
        let delay = politeness_delay(&source.politeness);
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        debug!(source_id = %source.source_id, delay_ms = delay.as_millis() as u64, "politeness delay");
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// A failed browser page is retried once over http, after its own politeness pause.
    /// Cancellation during that pause reports the browser error.
    async fn fetch_page(
        &self,
        strategy: &dyn FetchStrategy,
        source: &SourceConfig,
        query: &SearchQuery,
        progress: &mut PassProgress,
    ) -> Result<RawContent, FetchError> {
        match strategy.fetch(source, query).await {
            Ok(raw) => Ok(raw),
            Err(err) if strategy.kind() == StrategyKind::Browser => {
                warn!(source_id = %source.source_id, page = query.page, error = %err, "browser fetch failed; retrying over http");
                if !self.polite_pause(source, progress).await {
                    return Err(err);
                }
                self.http.fetch(source, query).await
            }
            Err(err) => Err(err),
        }
    }

    async fn scrape_source(
        &self,
        source: &SourceConfig,
        strategy: &dyn FetchStrategy,
        keywords: &str,
        max_jobs: usize,
        mut outcome: SourceOutcome,
        progress: &mut PassProgress,
    ) -> SourceOutcome {
        let mut query = SearchQuery::new(keywords);
        query.location = self.location.clone();

        for page in 0..source.pages.max(1) {
            if progress.jobs.len() >= max_jobs {
                break;
            }
            if !self.polite_pause(source, progress).await {
                if page == 0 {
                    return outcome.skip(SkipReason::Cancelled);
                }
                outcome.truncated = true;
                break;
            }

            outcome.transition(SourceState::Fetching);
            let raw = match self.fetch_page(strategy, source, &query.with_page(page), progress).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(source_id = %source.source_id, page, error = %err, "fetch failed");
                    if page == 0 {
                        return outcome.skip(SkipReason::Fetch(err));
                    }
                    outcome.truncated = true;
                    break;
                }
            };
            outcome.pages_fetched += 1;

            outcome.transition(SourceState::Parsing);
            let parsed = match parse(source, &raw) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(source_id = %source.source_id, page, error = %err, "parse failed");
                    if page == 0 {
                        return outcome.skip(SkipReason::Parse(err));
                    }
                    outcome.truncated = true;
                    break;
                }
            };
            outcome.candidates += parsed.candidates.len();
            outcome.dropped += parsed.dropped;
            if parsed.candidates.is_empty() {
                break;
            }

            outcome.transition(SourceState::Normalizing);
            let scraped_at = Utc::now();
            for candidate in parsed.candidates {
                if progress.jobs.len() >= max_jobs {
                    break;
                }
                let posting = self.normalizer.normalize(candidate, scraped_at);
                if progress.seen.insert(posting.id.clone()) {
                    progress.jobs.push(posting);
                    outcome.kept += 1;
                } else {
                    outcome.duplicates += 1;
                }
            }
        }

        outcome.transition(SourceState::Done);
        outcome
    }
}

#[async_trait]
impl ScrapeRunner for ScrapeOrchestrator {
    async fn run_pass(&self, keywords: &str, max_jobs: usize) -> ScrapePass {
        ScrapeOrchestrator::run_pass(self, keywords, max_jobs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
sources:
  - source_id: indeed
    display_name: Indeed
    url_template: "https://www.indeed.com/jobs?q={keywords}&l={location}&start={offset}"
    parser:
      kind: indeed
    pages: 2
    default_location: Remote
  - source_id: github
    url_template: "https://jobs.github.com/positions.json?description={keywords}&page={page}"
    parser:
      kind: github
    politeness:
      min_delay_ms: 1000
      max_delay_ms: 2000
  - source_id: linkedin
    enabled: false
    url_template: "https://www.linkedin.com/jobs/search/?keywords={keywords}&start={offset}"
    strategy: browser
    parser:
      kind: generic
      selectors:
        card: div.base-card
        title: h3
        company: h4
"#;

    #[test]
    fn registry_yaml_loads_with_defaults() {
        let registry = SourceRegistry::from_yaml_str(REGISTRY).unwrap();
        assert_eq!(registry.sources.len(), 3);
        let enabled = registry.enabled().map(|s| s.source_id.as_str()).collect::<Vec<_>>();
        assert_eq!(enabled, vec!["indeed", "github"]);

        let github = &registry.sources[1];
        assert_eq!(github.pages, 1);
        assert_eq!(github.strategy, StrategyKind::Http);
        assert_eq!(github.politeness.min_delay_ms, 1000);
        assert_eq!(registry.sources[0].politeness, Politeness::default());
        assert_eq!(registry.sources[2].strategy, StrategyKind::Browser);
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let text = r#"
sources:
  - source_id: indeed
    url_template: "https://a.example/?q={keywords}"
    parser: { kind: indeed }
  - source_id: indeed
    url_template: "https://b.example/?q={keywords}"
    parser: { kind: indeed }
"#;
        let err = SourceRegistry::from_yaml_str(text).unwrap_err();
        assert!(err.to_string().contains("duplicate source_id"));
    }

    #[test]
    fn politeness_delay_stays_in_window() {
        let politeness = Politeness {
            min_delay_ms: 200,
            max_delay_ms: 400,
            user_agents: vec![],
        };
        for _ in 0..100 {
            let delay = politeness_delay(&politeness);
            assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
        }
        assert_eq!(politeness_delay(&Politeness::immediate()), Duration::ZERO);

        let reversed = Politeness {
            min_delay_ms: 50,
            max_delay_ms: 10,
            user_agents: vec![],
        };
        let delay = politeness_delay(&reversed);
        assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn skills_file_overrides_builtin_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.yaml");
        std::fs::write(&path, "version: 1\nskills:\n  - Rust\n  - tokio\n").unwrap();
        let vocab = load_skill_vocabulary(&path).await.unwrap();
        assert_eq!(vocab.len(), 2);
        assert!(vocab.extract("We write Rust with Tokio").contains("tokio"));

        let missing = load_skill_vocabulary(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(missing.len(), SkillVocabulary::default().len());
    }

    #[tokio::test]
    async fn skills_file_with_unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.yaml");
        std::fs::write(&path, "version: 2\nskills:\n  - Rust\n").unwrap();
        let err = load_skill_vocabulary(&path).await.unwrap_err();
        assert!(err.to_string().contains("unsupported skills file version 2"), "{err}");
    }

    #[test]
    fn blank_location_falls_back_to_source_default() {
        let http = Arc::new(HttpFetchStrategy::new(HttpClientConfig::default()).unwrap());
        let orchestrator = ScrapeOrchestrator::new(vec![], http).with_location(Some("  ".into()));
        assert_eq!(orchestrator.location, None);
    }

    #[tokio::test]
    async fn shipped_registry_and_skills_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = SourceRegistry::load(&root.join("sources.yaml")).await.unwrap();
        let ids = registry.enabled().map(|s| s.source_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["indeed", "github", "linkedin"]);

        let vocab = load_skill_vocabulary(&root.join("rules/skills.yaml")).await.unwrap();
        assert_eq!(vocab, SkillVocabulary::default());
    }

    #[test]
    fn skip_reasons_render_for_operators() {
        let state = SourceState::Skipped(SkipReason::Fetch(FetchError::Timeout {
            url: "https://x.example".into(),
        }));
        assert!(state.to_string().starts_with("skipped (fetch failed:"));
        assert_eq!(SourceState::Skipped(SkipReason::MaxJobsReached).to_string(), "skipped (max jobs reached)");
    }
}
