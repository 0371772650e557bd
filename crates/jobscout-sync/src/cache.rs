//! Read-through job cache: scrape on an empty store, otherwise serve stored postings.

use std::collections::BTreeSet;

use async_trait::async_trait;
use jobscout_core::JobPosting;
use jobscout_storage::{BatchSaveReport, JobStore, StoreError};
use thiserror::Error;
use tracing::{debug, info};

use crate::{ScrapePass, ScrapeRunner};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("job store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("scraped {scraped} jobs but none could be persisted")]
    Persist { scraped: usize },
}

#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub pass: ScrapePass,
    pub saved: BatchSaveReport,
}

#[derive(Debug, Clone)]
pub enum CacheOutcome {
    Hit,
    Miss { report: RefreshReport },
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub jobs: Vec<JobPosting>,
    pub outcome: CacheOutcome,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self.outcome, CacheOutcome::Hit)
    }
}

fn as_limit(max_jobs: usize) -> u32 {
    u32::try_from(max_jobs).unwrap_or(u32::MAX)
}

pub struct JobCache<R> {
    store: JobStore,
    runner: R,
}

impl<R: ScrapeRunner> JobCache<R> {
    pub fn new(store: JobStore, runner: R) -> Self {
        Self { store, runner }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub async fn get_cached_jobs(&self, keywords: &str, max_jobs: usize) -> Result<Vec<JobPosting>, DiscoveryError> {
        Ok(self.lookup(keywords, max_jobs).await?.jobs)
    }

    /// Any stored job counts as a hit; there is no expiry. Keywords only matter on a miss.
    pub async fn lookup(&self, keywords: &str, max_jobs: usize) -> Result<CacheLookup, DiscoveryError> {
        if self.store.count_jobs().await? == 0 {
            info!(keywords, "job cache empty; scraping");
            let report = self.refresh(keywords, max_jobs).await?;
            return Ok(CacheLookup {
                jobs: report.pass.jobs.clone(),
                outcome: CacheOutcome::Miss { report },
            });
        }

        let jobs = self.store.get_all_jobs(Some(as_limit(max_jobs)), None).await?;
        debug!(jobs = jobs.len(), "job cache hit");
        Ok(CacheLookup {
            jobs,
            outcome: CacheOutcome::Hit,
        })
    }

    /// Scrape now and persist whatever the pass found, regardless of cache state.
    pub async fn refresh(&self, keywords: &str, max_jobs: usize) -> Result<RefreshReport, DiscoveryError> {
        let pass = self.runner.run_pass(keywords, max_jobs).await;
        let saved = self.store.save_jobs_batch(&pass.jobs).await?;
        if !pass.jobs.is_empty() && saved.saved() == 0 {
            return Err(DiscoveryError::Persist {
                scraped: pass.jobs.len(),
            });
        }
        info!(
            run_id = %pass.run_id,
            scraped = pass.jobs.len(),
            inserted = saved.inserted,
            updated = saved.updated,
            failed = saved.failed,
            "refreshed job cache"
        );
        Ok(RefreshReport { pass, saved })
    }

    pub async fn count(&self) -> Result<u64, DiscoveryError> {
        Ok(self.store.count_jobs().await?)
    }

    pub async fn clear(&self) -> Result<u64, DiscoveryError> {
        Ok(self.store.clear_jobs().await?)
    }
}

/// Scores one posting against a resume. Returns `(score, justification)`; higher is better.
#[async_trait]
pub trait CompatibilityScorer: Send + Sync {
    async fn score(&self, resume_skills: &BTreeSet<String>, job: &JobPosting) -> (f64, String);
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedJob {
    pub job: JobPosting,
    pub score: f64,
    pub justification: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResumeDiscovery {
    pub total_jobs_found: usize,
    pub ranked: Vec<RankedJob>,
}

/// Pulls jobs through the cache (scraping with the resume skills as keywords on a miss)
/// and ranks them best first.
pub async fn discover_jobs_for_resume<R, S>(
    cache: &JobCache<R>,
    scorer: &S,
    resume_skills: &[String],
    max_jobs: usize,
) -> Result<ResumeDiscovery, DiscoveryError>
where
    R: ScrapeRunner,
    S: CompatibilityScorer + ?Sized,
{
    let keywords = resume_skills
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let skills = resume_skills
        .iter()
        .map(|s| jobscout_core::normalize_key_fragment(s))
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>();

    let jobs = cache.get_cached_jobs(&keywords, max_jobs).await?;
    let total_jobs_found = jobs.len();

    let mut ranked = Vec::with_capacity(jobs.len());
    for job in jobs {
        let (score, justification) = scorer.score(&skills, &job).await;
        ranked.push(RankedJob {
            job,
            score,
            justification,
        });
    }
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    Ok(ResumeDiscovery {
        total_jobs_found,
        ranked,
    })
}
