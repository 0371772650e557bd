//! SQLite-backed job store: one `jobs` table keyed by identity hash.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobscout_core::{normalize_key_fragment, ExperienceLevel, JobPosting};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobscout-storage";

pub const DEFAULT_DB_FILE: &str = "jobs.db";

const JOB_COLUMNS: &str = "j.id, j.title, j.company, j.location, j.description, j.skills, \
     j.experience_level, j.salary, j.source, j.url, j.scraped_at, j.last_seen_at, j.seen_count";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store connection failure: {0}")]
    ConnectionFailure(#[source] sqlx::Error),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("job store query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("stored job {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },
}

impl StoreError {
    fn connection(err: sqlx::Error) -> Self {
        Self::ConnectionFailure(err)
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if matches!(
                db.kind(),
                ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation
            ) {
                return Self::ConstraintViolation(db.message().to_string());
            }
        }
        if matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::Tls(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        ) {
            Self::ConnectionFailure(err)
        } else {
            Self::Query(err)
        }
    }
}

/// Outcome of one `save_jobs_batch` call. Rows that violate a constraint are
/// counted in `failed`; the rest of the batch is still written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSaveReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl BatchSaveReport {
    pub fn saved(&self) -> usize {
        self.inserted + self.updated
    }
}

/// A posting plus the bookkeeping the store keeps about re-sightings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJob {
    pub posting: JobPosting,
    pub last_seen_at: DateTime<Utc>,
    pub seen_count: u32,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    title: String,
    company: String,
    location: Option<String>,
    description: String,
    skills: String,
    experience_level: String,
    salary: Option<String>,
    source: String,
    url: String,
    scraped_at: i64,
    last_seen_at: i64,
    seen_count: i64,
}

fn micros_to_utc(id: &str, micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("timestamp out of range: {micros}"),
    })
}

impl JobRow {
    fn into_stored(self) -> Result<StoredJob, StoreError> {
        let skills: BTreeSet<String> = serde_json::from_str(&self.skills).map_err(|e| StoreError::Corrupt {
            id: self.id.clone(),
            reason: format!("invalid skills JSON: {e}"),
        })?;
        let experience_level =
            ExperienceLevel::parse(&self.experience_level).ok_or_else(|| StoreError::Corrupt {
                id: self.id.clone(),
                reason: format!("unknown experience level {}", self.experience_level),
            })?;
        let scraped_at = micros_to_utc(&self.id, self.scraped_at)?;
        let last_seen_at = micros_to_utc(&self.id, self.last_seen_at)?;

        Ok(StoredJob {
            posting: JobPosting {
                id: self.id,
                title: self.title,
                company: self.company,
                location: self.location,
                description: self.description,
                skills,
                experience_level,
                salary: self.salary,
                source: self.source,
                url: self.url,
                scraped_at,
            },
            last_seen_at,
            seen_count: u32::try_from(self.seen_count).unwrap_or(u32::MAX),
        })
    }

    fn into_posting(self) -> Result<JobPosting, StoreError> {
        self.into_stored().map(|stored| stored.posting)
    }
}

fn rows_to_postings(rows: Vec<JobRow>) -> Result<Vec<JobPosting>, StoreError> {
    rows.into_iter().map(JobRow::into_posting).collect()
}

fn sql_limit(limit: Option<u32>) -> i64 {
    limit.map(i64::from).unwrap_or(-1)
}

/// Upsert one posting, returning the row's `seen_count` after the write
/// (1 means the row was just inserted).
async fn upsert(conn: &mut SqliteConnection, posting: &JobPosting) -> Result<i64, StoreError> {
    let skills = serde_json::to_string(&posting.skills).map_err(|e| StoreError::Corrupt {
        id: posting.id.clone(),
        reason: format!("unserializable skills: {e}"),
    })?;
    let seen_at = posting.scraped_at.timestamp_micros();

    let seen_count: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO jobs (
            id, title, company, location, description, skills, experience_level,
            salary, source, url, scraped_at, last_seen_at, seen_count
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11, 1)
        ON CONFLICT(id) DO UPDATE SET
            location = excluded.location,
            description = excluded.description,
            skills = excluded.skills,
            experience_level = excluded.experience_level,
            salary = excluded.salary,
            last_seen_at = excluded.last_seen_at,
            seen_count = jobs.seen_count + 1
        RETURNING seen_count
        "#,
    )
    .bind(&posting.id)
    .bind(&posting.title)
    .bind(&posting.company)
    .bind(&posting.location)
    .bind(&posting.description)
    .bind(skills)
    .bind(posting.experience_level.as_str())
    .bind(&posting.salary)
    .bind(&posting.source)
    .bind(&posting.url)
    .bind(seen_at)
    .fetch_one(conn)
    .await?;
    Ok(seen_count)
}

/// Durable job storage. Cheap to clone; each call borrows a pooled connection
/// only for its own duration.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if needed) a file-backed store.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StoreError::connection)?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!(path = %path.as_ref().display(), "job store opened");
        Ok(store)
    }

    /// Ephemeral store on a single pinned connection, so every call sees the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(StoreError::connection)?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT,
                description TEXT NOT NULL DEFAULT '',
                skills TEXT NOT NULL DEFAULT '[]',
                experience_level TEXT NOT NULL DEFAULT 'unspecified',
                salary TEXT,
                source TEXT NOT NULL,
                url TEXT NOT NULL DEFAULT '',
                scraped_at INTEGER NOT NULL,
                last_seen_at INTEGER NOT NULL,
                seen_count INTEGER NOT NULL DEFAULT 1,
                CHECK (title <> '' OR company <> '')
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_scraped_at ON jobs(scraped_at DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_source ON jobs(source);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn save_jobs_batch(&self, postings: &[JobPosting]) -> Result<BatchSaveReport, StoreError> {
        let mut report = BatchSaveReport::default();
        if postings.is_empty() {
            return Ok(report);
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::connection)?;
        for posting in postings {
            match upsert(&mut tx, posting).await {
                Ok(1) => report.inserted += 1,
                Ok(_) => report.updated += 1,
                Err(StoreError::ConstraintViolation(reason)) => {
                    warn!(id = %posting.id, source = %posting.source, %reason, "rejected job row");
                    report.failed += 1;
                }
                Err(other) => return Err(other),
            }
        }
        tx.commit().await?;

        debug!(
            inserted = report.inserted,
            updated = report.updated,
            failed = report.failed,
            "saved job batch"
        );
        Ok(report)
    }

    /// Most recently first-seen postings first.
    pub async fn get_all_jobs(&self, limit: Option<u32>, offset: Option<u32>) -> Result<Vec<JobPosting>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs AS j ORDER BY j.scraped_at DESC, j.rowid ASC LIMIT ? OFFSET ?"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(sql_limit(limit))
            .bind(i64::from(offset.unwrap_or(0)))
            .fetch_all(&self.pool)
            .await?;
        rows_to_postings(rows)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<StoredJob>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs AS j WHERE j.id = ?");
        let row: Option<JobRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(JobRow::into_stored).transpose()
    }

    /// Postings sharing at least one skill with `skills`, ranked by overlap size
    /// and then by recency. Matching is case-insensitive.
    pub async fn search_jobs_by_skills<S: AsRef<str>>(
        &self,
        skills: &[S],
        limit: Option<u32>,
    ) -> Result<Vec<JobPosting>, StoreError> {
        let wanted = skills
            .iter()
            .map(|s| normalize_key_fragment(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect::<BTreeSet<_>>();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {JOB_COLUMNS}, COUNT(DISTINCT lower(s.value)) AS overlap \
             FROM jobs AS j, json_each(j.skills) AS s WHERE lower(s.value) IN ("
        ));
        let mut list = qb.separated(", ");
        for skill in wanted {
            list.push_bind(skill);
        }
        list.push_unseparated(") GROUP BY j.id ORDER BY overlap DESC, j.scraped_at DESC, j.rowid ASC LIMIT ");
        qb.push_bind(sql_limit(limit));

        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows_to_postings(rows)
    }

    pub async fn get_jobs_by_source(&self, source_id: &str) -> Result<Vec<JobPosting>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs AS j WHERE j.source = ? ORDER BY j.scraped_at DESC, j.rowid ASC"
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql).bind(source_id).fetch_all(&self.pool).await?;
        rows_to_postings(rows)
    }

    pub async fn count_jobs(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Deletes every row. Not reversible.
    pub async fn clear_jobs(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM jobs").execute(&self.pool).await?;
        info!(deleted = result.rows_affected(), "cleared job store");
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobscout_core::identity_hash;
    use tempfile::tempdir;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn posting(title: &str, source: &str, skills: &[&str], scraped_at: DateTime<Utc>) -> JobPosting {
        let url = format!("https://jobs.example/{}", title.replace(' ', "-").to_lowercase());
        JobPosting {
            id: identity_hash(title, "TechCorp", source, &url),
            title: title.to_string(),
            company: "TechCorp".to_string(),
            location: Some("Remote".to_string()),
            description: format!("{title} role"),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            experience_level: ExperienceLevel::Unspecified,
            salary: None,
            source: source.to_string(),
            url,
            scraped_at,
        }
    }

    fn titles(jobs: &[JobPosting]) -> Vec<&str> {
        jobs.iter().map(|j| j.title.as_str()).collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_keeps_first_seen() {
        let store = JobStore::in_memory().await.unwrap();
        let first = posting("Python Developer", "indeed", &["python"], at(8));
        let report = store.save_jobs_batch(&[first.clone()]).await.unwrap();
        assert_eq!(report, BatchSaveReport { inserted: 1, updated: 0, failed: 0 });

        let mut again = first.clone();
        again.description = "Python Developer role, now with Docker".to_string();
        again.skills.insert("docker".to_string());
        again.salary = Some("$100k".to_string());
        again.scraped_at = at(12);
        let report = store.save_jobs_batch(&[again]).await.unwrap();
        assert_eq!(report, BatchSaveReport { inserted: 0, updated: 1, failed: 0 });
        assert_eq!(store.count_jobs().await.unwrap(), 1);

        let stored = store.get_job(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.posting.description, "Python Developer role, now with Docker");
        assert_eq!(stored.posting.salary.as_deref(), Some("$100k"));
        assert!(stored.posting.skills.contains("docker"));
        assert_eq!(stored.posting.scraped_at, at(8));
        assert_eq!(stored.last_seen_at, at(12));
        assert_eq!(stored.seen_count, 2);
    }

    #[tokio::test]
    async fn round_trips_every_field() {
        let store = JobStore::in_memory().await.unwrap();
        let mut job = posting("Senior Rust Engineer", "github", &["rust", "linux"], at(9));
        job.experience_level = ExperienceLevel::Senior;
        job.location = None;
        job.salary = Some("€90k".into());
        store.save_jobs_batch(&[job.clone()]).await.unwrap();
        assert_eq!(store.get_all_jobs(None, None).await.unwrap(), vec![job]);
    }

    #[tokio::test]
    async fn get_all_jobs_is_most_recent_first_with_paging() {
        let store = JobStore::in_memory().await.unwrap();
        store
            .save_jobs_batch(&[
                posting("Old", "indeed", &[], at(1)),
                posting("Newest", "indeed", &[], at(5)),
                posting("Middle", "github", &[], at(3)),
            ])
            .await
            .unwrap();

        let all = store.get_all_jobs(None, None).await.unwrap();
        assert_eq!(titles(&all), vec!["Newest", "Middle", "Old"]);
        let page = store.get_all_jobs(Some(1), Some(1)).await.unwrap();
        assert_eq!(titles(&page), vec!["Middle"]);
    }

    #[tokio::test]
    async fn skill_search_ranks_by_overlap_then_recency() {
        let store = JobStore::in_memory().await.unwrap();
        store
            .save_jobs_batch(&[
                posting("Python Only", "indeed", &["python"], at(2)),
                posting("Python And AWS", "indeed", &["python", "aws"], at(1)),
                posting("AWS Only", "github", &["aws"], at(3)),
                posting("Unrelated", "github", &["rust"], at(4)),
            ])
            .await
            .unwrap();

        let ranked = store.search_jobs_by_skills(&["Python", "aws"], None).await.unwrap();
        assert_eq!(titles(&ranked), vec!["Python And AWS", "AWS Only", "Python Only"]);

        let top = store.search_jobs_by_skills(&["python", "aws"], Some(1)).await.unwrap();
        assert_eq!(titles(&top), vec!["Python And AWS"]);

        let none: [&str; 0] = [];
        assert!(store.search_jobs_by_skills(&none, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn source_filter_count_and_clear() {
        let store = JobStore::in_memory().await.unwrap();
        store
            .save_jobs_batch(&[
                posting("A", "indeed", &[], at(1)),
                posting("B", "github", &[], at(2)),
                posting("C", "indeed", &[], at(3)),
            ])
            .await
            .unwrap();

        let indeed = store.get_jobs_by_source("indeed").await.unwrap();
        assert_eq!(titles(&indeed), vec!["C", "A"]);
        assert_eq!(store.count_jobs().await.unwrap(), 3);
        assert_eq!(store.clear_jobs().await.unwrap(), 3);
        assert_eq!(store.count_jobs().await.unwrap(), 0);
        assert!(store.get_all_jobs(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bad_rows_are_counted_not_fatal() {
        let store = JobStore::in_memory().await.unwrap();
        let mut anonymous = posting("placeholder", "indeed", &[], at(1));
        anonymous.title.clear();
        anonymous.company.clear();

        let report = store
            .save_jobs_batch(&[
                posting("Good One", "indeed", &[], at(1)),
                anonymous,
                posting("Good Two", "indeed", &[], at(2)),
            ])
            .await
            .unwrap();
        assert_eq!(report, BatchSaveReport { inserted: 2, updated: 0, failed: 1 });
        assert_eq!(store.count_jobs().await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_batches_keep_identity_unique() {
        let dir = tempdir().expect("tempdir");
        let store = JobStore::open(dir.path().join(DEFAULT_DB_FILE)).await.unwrap();
        let batch = (0..20)
            .map(|i| posting(&format!("Job {i}"), "indeed", &["python"], at(1)))
            .collect::<Vec<_>>();

        let (a, b) = tokio::join!(store.save_jobs_batch(&batch), store.save_jobs_batch(&batch));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.inserted + b.inserted, 20);
        assert_eq!(a.updated + b.updated, 20);
        assert_eq!(store.count_jobs().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(DEFAULT_DB_FILE);
        {
            let store = JobStore::open(&path).await.unwrap();
            store
                .save_jobs_batch(&[posting("Persistent", "indeed", &[], at(1))])
                .await
                .unwrap();
            store.close().await;
        }
        let reopened = JobStore::open(&path).await.unwrap();
        assert_eq!(reopened.count_jobs().await.unwrap(), 1);
    }
}
