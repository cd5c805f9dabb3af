use super::{JobOrder, JobQuery, Store};
use crate::error::{Error, Result};
use crate::model::{
    Batch, BatchOutcome, FailureRecord, Job, JobStatus, ManualEntry, ProviderProfile, SelectorAudit,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::path::Path;
use std::str::FromStr;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        provider TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        completed_at INTEGER,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_provider_status ON jobs (provider, status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at)",
    "CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        created_at INTEGER NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0,
        failed INTEGER NOT NULL DEFAULT 0,
        cancelled INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS providers (
        name TEXT PRIMARY KEY,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS selector_updates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider TEXT NOT NULL,
        at INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider TEXT NOT NULL,
        at INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS manual_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        queued_at INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
];

/// Document-style store: every record is kept as a JSON body, with the
/// columns queries filter on pulled out next to it.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database. Pinned to a single connection that is
    /// never recycled, since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode<T: DeserializeOwned>(row: &SqliteRow) -> Result<T> {
    let body: String = row.try_get("body")?;
    Ok(serde_json::from_str(&body)?)
}

fn push_job_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &JobQuery) {
    if let Some(status) = query.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(provider) = &query.provider {
        qb.push(" AND provider = ").push_bind(provider.clone());
    }
    if let Some(since) = query.created_since {
        qb.push(" AND created_at >= ").push_bind(since.timestamp_millis());
    }
    if let Some(since) = query.completed_since {
        qb.push(" AND completed_at >= ").push_bind(since.timestamp_millis());
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, provider, status, created_at, completed_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(job.id.as_str())
        .bind(job.provider.as_str())
        .bind(job.status.as_str())
        .bind(job.created_at.timestamp_millis())
        .bind(job.completed_at.map(|t| t.timestamp_millis()))
        .bind(serde_json::to_string(job)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn replace_job_if(&self, job: &Job, expected: JobStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = ?1, completed_at = ?2, body = ?3
             WHERE id = ?4 AND status = ?5",
        )
        .bind(job.status.as_str())
        .bind(job.completed_at.map(|t| t.timestamp_millis()))
        .bind(serde_json::to_string(job)?)
        .bind(job.id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT body FROM jobs WHERE 1 = 1");
        push_job_filters(&mut qb, query);
        match query.order {
            JobOrder::CreatedDesc => {
                qb.push(" ORDER BY created_at DESC");
            }
            JobOrder::CompletedDesc => {
                qb.push(" ORDER BY completed_at DESC");
            }
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }

        let mut jobs = Vec::new();
        let mut rows = qb.build().fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            jobs.push(decode(&row)?);
        }
        Ok(jobs)
    }

    async fn count_jobs(&self, query: &JobQuery) -> Result<u64> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) AS n FROM jobs WHERE 1 = 1");
        push_job_filters(&mut qb, query);
        let row = qb.build().fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u64)
    }

    async fn insert_batch(&self, batch: &Batch, jobs: &[Job]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO batches (id, created_at, completed, failed, cancelled, body) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(batch.id.as_str())
        .bind(batch.created_at.timestamp_millis())
        .bind(batch.progress.completed as i64)
        .bind(batch.progress.failed as i64)
        .bind(batch.progress.cancelled as i64)
        .bind(serde_json::to_string(batch)?)
        .execute(&mut *tx)
        .await?;

        for job in jobs {
            sqlx::query(
                "INSERT INTO jobs (id, provider, status, created_at, completed_at, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(job.id.as_str())
            .bind(job.provider.as_str())
            .bind(job.status.as_str())
            .bind(job.created_at.timestamp_millis())
            .bind(job.completed_at.map(|t| t.timestamp_millis()))
            .bind(serde_json::to_string(job)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_batch(&self, id: &str) -> Result<Option<Batch>> {
        let row = sqlx::query("SELECT completed, failed, cancelled, body FROM batches WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut batch: Batch = decode(&row)?;
        batch.progress.completed = row.try_get::<i64, _>("completed")? as u64;
        batch.progress.failed = row.try_get::<i64, _>("failed")? as u64;
        batch.progress.cancelled = row.try_get::<i64, _>("cancelled")? as u64;
        Ok(Some(batch))
    }

    async fn list_batches(&self) -> Result<Vec<Batch>> {
        let rows = sqlx::query("SELECT completed, failed, cancelled, body FROM batches ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let mut batch: Batch = decode(row)?;
                batch.progress.completed = row.try_get::<i64, _>("completed")? as u64;
                batch.progress.failed = row.try_get::<i64, _>("failed")? as u64;
                batch.progress.cancelled = row.try_get::<i64, _>("cancelled")? as u64;
                Ok(batch)
            })
            .collect()
    }

    async fn record_batch_outcome(&self, id: &str, outcome: BatchOutcome) -> Result<()> {
        let sql = match outcome {
            BatchOutcome::Completed => "UPDATE batches SET completed = completed + 1 WHERE id = ?1",
            BatchOutcome::Failed => "UPDATE batches SET failed = failed + 1 WHERE id = ?1",
            BatchOutcome::Cancelled => "UPDATE batches SET cancelled = cancelled + 1 WHERE id = ?1",
        };
        let result = sqlx::query(sql).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(Error::BatchNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn seed_provider(&self, profile: &ProviderProfile) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO providers (name, body) VALUES (?1, ?2)")
            .bind(profile.name.as_str())
            .bind(serde_json::to_string(profile)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_provider(&self, name: &str) -> Result<Option<ProviderProfile>> {
        let row = sqlx::query("SELECT body FROM providers WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode).transpose()
    }

    async fn list_providers(&self) -> Result<Vec<ProviderProfile>> {
        let rows = sqlx::query("SELECT body FROM providers ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode).collect()
    }

    async fn update_selectors(&self, audit: &SelectorAudit) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM providers WHERE name = ?1")
            .bind(audit.provider.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let mut profile: ProviderProfile = decode(&row)?;
        profile.selectors = audit.selectors.clone();
        profile.updated_at = audit.at;
        profile.selector_update_reason = Some(audit.reason.clone());

        sqlx::query("UPDATE providers SET body = ?1 WHERE name = ?2")
            .bind(serde_json::to_string(&profile)?)
            .bind(audit.provider.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO selector_updates (provider, at, body) VALUES (?1, ?2, ?3)")
            .bind(audit.provider.as_str())
            .bind(audit.at.timestamp_millis())
            .bind(serde_json::to_string(audit)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn selector_history(&self, provider: &str) -> Result<Vec<SelectorAudit>> {
        let rows = sqlx::query("SELECT body FROM selector_updates WHERE provider = ?1 ORDER BY id")
            .bind(provider)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode).collect()
    }

    async fn append_failure(&self, record: &FailureRecord) -> Result<()> {
        sqlx::query("INSERT INTO failures (provider, at, body) VALUES (?1, ?2, ?3)")
            .bind(record.provider.as_str())
            .bind(record.at.timestamp_millis())
            .bind(serde_json::to_string(record)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn failures(&self, provider: &str) -> Result<Vec<FailureRecord>> {
        let rows = sqlx::query("SELECT body FROM failures WHERE provider = ?1 ORDER BY id")
            .bind(provider)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode).collect()
    }

    async fn insert_manual(&self, entry: &ManualEntry) -> Result<()> {
        sqlx::query("INSERT INTO manual_queue (job_id, provider, queued_at, body) VALUES (?1, ?2, ?3, ?4)")
            .bind(entry.job_id.as_str())
            .bind(entry.provider.as_str())
            .bind(entry.queued_at.timestamp_millis())
            .bind(serde_json::to_string(entry)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn manual_queue(&self) -> Result<Vec<ManualEntry>> {
        let rows = sqlx::query("SELECT body FROM manual_queue ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    #[tokio::test]
    async fn jobs_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        let job = Job::new("a lighthouse at dusk", "ImageFX", 3, Utc::now());
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.insert_job(&job).await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::open(&path).await.unwrap();
        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
    }

    #[tokio::test]
    async fn compare_and_set_guards_status() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut job = Job::new("p", "ImageFX", 3, Utc::now());
        store.insert_job(&job).await.unwrap();

        job.start().unwrap();
        assert!(store.replace_job_if(&job, JobStatus::Queued).await.unwrap());
        // A second writer still believing the job is queued loses.
        assert!(!store.replace_job_if(&job, JobStatus::Queued).await.unwrap());

        job.fail("boom", Utc::now()).unwrap();
        assert!(store.replace_job_if(&job, JobStatus::Processing).await.unwrap());

        let failed = store
            .list_jobs(&JobQuery::new().status(JobStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn completed_window_query() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        for age_hours in [1, 2, 30] {
            let mut job = Job::new("p", "ImageFX", 3, now - Duration::hours(age_hours + 1));
            job.start().unwrap();
            job.complete(
                crate::model::JobResult {
                    images: vec![],
                    processing_time_secs: 1.0,
                    provider_response: None,
                },
                now - Duration::hours(age_hours),
            )
            .unwrap();
            store.insert_job(&job).await.unwrap();
        }

        let query = JobQuery::new()
            .provider("ImageFX")
            .status(JobStatus::Completed)
            .completed_since(now - Duration::hours(24))
            .newest_completed_first()
            .limit(50);
        let jobs = store.list_jobs(&query).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].completed_at > jobs[1].completed_at);
        assert_eq!(store.count_jobs(&query).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn batch_counters_increment() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        let mut batch = Batch::new("set", vec!["a".into()], vec!["x".into(), "y".into(), "z".into()], now);
        let jobs: Vec<Job> = batch
            .providers
            .iter()
            .map(|p| Job::new("a", p.as_str(), 2, now).with_metadata("batch_id", batch.id.clone()))
            .collect();
        batch.jobs = jobs.iter().map(|j| j.id.clone()).collect();
        store.insert_batch(&batch, &jobs).await.unwrap();

        store.record_batch_outcome(&batch.id, BatchOutcome::Completed).await.unwrap();
        store.record_batch_outcome(&batch.id, BatchOutcome::Failed).await.unwrap();
        assert!(!store.get_batch(&batch.id).await.unwrap().unwrap().progress.is_finished());
        store.record_batch_outcome(&batch.id, BatchOutcome::Cancelled).await.unwrap();

        let loaded = store.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.progress.completed, 1);
        assert_eq!(loaded.progress.failed, 1);
        assert_eq!(loaded.progress.cancelled, 1);
        assert_eq!(loaded.progress.total, 3);
        assert!(loaded.progress.is_finished());
        assert_eq!(store.list_batches().await.unwrap()[0].progress, loaded.progress);
        assert!(matches!(
            store.record_batch_outcome("missing", BatchOutcome::Failed).await,
            Err(Error::BatchNotFound(_))
        ));
    }

    #[tokio::test]
    async fn selector_update_is_audited() {
        let store = SqliteStore::in_memory().await.unwrap();
        let profile = ProviderProfile::new("ImageFX", Utc::now()).with_selector("prompt_input", "#old");
        assert!(store.seed_provider(&profile).await.unwrap());
        assert!(!store.seed_provider(&profile).await.unwrap());

        let mut selectors = profile.selectors.clone();
        selectors.insert("prompt_input".into(), "#new".into());
        let audit = SelectorAudit {
            provider: "ImageFX".into(),
            selectors,
            reason: "layout change".into(),
            at: Utc::now(),
        };
        assert!(store.update_selectors(&audit).await.unwrap());

        let loaded = store.get_provider("ImageFX").await.unwrap().unwrap();
        assert_eq!(loaded.selectors["prompt_input"], "#new");
        assert_eq!(loaded.selector_update_reason.as_deref(), Some("layout change"));
        assert_eq!(store.selector_history("ImageFX").await.unwrap().len(), 1);
    }
}
