//! # Job Run Repository
//!
//! Remembers when each scheduled job last ran, so a restart inside the
//! interval does not run the job again.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::DbResult;

/// Repository for scheduled job bookkeeping.
#[derive(Debug, Clone)]
pub struct JobRunRepository {
    pool: SqlitePool,
}

impl JobRunRepository {
    /// Creates a new JobRunRepository.
    pub fn new(pool: SqlitePool) -> Self {
        JobRunRepository { pool }
    }

    /// When `job_name` last completed, if ever.
    pub async fn last_run(&self, job_name: &str) -> DbResult<Option<DateTime<Utc>>> {
        let at: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_run_at FROM job_runs WHERE job_name = ?1")
                .bind(job_name)
                .fetch_optional(&self.pool)
                .await?;

        Ok(at)
    }

    /// Records a completed run.
    pub async fn record_run(&self, job_name: &str, at: DateTime<Utc>, summary: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (job_name, last_run_at, last_summary)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(job_name) DO UPDATE SET
                last_run_at = excluded.last_run_at,
                last_summary = excluded.last_summary
            "#,
        )
        .bind(job_name)
        .bind(at)
        .bind(summary)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_record_and_read_back() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.job_runs().last_run("stale_sale_sweep").await.unwrap().is_none());

        let first = Utc::now() - chrono::Duration::hours(6);
        db.job_runs().record_run("stale_sale_sweep", first, "cancelled=0").await.unwrap();
        let second = Utc::now();
        db.job_runs().record_run("stale_sale_sweep", second, "cancelled=2").await.unwrap();

        let last = db.job_runs().last_run("stale_sale_sweep").await.unwrap().unwrap();
        assert_eq!(last.timestamp(), second.timestamp());
    }
}
