use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};

use crate::models::{NormalizedJob, Technology};

pub async fn init_db(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS technologies (
            id SERIAL PRIMARY KEY,
            name VARCHAR NOT NULL UNIQUE,
            search_keyword VARCHAR NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create technologies table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id SERIAL PRIMARY KEY,
            job_id VARCHAR NOT NULL UNIQUE,
            title TEXT NOT NULL,
            salary TEXT,
            company TEXT NOT NULL,
            company_logo TEXT,
            work_format VARCHAR NOT NULL,
            location TEXT NOT NULL,
            description TEXT NOT NULL,
            views INTEGER NOT NULL DEFAULT 0 CHECK (views >= 0),
            applications INTEGER NOT NULL DEFAULT 0 CHECK (applications >= 0),
            posted_at TIMESTAMPTZ NOT NULL,
            experience_years DOUBLE PRECISION NOT NULL,
            english_level VARCHAR NOT NULL,
            technology_id INTEGER NOT NULL REFERENCES technologies(id),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create jobs table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS jobs_technology_id_idx ON jobs (technology_id);")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS jobs_posted_at_idx ON jobs (posted_at);")
        .execute(pool)
        .await?;

    Ok(())
}

/// The technology roster in seeding order.
pub async fn load_technologies(pool: &PgPool) -> Result<Vec<Technology>> {
    let technologies = sqlx::query_as::<_, Technology>(
        "SELECT id, name, search_keyword FROM technologies ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .context("failed to load technologies")?;
    Ok(technologies)
}

/// Destination for normalized jobs.
///
/// Inserting a job whose `job_id` is already stored is a silent no-op;
/// stored rows are never updated.
#[async_trait]
pub trait JobSink: Send + Sync {
    /// Stores a batch and returns how many rows were new.
    async fn insert_batch(&self, jobs: &[NormalizedJob]) -> Result<u64>;
}

pub struct PgJobSink {
    pool: PgPool,
}

impl PgJobSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobSink for PgJobSink {
    async fn insert_batch(&self, jobs: &[NormalizedJob]) -> Result<u64> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO jobs (job_id, title, salary, company, company_logo, work_format, location, \
             description, views, applications, posted_at, experience_years, english_level, technology_id) ",
        );
        query.push_values(jobs, |mut row, job| {
            row.push_bind(job.job_id.clone())
                .push_bind(job.title.clone())
                .push_bind(job.salary.clone())
                .push_bind(job.company.clone())
                .push_bind(job.company_logo.clone())
                .push_bind(job.work_format.as_str())
                .push_bind(job.location.clone())
                .push_bind(job.description.clone())
                .push_bind(job.views)
                .push_bind(job.applications)
                .push_bind(job.posted_at)
                .push_bind(job.experience_years)
                .push_bind(job.english_level.as_str())
                .push_bind(job.technology_id);
        });
        query.push(" ON CONFLICT (job_id) DO NOTHING");

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .context("bulk insert of jobs failed")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnglishLevel, WorkFormat};
    use chrono::Utc;
    use sqlx::postgres::PgPoolOptions;

    fn job(job_id: &str, technology_id: i32) -> NormalizedJob {
        NormalizedJob {
            job_id: job_id.to_string(),
            title: "Backend Engineer".to_string(),
            salary: None,
            company: "Acme".to_string(),
            company_logo: None,
            work_format: WorkFormat::Office,
            location: "Kyiv".to_string(),
            description: "Text".to_string(),
            views: 10,
            applications: 2,
            posted_at: Utc::now(),
            experience_years: 2.0,
            english_level: EnglishLevel::Intermediate,
            technology_id,
        }
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL pointing at a disposable Postgres"]
    async fn test_pg_insert_is_idempotent() {
        dotenv::dotenv().ok();
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPoolOptions::new().max_connections(1).connect(&url).await.unwrap();
        init_db(&pool).await.unwrap();

        let technology_id: i32 = sqlx::query_scalar(
            "INSERT INTO technologies (name, search_keyword) VALUES ('SinkTest', 'SinkTest') \
             ON CONFLICT (name) DO UPDATE SET search_keyword = EXCLUDED.search_keyword RETURNING id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        let batch = vec![job("sink-test-1", technology_id), job("sink-test-2", technology_id)];
        sqlx::query("DELETE FROM jobs WHERE job_id LIKE 'sink-test-%'")
            .execute(&pool)
            .await
            .unwrap();

        let sink = PgJobSink::new(pool.clone());
        assert_eq!(sink.insert_batch(&batch).await.unwrap(), 2);
        assert_eq!(sink.insert_batch(&batch).await.unwrap(), 0);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE job_id LIKE 'sink-test-%'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_empty_batch_skips_the_store() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://unused@localhost/unused")
            .unwrap();
        let sink = PgJobSink::new(pool);
        assert_eq!(sink.insert_batch(&[]).await.unwrap(), 0);
    }
}
