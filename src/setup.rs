//! Wipe-and-reseed step that runs before every triggered harvest.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Built-in technology roster as `(name, search keyword)`, in harvest order.
pub const TECHNOLOGIES: &[(&str, &str)] = &[
    ("JavaScript", "JavaScript"),
    ("Python", "Python"),
    ("Java", "Java"),
    (".NET", ".NET"),
    ("PHP", "PHP"),
    ("Node.js", "Node.js"),
    ("Go", "Golang"),
    ("Ruby", "Ruby"),
    ("Rust", "Rust"),
    ("Scala", "Scala"),
    ("iOS", "iOS"),
    ("Android", "Android"),
    ("Flutter", "Flutter"),
    ("React Native", "React Native"),
    ("C++", "C++"),
    ("DevOps", "DevOps"),
    ("QA", "QA"),
    ("Data Science", "Data Science"),
];

/// Deletes every stored job, restarts the job id sequence and upserts the roster.
///
/// Runs in a single transaction, so a failure leaves the previous data intact.
pub async fn reset_and_seed(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await.context("failed to open setup transaction")?;

    tracing::info!("Cleaning up existing jobs...");
    sqlx::query("DELETE FROM jobs").execute(&mut *tx).await?;
    sqlx::query("ALTER SEQUENCE jobs_id_seq RESTART WITH 1")
        .execute(&mut *tx)
        .await?;

    tracing::info!("Checking technologies...");
    for (name, keyword) in TECHNOLOGIES {
        sqlx::query(
            "INSERT INTO technologies (name, search_keyword) VALUES ($1, $2) \
             ON CONFLICT (name) DO UPDATE SET search_keyword = EXCLUDED.search_keyword",
        )
        .bind(*name)
        .bind(*keyword)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert technology {}", name))?;
    }

    tx.commit().await.context("failed to commit setup transaction")?;
    tracing::info!("Database setup completed successfully");
    Ok(())
}
