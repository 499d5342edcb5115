//! Run triggers: the daily cron job and the optional one-shot startup run.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::config::Config;
use crate::crawler;
use crate::setup;

/// Owns everything a triggered run needs. Cheap to clone.
#[derive(Clone)]
pub struct Harvester {
    pool: PgPool,
    config: Arc<Config>,
    shutdown: watch::Receiver<bool>,
    run_lock: Arc<Mutex<()>>,
}

impl Harvester {
    pub fn new(pool: PgPool, config: Arc<Config>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            config,
            shutdown,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Reseeds and runs one harvest. Failures are logged, never returned.
    ///
    /// Only one run holds the browser at a time; a trigger that arrives while
    /// a run is in progress is skipped.
    pub async fn trigger(&self, reason: &str) {
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::warn!("Skipping {} trigger: a harvest run is already in progress", reason);
            return;
        };
        if *self.shutdown.borrow() {
            tracing::info!("Skipping {} trigger: shutting down", reason);
            return;
        }

        tracing::info!("Starting {} harvest", reason);
        if let Err(e) = setup::reset_and_seed(&self.pool).await {
            tracing::error!("Database setup failed, skipping {} harvest: {:#}", reason, e);
            return;
        }

        if let Err(e) = crawler::run_once(&self.pool, &self.config, self.shutdown.clone()).await {
            tracing::error!("{} harvest failed: {:#}", reason, e);
        }
    }

    /// Resolves once no run holds the browser.
    pub async fn wait_idle(&self) {
        let _idle = self.run_lock.lock().await;
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }
}

/// Daily harvest job. The cron fields are wall-clock time in the configured zone.
pub fn harvest_job(harvester: &Harvester) -> Result<Job> {
    let scheduled = harvester.clone();
    let job = Job::new_async_tz(
        harvester.config.scrape_schedule.as_str(),
        harvester.config.scrape_timezone,
        move |_uuid, _lock| {
            let harvester = scheduled.clone();
            Box::pin(async move {
                harvester.trigger("scheduled").await;
            })
        },
    )?;
    Ok(job)
}

/// Registers the daily harvest and, when configured, spawns a startup run.
pub async fn start_scheduler(harvester: Harvester) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    scheduler.add(harvest_job(&harvester)?).await?;
    scheduler.start().await?;
    tracing::info!(
        "Scheduled harvest registered ({} {})",
        harvester.config.scrape_schedule,
        harvester.config.scrape_timezone
    );

    if harvester.config.scrape_on_startup {
        tokio::spawn(async move {
            harvester.trigger("startup").await;
        });
    }

    Ok(scheduler)
}
