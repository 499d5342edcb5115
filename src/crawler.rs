use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::browser::{ListingPage, Session, SessionError, WaitCondition, NAVIGATION_TIMEOUT};
use crate::config::Config;
use crate::db::{self, JobSink, PgJobSink};
use crate::extractor::extract_listings;
use crate::models::Technology;
use crate::planner::{listing_url, plan_pages};
use crate::rate_limit::RateLimiter;
use crate::transform::normalize_all;

/// Failed-item markup is logged up to this many characters.
const FAILED_MARKUP_LOG_CHARS: usize = 500;

// ============================================================================
// Settings & Report
// ============================================================================

/// Bounded retry for page navigations. Only transient session errors are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-based): `base * 2^(attempt-1)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor)
    }
}

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub base_url: String,
    pub region: String,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub technologies: u32,
    pub pages_planned: u32,
    pub pages_succeeded: u32,
    pub pages_failed: u32,
    pub listings_extracted: u64,
    pub listings_failed: u64,
    pub rows_inserted: u64,
}

struct PageOutcome {
    extracted: usize,
    failed: usize,
    inserted: u64,
}

// ============================================================================
// Run entry point
// ============================================================================

/// One full harvest: open the session, walk every technology and page, close.
///
/// Only session start-up (credential, browser launch) and roster loading abort
/// the run; everything below that is contained and logged. The session is
/// closed on every path, including shutdown.
pub async fn run_once(pool: &PgPool, config: &Config, mut shutdown: watch::Receiver<bool>) -> Result<RunReport> {
    tracing::info!("🚀 Initializing harvest run");
    let session = Session::open(&config.session_settings())
        .await
        .context("harvest run aborted during initialization")?;

    let outcome = harvest_with_session(&session, pool, config, &mut shutdown).await;

    tracing::info!("Closing harvest run");
    session.close().await;

    if let Ok(report) = &outcome {
        tracing::info!(
            "✅ Harvest finished: {} technologies, {}/{} pages ok ({} failed), {} listings ({} failed), {} new rows",
            report.technologies,
            report.pages_succeeded,
            report.pages_planned,
            report.pages_failed,
            report.listings_extracted,
            report.listings_failed,
            report.rows_inserted
        );
    }
    outcome
}

async fn harvest_with_session(
    session: &Session,
    pool: &PgPool,
    config: &Config,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<RunReport> {
    let technologies = db::load_technologies(pool).await?;
    if technologies.is_empty() {
        tracing::warn!("Technology roster is empty, nothing to harvest");
        return Ok(RunReport::default());
    }

    let sink = PgJobSink::new(pool.clone());
    let limiter = RateLimiter::new(config.max_request_delay);
    let settings = config.harvest_settings();

    tokio::select! {
        report = harvest(session, &sink, &technologies, &settings, &limiter) => Ok(report),
        _ = wait_for_shutdown(shutdown) => Err(anyhow::anyhow!("harvest run interrupted by shutdown")),
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            // Sender gone: no shutdown can arrive any more.
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Orchestration
// ============================================================================

/// Walks technologies in roster order and their pages in ascending order.
pub async fn harvest<P, S>(
    page: &P,
    sink: &S,
    technologies: &[Technology],
    settings: &HarvestSettings,
    limiter: &RateLimiter,
) -> RunReport
where
    P: ListingPage + ?Sized,
    S: JobSink + ?Sized,
{
    let mut report = RunReport::default();

    for technology in technologies {
        limiter.pause(&format!("technology {}", technology.name)).await;
        report.technologies += 1;

        let total_pages = plan_pages(page, &settings.base_url, &settings.region, &technology.search_keyword).await;
        tracing::info!("Processing {}: {} pages found", technology.search_keyword, total_pages);
        report.pages_planned += total_pages;

        for page_no in 1..=total_pages {
            limiter
                .pause(&format!("page {}/{} of {}", page_no, total_pages, technology.search_keyword))
                .await;

            match harvest_page(page, sink, technology, page_no, settings).await {
                Ok(outcome) => {
                    tracing::info!(
                        "Page {}/{}: {} succeeded, {} failed, {} new",
                        page_no,
                        total_pages,
                        outcome.extracted,
                        outcome.failed,
                        outcome.inserted
                    );
                    report.pages_succeeded += 1;
                    report.listings_extracted += outcome.extracted as u64;
                    report.listings_failed += outcome.failed as u64;
                    report.rows_inserted += outcome.inserted;
                }
                Err(e) => {
                    tracing::error!(
                        "Error processing page {} for {}: {:#}",
                        page_no,
                        technology.search_keyword,
                        e
                    );
                    report.pages_failed += 1;
                }
            }
        }
    }

    report
}

async fn harvest_page<P, S>(
    page: &P,
    sink: &S,
    technology: &Technology,
    page_no: u32,
    settings: &HarvestSettings,
) -> Result<PageOutcome>
where
    P: ListingPage + ?Sized,
    S: JobSink + ?Sized,
{
    let url = listing_url(&settings.base_url, &settings.region, &technology.search_keyword, Some(page_no));
    navigate_with_retry(page, &url, WaitCondition::Navigated, NAVIGATION_TIMEOUT, &settings.retry).await?;
    let html = page.content().await?;

    let extracted = extract_listings(&html, technology.id);
    for markup in &extracted.failed {
        tracing::debug!(
            "Failed listing markup: {}",
            markup.chars().take(FAILED_MARKUP_LOG_CHARS).collect::<String>()
        );
    }

    let extracted_count = extracted.listings.len();
    let failed = extracted.failed.len();
    let jobs = normalize_all(extracted.listings, Utc::now());
    let inserted = sink.insert_batch(&jobs).await?;

    Ok(PageOutcome {
        extracted: extracted_count,
        failed,
        inserted,
    })
}

/// Navigates with bounded retries and exponential backoff for transient failures.
pub async fn navigate_with_retry<P>(
    page: &P,
    url: &str,
    wait: WaitCondition,
    timeout: Duration,
    policy: &RetryPolicy,
) -> Result<(), SessionError>
where
    P: ListingPage + ?Sized,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match page.navigate(url, wait.clone(), timeout).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    "🔄 Navigation attempt {}/{} to {} failed: {}. Retrying in {:?}",
                    attempt,
                    max_attempts,
                    url,
                    e,
                    backoff
                );
                sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Test doubles
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;

    use crate::browser::{ListingPage, SessionError, WaitCondition};
    use crate::db::JobSink;
    use crate::models::NormalizedJob;
    use crate::planner::TOTAL_COUNT_SELECTOR;

    /// Scripted stand-in for the browser, keyed by (keyword, page).
    #[derive(Default)]
    pub struct FakePage {
        totals: HashMap<String, String>,
        pages: HashMap<(String, u32), String>,
        broken: HashSet<(String, u32)>,
        flaky: Mutex<HashMap<(String, u32), u32>>,
        current: Mutex<Option<(String, u32)>>,
        visits: Mutex<Vec<(String, u32)>>,
        waits: Mutex<Vec<(WaitCondition, Duration)>>,
        element_waits: Mutex<Vec<(String, Duration)>>,
    }

    impl FakePage {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_total(mut self, keyword: &str, indicator: &str) -> Self {
            self.totals.insert(keyword.to_string(), indicator.to_string());
            self
        }

        pub fn with_page(mut self, keyword: &str, page: u32, html: String) -> Self {
            self.pages.insert((keyword.to_string(), page), html);
            self
        }

        /// Navigation to this page always times out.
        pub fn with_broken_page(mut self, keyword: &str, page: u32) -> Self {
            self.broken.insert((keyword.to_string(), page));
            self
        }

        /// Navigation to this page fails `failures` times before succeeding.
        pub fn with_flaky_page(self, keyword: &str, page: u32, failures: u32) -> Self {
            self.flaky.lock().unwrap().insert((keyword.to_string(), page), failures);
            self
        }

        pub fn visits(&self) -> Vec<(String, u32)> {
            self.visits.lock().unwrap().clone()
        }

        /// `(wait, timeout)` of every navigation, in call order.
        pub fn waits(&self) -> Vec<(WaitCondition, Duration)> {
            self.waits.lock().unwrap().clone()
        }

        /// `(selector, timeout)` of every element read, in call order.
        pub fn element_waits(&self) -> Vec<(String, Duration)> {
            self.element_waits.lock().unwrap().clone()
        }

        fn parse_target(url: &str) -> (String, u32) {
            let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
            let mut keyword = String::new();
            let mut page = 1;
            for pair in query.split('&') {
                match pair.split_once('=') {
                    Some(("primary_keyword", v)) => {
                        keyword = urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_default()
                    }
                    Some(("page", v)) => page = v.parse().unwrap_or(1),
                    _ => {}
                }
            }
            (keyword, page)
        }
    }

    #[async_trait]
    impl ListingPage for FakePage {
        async fn navigate(&self, url: &str, wait: WaitCondition, timeout: Duration) -> Result<(), SessionError> {
            let target = Self::parse_target(url);
            self.visits.lock().unwrap().push(target.clone());
            self.waits.lock().unwrap().push((wait, timeout));

            if self.broken.contains(&target) {
                return Err(SessionError::Timeout { what: url.to_string(), timeout });
            }
            if let Some(left) = self.flaky.lock().unwrap().get_mut(&target) {
                if *left > 0 {
                    *left -= 1;
                    return Err(SessionError::Browser(anyhow::anyhow!("connection reset")));
                }
            }

            *self.current.lock().unwrap() = Some(target);
            Ok(())
        }

        async fn element_text(&self, selector: &str, timeout: Duration) -> Result<String, SessionError> {
            self.element_waits.lock().unwrap().push((selector.to_string(), timeout));
            let current = self.current.lock().unwrap().clone();
            current
                .filter(|_| selector == TOTAL_COUNT_SELECTOR)
                .and_then(|(keyword, _)| self.totals.get(&keyword).cloned())
                .ok_or(SessionError::Timeout { what: selector.to_string(), timeout })
        }

        async fn content(&self) -> Result<String, SessionError> {
            let current = self.current.lock().unwrap().clone();
            Ok(current
                .and_then(|target| self.pages.get(&target).cloned())
                .unwrap_or_else(|| "<html><body><main></main></body></html>".to_string()))
        }
    }

    /// In-memory sink with the same skip-on-conflict semantics as Postgres.
    #[derive(Default)]
    pub struct MemorySink {
        rows: Mutex<BTreeMap<String, NormalizedJob>>,
        failing: AtomicBool,
    }

    impl MemorySink {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every insert errors, as if the store were unreachable.
        pub fn failing() -> Self {
            let sink = Self::default();
            sink.failing.store(true, Ordering::SeqCst);
            sink
        }

        pub fn job_ids(&self) -> Vec<String> {
            self.rows.lock().unwrap().keys().cloned().collect()
        }

        pub fn get(&self, job_id: &str) -> Option<NormalizedJob> {
            self.rows.lock().unwrap().get(job_id).cloned()
        }
    }

    #[async_trait]
    impl JobSink for MemorySink {
        async fn insert_batch(&self, jobs: &[NormalizedJob]) -> Result<u64> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("store unavailable");
            }
            let mut rows = self.rows.lock().unwrap();
            let mut inserted = 0;
            for job in jobs {
                if !rows.contains_key(&job.job_id) {
                    rows.insert(job.job_id.clone(), job.clone());
                    inserted += 1;
                }
            }
            Ok(inserted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakePage, MemorySink};
    use super::*;
    use crate::extractor::fixtures::{card, page};
    use crate::models::WorkFormat;

    fn settings() -> HarvestSettings {
        HarvestSettings {
            base_url: "https://site.test".to_string(),
            region: "UKR".to_string(),
            retry: RetryPolicy { max_attempts: 3, base_backoff: Duration::ZERO },
        }
    }

    fn technology(id: i32, keyword: &str) -> Technology {
        Technology { id, name: keyword.to_string(), search_keyword: keyword.to_string() }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy { max_attempts: 4, base_backoff: Duration::from_millis(500) };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_harvest_walks_technologies_then_pages() {
        let fake = FakePage::new()
            .with_total("Rust", "20")
            .with_page("Rust", 1, page(&[card("1", "Rust dev", &["Full Remote"]), card("2", "Rust lead", &[])]))
            .with_page("Rust", 2, page(&[card("3", "Rust intern", &[])]))
            .with_total("Go", "3")
            .with_page("Go", 1, page(&[card("4", "Go dev", &[])]));
        let sink = MemorySink::new();
        let technologies = vec![technology(1, "Rust"), technology(2, "Go")];

        let report = harvest(&fake, &sink, &technologies, &settings(), &RateLimiter::disabled()).await;

        assert_eq!(
            fake.visits(),
            vec![
                ("Rust".to_string(), 1),
                ("Rust".to_string(), 1),
                ("Rust".to_string(), 2),
                ("Go".to_string(), 1),
                ("Go".to_string(), 1),
            ]
        );
        assert_eq!(sink.job_ids(), vec!["1", "2", "3", "4"]);
        assert_eq!(sink.get("1").unwrap().work_format, WorkFormat::Remote);
        assert_eq!(sink.get("2").unwrap().work_format, WorkFormat::Office);
        assert_eq!(sink.get("4").unwrap().technology_id, 2);
        assert_eq!(
            report,
            RunReport {
                technologies: 2,
                pages_planned: 3,
                pages_succeeded: 3,
                pages_failed: 0,
                listings_extracted: 4,
                listings_failed: 0,
                rows_inserted: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_failed_page_does_not_stop_technology() {
        let fake = FakePage::new()
            .with_total("Rust", "45")
            .with_page("Rust", 1, page(&[card("1", "One", &[])]))
            .with_broken_page("Rust", 2)
            .with_page("Rust", 3, page(&[card("3", "Three", &[])]));
        let sink = MemorySink::new();

        let report = harvest(&fake, &sink, &[technology(1, "Rust")], &settings(), &RateLimiter::disabled()).await;

        assert_eq!(sink.job_ids(), vec!["1", "3"]);
        assert_eq!(report.pages_succeeded, 2);
        assert_eq!(report.pages_failed, 1);
    }

    #[tokio::test]
    async fn test_missing_indicator_still_harvests_first_page() {
        let fake = FakePage::new().with_page("Rust", 1, page(&[card("9", "Only", &[])]));
        let sink = MemorySink::new();

        let report = harvest(&fake, &sink, &[technology(1, "Rust")], &settings(), &RateLimiter::disabled()).await;

        assert_eq!(report.pages_planned, 1);
        assert_eq!(sink.job_ids(), vec!["9"]);
    }

    #[tokio::test]
    async fn test_broken_card_is_counted_and_siblings_persisted() {
        let broken = r#"<li><a class="job-item__title-link">No id</a></li>"#.to_string();
        let fake = FakePage::new()
            .with_total("Rust", "3")
            .with_page("Rust", 1, page(&[card("1", "One", &[]), broken, card("3", "Three", &[])]));
        let sink = MemorySink::new();

        let report = harvest(&fake, &sink, &[technology(1, "Rust")], &settings(), &RateLimiter::disabled()).await;

        assert_eq!(sink.job_ids(), vec!["1", "3"]);
        assert_eq!(report.listings_failed, 1);
        assert_eq!(report.pages_failed, 0);
    }

    #[tokio::test]
    async fn test_store_failure_is_page_scoped() {
        let fake = FakePage::new()
            .with_total("Rust", "30")
            .with_page("Rust", 1, page(&[card("1", "One", &[])]))
            .with_page("Rust", 2, page(&[card("2", "Two", &[])]));
        let sink = MemorySink::failing();

        let report = harvest(&fake, &sink, &[technology(1, "Rust")], &settings(), &RateLimiter::disabled()).await;

        assert_eq!(report.pages_failed, 2);
        assert_eq!(fake.visits().len(), 3);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let html = page(&[card("1", "One", &[]), card("2", "Two", &[])]);
        let fake = FakePage::new().with_total("Rust", "2").with_page("Rust", 1, html);
        let sink = MemorySink::new();
        let technologies = [technology(1, "Rust")];

        let first = harvest(&fake, &sink, &technologies, &settings(), &RateLimiter::disabled()).await;
        let second = harvest(&fake, &sink, &technologies, &settings(), &RateLimiter::disabled()).await;

        assert_eq!(first.rows_inserted, 2);
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.listings_extracted, 2);
        assert_eq!(sink.job_ids(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_transient_navigation_failure_is_retried() {
        let fake = FakePage::new()
            .with_total("Rust", "1")
            .with_flaky_page("Rust", 1, 2)
            .with_page("Rust", 1, page(&[card("1", "One", &[])]));
        let url = listing_url("https://site.test", "UKR", "Rust", Some(1));

        navigate_with_retry(&fake, &url, WaitCondition::Navigated, NAVIGATION_TIMEOUT, &settings().retry)
            .await
            .unwrap();
        assert_eq!(fake.visits().len(), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let fake = FakePage::new().with_broken_page("Rust", 1);
        let url = listing_url("https://site.test", "UKR", "Rust", Some(1));

        let err = navigate_with_retry(&fake, &url, WaitCondition::Navigated, NAVIGATION_TIMEOUT, &settings().retry)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
        assert_eq!(fake.visits().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_signal_resolves_wait() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
