//! Session controller: one headless Chrome and one tab for a whole run.
//!
//! The session is an owned value. Callers hand `&Session` to each stage and
//! finish with [`Session::close`]; dropping it also terminates Chrome, so an
//! aborted run cannot leak the browser process.

use std::ffi::OsStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use headless_chrome::protocol::cdp::{Network, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use thiserror::Error;

/// Process configuration key holding the site session id.
pub const CREDENTIAL_KEY: &str = "DJINNI_SESSION_ID";
const SESSION_COOKIE: &str = "sessionid";

/// Bound for full page navigations.
pub const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound for a specific expected element.
pub const ELEMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack on top of the DevTools timeout before the async side gives up.
const CALL_GRACE: Duration = Duration::from_secs(2);

/// Jitter pauses keep the DevTools socket quiet for a while; the default
/// idle timeout would close it mid-run.
const BROWSER_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

const HIDE_WEBDRIVER: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
"#;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} is not set")]
    MissingCredential(&'static str),
    #[error("failed to launch browser: {0}")]
    Launch(anyhow::Error),
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },
    #[error(transparent)]
    Browser(#[from] anyhow::Error),
}

impl SessionError {
    /// Failures worth another attempt within the same run.
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Timeout { .. } | SessionError::Browser(_))
    }
}

/// Readiness signal a navigation waits for.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitCondition {
    /// The page finished loading.
    Navigated,
    /// An element matching the selector is present.
    Selector(String),
}

/// The page operations the harvester needs from a browser.
#[async_trait]
pub trait ListingPage: Send + Sync {
    /// Loads `url` and suspends until `wait` holds or `timeout` elapses.
    async fn navigate(&self, url: &str, wait: WaitCondition, timeout: Duration) -> Result<(), SessionError>;

    /// Text of the first element matching `selector`, waiting at most `timeout` for it.
    async fn element_text(&self, selector: &str, timeout: Duration) -> Result<String, SessionError>;

    /// Serialized DOM of the current page.
    async fn content(&self) -> Result<String, SessionError>;
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub credential: Option<String>,
    pub cookie_domain: String,
    pub headless: bool,
}

pub struct Session {
    browser: Browser,
    tab: Arc<Tab>,
    /// Held by whichever blocking call is currently driving the tab.
    driving: Arc<Mutex<()>>,
}

impl Session {
    /// Validates the credential, launches Chrome and installs the auth cookie.
    ///
    /// The credential check happens before anything is launched or navigated.
    pub async fn open(settings: &SessionSettings) -> Result<Self, SessionError> {
        let credential = settings
            .credential
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or(SessionError::MissingCredential(CREDENTIAL_KEY))?;

        let headless = settings.headless;
        let cookie_domain = settings.cookie_domain.clone();

        let launched = tokio::task::spawn_blocking(move || -> anyhow::Result<(Browser, Arc<Tab>)> {
            let args = vec![
                OsStr::new("--no-sandbox"),
                OsStr::new("--disable-setuid-sandbox"),
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
            ];

            let browser = Browser::new(LaunchOptions {
                headless,
                sandbox: false,
                window_size: Some((1280, 800)),
                idle_browser_timeout: BROWSER_IDLE_TIMEOUT,
                args,
                ..Default::default()
            })?;

            let tab = browser.new_tab()?;
            tab.set_default_timeout(NAVIGATION_TIMEOUT);
            tab.call_method(Page::AddScriptToEvaluateOnNewDocument {
                source: HIDE_WEBDRIVER.to_string(),
                world_name: None,
                include_command_line_api: None,
                run_immediately: None,
            })?;

            Ok((browser, tab))
        })
        .await
        .map_err(|e| SessionError::Launch(anyhow::anyhow!("launch task failed: {}", e)))?
        .map_err(SessionError::Launch)?;

        let (browser, tab) = launched;
        let session = Session {
            browser,
            tab,
            driving: Arc::new(Mutex::new(())),
        };
        session.inject_credential(credential, cookie_domain).await?;

        tracing::info!("🌐 Browser session ready");
        Ok(session)
    }

    async fn inject_credential(&self, credential: String, domain: String) -> Result<(), SessionError> {
        self.blocking("session cookie".to_string(), ELEMENT_TIMEOUT, move |tab| {
            tab.call_method(Network::SetCookie {
                name: SESSION_COOKIE.to_string(),
                value: credential,
                url: None,
                domain: Some(domain),
                path: Some("/".to_string()),
                secure: Some(true),
                http_only: Some(true),
                same_site: None,
                expires: None,
                priority: None,
                same_party: None,
                source_scheme: None,
                source_port: None,
                partition_key: None,
            })?;
            Ok(())
        })
        .await
    }

    /// Single teardown step: closes the tab, then terminates Chrome.
    pub async fn close(self) {
        let Session { browser, tab, driving } = self;
        let closed = tokio::task::spawn_blocking(move || {
            let _driving = driving.lock().unwrap_or_else(PoisonError::into_inner);
            let result = tab.close(false);
            drop(browser);
            result
        })
        .await;

        match closed {
            Ok(Ok(_)) => tracing::info!("Browser session closed"),
            Ok(Err(e)) => tracing::warn!("Tab close failed, browser terminated anyway: {}", e),
            Err(e) => tracing::warn!("Browser close task failed: {}", e),
        }
    }

    async fn blocking<T, F>(&self, what: String, timeout: Duration, op: F) -> Result<T, SessionError>
    where
        T: Send + 'static,
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
    {
        run_bounded(
            Arc::clone(&self.tab),
            Arc::clone(&self.driving),
            what,
            timeout,
            CALL_GRACE,
            op,
        )
        .await
    }
}

/// One wall-clock budget shared by every step of a DevTools call.
#[derive(Debug, Clone, Copy)]
struct Deadline(Instant);

impl Deadline {
    fn after(timeout: Duration) -> Self {
        Deadline(Instant::now() + timeout)
    }

    /// Budget left for `step`, or an error once it is spent.
    fn remaining(&self, step: &str) -> anyhow::Result<Duration> {
        let left = self.0.saturating_duration_since(Instant::now());
        if left.is_zero() {
            anyhow::bail!("no time left for {}", step);
        }
        Ok(left)
    }
}

/// Runs `op` on the blocking pool, bounded by `timeout` plus `grace`.
///
/// The op holds `driving` for as long as it runs, so a call issued after an
/// earlier one timed out waits for that one to let go of the resource. A call
/// that errors after the bound has elapsed is reported as a timeout.
async fn run_bounded<R, T, F>(
    resource: Arc<R>,
    driving: Arc<Mutex<()>>,
    what: String,
    timeout: Duration,
    grace: Duration,
    op: F,
) -> Result<T, SessionError>
where
    R: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&R) -> anyhow::Result<T> + Send + 'static,
{
    let started = Instant::now();
    let task = tokio::task::spawn_blocking(move || {
        let _driving = driving.lock().unwrap_or_else(PoisonError::into_inner);
        op(&resource)
    });

    match tokio::time::timeout(timeout + grace, task).await {
        Err(_) => Err(SessionError::Timeout { what, timeout }),
        Ok(Err(join)) => Err(SessionError::Browser(anyhow::anyhow!("browser task failed: {}", join))),
        Ok(Ok(Err(e))) if started.elapsed() >= timeout => {
            tracing::debug!("{} failed at the deadline: {}", what, e);
            Err(SessionError::Timeout { what, timeout })
        }
        Ok(Ok(result)) => result.map_err(SessionError::Browser),
    }
}

#[async_trait]
impl ListingPage for Session {
    async fn navigate(&self, url: &str, wait: WaitCondition, timeout: Duration) -> Result<(), SessionError> {
        let target = url.to_string();
        let deadline = Deadline::after(timeout);
        self.blocking(format!("navigation to {}", url), timeout, move |tab| {
            tab.set_default_timeout(deadline.remaining("navigation")?);
            tab.navigate_to(&target)?;
            tab.set_default_timeout(deadline.remaining("page load")?);
            tab.wait_until_navigated()?;
            if let WaitCondition::Selector(selector) = wait {
                tab.wait_for_element_with_custom_timeout(&selector, deadline.remaining(&selector)?)?;
            }
            Ok(())
        })
        .await
    }

    async fn element_text(&self, selector: &str, timeout: Duration) -> Result<String, SessionError> {
        let selector = selector.to_string();
        let deadline = Deadline::after(timeout);
        self.blocking(format!("element {}", selector), timeout, move |tab| {
            let element = tab.wait_for_element_with_custom_timeout(&selector, deadline.remaining(&selector)?)?;
            element.get_inner_text()
        })
        .await
    }

    async fn content(&self) -> Result<String, SessionError> {
        self.blocking("page content".to_string(), NAVIGATION_TIMEOUT, |tab| tab.get_content())
            .await
    }
}
