use anyhow::{anyhow, bail, Context, Result};
use chrono_tz::Tz;
use std::str::FromStr;
use std::time::Duration;

use crate::browser::{SessionSettings, CREDENTIAL_KEY};
use crate::crawler::{HarvestSettings, RetryPolicy};

pub const DEFAULT_SCHEDULE: &str = "0 0 15 * * *";
pub const DEFAULT_TIMEZONE: &str = "Europe/Kyiv";

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Checked when a run starts, not here, so the query API can serve without it.
    pub session_credential: Option<String>,
    pub port: u16,
    pub frontend_url: String,
    pub scrape_on_startup: bool,
    pub scrape_schedule: String,
    /// Zone the schedule's wall-clock fields are read in.
    pub scrape_timezone: Tz,
    pub site_base_url: String,
    pub site_region: String,
    pub session_cookie_domain: String,
    pub max_request_delay: Duration,
    pub nav_max_attempts: u32,
    pub nav_backoff: Duration,
    pub headless: bool,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let database_url = get("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;

        let timezone = text("SCRAPE_TIMEZONE", DEFAULT_TIMEZONE);
        let scrape_timezone = timezone
            .parse::<Tz>()
            .map_err(|e| anyhow!("SCRAPE_TIMEZONE has an invalid value '{}': {}", timezone, e))?;

        let nav_max_attempts: u32 = number(&get, "NAV_MAX_ATTEMPTS", 3)?;
        if nav_max_attempts == 0 {
            bail!("NAV_MAX_ATTEMPTS must be at least 1");
        }

        Ok(Config {
            database_url,
            session_credential: get(CREDENTIAL_KEY),
            port: number(&get, "PORT", 3001)?,
            frontend_url: text("FRONTEND_URL", "http://localhost:3000"),
            scrape_on_startup: flag(&get, "SCRAPE_ON_STARTUP", false)?,
            scrape_schedule: text("SCRAPE_SCHEDULE", DEFAULT_SCHEDULE),
            scrape_timezone,
            site_base_url: text("SITE_BASE_URL", "https://djinni.co"),
            site_region: text("SITE_REGION", "UKR"),
            session_cookie_domain: text("SESSION_COOKIE_DOMAIN", ".djinni.co"),
            max_request_delay: Duration::from_millis(number(&get, "MAX_REQUEST_DELAY_MS", 15_000)?),
            nav_max_attempts,
            nav_backoff: Duration::from_millis(number(&get, "NAV_BACKOFF_MS", 2_000)?),
            headless: flag(&get, "HEADLESS", true)?,
            db_max_connections: number(&get, "DB_MAX_CONNECTIONS", 5)?,
        })
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            credential: self.session_credential.clone(),
            cookie_domain: self.session_cookie_domain.clone(),
            headless: self.headless,
        }
    }

    pub fn harvest_settings(&self) -> HarvestSettings {
        HarvestSettings {
            base_url: self.site_base_url.clone(),
            region: self.site_region.clone(),
            retry: RetryPolicy {
                max_attempts: self.nav_max_attempts,
                base_backoff: self.nav_backoff,
            },
        }
    }
}

fn number<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

fn flag<G>(get: &G, key: &str, default: bool) -> Result<bool>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => bail!("{} has an invalid boolean value '{}'", key, raw),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("DATABASE_URL", "postgres://localhost/jobs")]).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.scrape_schedule, DEFAULT_SCHEDULE);
        assert_eq!(config.scrape_timezone, chrono_tz::Europe::Kyiv);
        assert_eq!(config.max_request_delay, Duration::from_millis(15_000));
        assert_eq!(config.nav_max_attempts, 3);
        assert!(config.headless);
        assert!(!config.scrape_on_startup);
        assert!(config.session_credential.is_none());
    }

    #[test]
    fn test_database_url_is_required() {
        let err = config(&[]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_overrides_flow_into_settings() {
        let config = config(&[
            ("DATABASE_URL", "postgres://localhost/jobs"),
            ("DJINNI_SESSION_ID", "abc123"),
            ("SITE_BASE_URL", "https://site.test"),
            ("NAV_MAX_ATTEMPTS", "5"),
            ("NAV_BACKOFF_MS", "100"),
            ("HEADLESS", "no"),
            ("SCRAPE_ON_STARTUP", "YES"),
        ])
        .unwrap();

        let session = config.session_settings();
        assert_eq!(session.credential.as_deref(), Some("abc123"));
        assert!(!session.headless);
        assert!(config.scrape_on_startup);

        let harvest = config.harvest_settings();
        assert_eq!(harvest.base_url, "https://site.test");
        assert_eq!(harvest.retry.max_attempts, 5);
        assert_eq!(harvest.retry.base_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_malformed_values_name_the_key() {
        let err = config(&[("DATABASE_URL", "x"), ("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));

        let err = config(&[("DATABASE_URL", "x"), ("HEADLESS", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("HEADLESS"));

        let err = config(&[("DATABASE_URL", "x"), ("SCRAPE_TIMEZONE", "Mars/Olympus")]).unwrap_err();
        assert!(err.to_string().contains("SCRAPE_TIMEZONE"));

        let err = config(&[("DATABASE_URL", "x"), ("NAV_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("NAV_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_blank_credential_is_absent() {
        let config = config(&[("DATABASE_URL", "x"), ("DJINNI_SESSION_ID", "   ")]).unwrap();
        assert!(config.session_credential.is_none());
    }
}
