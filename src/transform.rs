//! Maps scraped listings onto the persisted job schema.
//!
//! Pure: no I/O, the clock is passed in. Malformed input yields a
//! best-effort record rather than an error.

use chrono::{DateTime, Utc};

use crate::models::{EnglishLevel, NormalizedJob, RawListing, WorkFormat};
use crate::parsing::{first_integer, parse_experience_years, parse_posted_at};

pub fn normalize(raw: RawListing, now: DateTime<Utc>) -> NormalizedJob {
    let RawListing {
        site_job_id,
        position,
        company,
        stats,
        workplace,
        description,
        technology_id,
    } = raw;

    NormalizedJob {
        job_id: site_job_id,
        title: position.title,
        salary: non_empty(position.salary),
        company: company.name,
        company_logo: non_empty(company.logo),
        work_format: if workplace.remote { WorkFormat::Remote } else { WorkFormat::Office },
        location: workplace.location,
        description,
        views: first_integer(&stats.views_text),
        applications: first_integer(&stats.applications_text),
        posted_at: parse_posted_at(&stats.posted_at_text, now),
        experience_years: parse_experience_years(&workplace.experience_years_text),
        english_level: EnglishLevel::from_text(&workplace.english_level_text),
        technology_id,
    }
}

/// Normalizes a whole page with a single clock reading.
pub fn normalize_all(listings: Vec<RawListing>, now: DateTime<Utc>) -> Vec<NormalizedJob> {
    listings.into_iter().map(|raw| normalize(raw, now)).collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
