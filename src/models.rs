//! Domain records shared by the harvester, the sink and the query API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

/// Skill tag paired with the keyword the listing site searches by.
/// Owned by the seeding routine; the harvester only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Technology {
    pub id: i32,
    pub name: String,
    pub search_keyword: String,
}

// ============================================================================
// Raw (as-scraped) listing
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Position {
    pub title: String,
    pub salary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Company {
    pub name: String,
    pub logo: Option<String>,
}

/// Counters and date exactly as printed on the listing card.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Stats {
    pub views_text: String,
    pub applications_text: String,
    pub posted_at_text: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workplace {
    pub remote: bool,
    pub location: String,
    pub experience_years_text: String,
    pub english_level_text: String,
}

/// One listing card as extracted from a page. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawListing {
    pub site_job_id: String,
    pub position: Position,
    pub company: Company,
    pub stats: Stats,
    pub workplace: Workplace,
    pub description: String,
    pub technology_id: i32,
}

// ============================================================================
// Normalized (persisted) job
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum WorkFormat {
    Remote,
    Office,
    /// Accepted by the store and the API; the extractor has no signal for it.
    Hybrid,
}

impl WorkFormat {
    pub const ALL: [WorkFormat; 3] = [WorkFormat::Remote, WorkFormat::Office, WorkFormat::Hybrid];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkFormat::Remote => "Remote",
            WorkFormat::Office => "Office",
            WorkFormat::Hybrid => "Hybrid",
        }
    }
}

impl fmt::Display for WorkFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkFormat::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown work format: {}", s))
    }
}

/// English requirement levels as the listing site labels them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum EnglishLevel {
    #[serde(rename = "No English")]
    NoEnglish,
    #[serde(rename = "Beginner/Elementary")]
    Elementary,
    #[serde(rename = "Pre-Intermediate")]
    PreIntermediate,
    #[serde(rename = "Intermediate")]
    Intermediate,
    #[serde(rename = "Upper-Intermediate")]
    UpperIntermediate,
    #[serde(rename = "Advanced")]
    Advanced,
    #[serde(rename = "Fluent")]
    Fluent,
    /// The card carried no recognizable level.
    #[serde(rename = "Not specified")]
    NotSpecified,
}

impl EnglishLevel {
    pub const ALL: [EnglishLevel; 8] = [
        EnglishLevel::NoEnglish,
        EnglishLevel::Elementary,
        EnglishLevel::PreIntermediate,
        EnglishLevel::Intermediate,
        EnglishLevel::UpperIntermediate,
        EnglishLevel::Advanced,
        EnglishLevel::Fluent,
        EnglishLevel::NotSpecified,
    ];

    /// Fragments that identify a level inside free card text. Order matters:
    /// "Intermediate" is a substring of its Pre-/Upper- neighbours.
    const MARKERS: [(&'static str, EnglishLevel); 8] = [
        ("upper-intermediate", EnglishLevel::UpperIntermediate),
        ("pre-intermediate", EnglishLevel::PreIntermediate),
        ("intermediate", EnglishLevel::Intermediate),
        ("elementary", EnglishLevel::Elementary),
        ("beginner", EnglishLevel::Elementary),
        ("advanced", EnglishLevel::Advanced),
        ("fluent", EnglishLevel::Fluent),
        ("no english", EnglishLevel::NoEnglish),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnglishLevel::NoEnglish => "No English",
            EnglishLevel::Elementary => "Beginner/Elementary",
            EnglishLevel::PreIntermediate => "Pre-Intermediate",
            EnglishLevel::Intermediate => "Intermediate",
            EnglishLevel::UpperIntermediate => "Upper-Intermediate",
            EnglishLevel::Advanced => "Advanced",
            EnglishLevel::Fluent => "Fluent",
            EnglishLevel::NotSpecified => "Not specified",
        }
    }

    /// Finds the level mentioned in card text such as "English: Upper-Intermediate".
    pub fn from_text(text: &str) -> EnglishLevel {
        let lower = text.to_lowercase();
        Self::MARKERS
            .iter()
            .find(|(marker, _)| lower.contains(marker))
            .map(|(_, level)| *level)
            .unwrap_or(EnglishLevel::NotSpecified)
    }

    /// True when `text` mentions any level at all.
    pub fn is_mentioned_in(text: &str) -> bool {
        EnglishLevel::from_text(text) != EnglishLevel::NotSpecified
    }
}

impl fmt::Display for EnglishLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnglishLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnglishLevel::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown English level: {}", s))
    }
}

/// Canonical job record written by the sink. `created_at` is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedJob {
    pub job_id: String,
    pub title: String,
    pub salary: Option<String>,
    pub company: String,
    pub company_logo: Option<String>,
    pub work_format: WorkFormat,
    pub location: String,
    pub description: String,
    pub views: i32,
    pub applications: i32,
    pub posted_at: DateTime<Utc>,
    pub experience_years: f64,
    pub english_level: EnglishLevel,
    pub technology_id: i32,
}
