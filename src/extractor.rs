//! Listing extraction from a rendered results page.
//!
//! Each card is read through a declarative table of field rules, so a change in
//! the site's markup is a one-line edit here. Cards are isolated from each
//! other: a card that fails a rule is reported with its raw markup and the rest
//! of the page is still returned.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

use crate::models::{Company, EnglishLevel, Position, RawListing, Stats, Workplace};

/// One card per matched element.
pub const LISTING_CONTAINER: &str = "main > ul.list-jobs > li";

/// Badge phrases that mark a listing as fully remote.
pub const REMOTE_BADGES: &[&str] = &["Full Remote"];

const JOB_ID_PREFIX: &str = "job-item-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    JobId,
    Title,
    Salary,
    CompanyName,
    CompanyLogo,
    ViewsText,
    ApplicationsText,
    PostedAtText,
    Remote,
    Location,
    ExperienceText,
    EnglishLevelText,
    Description,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Field::JobId => "job_id",
            Field::Title => "title",
            Field::Salary => "salary",
            Field::CompanyName => "company_name",
            Field::CompanyLogo => "company_logo",
            Field::ViewsText => "views",
            Field::ApplicationsText => "applications",
            Field::PostedAtText => "posted_at",
            Field::Remote => "remote",
            Field::Location => "location",
            Field::ExperienceText => "experience",
            Field::EnglishLevelText => "english_level",
            Field::Description => "description",
        }
    }
}

/// How a rule turns the matched element(s) into a string.
#[derive(Debug, Clone, Copy)]
pub enum Capture {
    /// Attribute of the card element itself, with an optional prefix removed.
    OwnAttr { name: &'static str, strip_prefix: &'static str },
    /// Text of the first match.
    Text,
    /// Full text of the first match, whitespace preserved (trimmed only).
    LongText,
    /// Attribute of the first match.
    Attr(&'static str),
    /// Text of the n-th match (0-based).
    NthText(usize),
    /// Text of the first match for which the predicate holds.
    TextWhere(fn(&str) -> bool),
    /// "true" when any match's text satisfies the predicate, absent otherwise.
    AnyTextWhere(fn(&str) -> bool),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: Field,
    /// `None` for rules reading the card element itself.
    pub selector: Option<&'static str>,
    pub capture: Capture,
    pub required: bool,
}

fn has_remote_badge(text: &str) -> bool {
    REMOTE_BADGES.iter().any(|badge| text.contains(badge))
}

fn mentions_experience(text: &str) -> bool {
    text.to_lowercase().contains("experience")
}

pub const FIELD_RULES: &[FieldRule] = &[
    FieldRule {
        field: Field::JobId,
        selector: None,
        capture: Capture::OwnAttr { name: "id", strip_prefix: JOB_ID_PREFIX },
        required: true,
    },
    FieldRule { field: Field::Title, selector: Some(".job-item__title-link"), capture: Capture::Text, required: true },
    FieldRule { field: Field::Salary, selector: Some(".text-success"), capture: Capture::Text, required: false },
    FieldRule {
        field: Field::CompanyName,
        selector: Some(r#"a[href^="/jobs/?company="]"#),
        capture: Capture::Text,
        required: false,
    },
    FieldRule {
        field: Field::CompanyLogo,
        selector: Some(".userpic-image_img"),
        capture: Capture::Attr("src"),
        required: false,
    },
    FieldRule { field: Field::ViewsText, selector: Some("span.text-nowrap"), capture: Capture::NthText(0), required: false },
    FieldRule {
        field: Field::ApplicationsText,
        selector: Some("span.text-nowrap"),
        capture: Capture::NthText(1),
        required: false,
    },
    FieldRule {
        field: Field::PostedAtText,
        selector: Some("span[data-original-title]"),
        capture: Capture::Attr("data-original-title"),
        required: false,
    },
    FieldRule {
        field: Field::Remote,
        selector: Some(".text-nowrap"),
        capture: Capture::AnyTextWhere(has_remote_badge),
        required: false,
    },
    FieldRule { field: Field::Location, selector: Some(".location-text"), capture: Capture::Text, required: false },
    FieldRule {
        field: Field::ExperienceText,
        selector: Some(".text-nowrap"),
        capture: Capture::TextWhere(mentions_experience),
        required: false,
    },
    FieldRule {
        field: Field::EnglishLevelText,
        selector: Some(".text-nowrap"),
        capture: Capture::TextWhere(EnglishLevel::is_mentioned_in),
        required: false,
    },
    FieldRule {
        field: Field::Description,
        selector: Some(".js-original-text"),
        capture: Capture::LongText,
        required: false,
    },
];

struct CompiledRule {
    rule: FieldRule,
    selector: Option<Selector>,
}

static CONTAINER_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(LISTING_CONTAINER).expect("valid container selector"));

static COMPILED_RULES: Lazy<Vec<CompiledRule>> = Lazy::new(|| {
    FIELD_RULES
        .iter()
        .map(|rule| CompiledRule {
            rule: *rule,
            selector: rule
                .selector
                .map(|s| Selector::parse(s).expect("valid field selector")),
        })
        .collect()
});

#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("required field `{0}` is missing")]
    Missing(&'static str),
    #[error("field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },
}

/// Outcome of one page: the cards that parsed, and raw markup of those that did not.
#[derive(Debug, Default)]
pub struct ExtractedPage {
    pub listings: Vec<RawListing>,
    pub failed: Vec<String>,
}

/// Extracts every listing card from a rendered page.
pub fn extract_listings(html: &str, technology_id: i32) -> ExtractedPage {
    let document = Html::parse_document(html);
    let mut page = ExtractedPage::default();

    for card in document.select(&CONTAINER_SELECTOR) {
        match extract_card(card, technology_id) {
            Ok(listing) => page.listings.push(listing),
            Err(e) => {
                tracing::warn!("Skipping listing card: {}", e);
                page.failed.push(card.html());
            }
        }
    }

    page
}

/// Applies the field table to one card.
pub fn extract_card(card: ElementRef<'_>, technology_id: i32) -> Result<RawListing, FieldError> {
    let mut fields = HashMap::new();

    for compiled in COMPILED_RULES.iter() {
        let value = capture(card, compiled);
        match value {
            Some(v) if !v.is_empty() => {
                fields.insert(compiled.rule.field, v);
            }
            _ if compiled.rule.required => return Err(FieldError::Missing(compiled.rule.field.name())),
            _ => {}
        }
    }

    build_listing(fields, technology_id)
}

fn capture(card: ElementRef<'_>, compiled: &CompiledRule) -> Option<String> {
    let matches = || {
        compiled
            .selector
            .as_ref()
            .into_iter()
            .flat_map(move |sel| card.select(sel))
    };

    match compiled.rule.capture {
        Capture::OwnAttr { name, strip_prefix } => card
            .value()
            .attr(name)
            .map(|v| v.trim().trim_start_matches(strip_prefix).to_string()),
        Capture::Text => matches().next().map(|el| squash(&element_text(el))),
        Capture::LongText => matches().next().map(|el| element_text(el).trim().to_string()),
        Capture::Attr(name) => matches()
            .next()
            .and_then(|el| el.value().attr(name))
            .map(|v| v.trim().to_string()),
        Capture::NthText(n) => matches().nth(n).map(|el| squash(&element_text(el))),
        Capture::TextWhere(pred) => matches()
            .map(|el| squash(&element_text(el)))
            .find(|text| pred(text)),
        Capture::AnyTextWhere(pred) => matches()
            .any(|el| pred(&element_text(el)))
            .then(|| "true".to_string()),
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>()
}

/// Collapses runs of whitespace, as card badges are often split over lines.
fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn build_listing(mut fields: HashMap<Field, String>, technology_id: i32) -> Result<RawListing, FieldError> {
    let mut take = |field: Field| fields.remove(&field);

    let site_job_id = take(Field::JobId).ok_or(FieldError::Missing(Field::JobId.name()))?;
    if site_job_id.chars().any(char::is_whitespace) {
        return Err(FieldError::Malformed {
            field: Field::JobId.name(),
            reason: format!("unexpected id '{}'", site_job_id),
        });
    }

    Ok(RawListing {
        site_job_id,
        position: Position {
            title: take(Field::Title).ok_or(FieldError::Missing(Field::Title.name()))?,
            salary: take(Field::Salary),
        },
        company: Company {
            name: take(Field::CompanyName).unwrap_or_default(),
            logo: take(Field::CompanyLogo),
        },
        stats: Stats {
            views_text: take(Field::ViewsText).unwrap_or_else(|| "0 views".to_string()),
            applications_text: take(Field::ApplicationsText).unwrap_or_else(|| "0 applications".to_string()),
            posted_at_text: take(Field::PostedAtText).unwrap_or_default(),
        },
        workplace: Workplace {
            remote: take(Field::Remote).is_some(),
            location: take(Field::Location).unwrap_or_default(),
            experience_years_text: take(Field::ExperienceText).unwrap_or_default(),
            english_level_text: take(Field::EnglishLevelText).unwrap_or_default(),
        },
        description: take(Field::Description).unwrap_or_default(),
        technology_id,
    })
}
