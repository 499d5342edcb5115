//! Pagination planning for a search keyword.

use crate::browser::{ListingPage, WaitCondition, ELEMENT_TIMEOUT, NAVIGATION_TIMEOUT};
use crate::parsing::first_integer;
use once_cell::sync::Lazy;
use regex::Regex;

/// Listings the site shows per results page.
pub const PAGE_SIZE: u32 = 15;

/// Heading badge holding the total number of matching listings.
pub const TOTAL_COUNT_SELECTOR: &str = "h1 span.text-muted";

static HAS_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d").expect("valid regex"));

/// URL of a results page. `page = None` addresses the first page without a page parameter.
pub fn listing_url(base_url: &str, region: &str, keyword: &str, page: Option<u32>) -> String {
    let mut url = format!(
        "{}/jobs/?primary_keyword={}&region={}",
        base_url.trim_end_matches('/'),
        urlencoding::encode(keyword),
        urlencoding::encode(region)
    );
    if let Some(page) = page {
        url.push_str(&format!("&page={}", page));
    }
    url
}

pub fn pages_for_total(total_count: u32) -> u32 {
    total_count.div_ceil(PAGE_SIZE)
}

/// Page count from the indicator text, or `None` when it carries no number.
pub fn pages_from_indicator(text: &str) -> Option<u32> {
    if !HAS_DIGIT.is_match(text) {
        return None;
    }
    Some(pages_for_total(first_integer(text).max(0) as u32))
}

/// Determines how many result pages exist for `keyword`.
///
/// Fail-soft: a missing or unreadable indicator yields a single page.
pub async fn plan_pages<P>(page: &P, base_url: &str, region: &str, keyword: &str) -> u32
where
    P: ListingPage + ?Sized,
{
    let url = listing_url(base_url, region, keyword, None);

    let indicator = match page.navigate(&url, WaitCondition::Navigated, NAVIGATION_TIMEOUT).await {
        Ok(()) => page.element_text(TOTAL_COUNT_SELECTOR, ELEMENT_TIMEOUT).await,
        Err(e) => Err(e),
    };

    match indicator {
        Ok(text) => match pages_from_indicator(&text) {
            Some(pages) => {
                tracing::debug!("Total count text for {}: '{}'", keyword, text.trim());
                pages
            }
            None => {
                tracing::warn!(
                    "Unreadable job count '{}' for {}, defaulting to one page",
                    text.trim(),
                    keyword
                );
                1
            }
        },
        Err(e) => {
            tracing::warn!("Could not find job count for {}, defaulting to one page: {}", keyword, e);
            1
        }
    }
}
