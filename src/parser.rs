//! Notice extraction from WebPlus list pages.
//!
//! ZJU WebPlus CMS list pages enumerate notices as
//! `<li><a href="/2026/0213/c86671a3134640/page.htm">title</a><span>date</span></li>`.
//! Anchors are recognized by the article URL pattern rather than by CSS
//! classes, which differ between college skins; the publish date is looked
//! up in the surrounding `<li>`.
//!
//! Extraction is tolerant per item: a notice missing its title or date is
//! skipped with a debug log and never aborts the rest of the page.

use crate::models::NoticeRecord;
use chrono::{Datelike, Days, NaiveDate};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

/// WebPlus article URL tail, e.g. `/2026/0213/c12577a3134640/page.htm`.
static ARTICLE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/\d{4}/\d{4}/[^/]+/page\.htm$").unwrap());

/// Full `YYYY-MM-DD` date token anywhere in text.
static FULL_DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap());

/// Bare `MM-DD` token (some skins abbreviate the year away on list pages).
static MONTH_DAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d{1,2})-(\d{1,2})$").unwrap());

/// How far into the future a year-resolved `MM-DD` date may land before it
/// is taken to belong to the previous year. List pages are chronological,
/// so this only matters around New Year.
const FUTURE_TOLERANCE_DAYS: u64 = 7;

/// Extract all notice records from one list page.
///
/// Relative hrefs resolve against `base_url` — the source's real origin
/// host, never the proxy host — so stored URLs are identical whichever
/// access path fetched the page. Duplicate hrefs within the page are
/// dropped, keeping the first occurrence.
#[instrument(level = "debug", skip(html))]
pub fn parse_notices(
    html: &str,
    source_id: &str,
    base_url: &str,
    degraded: bool,
    today: NaiveDate,
) -> Vec<NoticeRecord> {
    let document = Html::parse_document(html);
    let anchor_selector = Selector::parse("a[href]").unwrap();
    let span_selector = Selector::parse("span").unwrap();

    let records = document
        .select(&anchor_selector)
        .filter_map(|anchor| {
            let href = anchor.value().attr("href")?.trim();
            if !ARTICLE_URL_RE.is_match(href) {
                return None;
            }

            let title = normalize_text(anchor.text());
            if title.is_empty() {
                debug!(%href, "Skipping notice with empty title");
                return None;
            }

            let url = match absolute_url(href, base_url) {
                Some(url) => url,
                None => {
                    debug!(%href, "Skipping notice with unresolvable href");
                    return None;
                }
            };

            let Some(published_date) = item_date(&anchor, &span_selector, today) else {
                debug!(%href, "Skipping notice with no recognizable date");
                return None;
            };

            Some(NoticeRecord {
                source_id: source_id.to_string(),
                title,
                url,
                published_date,
                first_seen: today,
                degraded,
            })
        })
        .unique_by(|record| record.url.clone())
        .collect::<Vec<_>>();

    debug!(count = records.len(), "Parsed list page");
    records
}

/// Collapse an element's text runs into a single whitespace-normalized line.
fn normalize_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts.flat_map(str::split_whitespace).join(" ")
}

fn absolute_url(href: &str, base_url: &str) -> Option<String> {
    if href.starts_with("http") {
        return Some(href.to_string());
    }
    Url::parse(base_url).ok()?.join(href).ok().map(|u| u.to_string())
}

/// Find the publish date for one anchor: prefer a `<span>` inside the
/// parent `<li>`, then fall back to a full-date token anywhere in the
/// parent's text.
fn item_date(anchor: &ElementRef, span_selector: &Selector, today: NaiveDate) -> Option<NaiveDate> {
    let parent = anchor.parent().and_then(ElementRef::wrap)?;
    for span in parent.select(span_selector) {
        let text = normalize_text(span.text());
        if let Some(date) = extract_date(&text, today) {
            return Some(date);
        }
    }
    let parent_text = normalize_text(parent.text());
    FULL_DATE_RE
        .find(&parent_text)
        .and_then(|m| m.as_str().parse().ok())
}

/// Read a date token out of a text fragment: `YYYY-MM-DD` wins, a bare
/// `MM-DD` is resolved against the current year.
fn extract_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    if let Some(found) = FULL_DATE_RE.find(text) {
        return found.as_str().parse().ok();
    }
    let caps = MONTH_DAY_RE.captures(text.trim())?;
    resolve_month_day(caps[1].parse().ok()?, caps[2].parse().ok()?, today)
}

/// Resolve an abbreviated month-day token to a calendar date. Dates that
/// would land more than [`FUTURE_TOLERANCE_DAYS`] in the future roll back
/// to the previous year (a December notice read in January).
fn resolve_month_day(month: u32, day: u32, today: NaiveDate) -> Option<NaiveDate> {
    let horizon = today.checked_add_days(Days::new(FUTURE_TOLERANCE_DAYS))?;
    match NaiveDate::from_ymd_opt(today.year(), month, day) {
        Some(candidate) if candidate <= horizon => Some(candidate),
        // Too far in the future, or invalid this year (Feb 29): last year.
        _ => NaiveDate::from_ymd_opt(today.year() - 1, month, day),
    }
}
