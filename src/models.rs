//! Data models for notice records and the persisted feed.
//!
//! This module defines the core data structures used throughout the application:
//! - [`Source`]: static description of one college bulletin board
//! - [`Credential`]: the optional WebVPN login pair
//! - [`NoticeRecord`]: one normalized notice entry
//! - [`FeedState`]: the deduplicated feed document that crosses run boundaries
//! - [`AccessMode`] / [`SourceStatus`]: per-source access decision and outcome
//!
//! `FeedState` is the only entity persisted between runs; everything else is
//! rebuilt from scratch each execution.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One list-page endpoint: the paginated list URL plus the base host used
/// to resolve relative article links found on it.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    /// First-page list URL, e.g. `http://ckc.zju.edu.cn/54005/list.htm`.
    pub list_url: &'static str,
    /// Base host for resolving relative hrefs. This is always the real
    /// origin host, never the WebVPN proxy host, so stored URLs stay
    /// stable regardless of the access path.
    pub base_url: &'static str,
}

/// Static description of one college bulletin source.
///
/// A source always has at most two endpoints:
/// - `gated`: the campus-only notice list, reachable only through WebVPN
/// - `public`: a globally reachable list; for gated sources this doubles
///   as the degraded fallback (usually the college news page rather than
///   the real notice board)
#[derive(Debug, Clone, Copy)]
pub struct Source {
    /// Short stable identifier, e.g. `"cs"`. Part of every record's dedup key.
    pub id: &'static str,
    /// Human-readable college name shown by the renderer.
    pub name: &'static str,
    /// Globally reachable list endpoint, if one exists.
    pub public: Option<Endpoint>,
    /// Campus-only list endpoint requiring an authenticated WebVPN session.
    pub gated: Option<Endpoint>,
    /// Whether the canonical notice board sits behind the gateway.
    pub requires_auth: bool,
}

/// WebVPN login credentials, read from the environment.
///
/// The password must never appear in logs or in any persisted artifact,
/// hence the hand-written `Debug`.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Build a credential from the two optional env values. Both must be
    /// present and non-empty; anything else means "no credential", which
    /// is a handled state, not an error.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => {
                Some(Credential { username: u, password: p })
            }
            _ => None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A single normalized notice entry.
///
/// Identity across runs is `(source_id, url)`: two records sharing that key
/// are the same notice even if the title drifted between scrapes. On merge
/// the newer scrape's title and date win; the oldest `first_seen` is kept.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct NoticeRecord {
    /// Id of the [`Source`] this record came from.
    pub source_id: String,
    /// Notice title as shown on the list page.
    pub title: String,
    /// Canonical absolute article URL (dedup key together with `source_id`).
    pub url: String,
    /// Publish date shown on the list page.
    pub published_date: NaiveDate,
    /// Date this record was first observed by any run.
    pub first_seen: NaiveDate,
    /// True when the record was scraped from a public substitute feed
    /// because authenticated access was unavailable.
    #[serde(default)]
    pub degraded: bool,
}

/// The feed document handed to the external renderer and reloaded as prior
/// state on the next run.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FeedState {
    /// Human-readable generation timestamp in China Standard Time.
    pub updated_at: String,
    /// All retained records, globally sorted by publish date descending.
    pub records: Vec<NoticeRecord>,
}

/// How a source will be accessed this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Public source; no gateway involved.
    Public,
    /// Gated source fetched through an established WebVPN session.
    Authenticated,
    /// Gated source served from its public substitute; records are tagged.
    PublicFallback,
    /// Gated source with no substitute and no session; contributes nothing.
    Unavailable,
}

/// Outcome of one source for one run, surfaced to the caller for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Ok,
    Degraded,
    Unavailable,
    Error(String),
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Ok => write!(f, "ok"),
            SourceStatus::Degraded => write!(f, "degraded"),
            SourceStatus::Unavailable => write!(f, "unavailable"),
            SourceStatus::Error(kind) => write!(f, "error({kind})"),
        }
    }
}

/// Per-source summary returned next to the merged [`FeedState`].
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source_id: &'static str,
    pub status: SourceStatus,
    /// Records contributed by this run (not counting retained prior ones).
    pub scraped: usize,
}
