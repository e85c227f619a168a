//! Run driver: pagination, session handling, merge, dedup, sort, cap.
//!
//! One [`run`] call owns the entire scrape: it establishes the WebVPN
//! session at most once up front, walks every source's list pages
//! sequentially, merges the results into the prior feed state, and returns
//! the new state plus a per-source status summary. A failing source never
//! fails the run; its prior records are simply retained.

use crate::degrade;
use crate::fetch::{FetchFailure, FetchPage};
use crate::models::{
    AccessMode, Credential, Endpoint, FeedState, NoticeRecord, Source, SourceReport, SourceStatus,
};
use crate::output;
use crate::parser;
use crate::sources::{self, ITEMS_PER_PAGE};
use crate::webvpn::{SessionProvider, VpnSession};
use chrono::NaiveDate;
use itertools::Itertools;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Pause between list pages of one source.
const PAGE_DELAY: Duration = Duration::from_secs(1);
/// Pause between sources.
const SOURCE_DELAY: Duration = Duration::from_secs(2);

/// Scrape every source and fold the results into `prior`.
///
/// Requests are strictly sequential: the one gateway session must never
/// see concurrent use, and the origin servers get the same politeness
/// delays the site has always been crawled with.
#[instrument(level = "info", skip_all, fields(sources = source_list.len(), pages = pages))]
pub async fn run<F, G>(
    fetcher: &F,
    gateway: &G,
    source_list: &[Source],
    prior: &FeedState,
    credential: Option<&Credential>,
    pages: u32,
) -> (FeedState, Vec<SourceReport>)
where
    F: FetchPage,
    G: SessionProvider,
{
    let today = output::cst_now().date_naive();
    let probe_url = source_list.iter().find_map(|s| s.gated.map(|g| g.list_url));

    // Login happens at most once here. A failure degrades every gated
    // source for the whole run; there is no per-source login retry.
    let mut session = match (credential, probe_url) {
        (Some(cred), Some(probe)) => match gateway.establish(cred, probe).await {
            Ok(sess) => Some(sess),
            Err(error) => {
                warn!(%error, "WebVPN login failed; gated sources will degrade");
                None
            }
        },
        (None, Some(_)) => {
            info!("No WebVPN credential set; gated sources will degrade");
            None
        }
        _ => None,
    };
    // One session re-establishment per run, spent on the first expiry.
    let mut reauth_spent = false;

    let mut scraped_all: Vec<NoticeRecord> = Vec::new();
    let mut reports: Vec<SourceReport> = Vec::new();

    for (index, source) in source_list.iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(SOURCE_DELAY).await;
        }

        let mut mode = degrade::decide(source, credential.is_some(), session.is_some());

        // Gateway session scoping is undocumented: probe-verify each new
        // destination host instead of assuming the cookie carries over.
        if mode == AccessMode::Authenticated {
            if let (Some(sess), Some(gated)) = (session.as_mut(), source.gated.as_ref()) {
                if let Err(error) = sess.verify_host(gated.list_url).await {
                    warn!(source = source.id, %error, "Host probe failed; degrading source");
                    mode = degrade::decide(source, credential.is_some(), false);
                }
            }
        }

        let Some((endpoint, via_session, degraded)) = degrade::plan(source, mode) else {
            info!(source = source.id, "Source unavailable this run; prior records retained");
            reports.push(SourceReport {
                source_id: source.id,
                status: SourceStatus::Unavailable,
                scraped: 0,
            });
            continue;
        };

        info!(
            source = source.id,
            name = source.name,
            ?mode,
            url = endpoint.list_url,
            "Scraping source"
        );
        let mut attempt = scrape_source(
            fetcher,
            source.id,
            &endpoint,
            via_session.then(|| session.as_ref()).flatten(),
            degraded,
            pages,
            today,
        )
        .await;

        if matches!(attempt, Err(FetchFailure::AuthExpired)) {
            session = if !reauth_spent {
                reauth_spent = true;
                warn!(source = source.id, "Session expired mid-run; re-establishing once");
                match (credential, probe_url) {
                    (Some(cred), Some(probe)) => match gateway.establish(cred, probe).await {
                        Ok(sess) => Some(sess),
                        Err(error) => {
                            warn!(%error, "Re-login failed; gated sources degrade from here");
                            None
                        }
                    },
                    _ => None,
                }
            } else {
                None
            };

            if let Some(sess) = session.as_ref() {
                attempt =
                    scrape_source(fetcher, source.id, &endpoint, Some(sess), degraded, pages, today)
                        .await;
            }
            if matches!(attempt, Err(FetchFailure::AuthExpired)) {
                mode = degrade::decide(source, credential.is_some(), false);
                attempt = match degrade::plan(source, mode) {
                    Some((fallback, _, fallback_degraded)) => {
                        scrape_source(
                            fetcher,
                            source.id,
                            &fallback,
                            None,
                            fallback_degraded,
                            pages,
                            today,
                        )
                        .await
                    }
                    None => Err(FetchFailure::AuthExpired),
                };
            }
        }

        match attempt {
            Ok(records) => {
                let status = match mode {
                    AccessMode::PublicFallback => SourceStatus::Degraded,
                    _ => SourceStatus::Ok,
                };
                info!(source = source.id, count = records.len(), status = %status, "Source scraped");
                reports.push(SourceReport {
                    source_id: source.id,
                    status,
                    scraped: records.len(),
                });
                scraped_all.extend(records);
            }
            Err(failure) => {
                warn!(source = source.id, %failure, "Source failed; prior records retained");
                reports.push(SourceReport {
                    source_id: source.id,
                    status: SourceStatus::Error(failure.to_string()),
                    scraped: 0,
                });
            }
        }
    }

    let state = FeedState {
        updated_at: output::cst_now().format("%Y-%m-%d %H:%M:%S CST").to_string(),
        records: merge_records(&prior.records, scraped_all, pages as usize * ITEMS_PER_PAGE),
    };
    (state, reports)
}

/// Walk one source's list pages, newest first, accumulating records.
///
/// Stops early when a page yields zero records (the pagination rule has
/// drifted, or the list genuinely ended) and keeps earlier pages when a
/// later one fails. `AuthExpired` bubbles up untouched; the caller owns
/// the single re-authentication attempt.
async fn scrape_source<F: FetchPage>(
    fetcher: &F,
    source_id: &str,
    endpoint: &Endpoint,
    session: Option<&VpnSession>,
    degraded: bool,
    pages: u32,
    today: NaiveDate,
) -> Result<Vec<NoticeRecord>, FetchFailure> {
    let mut collected: Vec<NoticeRecord> = Vec::new();

    for page in 1..=pages {
        if page > 1 {
            tokio::time::sleep(PAGE_DELAY).await;
        }
        let url = sources::page_url(endpoint.list_url, page);
        let html = match fetcher.fetch(&url, session).await {
            Ok(html) => html,
            Err(FetchFailure::AuthExpired) => return Err(FetchFailure::AuthExpired),
            Err(failure) if collected.is_empty() => return Err(failure),
            Err(failure) => {
                warn!(source_id, page, %failure, "Page fetch failed; keeping earlier pages");
                break;
            }
        };

        let items = parser::parse_notices(&html, source_id, endpoint.base_url, degraded, today);
        if items.is_empty() {
            warn!(source_id, page, "No items on page; stopping pagination");
            break;
        }
        collected.extend(items);
    }

    Ok(collected.into_iter().unique_by(|r| r.url.clone()).collect())
}

/// Merge freshly scraped records into the prior feed.
///
/// Union per `(source_id, url)`: a repeated key keeps the oldest
/// `first_seen` and takes everything else from the new scrape (titles get
/// corrected post-publication now and then). Each source is then capped at
/// its `cap_per_source` most recent records and the whole feed sorted by
/// publish date descending, ties by `first_seen` descending then URL
/// ascending so output is deterministic.
pub fn merge_records(
    prior: &[NoticeRecord],
    scraped: Vec<NoticeRecord>,
    cap_per_source: usize,
) -> Vec<NoticeRecord> {
    let mut merged: HashMap<(String, String), NoticeRecord> = prior
        .iter()
        .map(|r| ((r.source_id.clone(), r.url.clone()), r.clone()))
        .collect();
    for mut record in scraped {
        let key = (record.source_id.clone(), record.url.clone());
        if let Some(existing) = merged.get(&key) {
            record.first_seen = existing.first_seen.min(record.first_seen);
        }
        merged.insert(key, record);
    }

    let mut by_source: HashMap<String, Vec<NoticeRecord>> = HashMap::new();
    for record in merged.into_values() {
        by_source.entry(record.source_id.clone()).or_default().push(record);
    }

    let mut records: Vec<NoticeRecord> = Vec::new();
    for group in by_source.values_mut() {
        group.sort_by(compare_records);
        group.truncate(cap_per_source);
        records.append(group);
    }
    records.sort_by(compare_records);
    records
}

fn compare_records(a: &NoticeRecord, b: &NoticeRecord) -> Ordering {
    b.published_date
        .cmp(&a.published_date)
        .then(b.first_seen.cmp(&a.first_seen))
        .then(a.url.cmp(&b.url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn record(source_id: &str, url: &str, published: &str, first_seen: &str) -> NoticeRecord {
        NoticeRecord {
            source_id: source_id.to_string(),
            title: format!("notice {url}"),
            url: url.to_string(),
            published_date: date(published),
            first_seen: date(first_seen),
            degraded: false,
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let scraped = vec![
            record("cs", "http://cspo.zju.edu.cn/x/2026/0213/c1a1/page.htm", "2026-02-13", "2026-02-14"),
            record("cs", "http://cspo.zju.edu.cn/x/2026/0210/c1a2/page.htm", "2026-02-10", "2026-02-14"),
        ];
        let once = merge_records(&[], scraped.clone(), 30);
        let twice = merge_records(&once, scraped, 30);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_keeps_oldest_first_seen() {
        let prior = vec![record("cs", "http://a/page.htm", "2026-02-13", "2026-02-13")];
        let rescrape = vec![record("cs", "http://a/page.htm", "2026-02-13", "2026-02-20")];
        let merged = merge_records(&prior, rescrape, 30);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].first_seen, date("2026-02-13"));
    }

    #[test]
    fn test_merge_title_correction_scenario() {
        // Prior state holds A; a new scrape returns A with a corrected
        // title plus new record B. B sorts first (newer date); A keeps its
        // original first_seen but takes the corrected title.
        let mut a_old = record("cs", "http://x/2024/0101/c1a1/page.htm", "2024-01-01", "2024-01-02");
        a_old.title = "通知（误）".to_string();
        let mut a_new = record("cs", "http://x/2024/0101/c1a1/page.htm", "2024-01-01", "2024-01-05");
        a_new.title = "通知（正）".to_string();
        let b = record("cs", "http://x/2024/0104/c1a2/page.htm", "2024-01-04", "2024-01-05");

        let merged = merge_records(&[a_old], vec![a_new, b.clone()], 30);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].url, b.url);
        assert_eq!(merged[1].title, "通知（正）");
        assert_eq!(merged[1].first_seen, date("2024-01-02"));
    }

    #[test]
    fn test_merge_retains_prior_for_absent_source() {
        // An unavailable source contributes nothing; its prior records stay.
        let prior = vec![record("cs", "http://a/page.htm", "2026-01-10", "2026-01-11")];
        let scraped = vec![record("ckc", "http://b/page.htm", "2026-02-13", "2026-02-14")];
        let merged = merge_records(&prior, scraped, 30);
        assert_eq!(merged.len(), 2);
        assert!(merged.iter().any(|r| r.source_id == "cs"));
    }

    #[test]
    fn test_ordering_is_deterministic() {
        let scraped = vec![
            record("a", "http://h/3.htm", "2026-02-10", "2026-02-11"),
            record("a", "http://h/1.htm", "2026-02-13", "2026-02-14"),
            record("b", "http://h/2.htm", "2026-02-13", "2026-02-14"),
            record("a", "http://h/4.htm", "2026-02-13", "2026-02-12"),
        ];
        let merged = merge_records(&[], scraped, 30);
        // date desc, then first_seen desc, then url asc
        let urls: Vec<&str> = merged.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["http://h/1.htm", "http://h/2.htm", "http://h/4.htm", "http://h/3.htm"]);
        for pair in merged.windows(2) {
            assert!(pair[0].published_date >= pair[1].published_date);
        }
    }

    #[test]
    fn test_per_source_cap_keeps_most_recent() {
        let mut scraped = Vec::new();
        for day in 1..=10 {
            scraped.push(record(
                "cs",
                &format!("http://h/{day}.htm"),
                &format!("2026-01-{day:02}"),
                "2026-02-01",
            ));
        }
        scraped.push(record("ckc", "http://k/1.htm", "2025-12-01", "2026-02-01"));

        let merged = merge_records(&[], scraped, 5);
        let cs: Vec<_> = merged.iter().filter(|r| r.source_id == "cs").collect();
        assert_eq!(cs.len(), 5);
        // most recent five survive the cap
        assert!(cs.iter().all(|r| r.published_date >= date("2026-01-06")));
        // the other source is capped independently
        assert_eq!(merged.iter().filter(|r| r.source_id == "ckc").count(), 1);
    }

    #[test]
    fn test_merge_commutative_on_distinct_keys() {
        let x = record("cs", "http://h/x.htm", "2026-02-13", "2026-02-14");
        let y = record("cs", "http://h/y.htm", "2026-02-12", "2026-02-14");
        let ab = merge_records(&[], vec![x.clone(), y.clone()], 30);
        let ba = merge_records(&[], vec![y, x], 30);
        assert_eq!(ab, ba);
    }

    use crate::webvpn::AuthFailure;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn list_page(ids: std::ops::Range<usize>) -> String {
        let items: String = ids
            .map(|i| {
                format!(
                    r#"<li><a href="/2026/0110/c1a{i}/page.htm">公告{i}</a><span>2026-01-10</span></li>"#
                )
            })
            .collect();
        format!("<html><body><ul id=\"wp_news_w6\">{items}</ul></body></html>")
    }

    const OPEN_SOURCE: Source = Source {
        id: "open",
        name: "公开学院",
        public: Some(Endpoint {
            list_url: "http://opencol.zju.edu.cn/100/list.htm",
            base_url: "http://opencol.zju.edu.cn",
        }),
        gated: None,
        requires_auth: false,
    };

    const GATED_CS: Source = Source {
        id: "cs",
        name: "内网甲",
        public: Some(Endpoint {
            list_url: "http://cs-pub.zju.edu.cn/200/list.htm",
            base_url: "http://cs-pub.zju.edu.cn",
        }),
        gated: Some(Endpoint {
            list_url: "http://cspo.zju.edu.cn/300/list.htm",
            base_url: "http://cspo.zju.edu.cn",
        }),
        requires_auth: true,
    };

    const GATED_GRS: Source = Source {
        id: "grs",
        name: "内网乙",
        public: Some(Endpoint {
            list_url: "http://grs-pub.zju.edu.cn/400/list.htm",
            base_url: "http://grs-pub.zju.edu.cn",
        }),
        gated: Some(Endpoint {
            list_url: "http://grs.zju.edu.cn/500/list.htm",
            base_url: "http://grs.zju.edu.cn",
        }),
        requires_auth: true,
    };

    /// Serves a full first page and an empty second page, recording every
    /// URL it was asked for.
    struct TailingOffFetcher {
        requested: Mutex<Vec<String>>,
    }

    impl FetchPage for TailingOffFetcher {
        async fn fetch(
            &self,
            url: &str,
            _session: Option<&VpnSession>,
        ) -> Result<String, FetchFailure> {
            self.requested.lock().unwrap().push(url.to_string());
            if url.ends_with("/list.htm") {
                Ok(list_page(0..ITEMS_PER_PAGE))
            } else {
                Ok(list_page(0..0))
            }
        }
    }

    struct UnusedGateway;

    impl SessionProvider for UnusedGateway {
        async fn establish(
            &self,
            _credential: &Credential,
            _probe_url: &str,
        ) -> Result<VpnSession, AuthFailure> {
            unreachable!("no gated source in this run");
        }
    }

    #[tokio::test]
    async fn test_pagination_stops_at_first_empty_page() {
        let fetcher = TailingOffFetcher {
            requested: Mutex::new(Vec::new()),
        };
        let (state, reports) = run(
            &fetcher,
            &UnusedGateway,
            &[OPEN_SOURCE],
            &FeedState::default(),
            None,
            3,
        )
        .await;

        // Page two comes back empty, so page three is never requested.
        let requested = fetcher.requested.lock().unwrap().clone();
        assert_eq!(
            requested,
            vec![
                "http://opencol.zju.edu.cn/100/list.htm",
                "http://opencol.zju.edu.cn/100/list2.htm",
            ]
        );
        assert_eq!(state.records.len(), ITEMS_PER_PAGE);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, SourceStatus::Ok);
    }

    /// Fails every gated request as an expired session; public pages work.
    struct ExpiredGatewayFetcher {
        requested: Mutex<Vec<String>>,
    }

    impl FetchPage for ExpiredGatewayFetcher {
        async fn fetch(
            &self,
            url: &str,
            session: Option<&VpnSession>,
        ) -> Result<String, FetchFailure> {
            self.requested.lock().unwrap().push(url.to_string());
            if session.is_some() {
                Err(FetchFailure::AuthExpired)
            } else {
                Ok(list_page(0..3))
            }
        }
    }

    struct CountingGateway {
        logins: AtomicUsize,
    }

    impl SessionProvider for CountingGateway {
        async fn establish(
            &self,
            _credential: &Credential,
            _probe_url: &str,
        ) -> Result<VpnSession, AuthFailure> {
            self.logins.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(VpnSession::offline(&["cspo.zju.edu.cn", "grs.zju.edu.cn"]))
        }
    }

    #[tokio::test]
    async fn test_session_reestablished_at_most_once_per_run() {
        let fetcher = ExpiredGatewayFetcher {
            requested: Mutex::new(Vec::new()),
        };
        let gateway = CountingGateway {
            logins: AtomicUsize::new(0),
        };
        let credential =
            Credential::from_parts(Some("user".to_string()), Some("pass".to_string()));

        let (state, reports) = run(
            &fetcher,
            &gateway,
            &[GATED_CS, GATED_GRS],
            &FeedState::default(),
            credential.as_ref(),
            1,
        )
        .await;

        // Initial login plus exactly one mid-run re-establishment, even
        // though both sources hit an expired session.
        assert_eq!(gateway.logins.load(AtomicOrdering::SeqCst), 2);

        // Both sources end up on their public fallback.
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.status == SourceStatus::Degraded));
        assert_eq!(state.records.len(), 6);
        assert!(state.records.iter().all(|r| r.degraded));

        let requested = fetcher.requested.lock().unwrap().clone();
        // First source: gated attempt, retry on the fresh session, then
        // fallback. Second source: gated attempt, straight to fallback.
        assert_eq!(
            requested,
            vec![
                "http://cspo.zju.edu.cn/300/list.htm",
                "http://cspo.zju.edu.cn/300/list.htm",
                "http://cs-pub.zju.edu.cn/200/list.htm",
                "http://grs.zju.edu.cn/500/list.htm",
                "http://grs-pub.zju.edu.cn/400/list.htm",
            ]
        );
    }
}
