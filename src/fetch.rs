//! List-page fetching with retry and backoff.
//!
//! One function, [`fetch_page`], retrieves a single list page either
//! directly or through an established WebVPN session. Transient failures
//! (timeouts, connection drops, 5xx) are retried with exponential backoff
//! and jitter; structural failures (4xx, login redirects) are surfaced
//! immediately so the caller can degrade or re-authenticate.

use crate::webvpn::{self, VpnSession};
use encoding_rs::{Encoding, UTF_8};
use once_cell::sync::Lazy;
use rand::{Rng, rng};
use regex::Regex;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Attempts per page, including the first one.
const MAX_ATTEMPTS: u32 = 3;
/// First backoff delay; doubles each attempt.
const BASE_DELAY: Duration = Duration::from_secs(1);
/// Per-request timeout. List pages are small; anything slower is a stall.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(25);

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// `charset=gbk` style token, in a Content-Type header or a `<meta>` tag.
static CHARSET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)charset\s*=\s*["']?([A-Za-z0-9_-]+)"#).unwrap());

/// How far into the body to look for a `<meta charset>` declaration.
const META_SNIFF_WINDOW: usize = 1024;

/// Why a page could not be fetched, after retries where applicable.
#[derive(Debug, Error)]
pub enum FetchFailure {
    /// Timeout or connection-level failure on every attempt.
    #[error("timeout")]
    Timeout,
    /// Non-retriable HTTP status, or a 5xx that persisted through retries.
    #[error("http_error({0})")]
    Http(u16),
    /// A session-routed request was answered with a login redirect. Not
    /// retried here; the caller owns the one re-authentication attempt.
    #[error("auth_expired")]
    AuthExpired,
}

/// Build a client that presents ordinary browser headers. The WebPlus CMS
/// serves different (sometimes empty) markup to obvious bots.
pub fn browser_client(cookie_store: bool) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
    Client::builder()
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .cookie_store(cookie_store)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// Shared client for public (sessionless) fetches.
static PLAIN_CLIENT: Lazy<Client> =
    Lazy::new(|| browser_client(false).expect("plain HTTP client"));

enum Attempt {
    /// Worth another try within the retry budget.
    Transient(FetchFailure),
    /// Retrying cannot help; surface immediately.
    Permanent(FetchFailure),
}

/// How the aggregator obtains list pages.
///
/// The production implementation is [`HttpFetcher`]; tests substitute
/// scripted implementations so pagination and re-authentication logic can
/// be exercised without a live gateway.
pub trait FetchPage {
    /// Retrieve one list page, optionally through a gateway session.
    async fn fetch(
        &self,
        url: &str,
        session: Option<&VpnSession>,
    ) -> Result<String, FetchFailure>;
}

/// The real fetcher: [`fetch_page`] with retry/backoff over HTTP.
#[derive(Debug)]
pub struct HttpFetcher;

impl FetchPage for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        session: Option<&VpnSession>,
    ) -> Result<String, FetchFailure> {
        fetch_page(url, session).await
    }
}

/// Fetch one list page and return its HTML body.
///
/// With a session the URL is rewritten onto the gateway's proxy path and
/// the request rides the session's cookie-bearing client; without one it
/// is a plain request on the shared client.
#[instrument(level = "info", skip(session), fields(via_session = session.is_some()))]
pub async fn fetch_page(url: &str, session: Option<&VpnSession>) -> Result<String, FetchFailure> {
    let (client, fetch_url) = match session {
        Some(sess) => (sess.client(), webvpn::rewrite_url(url)),
        None => (&*PLAIN_CLIENT, url.to_string()),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match try_fetch(client, &fetch_url, session.is_some()).await {
            Ok(body) => {
                debug!(bytes = body.len(), attempt, "Fetched list page");
                return Ok(body);
            }
            Err(Attempt::Permanent(failure)) => return Err(failure),
            Err(Attempt::Transient(failure)) => {
                if attempt >= MAX_ATTEMPTS {
                    warn!(%failure, attempt, "Fetch exhausted retries");
                    return Err(failure);
                }
                let mut delay = BASE_DELAY.saturating_mul(1 << (attempt - 1));
                delay += Duration::from_millis(rng().random_range(0..=250));
                warn!(%failure, attempt, max = MAX_ATTEMPTS, ?delay, "Fetch attempt failed; backing off");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_fetch(client: &Client, fetch_url: &str, via_session: bool) -> Result<String, Attempt> {
    let response = client.get(fetch_url).send().await.map_err(classify_transport)?;

    // A gated page answered with the login page means the cookie died.
    if via_session && webvpn::is_login_redirect(response.url().as_str()) {
        return Err(Attempt::Permanent(FetchFailure::AuthExpired));
    }

    let status = response.status();
    if status.is_server_error() {
        return Err(Attempt::Transient(FetchFailure::Http(status.as_u16())));
    }
    if !status.is_success() {
        return Err(Attempt::Permanent(FetchFailure::Http(status.as_u16())));
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = response.bytes().await.map_err(classify_transport)?;
    Ok(decode_html(&bytes, content_type.as_deref()))
}

/// Decode a fetched body to text, honoring its declared charset.
///
/// WebPlus pages still serve GBK/GB2312 here and there, sometimes with no
/// charset in the Content-Type header at all; decoding those as UTF-8
/// would mojibake every Chinese title straight into the persisted feed.
/// Precedence: header charset, then a `<meta charset>` sniffed from the
/// head of the body, then UTF-8.
pub fn decode_html(bytes: &[u8], content_type: Option<&str>) -> String {
    let label = content_type
        .and_then(charset_label)
        .or_else(|| charset_label(&String::from_utf8_lossy(&bytes[..bytes.len().min(META_SNIFF_WINDOW)])));
    let encoding = label
        .as_deref()
        .and_then(|l| Encoding::for_label(l.as_bytes()))
        .unwrap_or(UTF_8);
    let (text, actual, had_errors) = encoding.decode(bytes);
    if had_errors {
        debug!(encoding = actual.name(), "Body decoded with replacement characters");
    }
    text.into_owned()
}

fn charset_label(text: &str) -> Option<String> {
    CHARSET_RE.captures(text).map(|caps| caps[1].to_string())
}

fn classify_transport(error: reqwest::Error) -> Attempt {
    if let Some(status) = error.status() {
        return Attempt::Permanent(FetchFailure::Http(status.as_u16()));
    }
    // Timeouts, resets, DNS hiccups: all transient, all retried the same.
    Attempt::Transient(FetchFailure::Timeout)
}
