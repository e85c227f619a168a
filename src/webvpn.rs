//! WebVPN gateway session management.
//!
//! The campus WebVPN (`webvpn.zju.edu.cn`) fronts intranet-only hosts behind
//! a reverse proxy. It has its own login endpoint and does not bounce the
//! client through the campus CAS (that exchange happens server-to-server),
//! which is what makes it reachable from outside the campus network.
//!
//! # Login Flow
//!
//! 1. `GET /login` → grab the hidden `_csrf` token from the form
//! 2. `POST /do-login` with credentials + token → session cookie on success
//! 3. Probe a known gated URL and confirm it is not a login redirect
//!
//! The flow is modeled as an explicit state machine ([`LoginFlow`]) whose
//! transitions are pure functions of the observed response, so every step
//! is unit-testable without a live gateway.

use crate::fetch::browser_client;
use crate::models::Credential;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

const LOGIN_PAGE_URL: &str = "https://webvpn.zju.edu.cn/login";
const DO_LOGIN_URL: &str = "https://webvpn.zju.edu.cn/do-login";
const GATEWAY_PREFIX: &str = "https://webvpn.zju.edu.cn";

/// Scheme + remainder of a plain URL, e.g. `http` / `cspo.zju.edu.cn/86671/list.htm`.
static URL_PARTS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(https?)://(.+)$").unwrap());

/// Why session establishment failed. No variant implies partial success;
/// a failed establishment leaves nothing behind to reuse.
#[derive(Debug, Error)]
pub enum AuthFailure {
    /// The gateway rejected the username/password pair.
    #[error("invalid_credentials: {0}")]
    InvalidCredentials(String),
    /// A network-level failure during one of the login steps.
    #[error("network_error: {0}")]
    Network(String),
    /// A response did not match the expected page shape (missing token,
    /// unparseable reply, probe bounced back to the login page).
    #[error("unexpected_page_shape: {0}")]
    UnexpectedPageShape(String),
}

/// Map a plain intranet URL onto the gateway's proxy path scheme.
///
/// `http://cspo.zju.edu.cn/86671/list.htm` →
/// `https://webvpn.zju.edu.cn/http/cspo.zju.edu.cn/86671/list.htm`
///
/// Pure and deterministic; URLs that are not plain http(s) pass through
/// unchanged (the registry never contains any, but the fetcher must not
/// panic on one).
pub fn rewrite_url(plain_url: &str) -> String {
    match URL_PARTS_RE.captures(plain_url) {
        Some(caps) => format!("{GATEWAY_PREFIX}/{}/{}", &caps[1], &caps[2]),
        None => {
            warn!(url = %plain_url, "URL did not match the proxy rewrite pattern");
            plain_url.to_string()
        }
    }
}

/// True when a response's final URL landed on the WebVPN or CAS login page,
/// i.e. the request was answered with a login redirect instead of content.
pub fn is_login_redirect(final_url: &str) -> bool {
    final_url.contains("webvpn.zju.edu.cn/login") || final_url.contains("ids.zju.edu.cn/cas/login")
}

/// Reply shape of `POST /do-login`: `{"e":0,...}` on success,
/// `{"e":N,"m":"reason"}` on rejection.
#[derive(Debug, Deserialize)]
struct DoLoginReply {
    e: i64,
    #[serde(default)]
    m: Option<String>,
}

/// The login protocol as a state machine. Each transition consumes one
/// observed response and either advances or fails; there is no way to
/// reach [`LoginFlow::Verified`] without passing every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginFlow {
    NotStarted,
    TokenFetched { csrf: String },
    Submitted,
    Verified,
}

impl LoginFlow {
    /// `NotStarted` → `TokenFetched`: extract the hidden `_csrf` input from
    /// the login page's form markup.
    pub fn after_login_page(self, html: &str) -> Result<LoginFlow, AuthFailure> {
        if !matches!(&self, LoginFlow::NotStarted) {
            return Err(out_of_order(&self));
        }
        let document = Html::parse_document(html);
        let csrf_selector = Selector::parse(r#"input[name="_csrf"]"#).unwrap();
        let csrf = document
            .select(&csrf_selector)
            .find_map(|input| input.value().attr("value"))
            .ok_or_else(|| {
                AuthFailure::UnexpectedPageShape("_csrf token not found in login page".to_string())
            })?;
        Ok(LoginFlow::TokenFetched { csrf: csrf.to_string() })
    }

    /// `TokenFetched` → `Submitted`: classify the `/do-login` reply.
    ///
    /// A non-JSON body is tolerated as long as the final URL moved off the
    /// login page (older gateway builds replied with a plain redirect).
    pub fn after_submit(self, body: &str, final_url: &str) -> Result<LoginFlow, AuthFailure> {
        if !matches!(&self, LoginFlow::TokenFetched { .. }) {
            return Err(out_of_order(&self));
        }
        match serde_json::from_str::<DoLoginReply>(body) {
            Ok(reply) if reply.e == 0 => Ok(LoginFlow::Submitted),
            Ok(reply) => Err(AuthFailure::InvalidCredentials(
                reply.m.unwrap_or_else(|| format!("e={}", reply.e)),
            )),
            Err(_) if is_login_redirect(final_url) => Err(AuthFailure::InvalidCredentials(
                format!("bounced back to login page ({final_url})"),
            )),
            Err(_) => Ok(LoginFlow::Submitted),
        }
    }

    /// `Submitted` → `Verified`: the probe request must land on real
    /// content, not a login redirect. Re-probing an already verified
    /// session (a new destination host) is the same transition.
    pub fn after_probe(self, final_url: &str) -> Result<LoginFlow, AuthFailure> {
        match self {
            LoginFlow::Submitted | LoginFlow::Verified => {}
            other => return Err(out_of_order(&other)),
        }
        if is_login_redirect(final_url) {
            Err(AuthFailure::UnexpectedPageShape(format!(
                "probe redirected to login ({final_url})"
            )))
        } else {
            Ok(LoginFlow::Verified)
        }
    }
}

fn out_of_order(state: &LoginFlow) -> AuthFailure {
    AuthFailure::UnexpectedPageShape(format!("login flow out of order (at {state:?})"))
}

/// How the aggregator obtains gateway sessions.
///
/// The production implementation is [`WebVpnGateway`]; tests substitute
/// scripted implementations to drive the run-level session logic (initial
/// login, the single re-establishment) without a live gateway.
pub trait SessionProvider {
    async fn establish(
        &self,
        credential: &Credential,
        probe_url: &str,
    ) -> Result<VpnSession, AuthFailure>;
}

/// The real gateway: full login flow against `webvpn.zju.edu.cn`.
#[derive(Debug)]
pub struct WebVpnGateway;

impl SessionProvider for WebVpnGateway {
    async fn establish(
        &self,
        credential: &Credential,
        probe_url: &str,
    ) -> Result<VpnSession, AuthFailure> {
        VpnSession::establish(credential, probe_url).await
    }
}

/// An established, probe-verified gateway session.
///
/// Owns the one cookie-bearing client for the run. Scoped to a single
/// Aggregator invocation and never persisted or shared across runs.
pub struct VpnSession {
    client: Client,
    pub established_at: DateTime<Utc>,
    /// Hosts already confirmed reachable through this session. Gateway
    /// session scoping (per-host vs. global) is undocumented, so every new
    /// destination host is probe-verified before its first gated fetch.
    verified_hosts: HashSet<String>,
}

impl VpnSession {
    /// Run the full login flow and return a verified session.
    ///
    /// `probe_url` is a plain gated URL known to require authentication;
    /// establishment only succeeds once it is reachable through the proxy.
    #[instrument(level = "info", skip_all)]
    pub async fn establish(
        credential: &Credential,
        probe_url: &str,
    ) -> Result<VpnSession, AuthFailure> {
        let client = browser_client(true)
            .map_err(|e| AuthFailure::Network(format!("client build failed: {e}")))?;

        info!("Fetching WebVPN login page");
        let response = client
            .get(LOGIN_PAGE_URL)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthFailure::Network(e.to_string()))?;
        let login_html = response
            .text()
            .await
            .map_err(|e| AuthFailure::Network(e.to_string()))?;

        let flow = LoginFlow::NotStarted.after_login_page(&login_html)?;
        let csrf = match &flow {
            LoginFlow::TokenFetched { csrf } => csrf.clone(),
            other => return Err(out_of_order(other)),
        };
        debug!("Extracted _csrf token from login page");

        info!("Submitting credentials to WebVPN /do-login");
        let response = client
            .post(DO_LOGIN_URL)
            .form(&[
                ("_csrf", csrf.as_str()),
                ("auth_type", "local"),
                ("username", credential.username.as_str()),
                ("password", credential.password.as_str()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AuthFailure::Network(e.to_string()))?;
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| AuthFailure::Network(e.to_string()))?;
        let flow = flow.after_submit(&body, &final_url)?;
        debug!(?flow, "Credentials accepted by gateway");

        // The gateway needs a beat before the cookie is usable everywhere.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut session = VpnSession {
            client,
            established_at: Utc::now(),
            verified_hosts: HashSet::new(),
        };
        session.verify_host(probe_url).await?;
        info!(established_at = %session.established_at, "WebVPN session established and probe-verified");
        Ok(session)
    }

    /// Probe-verify that `plain_url`'s host is reachable through this
    /// session, caching the answer. Cheap no-op for already-verified hosts.
    #[instrument(level = "debug", skip(self))]
    pub async fn verify_host(&mut self, plain_url: &str) -> Result<(), AuthFailure> {
        let host = host_of(plain_url);
        if self.verified_hosts.contains(&host) {
            return Ok(());
        }
        let proxied = rewrite_url(plain_url);
        let response = self
            .client
            .get(&proxied)
            .send()
            .await
            .map_err(|e| AuthFailure::Network(e.to_string()))?;
        LoginFlow::Submitted.after_probe(response.url().as_str())?;
        debug!(%host, "Destination host verified through gateway");
        self.verified_hosts.insert(host);
        Ok(())
    }

    /// The cookie-bearing client all session-routed requests must use.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A session that never touched the network, with the given hosts
    /// already marked verified. Building a client performs no I/O.
    #[cfg(test)]
    pub(crate) fn offline(verified_hosts: &[&str]) -> VpnSession {
        VpnSession {
            client: browser_client(true).expect("offline client"),
            established_at: Utc::now(),
            verified_hosts: verified_hosts.iter().map(|h| h.to_string()).collect(),
        }
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_url_http() {
        assert_eq!(
            rewrite_url("http://cspo.zju.edu.cn/86671/list.htm"),
            "https://webvpn.zju.edu.cn/http/cspo.zju.edu.cn/86671/list.htm"
        );
    }

    #[test]
    fn test_rewrite_url_https() {
        assert_eq!(
            rewrite_url("https://grs.zju.edu.cn/notice/list.htm"),
            "https://webvpn.zju.edu.cn/https/grs.zju.edu.cn/notice/list.htm"
        );
    }

    #[test]
    fn test_rewrite_url_deterministic() {
        let plain = "http://cspo.zju.edu.cn/86671/list2.htm";
        assert_eq!(rewrite_url(plain), rewrite_url(plain));
    }

    #[test]
    fn test_rewrite_url_unrecognized_passthrough() {
        assert_eq!(rewrite_url("ftp://example.com/x"), "ftp://example.com/x");
    }

    #[test]
    fn test_csrf_extraction() {
        let html = r#"
            <html><body><form action="/do-login" method="post">
                <input type="hidden" name="_csrf" value="abc-123-def"/>
                <input type="text" name="username"/>
            </form></body></html>
        "#;
        let flow = LoginFlow::NotStarted.after_login_page(html).unwrap();
        assert_eq!(flow, LoginFlow::TokenFetched { csrf: "abc-123-def".to_string() });
    }

    #[test]
    fn test_csrf_missing_is_page_shape_failure() {
        let html = "<html><body><p>maintenance window</p></body></html>";
        let err = LoginFlow::NotStarted.after_login_page(html).unwrap_err();
        assert!(matches!(err, AuthFailure::UnexpectedPageShape(_)));
    }

    fn token_fetched() -> LoginFlow {
        LoginFlow::TokenFetched { csrf: "abc".to_string() }
    }

    #[test]
    fn test_submit_reply_success() {
        let flow = token_fetched().after_submit(r#"{"e":0,"m":"","d":null}"#, DO_LOGIN_URL).unwrap();
        assert_eq!(flow, LoginFlow::Submitted);
    }

    #[test]
    fn test_submit_reply_rejected() {
        let err = token_fetched()
            .after_submit(r#"{"e":1,"m":"用户名或密码错误"}"#, DO_LOGIN_URL)
            .unwrap_err();
        match err {
            AuthFailure::InvalidCredentials(msg) => assert!(msg.contains("用户名或密码错误")),
            other => panic!("wrong failure kind: {other:?}"),
        }
    }

    #[test]
    fn test_submit_non_json_still_on_login_page() {
        let err = token_fetched()
            .after_submit("<html>login</html>", "https://webvpn.zju.edu.cn/login?err=1")
            .unwrap_err();
        assert!(matches!(err, AuthFailure::InvalidCredentials(_)));
    }

    #[test]
    fn test_submit_non_json_redirected_away() {
        let flow = token_fetched()
            .after_submit("<html>portal</html>", "https://webvpn.zju.edu.cn/portal")
            .unwrap();
        assert_eq!(flow, LoginFlow::Submitted);
    }

    #[test]
    fn test_probe_detects_login_redirect() {
        let err = LoginFlow::Submitted
            .after_probe("https://webvpn.zju.edu.cn/login?redirect=x")
            .unwrap_err();
        assert!(matches!(err, AuthFailure::UnexpectedPageShape(_)));

        let err = LoginFlow::Submitted
            .after_probe("https://ids.zju.edu.cn/cas/login?service=y")
            .unwrap_err();
        assert!(matches!(err, AuthFailure::UnexpectedPageShape(_)));
    }

    #[test]
    fn test_probe_accepts_real_content_url() {
        let flow = LoginFlow::Submitted
            .after_probe("https://webvpn.zju.edu.cn/http/cspo.zju.edu.cn/86671/list.htm")
            .unwrap();
        assert_eq!(flow, LoginFlow::Verified);

        // Re-probing an already verified session is allowed (new host).
        let flow = flow
            .after_probe("https://webvpn.zju.edu.cn/http/grs.zju.edu.cn/notice/list.htm")
            .unwrap();
        assert_eq!(flow, LoginFlow::Verified);
    }

    #[test]
    fn test_transitions_reject_out_of_order_states() {
        let err = LoginFlow::Submitted.after_login_page("<html></html>").unwrap_err();
        assert!(matches!(err, AuthFailure::UnexpectedPageShape(_)));

        let err = LoginFlow::NotStarted.after_submit("{}", DO_LOGIN_URL).unwrap_err();
        assert!(matches!(err, AuthFailure::UnexpectedPageShape(_)));

        let err = LoginFlow::NotStarted.after_probe("https://x").unwrap_err();
        assert!(matches!(err, AuthFailure::UnexpectedPageShape(_)));
    }
}
