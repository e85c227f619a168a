//! # Bulletin Feed
//!
//! A scraping pipeline that collects notice/announcement listings from
//! several ZJU college websites and publishes one normalized, deduplicated
//! JSON feed for static-site rendering.
//!
//! ## Features
//!
//! - Scrapes WebPlus CMS list pages from multiple college bulletin boards
//! - Reaches campus-only boards through the WebVPN gateway when
//!   `ZJU_USERNAME`/`ZJU_PASSWORD` are set
//! - Degrades gracefully to public substitute feeds (clearly tagged) when
//!   authenticated access is unavailable
//! - Merges idempotently across daily runs: no duplicated or lost notices
//!
//! ## Usage
//!
//! ```sh
//! bulletin_feed -o docs/data.json
//! ```
//!
//! ## Architecture
//!
//! One run is a straight pipeline:
//! 1. **Session**: log in to WebVPN once, if credentials allow
//! 2. **Fetching**: walk each source's list pages with retry/backoff
//! 3. **Parsing**: extract title/date/link records per page
//! 4. **Merging**: dedup against the prior feed, sort, cap, write JSON

use chrono::Utc;
use clap::Parser;
use std::error::Error;
use tracing::{debug, info, instrument};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod aggregate;
mod cli;
mod degrade;
mod fetch;
mod models;
mod output;
mod parser;
mod sources;
mod webvpn;

use cli::Cli;
use models::Credential;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!(started_at = %Utc::now().to_rfc3339(), "bulletin_feed starting up");

    let args = Cli::parse();
    debug!(output = %args.output, pages = args.pages, "Parsed CLI arguments");

    let credential = Credential::from_parts(args.username.clone(), args.password.clone());
    info!(
        credential_present = credential.is_some(),
        "Credential check (gated sources degrade without one)"
    );

    let prior = output::load_prior(&args.output).await;

    let (state, reports) = aggregate::run(
        &fetch::HttpFetcher,
        &webvpn::WebVpnGateway,
        sources::SOURCES,
        &prior,
        credential.as_ref(),
        args.pages,
    )
    .await;

    // Partial source failure never fails the job; the statuses are the
    // machine-readable summary for whoever reads the CI logs.
    for report in &reports {
        info!(
            source = report.source_id,
            status = %report.status,
            scraped = report.scraped,
            "Source finished"
        );
    }

    output::write_feed(&args.output, &state).await?;

    let elapsed = start_time.elapsed();
    info!(
        total_records = state.records.len(),
        updated_at = %state.updated_at,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    Ok(())
}
