//! Feed document persistence.
//!
//! The feed JSON file is the sole artifact shared with the renderer and
//! the only thing that crosses run boundaries: it is read back as prior
//! state at startup and rewritten at the end of every run. Timestamps are
//! rendered in China Standard Time to match the sites being scraped.

use crate::models::FeedState;
use chrono::{DateTime, FixedOffset, Utc};
use std::error::Error;
use std::path::Path;
use tokio::fs;
use tracing::{info, instrument, warn};

/// Current time in China Standard Time (UTC+8).
pub fn cst_now() -> DateTime<FixedOffset> {
    let cst = FixedOffset::east_opt(8 * 3600).unwrap();
    Utc::now().with_timezone(&cst)
}

/// Load the previous run's feed from `path`.
///
/// A missing or unreadable file is a normal condition (first run, or a
/// renderer-side schema change) and yields an empty state, never an error.
#[instrument(level = "info")]
pub async fn load_prior(path: &str) -> FeedState {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<FeedState>(&contents) {
            Ok(state) => {
                info!(records = state.records.len(), "Loaded prior feed state");
                state
            }
            Err(error) => {
                warn!(%error, "Prior feed unreadable; starting from an empty state");
                FeedState::default()
            }
        },
        Err(_) => {
            info!("No prior feed found; starting from an empty state");
            FeedState::default()
        }
    }
}

/// Write the feed document to `path`, creating parent directories.
#[instrument(level = "info", skip(state))]
pub async fn write_feed(path: &str, state: &FeedState) -> Result<(), Box<dyn Error>> {
    let json = serde_json::to_string_pretty(state)?;

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    fs::write(path, json).await?;
    info!(path, records = state.records.len(), "Wrote feed document");
    Ok(())
}
