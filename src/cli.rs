//! Command-line interface definitions for the bulletin feed scraper.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! Credentials are only ever taken from the environment (they come in as
//! repository secrets on CI), everything else can also be a flag.

use crate::sources::DEFAULT_PAGES;
use clap::Parser;

/// Command-line arguments for the bulletin feed scraper.
///
/// # Examples
///
/// ```sh
/// # Default run: write (and reload prior state from) docs/data.json
/// bulletin_feed
///
/// # Custom output location and deeper pagination
/// bulletin_feed -o /srv/feed/data.json --pages 3
///
/// # With WebVPN access to gated boards
/// ZJU_USERNAME=... ZJU_PASSWORD=... bulletin_feed
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path of the JSON feed document; also read back as prior state
    #[arg(short, long, default_value = "docs/data.json")]
    pub output: String,

    /// List pages to fetch per source
    #[arg(short, long, default_value_t = DEFAULT_PAGES)]
    pub pages: u32,

    /// WebVPN username; unset means gated sources degrade to public feeds
    #[arg(long, env = "ZJU_USERNAME", hide_env_values = true)]
    pub username: Option<String>,

    /// WebVPN password
    #[arg(long, env = "ZJU_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}
