use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::settings::SETTINGS_FILE;

#[derive(Parser)]
#[command(name = "slack-reactions")]
#[command(about = "Resumable harvesting and aggregation of Slack reactions")]
pub struct Cli {
    /// Settings file
    #[arg(short, long, default_value = SETTINGS_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a settings file with the default values to --config
    InitConfig {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },

    /// Refresh the local channel directory from Slack
    SyncChannels,

    /// Harvest reactions and print per-channel tallies
    Aggregate {
        /// Channel id to ingest; repeatable. Defaults to every synced channel
        #[arg(short, long = "channel")]
        channels: Vec<String>,

        /// Lookback window in days, defaults to the configured value
        #[arg(short, long)]
        days: Option<u32>,

        /// Concurrent channels, defaults to the configured value
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show completed and in-progress channels
    Status,

    /// Forget a channel's checkpoint so the next run fetches it again
    Reset {
        #[arg(short, long)]
        channel: String,
    },

    /// Export custom emojis from Slack
    ExportEmojis {
        /// Output JSON file path for emoji data
        #[arg(short, long, default_value = "emojis.json")]
        output: PathBuf,
    },
}
