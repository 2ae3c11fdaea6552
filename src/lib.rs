pub mod backoff;
pub mod channels;
pub mod cli;
pub mod commands;
pub mod coordinator;
pub mod emoji;
pub mod error;
pub mod fetcher;
pub mod ingest;
pub mod model;
pub mod settings;
pub mod slack;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use cli::{Cli, Commands};
pub use coordinator::{AggregateReport, Aggregator, ChannelResult};
pub use error::{AppError, Result};
pub use ingest::{ChannelIngestor, ChannelOutcome, IngestReport, IngestState};
pub use model::{Position, ReactionTally};
pub use settings::{IngestConfig, Settings};
pub use slack::{SlackApi, SlackWebClient};
pub use store::SqliteStore;

pub fn load_token() -> Result<String> {
    std::env::var("SLACK_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty())
        .ok_or(AppError::MissingToken)
}
