use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::channels::sync_channels;
use crate::coordinator::{AggregateReport, Aggregator, ChannelResult};
use crate::emoji::{display_emoji, export_custom_emojis};
use crate::error::{AppError, Result};
use crate::ingest::ChannelOutcome;
use crate::load_token;
use crate::model::{ChannelInfo, ChannelStatus, ReactionTally};
use crate::settings::Settings;
use crate::slack::SlackWebClient;
use crate::store::SqliteStore;

const TOP_REACTIONS: usize = 10;

pub fn run_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(AppError::InvalidConfig(format!(
            "{} already exists; pass --force to replace it",
            path.display()
        )));
    }
    Settings::default().save(path)?;
    println!("Default settings written to {}", path.display());
    Ok(())
}

async fn connect() -> Result<SlackWebClient> {
    let client = SlackWebClient::new(&load_token()?)?;
    let user = client.verify_credentials().await?;
    tracing::debug!(user = %user, "authenticated");
    Ok(client)
}

pub async fn run_sync_channels(settings: &Settings) -> Result<()> {
    let client = connect().await?;
    let store = SqliteStore::open(&settings.database.path)?;

    println!("Syncing channels into {}...", settings.database.path.display());

    let count = sync_channels(&client, &store).await?;

    println!("Sync completed successfully! {} channels stored.", count);
    print_channels(&store.list_channels().await?);
    Ok(())
}

fn print_channels(channels: &[ChannelInfo]) {
    for channel in channels {
        println!("  {}", channel_line(channel));
    }
}

fn channel_line(channel: &ChannelInfo) -> String {
    let visibility = if channel.is_private { "private" } else { "public" };
    format!("{} #{} ({})", channel.id, channel.name, visibility)
}

pub async fn run_aggregate(
    settings: &Settings,
    channels: Vec<String>,
    days: Option<u32>,
    workers: Option<usize>,
    cancel: CancellationToken,
) -> Result<()> {
    let config = settings.ingest_config();
    let days = days.unwrap_or(config.retention_days);
    let workers = workers.unwrap_or(config.max_workers);
    let client = connect().await?;
    let store = Arc::new(SqliteStore::open(&settings.database.path)?);

    let channels = if channels.is_empty() {
        store
            .list_channels()
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect()
    } else {
        channels
    };
    if channels.is_empty() {
        return Err(AppError::InvalidConfig(
            "no channels given and none synced; run sync-channels first".to_string(),
        ));
    }

    println!(
        "Aggregating reactions for {} channels over the last {} days with {} workers...",
        channels.len(),
        days,
        workers
    );

    let aggregator = Aggregator::new(
        Arc::new(client),
        store.clone(),
        store,
        config,
        cancel,
    );
    let report = aggregator.aggregate(&channels, days, workers).await?;

    print_aggregate(&report);
    Ok(())
}

fn print_aggregate(report: &AggregateReport) {
    println!();
    for (channel_id, result) in &report.results {
        let status = match result {
            ChannelResult::Finished(ingest) => match &ingest.outcome {
                ChannelOutcome::Completed => format!(
                    "completed ({} messages, {} reactions)",
                    ingest.messages_processed, ingest.reactions_recorded
                ),
                ChannelOutcome::AlreadyCompleted => "already completed".to_string(),
                ChannelOutcome::Aborted { reason } => format!("aborted: {}", reason),
            },
            ChannelResult::Failed(error) => format!("failed: {}", error),
        };
        println!("{}: {}", channel_id, status);
        if let Some(tally) = report.tallies.get(channel_id) {
            print_tally(tally, "  ");
        }
    }

    let combined = report.combined();
    println!();
    println!("All channels ({} reactions):", combined.total());
    print_tally(&combined, "  ");

    println!();
    println!(
        "{} succeeded, {} failed, {} without reactions.",
        report.succeeded().len(),
        report.failed().len(),
        report.empty().len()
    );
    let failed = report.failed();
    if !failed.is_empty() {
        println!(
            "Failed channels resume from their checkpoint on the next run: {}",
            failed.join(", ")
        );
    }
}

fn print_tally(tally: &ReactionTally, indent: &str) {
    for (emoji, count) in tally.ranked().into_iter().take(TOP_REACTIONS) {
        println!("{}{} {}", indent, display_emoji(emoji), count);
    }
    if tally.len() > TOP_REACTIONS {
        println!("{}... and {} more", indent, tally.len() - TOP_REACTIONS);
    }
}

pub async fn run_status(settings: &Settings) -> Result<()> {
    let store = SqliteStore::open(&settings.database.path)?;
    let status = store.get_processing_status().await?;

    println!("Completed channels ({}):", status.completed.len());
    print_status_rows(&status.completed);
    println!();
    println!("In progress ({}):", status.in_progress.len());
    print_status_rows(&status.in_progress);
    Ok(())
}

fn print_status_rows(rows: &[ChannelStatus]) {
    if rows.is_empty() {
        println!("  (none)");
    }
    for row in rows {
        println!(
            "  {} #{}: {} reactions, updated {}",
            row.channel_id,
            row.display_name,
            row.reaction_row_count,
            row.last_updated.as_deref().unwrap_or("never")
        );
    }
}

pub async fn run_reset(settings: &Settings, channel_id: &str) -> Result<()> {
    let store = SqliteStore::open(&settings.database.path)?;

    if store.reset_progress(channel_id).await? {
        println!("Checkpoint for {} removed; the next run fetches it again.", channel_id);
    } else {
        println!("No checkpoint stored for {}.", channel_id);
    }
    Ok(())
}

pub async fn run_export_emojis(output: &Path) -> Result<()> {
    let client = SlackWebClient::new(&load_token()?)?;

    println!("Exporting custom emojis to {}...", output.display());

    let (exported, aliases) = export_custom_emojis(&client, output).await?;

    println!(
        "Export completed successfully! {} emojis exported, {} aliases skipped.",
        exported, aliases
    );
    Ok(())
}
