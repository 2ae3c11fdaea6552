//! One channel's resumable backfill.
//!
//! The ingestor walks the channel history from its resume bound, descends
//! into every thread root that has not been walked yet, and folds reactions
//! into a [`ReactionTally`] while buffering rows for the [`ReactionSink`].
//! Progress is checkpointed so an interrupted run picks up close to where it
//! stopped.

use std::cmp;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::fetcher::{FetchError, PageFetcher};
use crate::model::{
    MessageRecord, Position, ProgressUpdate, ReactionRecord, ReactionTally, SlackMessage,
    composite_id,
};
use crate::settings::IngestConfig;
use crate::slack::SlackApi;
use crate::store::{ProgressStore, ReactionSink};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Idle,
    Resuming,
    FetchingMessages,
    FetchingThread,
    Flushing,
    Completed,
    Aborted,
}

/// Delivery order of channel history, learned from consecutive messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistoryOrder {
    Unknown,
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// History was exhausted and the checkpoint marked complete.
    Completed,
    /// The checkpoint was already complete; nothing was fetched.
    AlreadyCompleted,
    /// Top-level pagination failed; the tally is partial.
    Aborted { reason: String },
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub channel_id: String,
    pub tally: ReactionTally,
    pub outcome: ChannelOutcome,
    /// Top-level messages seen this run.
    pub messages_processed: usize,
    /// Per-user reaction edges handed to the sink this run.
    pub reactions_recorded: usize,
}

pub struct ChannelIngestor {
    channel_id: String,
    progress: Arc<dyn ProgressStore>,
    sink: Arc<dyn ReactionSink>,
    fetcher: PageFetcher,
    retention_days: u32,
    flush_every: usize,
    state: IngestState,
    tally: ReactionTally,
    pending_messages: Vec<MessageRecord>,
    pending_reactions: Vec<ReactionRecord>,
    since_flush: usize,
    messages_processed: usize,
    reactions_recorded: usize,
    // Newest position over every fully processed page.
    newest_seen: Option<Position>,
    // Message position safe to persist before the run completes.
    committed: Option<Position>,
    // Checkpoints move mid-run only once history is known to be ascending;
    // otherwise unfetched older messages and threads may remain.
    order: HistoryOrder,
    last_observed: Option<Position>,
    // Threads at or below this were walked by an earlier run.
    thread_fence: Option<Position>,
    fence_written: Option<Position>,
    // Newest walked thread not yet persisted as the fence.
    fence_pending: Option<Position>,
}

impl ChannelIngestor {
    pub fn new(
        channel_id: impl Into<String>,
        api: Arc<dyn SlackApi>,
        progress: Arc<dyn ProgressStore>,
        sink: Arc<dyn ReactionSink>,
        config: &IngestConfig,
        cancel: CancellationToken,
    ) -> Self {
        let channel_id = channel_id.into();
        let fetcher = PageFetcher::new(
            api,
            channel_id.clone(),
            config.max_retries,
            config.page_delay,
            config.page_size,
            cancel,
        );
        Self {
            channel_id,
            progress,
            sink,
            fetcher,
            retention_days: config.retention_days,
            flush_every: config.flush_every.max(1),
            state: IngestState::Idle,
            tally: ReactionTally::new(),
            pending_messages: Vec::new(),
            pending_reactions: Vec::new(),
            since_flush: 0,
            messages_processed: 0,
            reactions_recorded: 0,
            newest_seen: None,
            committed: None,
            order: HistoryOrder::Unknown,
            last_observed: None,
            thread_fence: None,
            fence_written: None,
            fence_pending: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.fetcher = self.fetcher.with_seed(seed);
        self
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn state(&self) -> IngestState {
        self.state
    }

    /// Run the channel to completion or abort.
    ///
    /// Fetch failures never surface as `Err`; they end the run with
    /// [`ChannelOutcome::Aborted`] and a partial tally. `Err` means the
    /// store itself failed at a point where the run cannot be trusted.
    pub async fn run(&mut self) -> Result<IngestReport> {
        let span = info_span!("channel", channel = %self.channel_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&mut self) -> Result<IngestReport> {
        self.transition(IngestState::Resuming);
        self.sink.ensure_channel(&self.channel_id).await?;
        let checkpoint = self.progress.read(&self.channel_id).await?;

        if checkpoint.as_ref().is_some_and(|c| c.completed) {
            info!("channel already completed, skipping");
            self.transition(IngestState::Completed);
            return Ok(self.report(ChannelOutcome::AlreadyCompleted));
        }

        let resume_from = checkpoint
            .as_ref()
            .and_then(|c| c.last_message_position.clone());
        self.thread_fence = checkpoint.and_then(|c| c.last_thread_position);
        self.fence_written = self.thread_fence.clone();
        self.committed = resume_from.clone();

        let cutoff = self.retention_cutoff();
        let oldest = match resume_from {
            Some(position) => cmp::max(position, cutoff),
            None => cutoff,
        };
        debug!(oldest = %oldest, fence = ?self.thread_fence, "resuming");

        match self.drain_history(&oldest).await {
            Ok(()) => {
                self.finish().await?;
                info!(
                    messages = self.messages_processed,
                    reactions = self.reactions_recorded,
                    "channel completed"
                );
                Ok(self.report(ChannelOutcome::Completed))
            }
            Err(error) => {
                warn!(error = %error, "aborting channel");
                self.abort().await;
                Ok(self.report(ChannelOutcome::Aborted {
                    reason: error.to_string(),
                }))
            }
        }
    }

    /// Oldest position inside the retention window; the epoch when the
    /// window reaches past what a timestamp can represent.
    fn retention_cutoff(&self) -> Position {
        TimeDelta::try_days(i64::from(self.retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .filter(|cutoff| cutoff.timestamp() >= 0)
            .map(Position::from_datetime)
            .unwrap_or_else(|| Position::from("0.000000"))
    }

    async fn drain_history(&mut self, oldest: &Position) -> std::result::Result<(), FetchError> {
        let mut cursor: Option<String> = None;
        loop {
            self.transition(IngestState::FetchingMessages);
            let page = self.fetcher.fetch_messages(oldest, cursor.as_deref()).await?;
            if page.items.is_empty() {
                return Ok(());
            }

            for message in &page.items {
                self.observe_order(&message.position).await;
                let parent = match &message.thread_position {
                    Some(thread) if message.is_broadcast_reply() => {
                        Some(composite_id(&self.channel_id, thread))
                    }
                    _ => None,
                };
                self.record(message, parent);

                if message.is_thread_root() && self.needs_walk(&message.position) {
                    self.transition(IngestState::FetchingThread);
                    match self.walk_thread(&message.position).await {
                        Ok(()) => self.advance_fence(&message.position).await,
                        Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                        Err(error) => {
                            warn!(thread = %message.position, error = %error, "skipping thread");
                        }
                    }
                    self.transition(IngestState::FetchingMessages);
                }

                self.messages_processed += 1;
                self.since_flush += 1;
                if self.since_flush >= self.flush_every {
                    if let Err(error) = self.flush().await {
                        warn!(error = %error, "flush failed, rows kept for the next flush");
                    }
                    self.transition(IngestState::FetchingMessages);
                }
            }

            self.commit_page(&page.items);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    fn needs_walk(&self, root: &Position) -> bool {
        match &self.thread_fence {
            Some(fence) => root > fence,
            None => true,
        }
    }

    async fn walk_thread(&mut self, root: &Position) -> std::result::Result<(), FetchError> {
        let parent_id = composite_id(&self.channel_id, root);
        let mut cursor: Option<String> = None;
        loop {
            let page = self.fetcher.fetch_replies(root, cursor.as_deref()).await?;
            for reply in page.items.iter().filter(|reply| &reply.position != root) {
                self.record(reply, Some(parent_id.clone()));
            }
            match page.next_cursor {
                Some(next) if !page.items.is_empty() => cursor = Some(next),
                _ => return Ok(()),
            }
        }
    }

    /// Record a fully walked thread. The fence is persisted right away only
    /// while history is ascending, since every older root has been seen.
    async fn advance_fence(&mut self, root: &Position) {
        if self.fence_pending.as_ref().is_none_or(|pending| root > pending) {
            self.fence_pending = Some(root.clone());
        }
        if self.order == HistoryOrder::Ascending {
            self.persist_fence().await;
        }
    }

    async fn persist_fence(&mut self) {
        let Some(root) = self.fence_pending.take() else {
            return;
        };
        if self.fence_written.as_ref().is_some_and(|fence| fence >= &root) {
            return;
        }
        match self
            .progress
            .write(&self.channel_id, ProgressUpdate::thread(root.clone()))
            .await
        {
            Ok(()) => {
                debug!(thread = %root, "thread fence advanced");
                self.fence_written = Some(root);
            }
            Err(error) => {
                warn!(thread = %root, error = %error, "could not persist thread fence");
                self.fence_pending = Some(root);
            }
        }
    }

    /// Buffer a message and its reactions if it has any.
    fn record(&mut self, message: &SlackMessage, parent_id: Option<String>) {
        if !message.has_reactions() {
            return;
        }
        let id = composite_id(&self.channel_id, &message.position);
        for reaction in &message.reactions {
            self.tally.add(&reaction.name, reaction.count);
            for user in &reaction.users {
                self.pending_reactions.push(ReactionRecord {
                    message_id: id.clone(),
                    emoji_name: reaction.name.clone(),
                    user_id: user.clone(),
                    position: message.position.clone(),
                });
                self.reactions_recorded += 1;
            }
        }
        self.pending_messages.push(MessageRecord {
            id,
            channel_id: self.channel_id.clone(),
            author_id: message.user.clone(),
            position: message.position.clone(),
            is_reply: parent_id.is_some(),
            parent_message_id: parent_id,
        });
    }

    async fn observe_order(&mut self, position: &Position) {
        let previous = self.last_observed.replace(position.clone());
        let Some(previous) = previous else {
            return;
        };
        let next = if position < &previous {
            HistoryOrder::Descending
        } else if position > &previous && self.order == HistoryOrder::Unknown {
            HistoryOrder::Ascending
        } else {
            self.order
        };
        if next == self.order {
            return;
        }
        debug!(order = ?next, "history order detected");
        self.order = next;
        if next == HistoryOrder::Ascending {
            self.persist_fence().await;
        }
    }

    fn commit_page(&mut self, items: &[SlackMessage]) {
        let page_newest = items.iter().map(|m| &m.position).max().cloned();
        self.newest_seen = match (self.newest_seen.take(), page_newest) {
            (Some(a), Some(b)) => Some(cmp::max(a, b)),
            (a, b) => a.or(b),
        };
        if self.order == HistoryOrder::Ascending && self.newest_seen.is_some() {
            self.committed = self.newest_seen.clone();
        }
    }

    /// Write pending rows, then move the message checkpoint to the last
    /// committed page. Rows stay buffered if the sink rejects them.
    async fn flush(&mut self) -> Result<()> {
        self.transition(IngestState::Flushing);
        self.since_flush = 0;
        self.sink
            .write_batch(&self.pending_messages, &self.pending_reactions)
            .await?;
        debug!(
            messages = self.pending_messages.len(),
            reactions = self.pending_reactions.len(),
            "flushed batch"
        );
        self.pending_messages.clear();
        self.pending_reactions.clear();

        if let Some(position) = self.committed.clone() {
            self.progress
                .write(&self.channel_id, ProgressUpdate::message(position))
                .await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.flush().await?;
        let fence = self
            .fence_pending
            .take()
            .filter(|root| self.fence_written.as_ref().is_none_or(|fence| root > fence));
        let update = ProgressUpdate {
            last_message_position: self.newest_seen.clone(),
            last_thread_position: fence,
            completed: None,
        }
        .completed(true);
        self.progress.write(&self.channel_id, update).await?;
        self.transition(IngestState::Completed);
        Ok(())
    }

    async fn abort(&mut self) {
        if let Err(error) = self.flush().await {
            warn!(error = %error, "final flush failed during abort");
        }
        let update = ProgressUpdate {
            last_message_position: self.committed.clone(),
            ..ProgressUpdate::default()
        }
        .completed(false);
        if let Err(error) = self.progress.write(&self.channel_id, update).await {
            warn!(error = %error, "could not checkpoint aborted channel");
        }
        self.transition(IngestState::Aborted);
    }

    fn transition(&mut self, next: IngestState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "state");
            self.state = next;
        }
    }

    fn report(&mut self, outcome: ChannelOutcome) -> IngestReport {
        IngestReport {
            channel_id: self.channel_id.clone(),
            tally: std::mem::take(&mut self.tally),
            outcome,
            messages_processed: self.messages_processed,
            reactions_recorded: self.reactions_recorded,
        }
    }
}
