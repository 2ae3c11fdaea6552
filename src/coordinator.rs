//! Fans channel ingestors out under a worker ceiling and joins their tallies.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::ingest::{ChannelIngestor, ChannelOutcome, IngestReport};
use crate::model::ReactionTally;
use crate::settings::IngestConfig;
use crate::slack::SlackApi;
use crate::store::{ProgressStore, ReactionSink};
use crate::{AppError, Result};

/// How one channel ended inside an aggregation run.
#[derive(Debug, Clone)]
pub enum ChannelResult {
    Finished(IngestReport),
    /// The ingestor returned an error or its task died.
    Failed(String),
}

impl ChannelResult {
    pub fn is_failure(&self) -> bool {
        match self {
            ChannelResult::Finished(report) => {
                matches!(report.outcome, ChannelOutcome::Aborted { .. })
            }
            ChannelResult::Failed(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub run_id: Uuid,
    /// One entry per requested channel; failed channels map to an empty tally.
    pub tallies: BTreeMap<String, ReactionTally>,
    pub results: BTreeMap<String, ChannelResult>,
}

impl AggregateReport {
    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_failure())
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.non_failed(|tally| !tally.is_empty())
    }

    /// Channels that finished without error but saw no reactions.
    pub fn empty(&self) -> Vec<&str> {
        self.non_failed(|tally| tally.is_empty())
    }

    fn non_failed(&self, keep: impl Fn(&ReactionTally) -> bool) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| !result.is_failure())
            .filter(|(id, _)| self.tallies.get(id.as_str()).is_some_and(&keep))
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn combined(&self) -> ReactionTally {
        let mut total = ReactionTally::new();
        for tally in self.tallies.values() {
            total.merge(tally);
        }
        total
    }
}

pub struct Aggregator {
    api: Arc<dyn SlackApi>,
    progress: Arc<dyn ProgressStore>,
    sink: Arc<dyn ReactionSink>,
    config: IngestConfig,
    cancel: CancellationToken,
}

impl Aggregator {
    pub fn new(
        api: Arc<dyn SlackApi>,
        progress: Arc<dyn ProgressStore>,
        sink: Arc<dyn ReactionSink>,
        config: IngestConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            progress,
            sink,
            config,
            cancel,
        }
    }

    /// Ingest every channel with at most `max_workers` running at once.
    ///
    /// Only a bad configuration fails the call; per-channel failures land in
    /// the report.
    pub async fn aggregate(
        &self,
        channel_ids: &[String],
        days: u32,
        max_workers: usize,
    ) -> Result<AggregateReport> {
        let config = IngestConfig {
            retention_days: days,
            max_workers,
            ..self.config.clone()
        };
        config.validate()?;

        let run_id = Uuid::new_v4();
        let span = info_span!("aggregate", %run_id);
        self.run(run_id, config, channel_ids).instrument(span).await
    }

    async fn run(
        &self,
        run_id: Uuid,
        config: IngestConfig,
        channel_ids: &[String],
    ) -> Result<AggregateReport> {
        let channels: BTreeSet<&String> = channel_ids.iter().collect();
        info!(
            channels = channels.len(),
            workers = config.max_workers,
            days = config.retention_days,
            "starting aggregation"
        );

        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        let mut tasks = JoinSet::new();
        for channel_id in &channels {
            let mut ingestor = ChannelIngestor::new(
                channel_id.as_str(),
                Arc::clone(&self.api),
                Arc::clone(&self.progress),
                Arc::clone(&self.sink),
                &config,
                self.cancel.clone(),
            );
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(
                async move {
                    let channel_id = ingestor.channel_id().to_string();
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => ingestor.run().await,
                        Err(_) => Err(AppError::Cancelled),
                    };
                    (channel_id, result)
                }
                .in_current_span(),
            );
        }

        let mut tallies = BTreeMap::new();
        let mut results = BTreeMap::new();
        let mut last_join_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((channel_id, Ok(report))) => {
                    tallies.insert(channel_id.clone(), report.tally.clone());
                    results.insert(channel_id, ChannelResult::Finished(report));
                }
                Ok((channel_id, Err(err))) => {
                    error!(channel = %channel_id, error = %err, "channel failed");
                    tallies.insert(channel_id.clone(), ReactionTally::new());
                    results.insert(channel_id, ChannelResult::Failed(err.to_string()));
                }
                Err(err) => {
                    error!(error = %err, "ingestor task died");
                    last_join_error = Some(AppError::Join(err.to_string()));
                }
            }
        }

        // A task that panicked cannot report its channel id.
        if let Some(err) = last_join_error {
            for channel_id in channels {
                if !results.contains_key(channel_id.as_str()) {
                    tallies.insert(channel_id.clone(), ReactionTally::new());
                    results.insert(channel_id.clone(), ChannelResult::Failed(err.to_string()));
                }
            }
        }

        let report = AggregateReport {
            run_id,
            tallies,
            results,
        };
        let failed = report.failed();
        if !failed.is_empty() {
            warn!(channels = ?failed, "channels failed");
        }
        info!(
            succeeded = report.succeeded().len(),
            failed = failed.len(),
            empty = report.empty().len(),
            "aggregation finished"
        );
        Ok(report)
    }
}
