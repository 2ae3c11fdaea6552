//! Single-page Slack calls wrapped in classification, backoff and retry.

use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{self, ErrorClass};
use crate::model::{Page, Position, SlackMessage};
use crate::slack::{ApiError, SlackApi};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: ApiError },

    #[error("terminal API error: {0}")]
    Terminal(ApiError),

    #[error("unrecognized API error: {0}")]
    Unclassified(ApiError),

    #[error("cancelled")]
    Cancelled,
}

/// Which listing a fetch targets.
#[derive(Debug, Clone, Copy)]
pub enum PageRequest<'a> {
    History { oldest: &'a Position },
    Replies { thread: &'a Position },
}

impl PageRequest<'_> {
    fn describe(&self) -> String {
        match self {
            PageRequest::History { .. } => "history".to_string(),
            PageRequest::Replies { thread } => format!("thread {}", thread),
        }
    }
}

/// Sleep that returns early with `false` when `cancel` fires.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

pub struct PageFetcher {
    api: Arc<dyn SlackApi>,
    channel_id: String,
    max_attempts: u32,
    page_delay: Duration,
    page_size: u16,
    rng: StdRng,
    cancel: CancellationToken,
}

impl PageFetcher {
    pub fn new(
        api: Arc<dyn SlackApi>,
        channel_id: impl Into<String>,
        max_attempts: u32,
        page_delay: Duration,
        page_size: u16,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            channel_id: channel_id.into(),
            max_attempts,
            page_delay,
            page_size,
            rng: StdRng::from_entropy(),
            cancel,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub async fn fetch_messages(
        &mut self,
        oldest: &Position,
        cursor: Option<&str>,
    ) -> Result<Page<SlackMessage>, FetchError> {
        self.fetch(PageRequest::History { oldest }, cursor).await
    }

    pub async fn fetch_replies(
        &mut self,
        thread: &Position,
        cursor: Option<&str>,
    ) -> Result<Page<SlackMessage>, FetchError> {
        self.fetch(PageRequest::Replies { thread }, cursor).await
    }

    /// Fetch one page, re-requesting the same cursor on retryable errors.
    pub async fn fetch(
        &mut self,
        request: PageRequest<'_>,
        cursor: Option<&str>,
    ) -> Result<Page<SlackMessage>, FetchError> {
        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            attempt += 1;

            let result = match request {
                PageRequest::History { oldest } => {
                    self.api
                        .list_messages(&self.channel_id, oldest, cursor, self.page_size)
                        .await
                }
                PageRequest::Replies { thread } => {
                    self.api
                        .list_thread_replies(&self.channel_id, thread, cursor, self.page_size)
                        .await
                }
            };

            let error = match result {
                Ok(page) => {
                    // Pacing only; an interrupted pause still delivers the page.
                    sleep_or_cancel(self.page_delay, &self.cancel).await;
                    return Ok(page);
                }
                Err(error) => error,
            };

            let class = error.class();
            if !class.is_retryable() {
                return Err(match class {
                    ErrorClass::Terminal => FetchError::Terminal(error),
                    _ => FetchError::Unclassified(error),
                });
            }
            if attempt >= self.max_attempts {
                return Err(FetchError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let wait =
                backoff::wait_for(class, error.retry_after, &mut self.rng).unwrap_or_default();
            warn!(
                channel = %self.channel_id,
                listing = %request.describe(),
                code = %error.code,
                attempt,
                wait_secs = wait.as_secs_f64(),
                "retrying page fetch"
            );
            if !sleep_or_cancel(wait, &self.cancel).await {
                return Err(FetchError::Cancelled);
            }
            debug!(channel = %self.channel_id, attempt, "backoff finished");
        }
    }
}
