//! Scripted Slack API used by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::model::{
    ChannelInfo, MessageRecord, Page, Position, ReactionEntry, ReactionRecord, SlackMessage,
};
use crate::slack::{ApiError, ApiResult, SlackApi};
use crate::store::{ReactionSink, SqliteStore};
use crate::{AppError, Result};

pub(crate) fn msg(ts: &str) -> SlackMessage {
    SlackMessage {
        position: Position::from(ts),
        user: Some("U0".to_string()),
        thread_position: None,
        reply_count: 0,
        reactions: Vec::new(),
    }
}

/// Timestamp `offset` seconds after a base one day in the past, so it falls
/// inside any retention window used by the tests.
pub(crate) fn recent_ts(offset: i64) -> String {
    static BASE: OnceLock<i64> = OnceLock::new();
    let base = *BASE.get_or_init(|| Utc::now().timestamp() - 86_400);
    format!("{}.000100", base + offset)
}

pub(crate) trait MessageExt {
    /// Attach reactions; each gets `count` distinct users.
    fn reacted(self, reactions: &[(&str, u64)]) -> Self;
    fn thread_root(self, reply_count: u64) -> Self;
    fn reply_to(self, root: &str) -> Self;
}

impl MessageExt for SlackMessage {
    fn reacted(mut self, reactions: &[(&str, u64)]) -> Self {
        self.reactions = reactions
            .iter()
            .map(|(name, count)| ReactionEntry {
                name: name.to_string(),
                count: *count,
                users: (1..=*count).map(|i| format!("U{}", i)).collect(),
            })
            .collect();
        self
    }

    fn thread_root(mut self, reply_count: u64) -> Self {
        self.thread_position = Some(self.position.clone());
        self.reply_count = reply_count;
        self
    }

    fn reply_to(mut self, root: &str) -> Self {
        self.thread_position = Some(Position::from(root));
        self
    }
}

struct FailureRule {
    key: String,
    page: usize,
    error: ApiError,
    remaining: Option<usize>,
}

#[derive(Default)]
struct FixtureState {
    channels: HashMap<String, Vec<SlackMessage>>,
    threads: HashMap<String, Vec<SlackMessage>>,
    failures: Vec<FailureRule>,
    calls: HashMap<String, usize>,
    directory: Vec<Vec<ChannelInfo>>,
    emojis: BTreeMap<String, String>,
}

impl FixtureState {
    fn take_failure(&mut self, key: &str, page: usize) -> Option<ApiError> {
        let rule = self
            .failures
            .iter_mut()
            .find(|r| r.key == key && r.page == page && r.remaining != Some(0))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.error.clone())
    }

    fn record_call(&mut self, key: &str) {
        *self.calls.entry(key.to_string()).or_insert(0) += 1;
    }
}

fn history_key(channel: &str) -> String {
    format!("history:{}", channel)
}

fn thread_key(channel: &str, root: &str) -> String {
    format!("thread:{}:{}", channel, Position::from(root))
}

/// Serves channel history with offset cursors, oldest-first unless
/// [`FixtureApi::newest_first`] is set.
#[derive(Default)]
pub(crate) struct FixtureApi {
    state: Mutex<FixtureState>,
    newest_first: bool,
    latency: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FixtureApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_channel(mut self, channel: &str, mut messages: Vec<SlackMessage>) -> Self {
        messages.sort_by(|a, b| a.position.cmp(&b.position));
        self.state.get_mut().channels.insert(channel.to_string(), messages);
        self
    }

    /// Deliver history pages newest message first, as Slack does for
    /// `oldest`-bounded requests.
    pub(crate) fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    /// Replies under `root`; the listing starts with the root itself.
    pub(crate) fn with_thread(
        mut self,
        channel: &str,
        root: &str,
        replies: Vec<SlackMessage>,
    ) -> Self {
        let mut listing = vec![msg(root).thread_root(replies.len() as u64)];
        listing.extend(replies.into_iter().map(|r| r.reply_to(root)));
        self.state
            .get_mut()
            .threads
            .insert(thread_key(channel, root), listing);
        self
    }

    /// Fail history page `page` (0-based) `times` times, or forever with `None`.
    pub(crate) fn fail_history(
        mut self,
        channel: &str,
        page: usize,
        error: ApiError,
        times: Option<usize>,
    ) -> Self {
        self.state.get_mut().failures.push(FailureRule {
            key: history_key(channel),
            page,
            error,
            remaining: times,
        });
        self
    }

    pub(crate) fn fail_thread(
        mut self,
        channel: &str,
        root: &str,
        page: usize,
        error: ApiError,
        times: Option<usize>,
    ) -> Self {
        self.state.get_mut().failures.push(FailureRule {
            key: thread_key(channel, root),
            page,
            error,
            remaining: times,
        });
        self
    }

    pub(crate) fn with_directory(mut self, pages: Vec<Vec<ChannelInfo>>) -> Self {
        self.state.get_mut().directory = pages;
        self
    }

    pub(crate) fn with_emojis(mut self, emojis: &[(&str, &str)]) -> Self {
        self.state.get_mut().emojis = emojis
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    /// Hold every history call open for `latency` so overlap is observable.
    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Most history calls that were ever in progress at once.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn history_calls(&self, channel: &str) -> usize {
        self.state
            .lock()
            .calls
            .get(&history_key(channel))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn thread_calls(&self, channel: &str, root: &str) -> usize {
        self.state
            .lock()
            .calls
            .get(&thread_key(channel, root))
            .copied()
            .unwrap_or(0)
    }

    fn serve_history(
        &self,
        channel_id: &str,
        oldest: &Position,
        cursor: Option<&str>,
        limit: u16,
    ) -> ApiResult<Page<SlackMessage>> {
        let mut state = self.state.lock();
        let key = history_key(channel_id);
        state.record_call(&key);
        let Some(messages) = state.channels.get(channel_id) else {
            return Err(ApiError::new("channel_not_found"));
        };
        let mut visible: Vec<SlackMessage> = messages
            .iter()
            .filter(|m| &m.position > oldest)
            .cloned()
            .collect();
        if self.newest_first {
            visible.reverse();
        }
        let (page_index, page) = paginate(&visible, cursor, limit);
        if let Some(error) = state.take_failure(&key, page_index) {
            return Err(error);
        }
        Ok(page)
    }
}

fn paginate(
    items: &[SlackMessage],
    cursor: Option<&str>,
    limit: u16,
) -> (usize, Page<SlackMessage>) {
    let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
    let limit = limit.max(1) as usize;
    let end = (start + limit).min(items.len());
    let page_items = items.get(start..end).map(|s| s.to_vec()).unwrap_or_default();
    let next_cursor = (end < items.len()).then(|| end.to_string());
    (
        start / limit,
        Page {
            items: page_items,
            next_cursor,
        },
    )
}

#[async_trait]
impl SlackApi for FixtureApi {
    async fn list_messages(
        &self,
        channel_id: &str,
        oldest: &Position,
        cursor: Option<&str>,
        limit: u16,
    ) -> ApiResult<Page<SlackMessage>> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = self.serve_history(channel_id, oldest, cursor, limit);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list_thread_replies(
        &self,
        channel_id: &str,
        thread: &Position,
        cursor: Option<&str>,
        limit: u16,
    ) -> ApiResult<Page<SlackMessage>> {
        let mut state = self.state.lock();
        let key = thread_key(channel_id, thread.as_str());
        state.record_call(&key);
        let Some(listing) = state.threads.get(&key) else {
            return Err(ApiError::new("thread_not_found"));
        };
        let (page_index, page) = paginate(listing, cursor, limit);
        if let Some(error) = state.take_failure(&key, page_index) {
            return Err(error);
        }
        Ok(page)
    }

    async fn list_channels(&self, cursor: Option<&str>) -> ApiResult<Page<ChannelInfo>> {
        let state = self.state.lock();
        let index: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let items = state.directory.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < state.directory.len()).then(|| (index + 1).to_string());
        Ok(Page { items, next_cursor })
    }

    async fn list_custom_emojis(&self) -> ApiResult<BTreeMap<String, String>> {
        Ok(self.state.lock().emojis.clone())
    }
}

/// Sink over a [`SqliteStore`] that rejects its first `failures` batches.
pub(crate) struct FlakySink {
    inner: Arc<SqliteStore>,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakySink {
    pub(crate) fn new(inner: Arc<SqliteStore>, failures: usize) -> Self {
        Self {
            inner,
            failures,
            attempts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReactionSink for FlakySink {
    async fn write_batch(
        &self,
        messages: &[MessageRecord],
        reactions: &[ReactionRecord],
    ) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(AppError::Io(std::io::Error::other("disk full")));
        }
        self.inner.write_batch(messages, reactions).await
    }

    async fn ensure_channel(&self, channel_id: &str) -> Result<()> {
        self.inner.ensure_channel(channel_id).await
    }
}
