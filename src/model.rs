//! Typed records shared by the API client, the ingestion engine and the store.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Slack message timestamp ("1767636991.559059").
///
/// Ordering is numeric on the seconds and microseconds parts, so
/// "10.5" sorts after "9.9". Values that do not parse fall back to
/// plain string ordering.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(format!("{}.{:06}", dt.timestamp(), dt.timestamp_subsec_micros()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric_key(&self) -> Option<(u64, u64)> {
        let (secs, frac) = match self.0.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (self.0.as_str(), ""),
        };
        let secs: u64 = secs.parse().ok()?;
        if frac.len() > 6 || !frac.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let micros = if frac.is_empty() {
            0
        } else {
            format!("{:0<6}", frac).parse().ok()?
        };
        Some((secs, micros))
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric_key(), other.numeric_key()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Position {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Row key of a stored message: `{channel_id}-{position}`.
pub fn composite_id(channel_id: &str, position: &Position) -> String {
    format!("{}-{}", channel_id, position)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: String,
    pub is_private: bool,
    pub is_archived: bool,
}

/// One emoji on a message as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionEntry {
    pub name: String,
    /// Aggregate count reported by the API; may exceed `users.len()`
    /// because Slack truncates the user list.
    pub count: u64,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackMessage {
    pub position: Position,
    pub user: Option<String>,
    pub thread_position: Option<Position>,
    pub reply_count: u64,
    pub reactions: Vec<ReactionEntry>,
}

impl SlackMessage {
    pub fn has_reactions(&self) -> bool {
        !self.reactions.is_empty()
    }

    /// Root of a thread that has at least one reply.
    pub fn is_thread_root(&self) -> bool {
        self.reply_count > 0 && self.thread_position.as_ref() == Some(&self.position)
    }

    /// A reply that was also broadcast to the channel history.
    pub fn is_broadcast_reply(&self) -> bool {
        matches!(&self.thread_position, Some(thread) if thread != &self.position)
    }
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, Default)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: String,
    pub channel_id: String,
    pub author_id: Option<String>,
    pub position: Position,
    pub is_reply: bool,
    pub parent_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    pub message_id: String,
    pub emoji_name: String,
    pub user_id: String,
    pub position: Position,
}

/// Emoji name to summed reaction count for one channel run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ReactionTally(BTreeMap<String, u64>);

impl ReactionTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, emoji: &str, count: u64) {
        *self.0.entry(emoji.to_string()).or_insert(0) += count;
    }

    pub fn merge(&mut self, other: &ReactionTally) {
        for (emoji, count) in &other.0 {
            self.add(emoji, *count);
        }
    }

    pub fn get(&self, emoji: &str) -> u64 {
        self.0.get(emoji).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Entries sorted by count descending, then name.
    pub fn ranked(&self) -> Vec<(&str, u64)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }
}

impl<const N: usize> From<[(&str, u64); N]> for ReactionTally {
    fn from(entries: [(&str, u64); N]) -> Self {
        let mut tally = Self::new();
        for (emoji, count) in entries {
            tally.add(emoji, count);
        }
        tally
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressCheckpoint {
    pub channel_id: String,
    pub last_message_position: Option<Position>,
    pub last_thread_position: Option<Position>,
    pub completed: bool,
    pub started_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Partial checkpoint write. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub last_message_position: Option<Position>,
    pub last_thread_position: Option<Position>,
    pub completed: Option<bool>,
}

impl ProgressUpdate {
    pub fn message(position: Position) -> Self {
        Self {
            last_message_position: Some(position),
            ..Self::default()
        }
    }

    pub fn thread(position: Position) -> Self {
        Self {
            last_thread_position: Some(position),
            ..Self::default()
        }
    }

    pub fn completed(mut self, completed: bool) -> Self {
        self.completed = Some(completed);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub channel_id: String,
    pub display_name: String,
    pub reaction_row_count: u64,
    pub last_updated: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStatus {
    pub completed: Vec<ChannelStatus>,
    pub in_progress: Vec<ChannelStatus>,
}
