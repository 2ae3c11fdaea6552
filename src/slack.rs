use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use slack_morphism::errors::SlackClientError;
use slack_morphism::prelude::*;

use crate::backoff::ErrorClass;
use crate::model::{ChannelInfo, Page, Position, ReactionEntry, SlackMessage};
use crate::{AppError, Result};

const PAGE_LIMIT: u16 = 200;

/// Error reported by a Slack API call, reduced to what the retry logic needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            code: "ratelimited".to_string(),
            retry_after,
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::from_code(&self.code)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.retry_after {
            Some(wait) => write!(f, "{} (retry after {}s)", self.code, wait.as_secs()),
            None => f.write_str(&self.code),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ApiError> for AppError {
    fn from(err: ApiError) -> Self {
        match err.retry_after {
            Some(wait) if err.class() == ErrorClass::RateLimited => AppError::SlackRateLimit {
                retry_after_secs: wait.as_secs(),
            },
            _ => AppError::SlackApi(err.code),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// The paginated Slack Web API calls the harvester depends on.
#[async_trait]
pub trait SlackApi: Send + Sync {
    /// One page of channel history newer than `oldest` (exclusive).
    async fn list_messages(
        &self,
        channel_id: &str,
        oldest: &Position,
        cursor: Option<&str>,
        limit: u16,
    ) -> ApiResult<Page<SlackMessage>>;

    /// One page of a thread. Slack includes the root message in the listing.
    async fn list_thread_replies(
        &self,
        channel_id: &str,
        thread: &Position,
        cursor: Option<&str>,
        limit: u16,
    ) -> ApiResult<Page<SlackMessage>>;

    async fn list_channels(&self, cursor: Option<&str>) -> ApiResult<Page<ChannelInfo>>;

    /// Custom emoji name to image URL, or `alias:<name>` for aliases.
    async fn list_custom_emojis(&self) -> ApiResult<BTreeMap<String, String>>;
}

pub struct SlackWebClient {
    client: SlackHyperClient,
    token: SlackApiToken,
}

impl SlackWebClient {
    pub fn new(token: &str) -> Result<Self> {
        let connector = SlackClientHyperConnector::new()
            .map_err(|e| AppError::SlackApi(format!("failed to create connector: {}", e)))?;
        Ok(Self {
            client: SlackClient::new(connector),
            token: SlackApiToken::new(SlackApiTokenValue(token.to_string())),
        })
    }

    /// Check the token before any work is scheduled. Returns the user id.
    pub async fn verify_credentials(&self) -> Result<String> {
        let session = self.client.open_session(&self.token);
        let response = session
            .auth_test()
            .await
            .map_err(|e| AppError::from(map_client_error(e)))?;
        Ok(response.user_id.0)
    }
}

#[async_trait]
impl SlackApi for SlackWebClient {
    async fn list_messages(
        &self,
        channel_id: &str,
        oldest: &Position,
        cursor: Option<&str>,
        limit: u16,
    ) -> ApiResult<Page<SlackMessage>> {
        let session = self.client.open_session(&self.token);
        let request = SlackApiConversationsHistoryRequest::new()
            .with_channel(SlackChannelId(channel_id.to_string()))
            .with_oldest(SlackTs(oldest.as_str().to_string()))
            .with_limit(limit)
            .opt_cursor(cursor.map(|c| SlackCursorId(c.to_string())));

        let response = session
            .conversations_history(&request)
            .await
            .map_err(map_client_error)?;

        Ok(Page {
            items: response.messages.iter().map(convert_message).collect(),
            next_cursor: next_cursor(response.response_metadata),
        })
    }

    async fn list_thread_replies(
        &self,
        channel_id: &str,
        thread: &Position,
        cursor: Option<&str>,
        limit: u16,
    ) -> ApiResult<Page<SlackMessage>> {
        let session = self.client.open_session(&self.token);
        let request = SlackApiConversationsRepliesRequest::new(
            SlackChannelId(channel_id.to_string()),
            SlackTs(thread.as_str().to_string()),
        )
        .with_limit(limit)
        .opt_cursor(cursor.map(|c| SlackCursorId(c.to_string())));

        let response = session
            .conversations_replies(&request)
            .await
            .map_err(map_client_error)?;

        Ok(Page {
            items: response.messages.iter().map(convert_message).collect(),
            next_cursor: next_cursor(response.response_metadata),
        })
    }

    async fn list_channels(&self, cursor: Option<&str>) -> ApiResult<Page<ChannelInfo>> {
        let session = self.client.open_session(&self.token);
        let request = SlackApiConversationsListRequest::new()
            .with_limit(PAGE_LIMIT)
            .with_types(vec![
                SlackConversationType::Public,
                SlackConversationType::Private,
            ])
            .opt_cursor(cursor.map(|c| SlackCursorId(c.to_string())));

        let response = session
            .conversations_list(&request)
            .await
            .map_err(map_client_error)?;

        let items = response
            .channels
            .into_iter()
            .map(|channel| ChannelInfo {
                id: channel.id.0.clone(),
                name: channel.name.clone().unwrap_or_else(|| "unknown".to_string()),
                is_private: channel.flags.is_private.unwrap_or(false),
                is_archived: channel.flags.is_archived.unwrap_or(false),
            })
            .collect();

        Ok(Page {
            items,
            next_cursor: next_cursor(response.response_metadata),
        })
    }

    async fn list_custom_emojis(&self) -> ApiResult<BTreeMap<String, String>> {
        let session = self.client.open_session(&self.token);
        let response = session.emoji_list().await.map_err(map_client_error)?;

        Ok(response
            .emoji
            .into_iter()
            .map(|(name, emoji)| {
                let value = match emoji {
                    SlackEmojiRef::Url(url) => url.to_string(),
                    SlackEmojiRef::Alias(alias) => format!("alias:{}", alias.0),
                };
                (name.0, value)
            })
            .collect())
    }
}

fn next_cursor(meta: Option<SlackResponseMetadata>) -> Option<String> {
    meta.and_then(|m| m.next_cursor)
        .map(|c| c.0)
        .filter(|c| !c.is_empty())
}

fn convert_message(message: &SlackHistoryMessage) -> SlackMessage {
    let reactions = message
        .content
        .reactions
        .as_ref()
        .map(|reactions| {
            reactions
                .iter()
                .map(|r| ReactionEntry {
                    name: r.name.0.clone(),
                    count: r.count as u64,
                    users: r.users.iter().map(|u| u.0.clone()).collect(),
                })
                .collect()
        })
        .unwrap_or_default();

    SlackMessage {
        position: Position::new(message.origin.ts.0.clone()),
        user: message.sender.user.as_ref().map(|u| u.0.clone()),
        thread_position: message
            .origin
            .thread_ts
            .as_ref()
            .map(|ts| Position::new(ts.0.clone())),
        reply_count: message.parent.reply_count.unwrap_or(0) as u64,
        reactions,
    }
}

fn map_client_error(err: SlackClientError) -> ApiError {
    match err {
        SlackClientError::RateLimitError(e) => ApiError::rate_limited(e.retry_after),
        SlackClientError::ApiError(e) => ApiError::new(e.code),
        SlackClientError::HttpError(_) | SlackClientError::HttpProtocolError(_) => {
            ApiError::new("transport_error")
        }
        other => ApiError::new(format!("client_error: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use slack_morphism::errors::{SlackClientApiError, SlackRateLimitError};

    use super::*;

    #[test]
    fn test_api_error_class() {
        assert_eq!(ApiError::new("timeout").class(), ErrorClass::Transient);
        assert_eq!(ApiError::rate_limited(None).class(), ErrorClass::RateLimited);
        assert_eq!(ApiError::new("is_archived").class(), ErrorClass::Terminal);
    }

    #[test]
    fn test_api_error_display() {
        assert_eq!(ApiError::new("not_in_channel").to_string(), "not_in_channel");
        assert_eq!(
            ApiError::rate_limited(Some(Duration::from_secs(12))).to_string(),
            "ratelimited (retry after 12s)"
        );
    }

    #[test]
    fn test_api_error_into_app_error() {
        let err: AppError = ApiError::rate_limited(Some(Duration::from_secs(30))).into();
        assert!(matches!(err, AppError::SlackRateLimit { retry_after_secs: 30 }));

        let err: AppError = ApiError::new("invalid_auth").into();
        assert_eq!(err.to_string(), "Slack API error: invalid_auth");
    }

    #[test]
    fn test_map_client_error_codes() {
        let api = SlackClientError::ApiError(SlackClientApiError {
            code: "channel_not_found".to_string(),
            errors: None,
            warnings: None,
            http_response_body: None,
        });
        assert_eq!(map_client_error(api).class(), ErrorClass::Terminal);

        let limited = SlackClientError::RateLimitError(SlackRateLimitError {
            retry_after: Some(Duration::from_secs(7)),
            code: None,
            warnings: None,
            http_response_body: None,
        });
        let mapped = map_client_error(limited);
        assert_eq!(mapped.class(), ErrorClass::RateLimited);
        assert_eq!(mapped.retry_after, Some(Duration::from_secs(7)));
    }
}
