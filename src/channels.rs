use std::time::Duration;

use tracing::{debug, info};

use crate::Result;
use crate::model::ChannelInfo;
use crate::slack::SlackApi;
use crate::store::SqliteStore;

const PAGE_PAUSE: Duration = Duration::from_secs(1);

/// Refresh the channel directory from the workspace listing.
///
/// Archived channels are dropped. Returns how many channels were stored.
pub async fn sync_channels(api: &dyn SlackApi, store: &SqliteStore) -> Result<usize> {
    let mut channels: Vec<ChannelInfo> = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let page = api.list_channels(cursor.as_deref()).await?;
        debug!(count = page.items.len(), "fetched channel page");
        channels.extend(page.items.into_iter().filter(|c| !c.is_archived));

        match page.next_cursor {
            Some(next) => {
                cursor = Some(next);
                tokio::time::sleep(PAGE_PAUSE).await;
            }
            None => break,
        }
    }

    let stored = store.upsert_channels(channels).await?;
    info!(channels = stored, "channel directory synced");
    Ok(stored)
}
