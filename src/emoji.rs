use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::slack::SlackApi;
use crate::{AppError, Result};

const ALIAS_PREFIX: &str = "alias:";

/// Write the workspace's custom emojis as `{name: url}` JSON, skipping aliases.
///
/// Returns `(exported, aliases_skipped)`.
pub async fn export_custom_emojis(
    api: &dyn SlackApi,
    output_path: &Path,
) -> Result<(usize, usize)> {
    let all = api.list_custom_emojis().await?;
    let total = all.len();

    let images: BTreeMap<String, String> = all
        .into_iter()
        .filter(|(_, url)| !url.starts_with(ALIAS_PREFIX))
        .collect();
    let aliases = total - images.len();

    write_json(output_path, &images)?;
    info!(exported = images.len(), aliases, "custom emojis exported");
    Ok((images.len(), aliases))
}

fn write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let file = File::create(path).map_err(|e| AppError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)
        .map_err(|e| AppError::JsonSerialize(e.to_string()))?;
    writer.flush()?;
    Ok(())
}

/// Glyph for a standard reaction name, `:name:` for anything custom.
pub fn display_emoji(name: &str) -> String {
    let base = name.split("::skin-tone-").next().unwrap_or(name);
    match emojis::get_by_shortcode(base) {
        Some(emoji) => emoji.to_string(),
        None => format!(":{}:", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureApi;

    #[test]
    fn test_display_emoji_standard() {
        assert_eq!(display_emoji("tada"), "🎉");
    }

    #[test]
    fn test_display_emoji_strips_skin_tone() {
        assert_eq!(display_emoji("wave::skin-tone-3"), display_emoji("wave"));
        assert_eq!(display_emoji("wave"), "👋");
    }

    #[test]
    fn test_display_emoji_custom() {
        assert_eq!(display_emoji("partyparrot"), ":partyparrot:");
    }

    #[tokio::test]
    async fn test_export_skips_aliases() {
        let api = FixtureApi::new().with_emojis(&[
            ("partyparrot", "https://emoji.example/partyparrot.gif"),
            ("parrot", "alias:partyparrot"),
            ("shipit", "https://emoji.example/shipit.png"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emojis.json");

        let (exported, aliases) = export_custom_emojis(&api, &path).await.unwrap();

        assert_eq!((exported, aliases), (2, 1));
        let written: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(!written.contains_key("parrot"));
    }

    #[tokio::test]
    async fn test_export_reports_unwritable_path() {
        let api = FixtureApi::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("emojis.json");

        let err = export_custom_emojis(&api, &path).await.unwrap_err();

        assert!(matches!(err, AppError::WriteFile { .. }));
    }
}
