use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

pub const SETTINGS_FILE: &str = "settings.toml";

/// Longest retention window accepted, about a century.
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("slack_reactions.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    pub days: u32,
    #[serde(rename = "max-workers")]
    pub max_workers: usize,
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
    #[serde(rename = "page-delay-ms")]
    pub page_delay_ms: u64,
    #[serde(rename = "flush-every")]
    pub flush_every: usize,
    #[serde(rename = "page-size")]
    pub page_size: u16,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            days: 365,
            max_workers: 8,
            max_retries: 5,
            page_delay_ms: 1200,
            flush_every: 200,
            page_size: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| AppError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| AppError::TomlParse(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| AppError::TomlSerialize(e.to_string()))?;
        fs::write(path, content).map_err(|e| AppError::WriteFile {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            retention_days: self.ingest.days,
            max_workers: self.ingest.max_workers,
            max_retries: self.ingest.max_retries,
            page_delay: Duration::from_millis(self.ingest.page_delay_ms),
            flush_every: self.ingest.flush_every,
            page_size: self.ingest.page_size,
        }
    }
}

/// Runtime knobs for one aggregation run, handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Messages older than this many days are never fetched.
    pub retention_days: u32,
    pub max_workers: usize,
    /// Attempts per page, including the first.
    pub max_retries: u32,
    /// Pause after every successful page.
    pub page_delay: Duration,
    /// Processed top-level messages between flushes.
    pub flush_every: usize,
    pub page_size: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Settings::default().ingest_config()
    }
}

impl IngestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(AppError::InvalidConfig(format!(
                "days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.max_workers == 0 {
            return Err(AppError::InvalidConfig(
                "max-workers must be at least 1".to_string(),
            ));
        }
        if self.max_workers > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(AppError::InvalidConfig(format!(
                "max-workers must be at most {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.max_retries == 0 {
            return Err(AppError::InvalidConfig(
                "max-retries must be at least 1".to_string(),
            ));
        }
        if self.flush_every == 0 {
            return Err(AppError::InvalidConfig(
                "flush-every must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 || self.page_size > 1000 {
            return Err(AppError::InvalidConfig(
                "page-size must be between 1 and 1000".to_string(),
            ));
        }
        Ok(())
    }
}
