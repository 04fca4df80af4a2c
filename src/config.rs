use crate::error::{IngestError, Result};
use crate::rate_limiter::Limits;
use crate::retry::RetryPolicy;
use crate::types::{normalize_channel_name, Channel};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

static CHANNEL_NAME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{3,64}$").ok());

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Defaults to `<data_root>/warehouse.db`
    #[serde(default)]
    pub warehouse_path: Option<PathBuf>,
    pub source: SourceConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default = "default_true")]
    pub download_media: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages: None,
            download_media: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub requests_per_min: Option<u64>,
    #[serde(default)]
    pub bytes_per_min: Option<u64>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_min: None,
            bytes_per_min: None,
            concurrency: default_concurrency(),
        }
    }
}

impl RateLimitConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            requests_per_min: self.requests_per_min,
            bytes_per_min: self.bytes_per_min,
            concurrency: Some(self.concurrency),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// Detector program; enrichment is unavailable when unset
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Per-image limit; a detector still running after this is killed
    #[serde(default = "default_detector_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            batch_size: default_batch_size(),
            timeout_seconds: default_detector_timeout_seconds(),
        }
    }
}

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_token_env() -> String {
    "SOURCE_API_TOKEN".to_string()
}
fn default_page_size() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> u32 {
    3
}
fn default_batch_size() -> usize {
    50
}
fn default_detector_timeout_seconds() -> u64 {
    120
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: AppConfig = toml::from_str(content)?;
        for channel in &mut config.channels {
            channel.name = normalize_channel_name(&channel.name);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            let valid = CHANNEL_NAME
                .as_ref()
                .is_some_and(|re| re.is_match(&channel.name));
            if !valid {
                return Err(IngestError::Config(format!(
                    "invalid channel name '{}'",
                    channel.name
                )));
            }
            if !seen.insert(channel.name.as_str()) {
                return Err(IngestError::Config(format!(
                    "channel '{}' is configured twice",
                    channel.name
                )));
            }
        }
        if self.scrape.page_size == 0 {
            return Err(IngestError::Config("scrape.page_size must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IngestError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn warehouse_path(&self) -> PathBuf {
        self.warehouse_path
            .clone()
            .unwrap_or_else(|| self.data_root.join("warehouse.db"))
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source.timeout_seconds)
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs(self.enrichment.timeout_seconds.max(1))
    }

    /// The source bearer token. Missing tokens are a configuration error.
    pub fn source_token(&self) -> Result<String> {
        std::env::var(&self.source.token_env).map_err(|_| {
            IngestError::Config(format!(
                "environment variable {} is not set",
                self.source.token_env
            ))
        })
    }

    /// Enabled channels, optionally narrowed to a comma-separated selection.
    pub fn select_channels(&self, only: Option<&str>) -> Vec<Channel> {
        let wanted: Option<HashSet<String>> =
            only.map(|list| list.split(',').map(normalize_channel_name).collect());
        self.channels
            .iter()
            .filter(|c| c.enabled)
            .filter(|c| wanted.as_ref().map_or(true, |w| w.contains(&c.name)))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        data_root = "/var/lib/channel_ingest"

        [source]
        base_url = "https://api.example.test/v1"

        [retry]
        max_attempts = 3
        base_delay_ms = 1000
        max_delay_ms = 10000
        multiplier = 2.0

        [[channels]]
        name = "@CheMed123"

        [[channels]]
        name = "lobelia4cosmetics"
        enabled = false
    "#;

    #[test]
    fn parses_and_normalizes() {
        let cfg = AppConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(cfg.channels[0].name, "CheMed123");
        assert_eq!(cfg.scrape.page_size, 100);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(
            cfg.warehouse_path(),
            PathBuf::from("/var/lib/channel_ingest/warehouse.db")
        );
        assert_eq!(cfg.select_channels(None).len(), 1);
        assert!(cfg.select_channels(Some("lobelia4cosmetics")).is_empty());
    }

    #[test]
    fn rejects_bad_and_duplicate_channels() {
        let dup = format!("{SAMPLE}\n[[channels]]\nname = \"CheMed123\"\n");
        assert!(matches!(AppConfig::from_toml(&dup), Err(IngestError::Config(_))));

        let bad = SAMPLE.replace("@CheMed123", "no spaces allowed");
        assert!(matches!(AppConfig::from_toml(&bad), Err(IngestError::Config(_))));
    }

    #[test]
    fn missing_source_is_a_config_error() {
        assert!(AppConfig::from_toml("data_root = \"x\"").is_err());
    }
}
