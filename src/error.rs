use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Transient source error for {channel}: {message}")]
    TransientSource { channel: String, message: String },

    #[error("Scrape failed for {channel} after {attempts} attempt(s): {message}")]
    ScrapeFailure {
        channel: String,
        attempts: u32,
        message: String,
    },

    #[error("Checkpoint for {channel} cannot move from {stored} back to {attempted}")]
    InvalidCursor {
        channel: String,
        stored: i64,
        attempted: i64,
    },

    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),

    #[error("Load failed for partition {partition}: {message}")]
    LoadFailure { partition: String, message: String },

    #[error("Enrichment failed for {channel}/{external_id}: {message}")]
    EnrichmentFailure {
        channel: String,
        external_id: i64,
        message: String,
    },

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Shared state lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Reasons a raw record is rejected by the loader or the scraper.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("line is not valid JSON: {0}")]
    Unparseable(String),

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has an invalid value: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("timestamp `{0}` could not be parsed")]
    BadTimestamp(String),

    #[error("payload is malformed: {0}")]
    MalformedPayload(String),

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u32),

    #[error("schema violation: {0}")]
    Schema(String),
}

/// Classified failure returned by a message source adapter.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("rate limited by source")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("permanent source failure: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::Permanent(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        // Network-level errors are worth retrying; decoding errors are not.
        if err.is_decode() {
            SourceError::Permanent(err.to_string())
        } else {
            SourceError::Transient(err.to_string())
        }
    }
}
