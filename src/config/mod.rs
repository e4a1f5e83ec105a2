//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! unparsable. The database URL is wrapped in secrecy::SecretString to
//! keep credentials out of logs.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::worker::WorkerConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    /// Service name attached to exported telemetry.
    pub service_name: String,
    pub log_level: String,
    /// Queue carrying one message per track.
    pub item_queue: String,
    /// Queue receiving one event per completed job.
    pub completion_queue: String,
    /// Queue receiving messages that will never succeed.
    pub dead_letter_queue: String,
    /// Maximum messages per batch.
    pub batch_size: usize,
    /// Maximum time to wait for a batch to start filling.
    pub batch_wait: Duration,
    /// How long a read message stays hidden before redelivery.
    pub visibility_timeout: Duration,
    /// Deliveries after which a retryable failure is dead-lettered.
    pub max_deliveries: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            service_name: var_or("OTEL_SERVICE_NAME", "chartflow"),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            item_queue: var_or("ITEM_QUEUE", "track_items"),
            completion_queue: var_or("COMPLETION_QUEUE", "job_completed"),
            dead_letter_queue: var_or("DEAD_LETTER_QUEUE", "track_items_dlq"),
            batch_size: parsed_var("BATCH_SIZE", 10)?,
            batch_wait: Duration::from_secs(parsed_var("BATCH_WAIT_SECS", 5)?),
            visibility_timeout: Duration::from_secs(parsed_var("VISIBILITY_TIMEOUT_SECS", 60)?),
            max_deliveries: parsed_var("MAX_DELIVERIES", 3)?,
        })
    }

    /// Worker loop settings derived from this configuration.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            item_queue: self.item_queue.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
            batch_size: self.batch_size,
            batch_wait: self.batch_wait,
            visibility_timeout: self.visibility_timeout,
            max_deliveries: self.max_deliveries,
            ..WorkerConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
        Err(_) => Ok(default),
    }
}
