use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::HarvestError;

const ENV_PREFIX: &str = "HARVEST";

/// Runtime settings, read from an optional file and then `HARVEST_*` env vars.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub service_name: String,
    pub source_uri_template: String,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default)]
    pub queue_url: Option<String>,
    #[serde(default = "default_content_selector")]
    pub content_selector: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/harvester.sqlite")
}

fn default_queue_name() -> String {
    "documents".to_string()
}

fn default_content_selector() -> String {
    "article.item".to_string()
}

fn default_poll_interval() -> u64 {
    2 * 60 * 60
}

fn default_retry_backoff() -> u64 {
    15 * 60
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self, HarvestError> {
        Self::load_layered(file, config::Environment::with_prefix(ENV_PREFIX))
    }

    /// File first, then `env` on top of it.
    fn load_layered(file: Option<&Path>, env: config::Environment) -> Result<Self, HarvestError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }
        let settings: Settings = builder
            .add_source(env)
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| HarvestError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), HarvestError> {
        if self.service_name.trim().is_empty() {
            return Err(HarvestError::Config("service_name is empty".into()));
        }
        if self.queue_name.trim().is_empty() {
            return Err(HarvestError::Config("queue_name is empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(HarvestError::Config(
                "poll_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
