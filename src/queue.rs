use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::db::Database;

const QUEUE_NAME_HEADER: &str = "X-Queue-Name";

/// Delivery queue that receives one JSON message per published document.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    async fn send(&self, body: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Posts messages to a network queue endpoint.
pub struct HttpQueue {
    client: reqwest::Client,
    url: String,
    queue_name: String,
}

impl HttpQueue {
    pub fn new(url: &str, queue_name: &str, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to build queue http client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            queue_name: queue_name.to_string(),
        })
    }
}

#[async_trait]
impl DeliveryQueue for HttpQueue {
    async fn send(&self, body: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(QUEUE_NAME_HEADER, &self.queue_name)
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("Failed to reach queue at {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("queue {} rejected message with status {}", self.queue_name, status);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.queue_name
    }
}

/// Outbox table in the local database, used when no queue endpoint is configured.
pub struct SqliteQueue {
    db: Arc<Database>,
    queue_name: String,
}

impl SqliteQueue {
    pub fn new(db: Arc<Database>, queue_name: &str) -> Self {
        Self {
            db,
            queue_name: queue_name.to_string(),
        }
    }
}

#[async_trait]
impl DeliveryQueue for SqliteQueue {
    async fn send(&self, body: &str) -> Result<()> {
        self.db.enqueue(&self.queue_name, body)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.queue_name
    }
}
