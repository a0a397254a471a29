use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::error::HarvestError;

const PLACEHOLDERS: [&str; 2] = ["{id}", "%d"];

/// Fetch address with exactly one integer placeholder (`{id}` or `%d`).
#[derive(Debug, Clone)]
pub struct UriTemplate {
    prefix: String,
    suffix: String,
}

impl UriTemplate {
    pub fn parse(template: &str) -> Result<Self, HarvestError> {
        let mut found = PLACEHOLDERS
            .iter()
            .flat_map(|p| template.match_indices(p).map(move |(i, _)| (i, p.len())))
            .filter(|&(i, len)| !is_percent_escape(template, i, len));
        let (at, len) = found.next().ok_or_else(|| {
            HarvestError::Config(format!(
                "uri template {:?} has no `{{id}}` or `%d` placeholder",
                template
            ))
        })?;
        if found.next().is_some() {
            return Err(HarvestError::Config(format!(
                "uri template {:?} has more than one placeholder",
                template
            )));
        }
        Ok(Self {
            prefix: template[..at].to_string(),
            suffix: template[at + len..].to_string(),
        })
    }

    pub fn render(&self, sequence: u64) -> String {
        format!("{}{}{}", self.prefix, sequence, self.suffix)
    }
}

/// `%d` followed by a hex digit is an escape such as `%de`, not a placeholder.
fn is_percent_escape(template: &str, at: usize, len: usize) -> bool {
    template[at..].starts_with('%')
        && template[at + len..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_hexdigit())
}

/// What the archive returned for one sequence id.
#[derive(Debug)]
pub enum FetchOutcome {
    Found { uri: String, body: Vec<u8> },
    /// Any non-200 status: the end of what is currently published.
    NotFound { uri: String, status: u16 },
}

/// Connection-level failure; the cycle aborts without touching the checkpoint.
#[derive(Debug, Error)]
#[error("request to {uri} failed")]
pub struct FetchError {
    pub uri: String,
    #[source]
    pub source: reqwest::Error,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, sequence: u64) -> Result<FetchOutcome, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    template: UriTemplate,
}

impl HttpFetcher {
    pub fn new(
        template: UriTemplate,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, HarvestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| HarvestError::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self { client, template })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, sequence: u64) -> Result<FetchOutcome, FetchError> {
        let uri = self.template.render(sequence);
        let response = match self.client.get(&uri).send().await {
            Ok(r) => r,
            Err(source) => return Err(FetchError { uri, source }),
        };

        let status = response.status();
        if status != StatusCode::OK {
            debug!("{} returned {}", uri, status);
            return Ok(FetchOutcome::NotFound {
                uri,
                status: status.as_u16(),
            });
        }

        match response.bytes().await {
            Ok(body) => Ok(FetchOutcome::Found {
                uri,
                body: body.to_vec(),
            }),
            Err(source) => Err(FetchError { uri, source }),
        }
    }
}
