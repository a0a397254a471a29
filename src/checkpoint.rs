use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::db::Database;

/// Durable record of the last sequence id published for each source.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns `None` when the source has never been seeded.
    async fn load(&self, source_id: &str) -> Result<Option<u64>>;

    async fn store(&self, source_id: &str, last_sequence: u64) -> Result<()>;
}

#[async_trait]
impl CheckpointStore for Database {
    async fn load(&self, source_id: &str) -> Result<Option<u64>> {
        match self.last_id(source_id)? {
            Some(raw) => {
                let value = raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("checkpoint for `{}` is not an integer: {:?}", source_id, raw))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn store(&self, source_id: &str, last_sequence: u64) -> Result<()> {
        self.set_last_id(source_id, &last_sequence.to_string())
    }
}

/// Result of an operator seed request.
#[derive(Debug, PartialEq, Eq)]
pub enum SeedOutcome {
    Created,
    Updated { previous: u64 },
    Unchanged,
    /// The new value is lower than the stored one and `force` was not set.
    Refused { current: u64 },
}

/// Pre-seeds (or moves) a source's checkpoint.
///
/// Moving a checkpoint backwards re-harvests and republishes documents, so it
/// requires `force`.
pub async fn seed(
    store: &dyn CheckpointStore,
    source_id: &str,
    last_sequence: u64,
    force: bool,
) -> Result<SeedOutcome> {
    let outcome = match store.load(source_id).await? {
        None => SeedOutcome::Created,
        Some(current) if current == last_sequence => return Ok(SeedOutcome::Unchanged),
        Some(current) if current > last_sequence && !force => {
            return Ok(SeedOutcome::Refused { current })
        }
        Some(previous) => SeedOutcome::Updated { previous },
    };
    store.store(source_id, last_sequence).await?;
    Ok(outcome)
}
