use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Which half of the dual-sink publish failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    RecordStore,
    Queue,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::RecordStore => f.write_str("record store"),
            SinkKind::Queue => f.write_str("delivery queue"),
        }
    }
}

/// Why a fetched page could not be turned into text.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no element matches content selector `{selector}`")]
    NoContentFound { selector: String },
    #[error("failed to convert content region to text: {0}")]
    Parse(String),
}

/// Errors that end a harvest cycle early.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read checkpoint for `{source_id}`")]
    Storage {
        source_id: String,
        #[source]
        source: BoxError,
    },

    #[error("transport error fetching #{sequence} ({uri})")]
    Transport {
        sequence: u64,
        uri: String,
        #[source]
        source: BoxError,
    },

    #[error("unexpected content at #{sequence} ({uri})")]
    ContentFormat {
        sequence: u64,
        uri: String,
        #[source]
        kind: ExtractError,
    },

    #[error("{sink} write failed for #{sequence} ({uri})")]
    Sink {
        sequence: u64,
        uri: String,
        sink: SinkKind,
        #[source]
        source: BoxError,
    },

    #[error("published #{sequence} but failed to advance checkpoint")]
    Checkpoint {
        sequence: u64,
        #[source]
        source: BoxError,
    },
}

impl HarvestError {
    /// Fatal errors stop the process; everything else is retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HarvestError::Config(_))
    }

    /// Sequence id the cycle was working on when it failed, if any.
    pub fn sequence(&self) -> Option<u64> {
        match self {
            HarvestError::Transport { sequence, .. }
            | HarvestError::ContentFormat { sequence, .. }
            | HarvestError::Sink { sequence, .. }
            | HarvestError::Checkpoint { sequence, .. } => Some(*sequence),
            HarvestError::Config(_) | HarvestError::Storage { .. } => None,
        }
    }
}
