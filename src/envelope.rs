use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::DocumentRow;

/// Separator between the lower-cased service and the id in the `mp` key.
const MP_SEPARATOR: &str = "_ms:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Web,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Web => "web",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub channel: Channel,
    pub source_uri: String,
    pub sender_name: String,
    pub sender_uri: String,
}

/// Canonical harvested document, published to both sinks.
///
/// Serializes to the queue message shape:
/// `{id, service, created_at, raw_message, source: {channel, source_uri, sender_name, sender_uri}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub service: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "raw_message")]
    pub raw_content: String,
    pub source: SourceRef,
}

impl Envelope {
    /// Builds a fresh envelope for a web page. Every call mints a new id.
    pub fn build(service: &str, extracted_text: String, source_uri: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: service.to_string(),
            created_at: Utc::now().trunc_subsecs(0),
            raw_content: extracted_text,
            source: SourceRef {
                channel: Channel::Web,
                source_uri: source_uri.to_string(),
                sender_name: String::new(),
                sender_uri: String::new(),
            },
        }
    }

    /// Service-scoped secondary key: `lowercase(service)_ms:<id>`.
    pub fn mp(&self) -> String {
        format!("{}{}{}", self.service.to_lowercase(), MP_SEPARATOR, self.id)
    }

    pub fn created_at_rfc3339(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    pub fn to_record(&self) -> DocumentRow {
        DocumentRow {
            id: self.id.to_string(),
            mp: self.mp(),
            service: self.service.clone(),
            created_at: self.created_at_rfc3339(),
            channel: self.source.channel.as_str().to_string(),
            source_uri: self.source.source_uri.clone(),
            sender_name: self.source.sender_name.clone(),
            sender_uri: self.source.sender_uri.clone(),
            raw_message: self.raw_content.clone(),
        }
    }
}
