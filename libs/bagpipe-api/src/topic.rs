use std::collections::BTreeMap;

use crate::message::PlayerProblem;
use crate::schema::SchemaTable;
use crate::time::Time;

/// A named channel in a recorded log.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Topic {
    pub name: String,
    /// Schema of the messages, if the encoding has one.
    #[serde(default)]
    pub schema_name: Option<String>,
    /// Wire encoding of the payloads (`ros1`, `json`, ...).
    pub message_encoding: String,
}

impl Topic {
    pub fn new(
        name: impl Into<String>,
        schema_name: Option<&str>,
        message_encoding: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            schema_name: schema_name.map(str::to_string),
            message_encoding: message_encoding.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub num_messages: u64,
}

/// What a source hands out as payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageFormat {
    /// Encoded bytes, as recorded.
    #[default]
    Raw,
    /// Already-decoded values.
    Decoded,
}

/// Result of opening a source. Fixed for the lifetime of the source.
#[derive(Debug, Clone, Default)]
pub struct Initialization {
    pub start: Time,
    pub end: Time,
    pub topics: Vec<Topic>,
    pub schemas: SchemaTable,
    pub message_format: MessageFormat,
    pub topic_stats: BTreeMap<String, TopicStats>,
    /// Non-fatal problems found while opening (skipped sources, resorted data, ...).
    pub problems: Vec<PlayerProblem>,
}

impl Initialization {
    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn has_topic(&self, name: &str) -> bool {
        self.topic(name).is_some()
    }

    pub fn topic_names(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(|t| t.name.as_str())
    }
}
