use bytes::Bytes;

use crate::time::Time;

/// Payload of a message event: recorded bytes or a decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Encoded bytes. Cloning shares the buffer.
    Raw(Bytes),
    Decoded(serde_json::Value),
}

impl MessagePayload {
    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            MessagePayload::Raw(bytes) => Some(bytes),
            MessagePayload::Decoded(_) => None,
        }
    }

    pub fn as_decoded(&self) -> Option<&serde_json::Value> {
        match self {
            MessagePayload::Raw(_) => None,
            MessagePayload::Decoded(value) => Some(value),
        }
    }
}

/// One message on one topic at one receive time.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub topic: String,
    pub schema_name: Option<String>,
    pub receive_time: Time,
    pub payload: MessagePayload,
    /// Approximate in-memory footprint, used for cache accounting.
    pub size_in_bytes: usize,
}

impl MessageEvent {
    /// Raw event; its size is the payload length.
    pub fn raw(
        topic: impl Into<String>,
        schema_name: Option<&str>,
        receive_time: Time,
        bytes: impl Into<Bytes>,
    ) -> Self {
        let bytes = bytes.into();
        Self {
            topic: topic.into(),
            schema_name: schema_name.map(str::to_string),
            receive_time,
            size_in_bytes: bytes.len(),
            payload: MessagePayload::Raw(bytes),
        }
    }

    pub fn decoded(
        topic: impl Into<String>,
        schema_name: Option<&str>,
        receive_time: Time,
        value: serde_json::Value,
        size_in_bytes: usize,
    ) -> Self {
        Self {
            topic: topic.into(),
            schema_name: schema_name.map(str::to_string),
            receive_time,
            payload: MessagePayload::Decoded(value),
            size_in_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemSeverity {
    Error,
    Warn,
    Info,
}

/// A non-fatal problem, surfaced to the user instead of aborting playback.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PlayerProblem {
    pub severity: ProblemSeverity,
    pub message: String,
    /// Underlying cause, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remediation hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,
}

impl PlayerProblem {
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ProblemSeverity::Error, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(ProblemSeverity::Warn, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(ProblemSeverity::Info, message)
    }

    fn new(severity: ProblemSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            error: None,
            tip: None,
        }
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_tip(mut self, tip: impl Into<String>) -> Self {
        self.tip = Some(tip.into());
        self
    }
}

/// One item of a message stream.
///
/// Recoverable per-item failures travel as `Problem` items, so a long-lived
/// iteration loop is never torn down by them.
#[derive(Debug, Clone, PartialEq)]
pub enum IteratorResult {
    MessageEvent(MessageEvent),
    Problem {
        /// Groups repeated problems of one origin (usually the topic).
        connection_id: String,
        problem: PlayerProblem,
    },
    /// No further messages exist before this time.
    Stamp(Time),
}

impl IteratorResult {
    /// Time the item is positioned at in the stream, if any.
    pub fn time(&self) -> Option<Time> {
        match self {
            IteratorResult::MessageEvent(event) => Some(event.receive_time),
            IteratorResult::Stamp(time) => Some(*time),
            IteratorResult::Problem { .. } => None,
        }
    }

    pub fn as_message(&self) -> Option<&MessageEvent> {
        match self {
            IteratorResult::MessageEvent(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_problem(&self) -> bool {
        matches!(self, IteratorResult::Problem { .. })
    }
}
