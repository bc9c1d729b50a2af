use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use bagpipe_api::error::SourceError;
use bagpipe_api::message::{MessageEvent, PlayerProblem};
use bagpipe_api::schema::SchemaTable;
use bagpipe_api::source::{GetMessagesArgs, LogSource, MessagesByFormat};
use bagpipe_api::time::Time;
use bagpipe_api::topic::{Initialization, MessageFormat, Topic, TopicStats};

/// One recorded message of an in-memory log.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub topic: String,
    pub receive_time: Time,
    pub data: Bytes,
}

impl MemoryRecord {
    pub fn new(topic: impl Into<String>, receive_time: Time, data: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            receive_time,
            data: data.into(),
        }
    }
}

/// Recorded log held in memory. Serves raw payloads.
///
/// Records may be given in any order; they are resorted by receive time and
/// the initialization carries a warning when that was needed.
pub struct MemoryLogSource {
    name: String,
    topics: Vec<Topic>,
    schemas: SchemaTable,
    records: Vec<MemoryRecord>,
    resorted: bool,
    latency: Option<Duration>,
    fetches: AtomicUsize,
}

impl std::fmt::Debug for MemoryLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLogSource")
            .field("name", &self.name)
            .field("topics", &self.topics.len())
            .field("records", &self.records.len())
            .finish()
    }
}

impl MemoryLogSource {
    pub fn new(
        name: impl Into<String>,
        topics: Vec<Topic>,
        schemas: SchemaTable,
        mut records: Vec<MemoryRecord>,
    ) -> Self {
        let resorted = !records
            .windows(2)
            .all(|w| w[0].receive_time <= w[1].receive_time);
        if resorted {
            records.sort_by_key(|r| r.receive_time);
        }
        Self {
            name: name.into(),
            topics,
            schemas,
            records,
            resorted,
            latency: None,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Delay every `get_messages` call, as a slow disk or network would.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `get_messages` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn usable_topics(&self) -> Vec<Topic> {
        self.topics
            .iter()
            .filter(|t| match &t.schema_name {
                Some(schema) => self.schemas.contains(schema),
                None => true,
            })
            .cloned()
            .collect()
    }

    fn range(&self, start: Time, end: Time) -> &[MemoryRecord] {
        let lo = self.records.partition_point(|r| r.receive_time < start);
        let hi = self.records.partition_point(|r| r.receive_time <= end);
        if lo >= hi { &[] } else { &self.records[lo..hi] }
    }

    fn event(&self, record: &MemoryRecord) -> MessageEvent {
        let schema = self
            .topics
            .iter()
            .find(|t| t.name == record.topic)
            .and_then(|t| t.schema_name.as_deref());
        MessageEvent::raw(record.topic.clone(), schema, record.receive_time, record.data.clone())
    }
}

impl LogSource for MemoryLogSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Initialization, SourceError>> + Send + '_>> {
        Box::pin(async move {
            if self.topics.is_empty() {
                return Err(SourceError::empty("log contains no topics"));
            }
            let topics = self.usable_topics();
            if topics.is_empty() {
                return Err(SourceError::corrupt(format!(
                    "log declares {} topics but none are usable",
                    self.topics.len()
                )));
            }

            let mut topic_stats: BTreeMap<String, TopicStats> = BTreeMap::new();
            for record in &self.records {
                topic_stats.entry(record.topic.clone()).or_default().num_messages += 1;
            }

            let mut problems = Vec::new();
            if self.resorted {
                tracing::warn!(source = %self.name, "records out of order, resorted by receive time");
                problems.push(
                    PlayerProblem::warn(format!("log '{}' is not in time order", self.name))
                        .with_tip("messages were resorted by receive time"),
                );
            }
            for topic in &self.topics {
                if !topics.contains(topic) {
                    problems.push(PlayerProblem::warn(format!(
                        "topic '{}' references unknown schema, skipped",
                        topic.name
                    )));
                }
            }

            Ok(Initialization {
                start: self.records.first().map(|r| r.receive_time).unwrap_or(Time::ZERO),
                end: self.records.last().map(|r| r.receive_time).unwrap_or(Time::ZERO),
                topics,
                schemas: self.schemas.clone(),
                message_format: MessageFormat::Raw,
                topic_stats,
                problems,
            })
        })
    }

    fn get_messages(
        &self,
        args: GetMessagesArgs,
    ) -> Pin<Box<dyn Future<Output = Result<MessagesByFormat, SourceError>> + Send + '_>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }

            let mut out = MessagesByFormat::default();
            if args.start > args.end {
                return Ok(out);
            }
            // A raw log answers both lists with its native payloads.
            for record in self.range(args.start, args.end) {
                if args.topics.raw.contains(&record.topic) {
                    out.raw.push(self.event(record));
                }
                if args.topics.parsed.contains(&record.topic) {
                    out.parsed.push(self.event(record));
                }
            }
            Ok(out)
        })
    }
}
