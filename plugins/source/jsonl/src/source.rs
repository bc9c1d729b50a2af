use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use tokio::sync::OnceCell;

use bagpipe_api::error::SourceError;
use bagpipe_api::message::{MessageEvent, PlayerProblem};
use bagpipe_api::schema::SchemaTable;
use bagpipe_api::source::{GetMessagesArgs, LogSource, MessagesByFormat};
use bagpipe_api::store::LogIdentity;
use bagpipe_api::time::Time;
use bagpipe_api::topic::{Initialization, MessageFormat, Topic, TopicStats};

use crate::format::{FORMAT_VERSION, LogHeader, LogLine};

/// Identity from file size and modification time.
pub async fn metadata_identity(path: &Path) -> Result<LogIdentity, SourceError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| SourceError::from(e).with_context(path.display()))?;
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(LogIdentity::from_metadata(meta.len(), mtime_ns))
}

/// Identity from a hash of the whole file.
pub async fn content_identity(path: &Path) -> Result<LogIdentity, SourceError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| SourceError::from(e).with_context(path.display()))?;
    Ok(LogIdentity::from_content(&bytes))
}

// ---------------------------------------------------------------------------
// JsonlLogSource
// ---------------------------------------------------------------------------

struct Record {
    topic: String,
    time: Time,
    data: Bytes,
}

struct Loaded {
    topics: Vec<Topic>,
    records: Vec<Record>,
}

/// A recorded log stored as JSON lines. Read fully at initialize.
pub struct JsonlLogSource {
    name: String,
    path: PathBuf,
    loaded: OnceCell<Loaded>,
}

impl std::fmt::Debug for JsonlLogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlLogSource")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

impl JsonlLogSource {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            loaded: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<(Loaded, Initialization), SourceError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| SourceError::from(e).with_context(self.path.display()))?;
        parse_log(&self.name, &content).map_err(|e| e.with_context(self.path.display()))
    }

    fn loaded(&self) -> Result<&Loaded, SourceError> {
        self.loaded
            .get()
            .ok_or_else(|| SourceError::logic(format!("log '{}' read before initialize", self.name)))
    }
}

/// Parse a whole log. Unreadable message lines are skipped and reported.
fn parse_log(name: &str, content: &str) -> Result<(Loaded, Initialization), SourceError> {
    let mut lines = content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
    let (_, header_line) = lines
        .next()
        .ok_or_else(|| SourceError::empty("log file is empty"))?;
    let header: LogHeader = serde_json::from_str(header_line)
        .map_err(|e| SourceError::corrupt(format!("bad header: {e}")))?;
    if header.version != FORMAT_VERSION {
        return Err(SourceError::corrupt(format!(
            "unsupported log version {}",
            header.version
        )));
    }
    if header.topics.is_empty() {
        return Err(SourceError::empty("log contains no topics"));
    }

    let schemas: SchemaTable = header.schemas.into_iter().collect();
    let (topics, unusable): (Vec<Topic>, Vec<Topic>) =
        header.topics.into_iter().partition(|t| match &t.schema_name {
            Some(schema) => schemas.contains(schema),
            None => true,
        });
    if topics.is_empty() {
        return Err(SourceError::corrupt(format!(
            "log declares {} topics but none are usable",
            unusable.len()
        )));
    }

    let mut problems: Vec<PlayerProblem> = unusable
        .iter()
        .map(|t| {
            PlayerProblem::warn(format!(
                "topic '{}' references unknown schema, skipped",
                t.name
            ))
        })
        .collect();

    let mut records = Vec::new();
    let mut bad_lines = Vec::new();
    for (number, line) in lines {
        match serde_json::from_str::<LogLine>(line) {
            Ok(line) if topics.iter().any(|t| t.name == line.topic) => records.push(Record {
                topic: line.topic,
                time: line.time,
                data: Bytes::from(line.data),
            }),
            Ok(line) if unusable.iter().any(|t| t.name == line.topic) => {}
            Ok(_) | Err(_) => bad_lines.push(number + 1),
        }
    }
    if !bad_lines.is_empty() {
        tracing::warn!(source = %name, count = bad_lines.len(), first = bad_lines[0], "skipping unreadable lines");
        problems.push(
            PlayerProblem::warn(format!(
                "log '{name}' has {} unreadable lines, first at line {}",
                bad_lines.len(),
                bad_lines[0]
            ))
            .with_tip("those messages are skipped"),
        );
    }

    if !records.windows(2).all(|w| w[0].time <= w[1].time) {
        records.sort_by_key(|r| r.time);
        tracing::warn!(source = %name, "records out of order, resorted by receive time");
        problems.push(
            PlayerProblem::warn(format!("log '{name}' is not in time order"))
                .with_tip("messages were resorted by receive time"),
        );
    }

    let mut topic_stats: BTreeMap<String, TopicStats> = BTreeMap::new();
    for record in &records {
        topic_stats.entry(record.topic.clone()).or_default().num_messages += 1;
    }

    let init = Initialization {
        start: records.first().map(|r| r.time).unwrap_or(Time::ZERO),
        end: records.last().map(|r| r.time).unwrap_or(Time::ZERO),
        topics: topics.clone(),
        schemas,
        message_format: MessageFormat::Raw,
        topic_stats,
        problems,
    };
    Ok((Loaded { topics, records }, init))
}

impl Loaded {
    fn range(&self, start: Time, end: Time) -> &[Record] {
        let lo = self.records.partition_point(|r| r.time < start);
        let hi = self.records.partition_point(|r| r.time <= end);
        if lo >= hi { &[] } else { &self.records[lo..hi] }
    }

    fn event(&self, record: &Record) -> MessageEvent {
        let schema = self
            .topics
            .iter()
            .find(|t| t.name == record.topic)
            .and_then(|t| t.schema_name.as_deref());
        MessageEvent::raw(record.topic.clone(), schema, record.time, record.data.clone())
    }
}

impl LogSource for JsonlLogSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Initialization, SourceError>> + Send + '_>> {
        Box::pin(async move {
            if self.loaded.initialized() {
                return Err(SourceError::logic(format!(
                    "log '{}' initialized twice",
                    self.name
                )));
            }
            let (loaded, init) = self.load().await?;
            tracing::info!(
                source = %self.name,
                path = %self.path.display(),
                topics = init.topics.len(),
                messages = loaded.records.len(),
                "log loaded"
            );
            // A concurrent initialize lost the race; keep the first.
            let _ = self.loaded.set(loaded);
            Ok(init)
        })
    }

    fn get_messages(
        &self,
        args: GetMessagesArgs,
    ) -> Pin<Box<dyn Future<Output = Result<MessagesByFormat, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let loaded = self.loaded()?;
            let mut out = MessagesByFormat::default();
            if args.start > args.end {
                return Ok(out);
            }
            for record in loaded.range(args.start, args.end) {
                if args.topics.raw.contains(&record.topic) {
                    out.raw.push(loaded.event(record));
                }
                if args.topics.parsed.contains(&record.topic) {
                    out.parsed.push(loaded.event(record));
                }
            }
            Ok(out)
        })
    }
}
