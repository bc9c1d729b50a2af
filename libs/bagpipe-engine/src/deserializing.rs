use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{OnceCell, watch};

use bagpipe_api::decoder::MessageDecoder;
use bagpipe_api::error::SourceError;
use bagpipe_api::message::{IteratorResult, MessageEvent, MessagePayload, PlayerProblem};
use bagpipe_api::progress::Progress;
use bagpipe_api::source::{
    BackfillArgs, GetMessagesArgs, LogSource, MessageIterator, MessageIteratorArgs,
};
use bagpipe_api::subscription::{SubscribePayload, TopicSelection, TopicsByFormat};
use bagpipe_api::time::Time;
use bagpipe_api::topic::{Initialization, MessageFormat};

use crate::decoder_registry::DecoderRegistry;
use crate::schema_registry::{SchemaHandle, SchemaRegistry};
use crate::sizing::estimate_object_size;
use crate::sync::lock;

/// Decodes the raw messages of a source into values.
///
/// Decoders are built once per topic at initialization. A topic whose
/// decoder cannot be built is delivered raw.
pub struct DeserializingSource {
    source: Arc<dyn LogSource>,
    decoders: DecoderRegistry,
    schemas: SchemaRegistry,
    prepared: OnceCell<Prepared>,
    /// Size estimates of sliced subscriptions, by subscription key.
    slice_sizes: Arc<Mutex<HashMap<String, usize>>>,
}

struct Prepared {
    init: Initialization,
    #[allow(dead_code)]
    schemas: SchemaHandle,
    decoders: HashMap<String, Arc<dyn MessageDecoder>>,
}

impl std::fmt::Debug for DeserializingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeserializingSource")
            .field("source", &self.source.name())
            .field("decoders", &self.decoders)
            .finish()
    }
}

impl DeserializingSource {
    pub fn new(source: Arc<dyn LogSource>, decoders: DecoderRegistry) -> Self {
        Self::with_schema_registry(source, decoders, SchemaRegistry::new())
    }

    /// Share schema tables with other sources through `schemas`.
    pub fn with_schema_registry(
        source: Arc<dyn LogSource>,
        decoders: DecoderRegistry,
        schemas: SchemaRegistry,
    ) -> Self {
        Self {
            source,
            decoders,
            schemas,
            prepared: OnceCell::new(),
            slice_sizes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn initialize(&self) -> Result<Initialization, SourceError> {
        let prepared = self.prepared.get_or_try_init(|| self.prepare()).await?;
        Ok(prepared.init.clone())
    }

    async fn prepare(&self) -> Result<Prepared, SourceError> {
        let mut init = self.source.initialize().await?;
        let schemas = self.schemas.register(init.schemas.clone());

        let mut decoders = HashMap::new();
        for topic in &init.topics {
            match self.decoders.create(
                &topic.message_encoding,
                topic.schema_name.as_deref(),
                schemas.schemas(),
            ) {
                Ok(decoder) => {
                    decoders.insert(topic.name.clone(), decoder);
                }
                Err(e) => {
                    tracing::warn!(
                        topic = %topic.name,
                        encoding = %topic.message_encoding,
                        error = %e,
                        "no decoder for topic, delivering raw"
                    );
                    init.problems.push(
                        PlayerProblem::warn(format!("topic '{}' cannot be decoded", topic.name))
                            .with_error(&e)
                            .with_tip("messages on this topic are delivered undecoded"),
                    );
                }
            }
        }
        init.message_format = MessageFormat::Decoded;

        tracing::info!(
            source = %self.source.name(),
            topics = init.topics.len(),
            decoded = decoders.len(),
            "deserializer ready"
        );
        Ok(Prepared {
            init,
            schemas,
            decoders,
        })
    }

    fn prepared(&self) -> Result<&Prepared, SourceError> {
        self.prepared
            .get()
            .ok_or_else(|| SourceError::logic("deserializer used before initialize"))
    }

    /// Per-topic readers for a subscription set, plus a problem for every
    /// subscribed topic the log does not have.
    fn readers(&self, topics: &TopicSelection) -> Result<(Readers, Vec<IteratorResult>), SourceError> {
        let prepared = self.prepared()?;
        let mut readers = HashMap::new();
        let mut problems = Vec::new();
        for (name, payload) in topics {
            if !prepared.init.has_topic(name) {
                tracing::warn!(topic = %name, "subscribed topic not in log");
                problems.push(IteratorResult::Problem {
                    connection_id: name.clone(),
                    problem: PlayerProblem::warn(format!("topic '{name}' is not in the log")),
                });
                continue;
            }
            readers.insert(name.clone(), TopicReader::resolve(payload, prepared.decoders.get(name)));
        }
        Ok((
            Readers {
                topics: readers,
                slice_sizes: self.slice_sizes.clone(),
            },
            problems,
        ))
    }

    /// Stream decoded messages of the subscribed topics.
    pub fn message_iterator(
        &self,
        args: MessageIteratorArgs,
    ) -> Result<Box<dyn MessageIterator>, SourceError> {
        let init = &self.prepared()?.init;
        let (readers, problems) = self.readers(&args.topics)?;
        let inner = self.source.clone().message_iterator(GetMessagesArgs {
            start: args.start.unwrap_or(init.start),
            end: args.end.unwrap_or(init.end),
            topics: readers.raw_topics(),
        });
        Ok(Box::new(DeserializingIterator {
            inner,
            readers,
            pending: problems.into(),
            closed: false,
        }))
    }

    /// Latest decoded message at or before `time` for each subscribed topic.
    ///
    /// Messages that fail to decode are logged and left out.
    pub async fn get_backfill_messages(
        &self,
        time: Time,
        topics: &TopicSelection,
    ) -> Result<Vec<MessageEvent>, SourceError> {
        let (readers, _) = self.readers(topics)?;
        let raw = self
            .source
            .get_backfill_messages(BackfillArgs {
                time,
                topics: readers.raw_topics(),
            })
            .await?;

        let mut out = Vec::with_capacity(raw.len());
        for event in raw {
            let topic = event.topic.clone();
            let receive_time = event.receive_time;
            match readers.read(event) {
                Ok(event) => out.push(event),
                Err(e) => {
                    tracing::error!(
                        topic = %topic,
                        time = %receive_time,
                        error = %e,
                        "dropping backfill message that failed to decode"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Cached size estimate of a sliced subscription, once computed.
    pub fn slice_size(&self, payload: &SubscribePayload) -> Option<usize> {
        lock(&self.slice_sizes).get(&payload.cache_key()).copied()
    }

    pub fn progress(&self) -> Option<watch::Receiver<Progress>> {
        self.source.progress()
    }

    pub fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.source.close()
    }
}

// ---------------------------------------------------------------------------
// Per-topic dispatch
// ---------------------------------------------------------------------------

/// How messages of one subscribed topic are read. Resolved once per
/// subscription.
enum TopicReader {
    /// No decoder: pass through as recorded.
    Raw,
    Decode(Arc<dyn MessageDecoder>),
    Slice {
        decoder: Arc<dyn MessageDecoder>,
        fields: Vec<String>,
        size_key: String,
    },
}

impl TopicReader {
    fn resolve(payload: &SubscribePayload, decoder: Option<&Arc<dyn MessageDecoder>>) -> Self {
        match (decoder, &payload.fields) {
            (None, _) => TopicReader::Raw,
            (Some(decoder), None) => TopicReader::Decode(decoder.clone()),
            (Some(decoder), Some(fields)) => TopicReader::Slice {
                decoder: decoder.clone(),
                fields: fields.clone(),
                size_key: payload.cache_key(),
            },
        }
    }
}

struct Readers {
    topics: HashMap<String, TopicReader>,
    slice_sizes: Arc<Mutex<HashMap<String, usize>>>,
}

impl Readers {
    fn raw_topics(&self) -> TopicsByFormat {
        let mut names: Vec<&String> = self.topics.keys().collect();
        names.sort();
        TopicsByFormat::raw(names.into_iter().cloned())
    }

    fn read(&self, event: MessageEvent) -> Result<MessageEvent, SourceError> {
        let Some(reader) = self.topics.get(&event.topic) else {
            return Ok(event);
        };
        let bytes = match &event.payload {
            MessagePayload::Raw(bytes) => bytes,
            MessagePayload::Decoded(_) => return Ok(event),
        };
        match reader {
            TopicReader::Raw => Ok(event),
            TopicReader::Decode(decoder) => {
                let value = decoder.decode(bytes)?;
                let size = bytes.len().max(estimate_object_size(&value));
                Ok(MessageEvent::decoded(
                    event.topic,
                    event.schema_name.as_deref(),
                    event.receive_time,
                    value,
                    size,
                ))
            }
            TopicReader::Slice {
                decoder,
                fields,
                size_key,
            } => {
                let value = slice_fields(decoder.decode(bytes)?, fields);
                let size = *lock(&self.slice_sizes)
                    .entry(size_key.clone())
                    .or_insert_with(|| estimate_object_size(&value));
                Ok(MessageEvent::decoded(
                    event.topic,
                    event.schema_name.as_deref(),
                    event.receive_time,
                    value,
                    size,
                ))
            }
        }
    }
}

/// Keep only the requested top-level fields of an object.
fn slice_fields(value: Value, fields: &[String]) -> Value {
    match value {
        Value::Object(mut map) => Value::Object(
            fields
                .iter()
                .filter_map(|f| map.remove(f).map(|v| (f.clone(), v)))
                .collect(),
        ),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// DeserializingIterator
// ---------------------------------------------------------------------------

struct DeserializingIterator {
    inner: Box<dyn MessageIterator>,
    readers: Readers,
    pending: VecDeque<IteratorResult>,
    closed: bool,
}

impl MessageIterator for DeserializingIterator {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<IteratorResult>> + Send + '_>> {
        Box::pin(async move {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.closed {
                return None;
            }
            let item = self.inner.next().await?;
            let IteratorResult::MessageEvent(event) = item else {
                return Some(item);
            };
            let topic = event.topic.clone();
            let schema = event.schema_name.clone();
            match self.readers.read(event) {
                Ok(event) => Some(IteratorResult::MessageEvent(event)),
                Err(e) => {
                    tracing::debug!(topic = %topic, error = %e, "message failed to decode");
                    Some(IteratorResult::Problem {
                        problem: PlayerProblem::error(format!(
                            "failed to decode message on topic '{topic}'"
                        ))
                        .with_error(&e)
                        .with_tip(match schema {
                            Some(schema) => {
                                format!("check that schema '{schema}' matches the recorded data")
                            }
                            None => "check that the topic's encoding matches the recorded data".into(),
                        }),
                        connection_id: topic,
                    })
                }
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if self.closed {
                return;
            }
            self.closed = true;
            self.pending.clear();
            self.inner.close().await;
        })
    }
}
