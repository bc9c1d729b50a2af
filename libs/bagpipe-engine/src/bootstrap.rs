use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use bagpipe_api::error::SourceError;
use bagpipe_api::message::MessageEvent;
use bagpipe_api::progress::Progress;
use bagpipe_api::source::{LogSource, MessageIteratorArgs};
use bagpipe_api::store::{BlockStore, LogIdentity};
use bagpipe_api::subscription::TopicSelection;
use bagpipe_api::time::Time;
use bagpipe_api::topic::Initialization;

use crate::caching_source::{CacheOptions, CachingSource};
use crate::config::{IteratorConfig, PlaybackConfig, SourceConfig};
use crate::cursor::MessageCursor;
use crate::decoder_registry::DecoderRegistry;
use crate::deserializing::DeserializingSource;
use crate::error::EngineError;
use crate::merger::SourceMerger;
use crate::persistent::PersistentTarget;

/// A leaf log ready to be wrapped by the pipeline.
pub struct OpenedLog {
    pub name: String,
    pub source: Arc<dyn LogSource>,
    /// Needed for the persistent cache. `None` keeps the log memory only.
    pub identity: Option<LogIdentity>,
}

impl std::fmt::Debug for OpenedLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedLog")
            .field("name", &self.name)
            .field("identity", &self.identity)
            .finish()
    }
}

/// Opens logs of one on-disk format.
pub trait LogOpener: Send + Sync {
    /// Value of `format` in a source definition.
    fn format(&self) -> &str;

    fn open<'a>(
        &'a self,
        config: &'a SourceConfig,
    ) -> Pin<Box<dyn Future<Output = Result<OpenedLog, SourceError>> + Send + 'a>>;
}

/// Open every configured source with the opener for its format.
pub async fn open_logs(
    config: &PlaybackConfig,
    openers: &[&dyn LogOpener],
) -> Result<Vec<OpenedLog>, EngineError> {
    let mut logs = Vec::with_capacity(config.sources.len());
    for source in &config.sources {
        let opener = openers
            .iter()
            .find(|o| o.format() == source.format)
            .ok_or_else(|| EngineError::UnknownSourceFormat {
                source_name: source.name.clone(),
                format: source.format.clone(),
            })?;
        let log = opener
            .open(source)
            .await
            .map_err(|e| EngineError::Source(e).with_context(format!("source '{}'", source.name)))?;
        tracing::info!(source = %source.name, path = %source.path.display(), format = %source.format, "opened log");
        logs.push(log);
    }
    Ok(logs)
}

/// The assembled read path: caches over every log, merged, then decoded.
pub struct Pipeline {
    source: DeserializingSource,
    init: Initialization,
    iterator: IteratorConfig,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("source", &self.source)
            .field("topics", &self.init.topics.len())
            .finish()
    }
}

impl Pipeline {
    /// Build and initialize the pipeline.
    ///
    /// With a `store`, logs that carry an identity also get a persistent
    /// block cache.
    pub async fn open(
        config: &PlaybackConfig,
        logs: Vec<OpenedLog>,
        decoders: DecoderRegistry,
        store: Option<Arc<dyn BlockStore>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let options = CacheOptions::from(config.cache.clone());

        // --- 1. Cache every leaf ---
        let mut children: Vec<Arc<dyn LogSource>> = Vec::with_capacity(logs.len());
        for log in logs {
            let cached = match (&store, log.identity) {
                (Some(store), Some(identity)) => CachingSource::with_persistent(
                    log.source,
                    options,
                    PersistentTarget::new(store.clone(), log.name.clone(), identity),
                ),
                _ => CachingSource::new(log.source, options),
            };
            tracing::debug!(source = %log.name, "cache attached");
            children.push(Arc::new(cached));
        }

        // --- 2. Merge, then decode ---
        let merged: Arc<dyn LogSource> = Arc::new(SourceMerger::new("merged", children));
        let source = DeserializingSource::new(merged, decoders);
        let init = source.initialize().await?;

        for problem in &init.problems {
            tracing::warn!(severity = ?problem.severity, problem = %problem.message, "initialization problem");
        }
        tracing::info!(
            topics = init.topics.len(),
            start = %init.start,
            end = %init.end,
            "pipeline ready"
        );

        Ok(Self {
            source,
            init,
            iterator: config.iterator.clone(),
        })
    }

    pub fn initialization(&self) -> &Initialization {
        &self.init
    }

    /// Start streaming the subscribed topics.
    pub fn cursor(&self, args: MessageIteratorArgs) -> Result<MessageCursor, EngineError> {
        let iter = self.source.message_iterator(args)?;
        Ok(MessageCursor::spawn(iter, self.iterator.channel_capacity))
    }

    pub async fn backfill(
        &self,
        time: Time,
        topics: &TopicSelection,
    ) -> Result<Vec<MessageEvent>, EngineError> {
        Ok(self.source.get_backfill_messages(time, topics).await?)
    }

    pub fn progress(&self) -> Option<watch::Receiver<Progress>> {
        self.source.progress()
    }

    /// Default `next_batch` budget.
    pub fn batch_budget(&self) -> Duration {
        Duration::from_millis(self.iterator.batch_ms)
    }

    pub async fn close(&self) {
        self.source.close().await;
        tracing::info!("pipeline closed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use bagpipe_api::error::ErrorKind;
    use bagpipe_api::message::IteratorResult;
    use bagpipe_api::schema::SchemaTable;
    use bagpipe_api::subscription::{SubscribePayload, topic_selection};
    use bagpipe_api::topic::Topic;
    use bagpipe_format_json::JsonDecoderFactory;
    use bagpipe_storage_memory::MemoryBlockStore;

    use super::*;
    use crate::memory_source::{MemoryLogSource, MemoryRecord};

    fn log(name: &str, topic: &str, secs: &[u32]) -> OpenedLog {
        let records = secs
            .iter()
            .map(|s| MemoryRecord::new(topic, Time::new(*s, 0), format!(r#"{{"at":{s}}}"#).into_bytes()))
            .collect();
        OpenedLog {
            name: name.into(),
            source: Arc::new(MemoryLogSource::new(
                name,
                vec![Topic::new(topic, None, "json")],
                SchemaTable::new(),
                records,
            )),
            identity: Some(LogIdentity::from_content(name.as_bytes())),
        }
    }

    fn decoders() -> DecoderRegistry {
        DecoderRegistry::new().with(Arc::new(JsonDecoderFactory))
    }

    #[tokio::test]
    async fn test_open_and_stream_merged_logs() {
        let config = PlaybackConfig::default();
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let pipeline = Pipeline::open(
            &config,
            vec![log("front", "/front", &[0, 2, 4]), log("rear", "/rear", &[1, 3])],
            decoders(),
            Some(store),
        )
        .await
        .unwrap();

        let init = pipeline.initialization();
        assert_eq!(init.topic_names().collect::<Vec<_>>(), vec!["/front", "/rear"]);
        assert_eq!(init.start, Time::ZERO);
        assert_eq!(init.end, Time::new(4, 0));

        let mut cursor = pipeline
            .cursor(MessageIteratorArgs {
                topics: topic_selection([
                    SubscribePayload::whole("/front"),
                    SubscribePayload::whole("/rear"),
                ]),
                ..Default::default()
            })
            .unwrap();
        let mut seen = Vec::new();
        while let Some(item) = cursor.next().await {
            if let IteratorResult::MessageEvent(event) = item {
                seen.push(event.payload.as_decoded().unwrap()["at"].as_u64().unwrap());
            }
        }
        cursor.end().await;
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        let latest = pipeline
            .backfill(Time::new(3, 0), &topic_selection([SubscribePayload::whole("/front")]))
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].receive_time, Time::new(2, 0));

        pipeline.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_topic_fails_open() {
        let err = Pipeline::open(
            &PlaybackConfig::default(),
            vec![log("a", "/x", &[0]), log("b", "/x", &[1])],
            decoders(),
            None,
        )
        .await
        .unwrap_err();
        match err {
            EngineError::Source(e) => assert_eq!(e.kind, ErrorKind::Schema),
            other => panic!("expected source error, got {other:?}"),
        }
    }

    struct FixedOpener;

    impl LogOpener for FixedOpener {
        fn format(&self) -> &str {
            "memory"
        }

        fn open<'a>(
            &'a self,
            config: &'a SourceConfig,
        ) -> Pin<Box<dyn Future<Output = Result<OpenedLog, SourceError>> + Send + 'a>> {
            Box::pin(async move { Ok(log(&config.name, "/t", &[0])) })
        }
    }

    #[tokio::test]
    async fn test_open_logs_by_format() {
        let mut config = PlaybackConfig::default();
        config.sources.push(SourceConfig {
            name: "a".into(),
            path: PathBuf::from("a.mem"),
            format: "memory".into(),
            identity: Default::default(),
        });
        let logs = open_logs(&config, &[&FixedOpener]).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "a");

        config.sources[0].format = "mcap".into();
        let err = open_logs(&config, &[&FixedOpener]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnknownSourceFormat { ref format, .. } if format == "mcap"
        ));
    }
}
