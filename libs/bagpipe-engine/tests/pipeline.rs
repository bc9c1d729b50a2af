use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bagpipe_api::error::SourceError;
use bagpipe_api::message::{IteratorResult, MessageEvent};
use bagpipe_api::schema::SchemaTable;
use bagpipe_api::source::{GetMessagesArgs, LogSource, MessageIterator, MessageIteratorArgs, MessagesByFormat};
use bagpipe_api::store::BlockStore;
use bagpipe_api::subscription::{SubscribePayload, TopicsByFormat, topic_selection};
use bagpipe_api::time::Time;
use bagpipe_api::topic::{Initialization, Topic};
use bagpipe_engine::bootstrap::{OpenedLog, Pipeline};
use bagpipe_engine::caching_source::{CacheOptions, CachingSource};
use bagpipe_engine::config::PlaybackConfig;
use bagpipe_engine::cursor::MessageCursor;
use bagpipe_engine::decoder_registry::DecoderRegistry;
use bagpipe_engine::deserializing::DeserializingSource;
use bagpipe_engine::memory_source::{MemoryLogSource, MemoryRecord};
use bagpipe_engine::merger::SourceMerger;
use bagpipe_format_json::JsonDecoderFactory;
use bagpipe_source_jsonl::{JsonlLogSource, LogHeader, LogLine, metadata_identity, render_log};
use bagpipe_storage_file::FileBlockStore;

fn decoders() -> DecoderRegistry {
    DecoderRegistry::new().with(Arc::new(JsonDecoderFactory))
}

fn memory_log(name: &str, topic: &str, times: &[(u32, u32)]) -> Arc<MemoryLogSource> {
    let records = times
        .iter()
        .enumerate()
        .map(|(i, (sec, nsec))| {
            MemoryRecord::new(
                topic,
                Time::new(*sec, *nsec),
                format!(r#"{{"log":"{name}","i":{i}}}"#).into_bytes(),
            )
        })
        .collect();
    Arc::new(MemoryLogSource::new(
        name,
        vec![Topic::new(topic, None, "json")],
        SchemaTable::new(),
        records,
    ))
}

fn key(event: &MessageEvent) -> (String, Time, Vec<u8>) {
    (
        event.topic.clone(),
        event.receive_time,
        event.payload.as_raw().map(|b| b.to_vec()).unwrap_or_default(),
    )
}

// ---------------------------------------------------------------------------
// Merged streams
// ---------------------------------------------------------------------------

#[tokio::test]
async fn merged_range_reads_equal_sorted_union_of_children() {
    let leaves = [
        memory_log("a", "/a", &[(0, 0), (1, 0), (1, 0), (3, 0), (5, 500)]),
        memory_log("b", "/b", &[(1, 0), (1, 0), (2, 250), (5, 500)]),
        memory_log("c", "/c", &[(0, 0), (5, 500), (7, 0)]),
    ];
    let options = CacheOptions {
        block_duration_ns: 500_000_000,
        ..Default::default()
    };
    let children: Vec<Arc<dyn LogSource>> = leaves
        .iter()
        .map(|l| Arc::new(CachingSource::new(l.clone(), options)) as Arc<dyn LogSource>)
        .collect();
    let merger = SourceMerger::new("merged", children);
    merger.initialize().await.unwrap();
    for leaf in &leaves {
        leaf.initialize().await.unwrap();
    }

    let all = TopicsByFormat::raw(["/a", "/b", "/c"]);
    for (start, end) in [
        (Time::ZERO, Time::new(7, 0)),
        (Time::new(1, 0), Time::new(5, 500)),
        (Time::new(2, 250), Time::new(2, 250)),
        (Time::new(4, 0), Time::new(6, 0)),
        (Time::new(8, 0), Time::new(9, 0)),
    ] {
        let merged = merger
            .get_messages(GetMessagesArgs { start, end, topics: all.clone() })
            .await
            .unwrap();

        let mut expected = Vec::new();
        for leaf in &leaves {
            let part = leaf
                .get_messages(GetMessagesArgs { start, end, topics: all.clone() })
                .await
                .unwrap();
            expected.extend(part.raw);
        }
        // Stable: ties keep child order.
        expected.sort_by_key(|e| e.receive_time);

        let got: Vec<_> = merged.raw.iter().map(key).collect();
        let want: Vec<_> = expected.iter().map(key).collect();
        assert_eq!(got, want, "range [{start}, {end}]");
    }
    merger.close().await;
}

// ---------------------------------------------------------------------------
// Persistent cache across runs
// ---------------------------------------------------------------------------

fn write_log(dir: &Path, name: &str, topic: &str, secs: &[u32]) -> PathBuf {
    let path = dir.join(format!("{name}.jsonl"));
    let lines: Vec<LogLine> = secs
        .iter()
        .map(|s| LogLine::new(topic, Time::new(*s, 0), format!(r#"{{"at":{s}}}"#).into_bytes()))
        .collect();
    let content = render_log(
        &LogHeader::new(vec![Topic::new(topic, None, "json")], vec![]),
        &lines,
    )
    .unwrap();
    std::fs::write(&path, content).unwrap();
    path
}

async fn open_jsonl(paths: &[(&str, &Path)]) -> Vec<OpenedLog> {
    let mut logs = Vec::new();
    for (name, path) in paths {
        logs.push(OpenedLog {
            name: name.to_string(),
            source: Arc::new(JsonlLogSource::new(*name, *path)),
            identity: Some(metadata_identity(path).await.unwrap()),
        });
    }
    logs
}

async fn play_all(pipeline: &Pipeline) -> Vec<(String, Time, serde_json::Value)> {
    let topics = topic_selection(
        pipeline
            .initialization()
            .topic_names()
            .map(SubscribePayload::whole),
    );
    let mut cursor = pipeline
        .cursor(MessageIteratorArgs {
            topics,
            ..Default::default()
        })
        .unwrap();
    let mut out = Vec::new();
    while let Some(batch) = cursor.next_batch(Duration::from_millis(20)).await {
        for item in batch {
            if let IteratorResult::MessageEvent(e) = item {
                let value = e.payload.as_decoded().cloned().unwrap();
                out.push((e.topic, e.receive_time, value));
            }
        }
    }
    cursor.end().await;
    out
}

#[tokio::test]
async fn jsonl_logs_play_back_identically_from_persistent_cache() {
    let logs_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let front = write_log(logs_dir.path(), "front", "/front", &[0, 2, 4]);
    let rear = write_log(logs_dir.path(), "rear", "/rear", &[1, 3]);
    let config = PlaybackConfig::default();

    let store: Arc<dyn BlockStore> = Arc::new(FileBlockStore::new(cache_dir.path()));
    let first = Pipeline::open(
        &config,
        open_jsonl(&[("front", &front), ("rear", &rear)]).await,
        decoders(),
        Some(store.clone()),
    )
    .await
    .unwrap();
    let played = play_all(&first).await;
    first.close().await;

    let times: Vec<u32> = played.iter().map(|(_, t, _)| t.sec).collect();
    assert_eq!(times, vec![0, 1, 2, 3, 4]);
    assert_eq!(played[1].0, "/rear");
    assert_eq!(played[1].2["at"], 1);

    let directory = store.read_directory("front").await.unwrap().unwrap();
    assert!(!directory.blocks.is_empty());
    assert!(cache_dir.path().join("front/directory.json").is_file());

    let second = Pipeline::open(
        &config,
        open_jsonl(&[("front", &front), ("rear", &rear)]).await,
        decoders(),
        Some(store),
    )
    .await
    .unwrap();
    assert_eq!(play_all(&second).await, played);
    second.close().await;
}

#[tokio::test]
async fn progress_completes_once_everything_is_read() {
    let pipeline = Pipeline::open(
        &PlaybackConfig::default(),
        vec![
            OpenedLog {
                name: "front".into(),
                source: memory_log("front", "/front", &[(0, 0), (2, 0), (4, 0)]),
                identity: None,
            },
            OpenedLog {
                name: "rear".into(),
                source: memory_log("rear", "/rear", &[(1, 0), (3, 0)]),
                identity: None,
            },
        ],
        decoders(),
        None,
    )
    .await
    .unwrap();
    let mut progress = pipeline.progress().unwrap();

    let played = play_all(&pipeline).await;
    assert_eq!(played.len(), 5);

    tokio::time::timeout(Duration::from_secs(2), progress.wait_for(|p| p.is_complete()))
        .await
        .expect("progress did not complete")
        .unwrap();
    pipeline.close().await;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Leaf whose own iterator counts `close()` calls.
struct CountingLeaf {
    inner: Arc<MemoryLogSource>,
    closes: Arc<AtomicUsize>,
}

struct CountingIterator {
    inner: Box<dyn MessageIterator>,
    closes: Arc<AtomicUsize>,
}

impl MessageIterator for CountingIterator {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<IteratorResult>> + Send + '_>> {
        self.inner.next()
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()
    }
}

impl LogSource for CountingLeaf {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn initialize(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Initialization, SourceError>> + Send + '_>> {
        self.inner.initialize()
    }

    fn get_messages(
        &self,
        args: GetMessagesArgs,
    ) -> Pin<Box<dyn Future<Output = Result<MessagesByFormat, SourceError>> + Send + '_>> {
        self.inner.get_messages(args)
    }

    fn message_iterator(self: Arc<Self>, args: GetMessagesArgs) -> Box<dyn MessageIterator> {
        Box::new(CountingIterator {
            inner: self.inner.clone().message_iterator(args),
            closes: self.closes.clone(),
        })
    }
}

#[tokio::test]
async fn ending_a_cursor_mid_batch_closes_the_leaf_iterator_once() {
    let times: Vec<(u32, u32)> = (0..600).map(|s| (s, 0)).collect();
    let slow = memory_log("slow", "/t", &times);
    let slow = Arc::new(
        Arc::try_unwrap(slow)
            .unwrap_or_else(|_| unreachable!())
            .with_latency(Duration::from_millis(5)),
    );
    let closes = Arc::new(AtomicUsize::new(0));
    let leaf = Arc::new(CountingLeaf {
        inner: slow,
        closes: closes.clone(),
    });

    let source = DeserializingSource::new(leaf, decoders());
    source.initialize().await.unwrap();
    let iter = source
        .message_iterator(MessageIteratorArgs {
            topics: topic_selection([SubscribePayload::whole("/t")]),
            ..Default::default()
        })
        .unwrap();
    let mut cursor = MessageCursor::spawn(iter, 2);

    tokio::select! {
        _ = cursor.next_batch(Duration::from_secs(30)) => panic!("batch finished early"),
        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }
    cursor.end().await;
    cursor.end().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}
