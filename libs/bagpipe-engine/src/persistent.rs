use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use bagpipe_api::message::{MessageEvent, MessagePayload};
use bagpipe_api::source::MessagesByFormat;
use bagpipe_api::store::{
    BlockStore, CacheDirectory, LogIdentity, StoredBlock, StoredMessage, StoredPayload,
};
use bagpipe_api::subscription::TopicsByFormat;

use crate::block_cache::CachedBlock;
use crate::sync::lock;

enum WriterCommand {
    Write(StoredBlock),
    Flush(oneshot::Sender<()>),
}

/// Where one log's blocks are persisted. The writer itself is opened by the
/// cache once its block duration is known.
#[derive(Clone)]
pub struct PersistentTarget {
    pub store: Arc<dyn BlockStore>,
    pub log_key: String,
    pub identity: LogIdentity,
}

impl PersistentTarget {
    pub fn new(store: Arc<dyn BlockStore>, log_key: impl Into<String>, identity: LogIdentity) -> Self {
        Self {
            store,
            log_key: log_key.into(),
            identity,
        }
    }

    pub async fn open(self, block_duration_ns: u64) -> PersistentCacheWriter {
        PersistentCacheWriter::open(self.store, self.log_key, self.identity, block_duration_ns).await
    }
}

/// Mirrors frozen cache blocks into a [`BlockStore`].
///
/// Writes run on a background task and never block reads. Store failures are
/// logged and otherwise ignored: a failed write is a future cache miss, a
/// failed read is a miss now.
pub struct PersistentCacheWriter {
    log_key: String,
    identity: LogIdentity,
    store: Arc<dyn BlockStore>,
    /// Indices with a completed write, readable back.
    stored: Arc<Mutex<BTreeSet<u32>>>,
    tx: mpsc::UnboundedSender<WriterCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PersistentCacheWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCacheWriter")
            .field("log_key", &self.log_key)
            .field("identity", &self.identity)
            .finish()
    }
}

impl PersistentCacheWriter {
    /// Attach to the store records of `log_key`.
    ///
    /// Records written for another identity or block duration are
    /// invalidated and a fresh directory record is written.
    pub async fn open(
        store: Arc<dyn BlockStore>,
        log_key: impl Into<String>,
        identity: LogIdentity,
        block_duration_ns: u64,
    ) -> Self {
        let log_key = log_key.into();
        let fresh = CacheDirectory {
            log_key: log_key.clone(),
            identity: identity.clone(),
            block_duration_ns,
            blocks: BTreeSet::new(),
        };

        let directory = match store.read_directory(&log_key).await {
            Ok(Some(dir)) if dir.identity == identity && dir.block_duration_ns == block_duration_ns => {
                tracing::info!(log = %log_key, blocks = dir.blocks.len(), "reusing persistent cache");
                Some(dir)
            }
            Ok(Some(stale)) => {
                tracing::info!(
                    log = %log_key,
                    stale_identity = %stale.identity,
                    identity = %identity,
                    "persistent cache is stale, invalidating"
                );
                if let Err(e) = store.invalidate(&stale).await {
                    tracing::warn!(log = %log_key, error = %e, "failed to invalidate stale cache");
                }
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(log = %log_key, error = %e, "failed to read cache directory");
                None
            }
        };

        let directory = match directory {
            Some(dir) => dir,
            None => {
                if let Err(e) = store.write_directory(&fresh).await {
                    tracing::warn!(log = %log_key, error = %e, "failed to write cache directory");
                }
                fresh
            }
        };

        let stored = Arc::new(Mutex::new(directory.blocks.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(store.clone(), directory, stored.clone(), rx));

        Self {
            log_key,
            identity,
            store,
            stored,
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn identity(&self) -> &LogIdentity {
        &self.identity
    }

    pub fn has_block(&self, index: u32) -> bool {
        lock(&self.stored).contains(&index)
    }

    /// Read a block back. Any failure is a miss.
    pub async fn read(&self, index: u32) -> Option<CachedBlock> {
        if !self.has_block(index) {
            return None;
        }
        match self.store.read_block(&self.log_key, &self.identity, index).await {
            Ok(Some(block)) => {
                tracing::debug!(log = %self.log_key, index, "block read from persistent cache");
                Some(from_stored(block))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(log = %self.log_key, index, error = %e, "persistent cache read failed");
                None
            }
        }
    }

    /// Queue a frozen block for writing.
    pub fn enqueue(&self, index: u32, block: &CachedBlock) {
        if self.tx.send(WriterCommand::Write(to_stored(index, block))).is_err() {
            tracing::warn!(log = %self.log_key, index, "persistent cache writer stopped, block dropped");
        }
    }

    /// Wait until every queued write has been attempted.
    pub async fn flush(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Flush and stop the writer task.
    pub async fn close(&self) {
        self.flush().await;
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn run_writer(
    store: Arc<dyn BlockStore>,
    mut directory: CacheDirectory,
    stored: Arc<Mutex<BTreeSet<u32>>>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Write(block) => {
                let index = block.index;
                if let Err(e) = store
                    .write_block(&directory.log_key, &directory.identity, &block)
                    .await
                {
                    tracing::warn!(log = %directory.log_key, index, error = %e, "persistent cache write failed");
                    continue;
                }
                directory.blocks.insert(index);
                if let Err(e) = store.write_directory(&directory).await {
                    tracing::warn!(log = %directory.log_key, error = %e, "failed to update cache directory");
                    continue;
                }
                lock(&stored).insert(index);
                tracing::debug!(log = %directory.log_key, index, "block persisted");
            }
            WriterCommand::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

fn to_stored_message(event: &MessageEvent, parsed: bool) -> StoredMessage {
    StoredMessage {
        topic: event.topic.clone(),
        schema_name: event.schema_name.clone(),
        receive_time: event.receive_time,
        parsed,
        size_in_bytes: event.size_in_bytes,
        payload: match &event.payload {
            MessagePayload::Raw(bytes) => StoredPayload::Raw(bytes.to_vec()),
            MessagePayload::Decoded(value) => StoredPayload::Decoded(value.clone()),
        },
    }
}

fn to_stored(index: u32, block: &CachedBlock) -> StoredBlock {
    let messages = block
        .messages
        .raw
        .iter()
        .map(|e| to_stored_message(e, false))
        .chain(block.messages.parsed.iter().map(|e| to_stored_message(e, true)))
        .collect();
    StoredBlock {
        index,
        raw_topics: block.topics.raw.clone(),
        parsed_topics: block.topics.parsed.clone(),
        size_in_bytes: block.size_in_bytes,
        messages,
    }
}

fn from_stored(block: StoredBlock) -> CachedBlock {
    let mut messages = MessagesByFormat::default();
    for message in block.messages {
        let payload = match message.payload {
            StoredPayload::Raw(bytes) => MessagePayload::Raw(bytes.into()),
            StoredPayload::Decoded(value) => MessagePayload::Decoded(value),
        };
        let event = MessageEvent {
            topic: message.topic,
            schema_name: message.schema_name,
            receive_time: message.receive_time,
            payload,
            size_in_bytes: message.size_in_bytes,
        };
        if message.parsed {
            messages.parsed.push(event);
        } else {
            messages.raw.push(event);
        }
    }
    CachedBlock::new(
        TopicsByFormat {
            raw: block.raw_topics,
            parsed: block.parsed_topics,
        },
        messages,
    )
}


#[cfg(test)]
mod tests {
    use bagpipe_api::time::Time;
    use bagpipe_storage_memory::MemoryBlockStore;

    use super::*;

    fn block() -> CachedBlock {
        CachedBlock::new(
            TopicsByFormat::raw(["/a"]),
            MessagesByFormat {
                raw: vec![
                    MessageEvent::raw("/a", Some("S"), Time::new(1, 0), vec![1u8, 2]),
                    MessageEvent::raw("/a", Some("S"), Time::new(1, 5), vec![3u8]),
                ],
                parsed: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let store = Arc::new(MemoryBlockStore::new());
        let identity = LogIdentity::from_content(b"log");
        let writer = PersistentCacheWriter::open(store.clone(), "front", identity.clone(), 1_000).await;

        assert!(writer.read(0).await.is_none());
        writer.enqueue(0, &block());
        writer.flush().await;
        assert!(writer.has_block(0));
        assert_eq!(writer.read(0).await, Some(block()));
        writer.close().await;

        // A second writer with the same identity sees the stored block.
        let reopened = PersistentCacheWriter::open(store, "front", identity, 1_000).await;
        assert!(reopened.has_block(0));
        assert_eq!(reopened.read(0).await, Some(block()));
    }

    #[tokio::test]
    async fn test_changed_identity_invalidates() {
        let store = Arc::new(MemoryBlockStore::new());
        let writer =
            PersistentCacheWriter::open(store.clone(), "front", LogIdentity::from_content(b"v1"), 1_000)
                .await;
        writer.enqueue(3, &block());
        writer.close().await;

        let writer =
            PersistentCacheWriter::open(store.clone(), "front", LogIdentity::from_content(b"v2"), 1_000)
                .await;
        assert!(!writer.has_block(3));
        assert!(writer.read(3).await.is_none());
        let directory = store.read_directory("front").await.unwrap().unwrap();
        assert_eq!(directory.identity, LogIdentity::from_content(b"v2"));
        assert!(directory.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_changed_block_duration_invalidates() {
        let store = Arc::new(MemoryBlockStore::new());
        let identity = LogIdentity::from_content(b"v1");
        let writer = PersistentCacheWriter::open(store.clone(), "front", identity.clone(), 1_000).await;
        writer.enqueue(0, &block());
        writer.close().await;

        let writer = PersistentCacheWriter::open(store, "front", identity, 2_000).await;
        assert!(!writer.has_block(0));
    }
}
