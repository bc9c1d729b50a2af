use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{OnceCell, watch};

use bagpipe_api::error::SourceError;
use bagpipe_api::message::MessageEvent;
use bagpipe_api::progress::Progress;
use bagpipe_api::source::{
    BackfillArgs, GetMessagesArgs, LogSource, MessageIterator, MessagesByFormat, WindowedIterator,
};
use bagpipe_api::subscription::TopicsByFormat;
use bagpipe_api::time::Time;
use bagpipe_api::topic::Initialization;

use crate::block_cache::{BlockCache, CachedBlock};
use crate::config::CacheConfig;
use crate::persistent::{PersistentCacheWriter, PersistentTarget};
use crate::sync::lock;

type BlockFetch = Shared<BoxFuture<'static, Result<Arc<CachedBlock>, SourceError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub block_duration_ns: u64,
    pub max_cache_bytes: u64,
    pub lookahead_blocks: u32,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheConfig::default().into()
    }
}

impl From<CacheConfig> for CacheOptions {
    fn from(config: CacheConfig) -> Self {
        Self {
            block_duration_ns: config.block_duration_ms.saturating_mul(1_000_000),
            max_cache_bytes: config.max_cache_bytes,
            lookahead_blocks: config.lookahead_blocks,
        }
    }
}

/// Serves a source block by block out of a [`BlockCache`].
///
/// At most one fetch is in flight per block index, and at most one leaf
/// fetch runs at a time. Fetches run on their own tasks and complete even
/// when every reader waiting on them is cancelled.
pub struct CachingSource {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    source: Arc<dyn LogSource>,
    options: CacheOptions,
    persistent_target: Option<PersistentTarget>,
    persistent: OnceCell<PersistentCacheWriter>,
    init: OnceCell<Initialization>,
    cache: Mutex<Option<BlockCache>>,
    inflight: Mutex<HashMap<u32, BlockFetch>>,
    fetch_lock: tokio::sync::Mutex<()>,
    progress_tx: watch::Sender<Progress>,
}

impl std::fmt::Debug for CachingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingSource")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl CachingSource {
    pub fn new(source: Arc<dyn LogSource>, options: CacheOptions) -> Self {
        Self::build(source, options, None)
    }

    /// Cache that also mirrors frozen blocks into a persistent store and
    /// reads them back before asking the source. The store records are
    /// opened at initialize, keyed by the block duration in use.
    pub fn with_persistent(
        source: Arc<dyn LogSource>,
        options: CacheOptions,
        target: PersistentTarget,
    ) -> Self {
        Self::build(source, options, Some(target))
    }

    fn build(
        source: Arc<dyn LogSource>,
        options: CacheOptions,
        persistent_target: Option<PersistentTarget>,
    ) -> Self {
        let (progress_tx, _) = watch::channel(Progress::default());
        Self {
            inner: Arc::new(Inner {
                name: format!("cache({})", source.name()),
                source,
                options,
                persistent_target,
                persistent: OnceCell::new(),
                init: OnceCell::new(),
                cache: Mutex::new(None),
                inflight: Mutex::new(HashMap::new()),
                fetch_lock: tokio::sync::Mutex::new(()),
                progress_tx,
            }),
        }
    }

    /// Bytes currently held by ready blocks.
    pub fn cached_bytes(&self) -> u64 {
        lock(&self.inner.cache)
            .as_ref()
            .map(BlockCache::total_bytes)
            .unwrap_or(0)
    }

    pub fn is_cached(&self, index: u32) -> bool {
        self.inner.cached(index).is_some()
    }
}

impl Inner {
    /// Block duration in use: the configured one until initialize, then
    /// the cache's own.
    fn block_duration_ns(&self) -> u64 {
        lock(&self.cache)
            .as_ref()
            .map(BlockCache::block_duration_ns)
            .unwrap_or(self.options.block_duration_ns)
    }

    fn cached(&self, index: u32) -> Option<Arc<CachedBlock>> {
        lock(&self.cache).as_ref().and_then(|c| c.get(index))
    }

    async fn block(
        self: &Arc<Self>,
        index: u32,
        topics: &TopicsByFormat,
    ) -> Result<Arc<CachedBlock>, SourceError> {
        loop {
            if let Some(block) = self.cached(index) {
                if block.topics.covers(topics) {
                    return Ok(block);
                }
            }
            let block = self.fetch_shared(index, topics).await?;
            if block.topics.covers(topics) {
                return Ok(block);
            }
            // Joined a fetch for a narrower topic set; go again with the union.
        }
    }

    fn fetch_shared(self: &Arc<Self>, index: u32, topics: &TopicsByFormat) -> BlockFetch {
        let mut inflight = lock(&self.inflight);
        if let Some(fetch) = inflight.get(&index) {
            return fetch.clone();
        }
        let wanted = match self.cached(index) {
            Some(block) => block.topics.union(topics),
            None => topics.clone(),
        };
        let this = self.clone();
        let task = tokio::spawn(async move {
            let result = this.load(index, wanted).await;
            lock(&this.inflight).remove(&index);
            result
        });
        let fetch = async move {
            task.await.unwrap_or_else(|e| {
                Err(SourceError::logic(format!("fetch of block {index} failed: {e}")))
            })
        }
        .boxed()
        .shared();
        inflight.insert(index, fetch.clone());
        fetch
    }

    async fn load(&self, index: u32, topics: TopicsByFormat) -> Result<Arc<CachedBlock>, SourceError> {
        if let Some(persistent) = self.persistent.get() {
            if let Some(block) = persistent.read(index).await {
                if block.topics.covers(&topics) {
                    let block = Arc::new(block);
                    self.store(index, block.clone(), false);
                    return Ok(block);
                }
            }
        }

        let (start, end) = lock(&self.cache)
            .as_ref()
            .map(|c| c.block_bounds(index))
            .ok_or_else(|| SourceError::logic(format!("'{}' used before initialize", self.name)))?;

        let _leaf = self.fetch_lock.lock().await;
        let messages = self
            .source
            .get_messages(GetMessagesArgs {
                start,
                end,
                topics: topics.clone(),
            })
            .await
            .map_err(|e| e.with_context(format!("block {index}")))?;
        let block = Arc::new(CachedBlock::new(topics, messages));
        tracing::debug!(
            source = %self.source.name(),
            index,
            messages = block.messages.len(),
            bytes = block.size_in_bytes,
            "block fetched"
        );
        self.store(index, block.clone(), true);
        Ok(block)
    }

    fn store(&self, index: u32, block: Arc<CachedBlock>, persist: bool) {
        let progress = {
            let mut guard = lock(&self.cache);
            let Some(cache) = guard.as_mut() else { return };
            let evicted = cache.put(index, block.clone());
            if !evicted.is_empty() {
                tracing::debug!(source = %self.source.name(), ?evicted, "blocks evicted");
            }
            cache.progress()
        };
        self.progress_tx.send_replace(progress);
        if persist {
            if let Some(persistent) = self.persistent.get() {
                persistent.enqueue(index, &block);
            }
        }
    }

    fn set_playhead(&self, time: Time) {
        let progress = {
            let mut guard = lock(&self.cache);
            let Some(cache) = guard.as_mut() else { return };
            if cache.index_for(time) == cache.playhead() {
                return;
            }
            let evicted = cache.set_playhead(time);
            if evicted.is_empty() {
                return;
            }
            tracing::debug!(source = %self.source.name(), ?evicted, "blocks evicted");
            cache.progress()
        };
        self.progress_tx.send_replace(progress);
    }
}

impl LogSource for CachingSource {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn initialize(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Initialization, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let inner = &self.inner;
            let init = inner
                .init
                .get_or_try_init(|| async {
                    let init = inner.source.initialize().await?;
                    let cache = BlockCache::new(
                        init.start,
                        init.end,
                        inner.options.block_duration_ns,
                        inner.options.max_cache_bytes,
                        inner.options.lookahead_blocks,
                    );
                    if let Some(target) = &inner.persistent_target {
                        let writer = target.clone().open(cache.block_duration_ns()).await;
                        if inner.persistent.set(writer).is_err() {
                            tracing::warn!(source = %inner.source.name(), "persistent cache already attached");
                        }
                    }
                    tracing::info!(
                        source = %inner.source.name(),
                        blocks = cache.block_count(),
                        block_duration_ns = cache.block_duration_ns(),
                        "block cache ready"
                    );
                    inner.progress_tx.send_replace(cache.progress());
                    *lock(&inner.cache) = Some(cache);
                    Ok::<_, SourceError>(init)
                })
                .await?;
            Ok(init.clone())
        })
    }

    fn get_messages(
        &self,
        args: GetMessagesArgs,
    ) -> Pin<Box<dyn Future<Output = Result<MessagesByFormat, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let init = self
                .inner
                .init
                .get()
                .ok_or_else(|| SourceError::logic(format!("'{}' used before initialize", self.inner.name)))?;

            let start = args.start.max(init.start);
            let end = args.end.min(init.end);
            if start > end || args.topics.is_empty() {
                return Ok(MessagesByFormat::default());
            }

            self.inner.set_playhead(start);
            let indices = {
                let guard = lock(&self.inner.cache);
                let Some(cache) = guard.as_ref() else {
                    return Err(SourceError::logic("block cache missing after initialize"));
                };
                cache.index_for(start)..=cache.index_for(end)
            };

            let mut out = MessagesByFormat::default();
            for index in indices {
                let block = self.inner.block(index, &args.topics).await?;
                let slice = block.slice(start, end, &args.topics);
                out.raw.extend(slice.raw);
                out.parsed.extend(slice.parsed);
            }
            Ok(out)
        })
    }

    /// Served by the source directly; backfill reads are sparse and would
    /// otherwise pull every block before `args.time` into the cache.
    fn get_backfill_messages(
        &self,
        args: BackfillArgs,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageEvent>, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let _leaf = self.inner.fetch_lock.lock().await;
            self.inner.source.get_backfill_messages(args).await
        })
    }

    fn message_iterator(self: Arc<Self>, args: GetMessagesArgs) -> Box<dyn MessageIterator> {
        let window = self.inner.block_duration_ns();
        Box::new(WindowedIterator::new(self, args, window))
    }

    fn progress(&self) -> Option<watch::Receiver<Progress>> {
        Some(self.inner.progress_tx.subscribe())
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Some(persistent) = self.inner.persistent.get() {
                persistent.close().await;
            }
            self.inner.source.close().await;
        })
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bagpipe_api::message::IteratorResult;
    use bagpipe_api::progress::Range;
    use bagpipe_api::schema::SchemaTable;
    use bagpipe_api::store::{BlockStore, LogIdentity};
    use bagpipe_api::topic::Topic;
    use bagpipe_storage_memory::MemoryBlockStore;

    use super::*;
    use crate::memory_source::{MemoryLogSource, MemoryRecord};

    /// Ten seconds of `/a` and `/b` at 2 Hz, 100-byte payloads.
    fn leaf() -> MemoryLogSource {
        let mut records = Vec::new();
        for i in 0..20u64 {
            let time = Time::from_millis(i * 500);
            records.push(MemoryRecord::new("/a", time, vec![1u8; 100]));
            records.push(MemoryRecord::new("/b", time, vec![2u8; 100]));
        }
        MemoryLogSource::new(
            "leaf",
            vec![Topic::new("/a", None, "json"), Topic::new("/b", None, "json")],
            SchemaTable::new(),
            records,
        )
    }

    fn options(max_cache_bytes: u64) -> CacheOptions {
        CacheOptions {
            block_duration_ns: 1_000_000_000,
            max_cache_bytes,
            lookahead_blocks: 0,
        }
    }

    fn args(start_ms: u64, end_ms: u64, topics: &[&str]) -> GetMessagesArgs {
        GetMessagesArgs {
            start: Time::from_millis(start_ms),
            end: Time::from_millis(end_ms),
            topics: TopicsByFormat::raw(topics.iter().copied()),
        }
    }

    #[tokio::test]
    async fn test_reads_match_source_and_hit_cache() {
        let leaf = Arc::new(leaf());
        let cache = CachingSource::new(leaf.clone(), options(u64::MAX));
        cache.initialize().await.unwrap();

        let cached = cache.get_messages(args(250, 2_750, &["/a"])).await.unwrap();
        let direct = leaf.get_messages(args(250, 2_750, &["/a"])).await.unwrap();
        assert_eq!(cached, direct);
        let fetches = leaf.fetch_count();
        assert_eq!(fetches, 1 + 3);

        // Same range again: served from the cache.
        cache.get_messages(args(1_000, 2_000, &["/a"])).await.unwrap();
        assert_eq!(leaf.fetch_count(), fetches);
        assert!(cache.is_cached(2));
    }

    #[tokio::test]
    async fn test_wider_topic_set_refetches_union() {
        let leaf = Arc::new(leaf());
        let cache = CachingSource::new(leaf.clone(), options(u64::MAX));
        cache.initialize().await.unwrap();

        cache.get_messages(args(0, 999, &["/a"])).await.unwrap();
        let both = cache.get_messages(args(0, 999, &["/a", "/b"])).await.unwrap();
        assert_eq!(both.raw.len(), 4);
        assert_eq!(leaf.fetch_count(), 2);

        // Narrower request is covered by the union block.
        let only_b = cache.get_messages(args(0, 999, &["/b"])).await.unwrap();
        assert_eq!(only_b.raw.len(), 2);
        assert_eq!(leaf.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_evicted_block_refetched_once() {
        let leaf = Arc::new(leaf().with_latency(Duration::from_millis(20)));
        // Room for two 400-byte blocks.
        let cache = Arc::new(CachingSource::new(leaf.clone(), options(800)));
        cache.initialize().await.unwrap();

        cache.get_messages(args(0, 999, &["/a", "/b"])).await.unwrap();
        cache.get_messages(args(5_000, 5_999, &["/a", "/b"])).await.unwrap();
        cache.get_messages(args(9_000, 9_500, &["/a", "/b"])).await.unwrap();
        assert!(!cache.is_cached(0), "block 0 should have been evicted");
        let before = leaf.fetch_count();

        let reads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_messages(args(0, 999, &["/a", "/b"])).await })
            })
            .collect();
        for read in reads {
            assert_eq!(read.await.unwrap().unwrap().raw.len(), 4);
        }
        assert_eq!(leaf.fetch_count(), before + 1);
    }

    #[tokio::test]
    async fn test_progress_tracks_ready_blocks() {
        let leaf = Arc::new(leaf());
        let cache = CachingSource::new(leaf, options(u64::MAX));
        let rx = cache.progress().unwrap();
        let init = cache.initialize().await.unwrap();
        assert_eq!(init.end, Time::from_millis(9_500));
        assert!(rx.borrow().fully_loaded_fraction_ranges.is_empty());

        cache.get_messages(args(0, 9_500, &["/a"])).await.unwrap();
        assert_eq!(rx.borrow().fully_loaded_fraction_ranges, vec![Range::FULL]);
        let snapshot = rx.borrow().block_cache.clone().unwrap();
        assert!(snapshot.blocks.iter().all(Option::is_some));
    }

    #[tokio::test]
    async fn test_iterator_yields_stamps_per_block() {
        let cache = Arc::new(CachingSource::new(Arc::new(leaf()), options(u64::MAX)));
        cache.initialize().await.unwrap();
        let mut iter = cache.clone().message_iterator(args(0, 2_999, &["/a"]));
        let mut events = 0;
        let mut stamps = Vec::new();
        while let Some(item) = iter.next().await {
            match item {
                IteratorResult::MessageEvent(_) => events += 1,
                IteratorResult::Stamp(t) => stamps.push(t),
                IteratorResult::Problem { .. } => panic!("unexpected problem"),
            }
        }
        iter.close().await;
        assert_eq!(events, 6);
        assert_eq!(
            stamps,
            vec![
                Time::new(0, 999_999_999),
                Time::new(1, 999_999_999),
                Time::new(2, 999_999_999)
            ]
        );
    }

    #[tokio::test]
    async fn test_persistent_blocks_are_read_back() {
        let store = Arc::new(MemoryBlockStore::new());
        let identity = LogIdentity::from_content(b"leaf");

        let first_leaf = Arc::new(leaf());
        let target = PersistentTarget::new(store.clone(), "leaf", identity.clone());
        let cache = CachingSource::with_persistent(first_leaf.clone(), options(u64::MAX), target);
        cache.initialize().await.unwrap();
        let expected = cache.get_messages(args(0, 1_999, &["/a"])).await.unwrap();
        cache.close().await;

        let second_leaf = Arc::new(leaf());
        let target = PersistentTarget::new(store, "leaf", identity);
        let cache = CachingSource::with_persistent(second_leaf.clone(), options(u64::MAX), target);
        cache.initialize().await.unwrap();
        let again = cache.get_messages(args(0, 1_999, &["/a"])).await.unwrap();
        assert_eq!(again, expected);
        assert_eq!(second_leaf.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_read_does_not_block_other_blocks() {
        let leaf = Arc::new(leaf().with_latency(Duration::from_millis(100)));
        let cache = CachingSource::new(leaf.clone(), options(u64::MAX));
        cache.initialize().await.unwrap();
        let after_init = leaf.fetch_count();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), cache.get_messages(args(0, 999, &["/a"]))).await;
        assert!(cancelled.is_err());

        let other = tokio::time::timeout(Duration::from_secs(2), cache.get_messages(args(5_000, 5_999, &["/a"])))
            .await
            .expect("read of block 5 hung behind a cancelled fetch")
            .unwrap();
        assert_eq!(other.raw.len(), 2);

        // The abandoned fetch still completed and filled its block.
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cache.is_cached(0) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("abandoned fetch never landed");
        assert_eq!(leaf.fetch_count(), after_init + 2);
    }

    #[tokio::test]
    async fn test_long_log_uses_bounded_blocks() {
        let leaf = Arc::new(MemoryLogSource::new(
            "wall-clock",
            vec![Topic::new("/a", None, "json")],
            SchemaTable::new(),
            vec![
                MemoryRecord::new("/a", Time::ZERO, vec![1u8; 10]),
                MemoryRecord::new("/a", Time::new(1_700_000_000, 0), vec![2u8; 10]),
            ],
        ));
        let store = Arc::new(MemoryBlockStore::new());
        let identity = LogIdentity::from_content(b"wall-clock");
        let cache = Arc::new(CachingSource::with_persistent(
            leaf,
            options(u64::MAX),
            PersistentTarget::new(store.clone(), "wall-clock", identity),
        ));
        cache.initialize().await.unwrap();

        let all = cache
            .get_messages(GetMessagesArgs {
                start: Time::ZERO,
                end: Time::new(1_700_000_000, 0),
                topics: TopicsByFormat::raw(["/a"]),
            })
            .await
            .unwrap();
        assert_eq!(all.raw.len(), 2);
        let snapshot = cache.progress().unwrap().borrow().block_cache.clone().unwrap();
        assert!(snapshot.blocks.len() as u64 <= crate::block_cache::MAX_BLOCKS);

        cache.close().await;
        let directory = store.read_directory("wall-clock").await.unwrap().unwrap();
        assert!(directory.block_duration_ns > 1_000_000_000);
    }
}
