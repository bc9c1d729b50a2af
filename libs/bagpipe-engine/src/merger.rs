use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::{OnceCell, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bagpipe_api::error::SourceError;
use bagpipe_api::message::{MessageEvent, PlayerProblem};
use bagpipe_api::progress::{
    BlockCacheSnapshot, Progress, Range, intersect_ranges, normalize_ranges, union_block_caches,
};
use bagpipe_api::schema::SchemaTable;
use bagpipe_api::source::{BackfillArgs, GetMessagesArgs, LogSource, MessagesByFormat};
use bagpipe_api::time::Time;
use bagpipe_api::topic::Initialization;

use crate::merge::merge_by_time;
use crate::sync::lock;

/// Progress of a child that owns none of the topics of the current request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdleChildPolicy {
    /// Counts as fully loaded until a request touches its topics again.
    #[default]
    FullyLoaded,
    /// Keeps whatever progress it reported last.
    KeepReported,
}

/// Presents several sources as one. Children must publish disjoint topics.
pub struct SourceMerger {
    name: String,
    sources: Vec<Arc<dyn LogSource>>,
    policy: IdleChildPolicy,
    merged: OnceCell<Merged>,
    progress_tx: watch::Sender<Progress>,
    events_tx: mpsc::UnboundedSender<AggregatorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AggregatorEvent>>>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

struct Merged {
    init: Initialization,
    children: Vec<Child>,
}

/// A child that initialized successfully.
struct Child {
    /// Position among initialized children.
    slot: usize,
    source: Arc<dyn LogSource>,
    start: Time,
    end: Time,
    topics: BTreeSet<String>,
}

impl Child {
    fn check_ownership<'a>(
        &self,
        events: impl IntoIterator<Item = &'a MessageEvent>,
    ) -> Result<(), SourceError> {
        for event in events {
            if !self.topics.contains(&event.topic) {
                return Err(SourceError::logic(format!(
                    "source '{}' returned a message on topic '{}' it does not own",
                    self.source.name(),
                    event.topic
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SourceMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceMerger")
            .field("name", &self.name)
            .field("sources", &self.sources.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl SourceMerger {
    pub fn new(name: impl Into<String>, sources: Vec<Arc<dyn LogSource>>) -> Self {
        let (progress_tx, _) = watch::channel(Progress::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            sources,
            policy: IdleChildPolicy::default(),
            merged: OnceCell::new(),
            progress_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            aggregator: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_idle_policy(mut self, policy: IdleChildPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn merged(&self) -> Result<&Merged, SourceError> {
        self.merged
            .get()
            .ok_or_else(|| SourceError::logic(format!("merger '{}' used before initialize", self.name)))
    }

    async fn open(&self) -> Result<Merged, SourceError> {
        if self.sources.is_empty() {
            return Err(SourceError::empty("no sources to merge"));
        }

        let results = join_all(self.sources.iter().map(|s| s.initialize())).await;

        let mut problems = Vec::new();
        let mut opened = Vec::new();
        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(init) => opened.push((source.clone(), init)),
                Err(e) => {
                    tracing::warn!(
                        merger = %self.name,
                        source = %source.name(),
                        error = %e,
                        "source failed to initialize, skipping"
                    );
                    problems.push(
                        PlayerProblem::warn(format!(
                            "source '{}' failed to initialize",
                            source.name()
                        ))
                        .with_error(&e),
                    );
                }
            }
        }

        if opened.is_empty() {
            // Nothing to play. Callers bound the wait with their own timeout.
            tracing::error!(
                merger = %self.name,
                sources = self.sources.len(),
                "every source failed to initialize"
            );
            return std::future::pending().await;
        }

        let init = merge_initializations(&opened, problems)?;
        let children: Vec<Child> = opened
            .into_iter()
            .enumerate()
            .map(|(slot, (source, child_init))| Child {
                slot,
                source,
                start: child_init.start,
                end: child_init.end,
                topics: child_init.topics.into_iter().map(|t| t.name).collect(),
            })
            .collect();

        self.start_aggregator(&children, init.start, init.end);

        tracing::info!(
            merger = %self.name,
            sources = children.len(),
            topics = init.topics.len(),
            start = %init.start,
            end = %init.end,
            "merged sources"
        );
        Ok(Merged { init, children })
    }

    fn start_aggregator(&self, children: &[Child], start: Time, end: Time) {
        let Some(events) = lock(&self.events_rx).take() else {
            return;
        };
        let aggregator = ProgressAggregator {
            start,
            end,
            spans: children.iter().map(|c| (c.start, c.end)).collect(),
            receivers: children.iter().map(|c| c.source.progress()).collect(),
            idle: vec![false; children.len()],
            tx: self.progress_tx.clone(),
        };
        let handle = tokio::spawn(aggregator.run(events, self.cancel.clone()));
        *lock(&self.aggregator) = Some(handle);
    }

    fn mark_idle(&self, child: &Child, idle: bool) {
        if self.policy == IdleChildPolicy::FullyLoaded {
            let _ = self.events_tx.send(AggregatorEvent::Idle {
                slot: child.slot,
                idle,
            });
        }
    }
}

impl Drop for SourceMerger {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl LogSource for SourceMerger {
    fn name(&self) -> &str {
        &self.name
    }

    /// Initializes all children concurrently. Failing children are dropped
    /// with a warning; if every child fails the returned future never
    /// completes.
    fn initialize(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Initialization, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let merged = self.merged.get_or_try_init(|| self.open()).await?;
            Ok(merged.init.clone())
        })
    }

    fn get_messages(
        &self,
        args: GetMessagesArgs,
    ) -> Pin<Box<dyn Future<Output = Result<MessagesByFormat, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let merged = self.merged()?;

            let mut fetches = Vec::new();
            for child in &merged.children {
                let topics = args.topics.filter(|t| child.topics.contains(t));
                if topics.is_empty() {
                    self.mark_idle(child, true);
                    continue;
                }
                self.mark_idle(child, false);
                if args.end < child.start || args.start > child.end {
                    continue;
                }
                let child_args = GetMessagesArgs {
                    start: args.start.max(child.start),
                    end: args.end.min(child.end),
                    topics,
                };
                fetches.push(async move { (child, child.source.get_messages(child_args).await) });
            }

            let mut raw = Vec::with_capacity(fetches.len());
            let mut parsed = Vec::with_capacity(fetches.len());
            for (child, result) in join_all(fetches).await {
                let messages = result
                    .map_err(|e| e.with_context(format!("source '{}'", child.source.name())))?;
                child.check_ownership(messages.raw.iter().chain(&messages.parsed))?;
                raw.push(messages.raw);
                parsed.push(messages.parsed);
            }

            Ok(MessagesByFormat {
                raw: merge_by_time(raw),
                parsed: merge_by_time(parsed),
            })
        })
    }

    fn get_backfill_messages(
        &self,
        args: BackfillArgs,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageEvent>, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let merged = self.merged()?;

            let mut fetches = Vec::new();
            for child in &merged.children {
                let topics = args.topics.filter(|t| child.topics.contains(t));
                if topics.is_empty() || args.time < child.start {
                    continue;
                }
                let child_args = BackfillArgs {
                    time: args.time,
                    topics,
                };
                fetches.push(async move {
                    (child, child.source.get_backfill_messages(child_args).await)
                });
            }

            let mut lists = Vec::with_capacity(fetches.len());
            for (child, result) in join_all(fetches).await {
                let mut events = result
                    .map_err(|e| e.with_context(format!("source '{}'", child.source.name())))?;
                child.check_ownership(&events)?;
                events.sort_by_key(|e| e.receive_time);
                lists.push(events);
            }
            Ok(merge_by_time(lists))
        })
    }

    fn progress(&self) -> Option<watch::Receiver<Progress>> {
        Some(self.progress_tx.subscribe())
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            self.cancel.cancel();
            let handle = lock(&self.aggregator).take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            join_all(self.sources.iter().map(|s| s.close())).await;
            tracing::debug!(merger = %self.name, "merger closed");
        })
    }
}

/// Combine child initializations. Topic, schema and format conflicts abort.
fn merge_initializations(
    opened: &[(Arc<dyn LogSource>, Initialization)],
    mut failures: Vec<PlayerProblem>,
) -> Result<Initialization, SourceError> {
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    let mut schemas = SchemaTable::new();
    let mut topics = Vec::new();
    let mut topic_stats = BTreeMap::new();
    let mut problems = Vec::new();

    let first_format = opened[0].1.message_format;
    let mut start = Time::MAX;
    let mut end = Time::ZERO;

    for (source, init) in opened {
        for topic in &init.topics {
            if let Some(owner) = owners.insert(topic.name.as_str(), source.name()) {
                return Err(SourceError::schema(format!(
                    "duplicate topic '{}' in sources '{owner}' and '{}'",
                    topic.name,
                    source.name()
                )));
            }
            topics.push(topic.clone());
        }
        schemas
            .merge(&init.schemas)
            .map_err(|e| e.with_context(format!("source '{}'", source.name())))?;
        if init.message_format != first_format {
            return Err(SourceError::schema("mixed message formats"));
        }
        start = start.min(init.start);
        end = end.max(init.end);
        topic_stats.extend(init.topic_stats.iter().map(|(k, v)| (k.clone(), *v)));
        problems.extend(init.problems.iter().cloned());
    }
    problems.append(&mut failures);

    Ok(Initialization {
        start,
        end,
        topics,
        schemas,
        message_format: first_format,
        topic_stats,
        problems,
    })
}

// ---------------------------------------------------------------------------
// Progress aggregation
// ---------------------------------------------------------------------------

enum AggregatorEvent {
    Idle { slot: usize, idle: bool },
}

/// Owns the merged progress. Recomputes from the latest child values, so
/// bursts of child updates collapse into one publish.
struct ProgressAggregator {
    start: Time,
    end: Time,
    spans: Vec<(Time, Time)>,
    receivers: Vec<Option<watch::Receiver<Progress>>>,
    idle: Vec<bool>,
    tx: watch::Sender<Progress>,
}

impl ProgressAggregator {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<AggregatorEvent>,
        cancel: CancellationToken,
    ) {
        let streams: Vec<BoxStream<'static, ()>> = self
            .receivers
            .iter()
            .flatten()
            .cloned()
            .map(|rx| {
                futures::stream::unfold(rx, |mut rx| async move {
                    rx.changed().await.ok()?;
                    Some(((), rx))
                })
                .boxed()
            })
            .collect();
        let mut changes = futures::stream::select_all(streams);

        self.publish();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = changes.next() => {}
                Some(event) = events.recv() => self.apply(event),
                else => break,
            }
            while let Some(Some(())) = changes.next().now_or_never() {}
            while let Ok(event) = events.try_recv() {
                self.apply(event);
            }
            self.publish();
        }
    }

    fn apply(&mut self, event: AggregatorEvent) {
        match event {
            AggregatorEvent::Idle { slot, idle } => {
                if let Some(flag) = self.idle.get_mut(slot) {
                    *flag = idle;
                }
            }
        }
    }

    fn publish(&self) {
        let progress = self.compute();
        self.tx.send_if_modified(|current| {
            if *current == progress {
                return false;
            }
            *current = progress;
            true
        });
    }

    fn compute(&self) -> Progress {
        let mut loaded = vec![Range::FULL];
        let mut snapshots: Vec<BlockCacheSnapshot> = Vec::new();

        for (slot, receiver) in self.receivers.iter().enumerate() {
            // No progress channel: always fully loaded.
            let Some(receiver) = receiver else { continue };
            let progress = receiver.borrow().clone();
            if let Some(snapshot) = progress.block_cache {
                snapshots.push(snapshot);
            }
            if self.idle[slot] {
                continue;
            }
            let (child_start, child_end) = self.spans[slot];
            let child = self.to_merged_timeline(
                child_start,
                child_end,
                &progress.fully_loaded_fraction_ranges,
            );
            loaded = intersect_ranges(&loaded, &child);
        }

        Progress {
            fully_loaded_fraction_ranges: loaded,
            block_cache: union_block_caches(&snapshots),
        }
    }

    /// Map child-local fractions onto the merged timeline. Time outside the
    /// child's span counts as loaded for that child.
    fn to_merged_timeline(&self, child_start: Time, child_end: Time, ranges: &[Range]) -> Vec<Range> {
        let lo = child_start.fraction_of(self.start, self.end);
        let hi = child_end.fraction_of(self.start, self.end);
        let mut out = vec![Range::new(0.0, lo), Range::new(hi, 1.0)];
        for r in ranges {
            let s = Time::at_fraction(child_start, child_end, r.start).fraction_of(self.start, self.end);
            let e = Time::at_fraction(child_start, child_end, r.end).fraction_of(self.start, self.end);
            out.push(Range::new(s, e));
        }
        normalize_ranges(out)
    }
}
