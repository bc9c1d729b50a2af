use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::SourceError;
use crate::message::{IteratorResult, MessageEvent, PlayerProblem};
use crate::progress::Progress;
use crate::subscription::{TopicSelection, TopicsByFormat};
use crate::time::Time;
use crate::topic::Initialization;

/// Window used by the default [`LogSource::message_iterator`].
pub const DEFAULT_ITERATOR_WINDOW_NS: u64 = 1_000_000_000;

/// Range read: both ends inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetMessagesArgs {
    pub start: Time,
    pub end: Time,
    pub topics: TopicsByFormat,
}

/// Messages of a range read, one time-ordered list per requested format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagesByFormat {
    pub raw: Vec<MessageEvent>,
    pub parsed: Vec<MessageEvent>,
}

impl MessagesByFormat {
    pub fn len(&self) -> usize {
        self.raw.len() + self.parsed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.parsed.is_empty()
    }

    /// Both lists merged by receive time; on ties raw events come first.
    pub fn into_time_ordered(self) -> Vec<MessageEvent> {
        let mut out = Vec::with_capacity(self.len());
        let mut raw = self.raw.into_iter().peekable();
        let mut parsed = self.parsed.into_iter().peekable();
        loop {
            let take_raw = match (raw.peek(), parsed.peek()) {
                (Some(r), Some(p)) => r.receive_time <= p.receive_time,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_raw { raw.next() } else { parsed.next() };
            out.extend(next);
        }
        out
    }
}

/// Consumer-side streaming read over subscriptions.
///
/// Missing bounds default to the start and end of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageIteratorArgs {
    pub topics: TopicSelection,
    pub start: Option<Time>,
    pub end: Option<Time>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillArgs {
    /// Latest message at or before this time is wanted, per topic.
    pub time: Time,
    pub topics: TopicsByFormat,
}

/// Keep the last event per topic. Input must be time-ordered.
pub fn latest_per_topic(events: impl IntoIterator<Item = MessageEvent>) -> Vec<MessageEvent> {
    let mut latest: BTreeMap<String, MessageEvent> = BTreeMap::new();
    for event in events {
        latest.insert(event.topic.clone(), event);
    }
    let mut out: Vec<MessageEvent> = latest.into_values().collect();
    out.sort_by_key(|e| e.receive_time);
    out
}

/// Pull-based stream of [`IteratorResult`]s.
///
/// `next()` returns `None` once the stream is exhausted. `close()` releases
/// whatever the iterator holds; calling it more than once is harmless.
pub trait MessageIterator: Send {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<IteratorResult>> + Send + '_>>;

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// A recorded log, or anything that behaves like one (caches, mergers).
///
/// Every layer of the pipeline implements this trait so that layers compose.
pub trait LogSource: Send + Sync + 'static {
    /// Name used in logs and problems.
    fn name(&self) -> &str;

    /// Open the log. Called once before any read.
    fn initialize(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Initialization, SourceError>> + Send + '_>>;

    /// Read every message of the requested topics in `[start, end]`.
    fn get_messages(
        &self,
        args: GetMessagesArgs,
    ) -> Pin<Box<dyn Future<Output = Result<MessagesByFormat, SourceError>> + Send + '_>>;

    /// Latest message at or before `args.time`, for each requested topic.
    ///
    /// Default: scans from the beginning of the log through `get_messages`.
    fn get_backfill_messages(
        &self,
        args: BackfillArgs,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<MessageEvent>, SourceError>> + Send + '_>> {
        Box::pin(async move {
            let messages = self
                .get_messages(GetMessagesArgs {
                    start: Time::ZERO,
                    end: args.time,
                    topics: args.topics,
                })
                .await?;
            Ok(latest_per_topic(messages.into_time_ordered()))
        })
    }

    /// Stream `[args.start, args.end]` in time order.
    ///
    /// Default: sequential fixed-size windows over `get_messages`, with a
    /// [`IteratorResult::Stamp`] after each window.
    fn message_iterator(self: Arc<Self>, args: GetMessagesArgs) -> Box<dyn MessageIterator> {
        Box::new(WindowedIterator::new(self, args, DEFAULT_ITERATOR_WINDOW_NS))
    }

    /// Loading progress. `None` means the source is always fully loaded.
    fn progress(&self) -> Option<watch::Receiver<Progress>> {
        None
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

// ---------------------------------------------------------------------------
// WindowedIterator: default MessageIterator over get_messages()
// ---------------------------------------------------------------------------

/// Walks a range in fixed windows, one outstanding `get_messages` at a time.
pub struct WindowedIterator<S: LogSource + ?Sized> {
    source: Arc<S>,
    topics: TopicsByFormat,
    cursor: Time,
    end: Time,
    window_ns: u64,
    pending: VecDeque<IteratorResult>,
    done: bool,
}

impl<S: LogSource + ?Sized> WindowedIterator<S> {
    pub fn new(source: Arc<S>, args: GetMessagesArgs, window_ns: u64) -> Self {
        Self {
            source,
            topics: args.topics,
            cursor: args.start,
            end: args.end,
            window_ns: window_ns.max(1),
            done: args.start > args.end,
            pending: VecDeque::new(),
        }
    }

    async fn fill(&mut self) {
        let window_end = self
            .cursor
            .add_nanos(self.window_ns - 1)
            .min(self.end);
        let args = GetMessagesArgs {
            start: self.cursor,
            end: window_end,
            topics: self.topics.clone(),
        };
        match self.source.get_messages(args).await {
            Ok(messages) => {
                self.pending.extend(
                    messages
                        .into_time_ordered()
                        .into_iter()
                        .map(IteratorResult::MessageEvent),
                );
                self.pending.push_back(IteratorResult::Stamp(window_end));
            }
            Err(e) => {
                self.pending.push_back(IteratorResult::Problem {
                    connection_id: self.source.name().to_string(),
                    problem: PlayerProblem::error(format!(
                        "failed to read messages in [{}, {window_end}]",
                        self.cursor
                    ))
                    .with_error(&e),
                });
                self.done = true;
                return;
            }
        }
        if window_end >= self.end || window_end == Time::MAX {
            self.done = true;
        } else {
            self.cursor = window_end.add_nanos(1);
        }
    }
}

impl<S: LogSource + ?Sized> MessageIterator for WindowedIterator<S> {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Option<IteratorResult>> + Send + '_>> {
        Box::pin(async move {
            loop {
                if let Some(item) = self.pending.pop_front() {
                    return Some(item);
                }
                if self.done {
                    return None;
                }
                self.fill().await;
            }
        })
    }

    fn close(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.done = true;
        self.pending.clear();
        Box::pin(async {})
    }
}
