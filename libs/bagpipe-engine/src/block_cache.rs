use std::collections::BTreeMap;
use std::sync::Arc;

use bagpipe_api::message::MessageEvent;
use bagpipe_api::progress::{BlockCacheSnapshot, BlockDescriptor, Progress, Range, normalize_ranges};
use bagpipe_api::source::MessagesByFormat;
use bagpipe_api::subscription::TopicsByFormat;
use bagpipe_api::time::Time;

/// A frozen block: every message of `topics` within the block's bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBlock {
    pub topics: TopicsByFormat,
    pub messages: MessagesByFormat,
    pub size_in_bytes: u64,
}

impl CachedBlock {
    pub fn new(topics: TopicsByFormat, messages: MessagesByFormat) -> Self {
        let size_in_bytes = messages
            .raw
            .iter()
            .chain(&messages.parsed)
            .map(|e| e.size_in_bytes as u64)
            .sum();
        Self {
            topics,
            messages,
            size_in_bytes,
        }
    }

    pub fn descriptor(&self) -> BlockDescriptor {
        let mut message_count_by_topic: BTreeMap<String, u64> = BTreeMap::new();
        for event in self.messages.raw.iter().chain(&self.messages.parsed) {
            *message_count_by_topic.entry(event.topic.clone()).or_default() += 1;
        }
        BlockDescriptor {
            message_count_by_topic,
            size_in_bytes: self.size_in_bytes,
        }
    }

    /// Messages of `topics` within `[start, end]`.
    pub fn slice(&self, start: Time, end: Time, topics: &TopicsByFormat) -> MessagesByFormat {
        MessagesByFormat {
            raw: pick(&self.messages.raw, start, end, &topics.raw),
            parsed: pick(&self.messages.parsed, start, end, &topics.parsed),
        }
    }
}

fn pick(events: &[MessageEvent], start: Time, end: Time, topics: &[String]) -> Vec<MessageEvent> {
    events
        .iter()
        .filter(|e| e.receive_time >= start && e.receive_time <= end)
        .filter(|e| topics.contains(&e.topic))
        .cloned()
        .collect()
}

/// Upper bound on the number of slots of one cache.
pub const MAX_BLOCKS: u64 = 400;

/// Block duration actually used for a log spanning `span_ns`: the configured
/// duration, stretched so the log fits in [`MAX_BLOCKS`] slots.
pub fn effective_block_duration(span_ns: u64, configured_ns: u64) -> u64 {
    configured_ns.max(1).max(span_ns.div_ceil(MAX_BLOCKS - 1))
}

/// Fixed-duration block slots over `[start, end]`.
///
/// A slot is ready only once a complete block was `put`. The playhead block
/// and the `lookahead` blocks after it are never evicted. Long logs get
/// longer blocks, see [`effective_block_duration`].
#[derive(Debug)]
pub struct BlockCache {
    start: Time,
    end: Time,
    block_duration_ns: u64,
    slots: Vec<Option<Arc<CachedBlock>>>,
    total_bytes: u64,
    max_bytes: u64,
    lookahead: u32,
    playhead: u32,
}

impl BlockCache {
    pub fn new(start: Time, end: Time, block_duration_ns: u64, max_bytes: u64, lookahead: u32) -> Self {
        let end = end.max(start);
        let block_duration_ns = effective_block_duration(end.nanos_since(start), block_duration_ns);
        let count = end.nanos_since(start) / block_duration_ns + 1;
        Self {
            start,
            end,
            block_duration_ns,
            slots: vec![None; count as usize],
            total_bytes: 0,
            max_bytes,
            lookahead,
            playhead: 0,
        }
    }

    pub fn block_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn block_duration_ns(&self) -> u64 {
        self.block_duration_ns
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Block holding `time`. Times outside the log clamp to the first or
    /// last block.
    pub fn index_for(&self, time: Time) -> u32 {
        let offset = time.clamp(self.start, self.end).nanos_since(self.start);
        (offset / self.block_duration_ns) as u32
    }

    /// Inclusive time bounds of a block.
    pub fn block_bounds(&self, index: u32) -> (Time, Time) {
        let start = self.start.add_nanos(index as u64 * self.block_duration_ns);
        let end = start.add_nanos(self.block_duration_ns - 1).min(self.end);
        (start, end)
    }

    pub fn get(&self, index: u32) -> Option<Arc<CachedBlock>> {
        self.slots.get(index as usize).cloned().flatten()
    }

    /// Store a frozen block, replacing what the slot held. Returns the
    /// indices evicted to stay within budget.
    pub fn put(&mut self, index: u32, block: Arc<CachedBlock>) -> Vec<u32> {
        let Some(slot) = self.slots.get_mut(index as usize) else {
            return Vec::new();
        };
        if let Some(old) = slot.replace(block.clone()) {
            self.total_bytes -= old.size_in_bytes;
        }
        self.total_bytes += block.size_in_bytes;
        self.evict()
    }

    fn is_pinned(&self, index: u32) -> bool {
        index >= self.playhead && index <= self.playhead.saturating_add(self.lookahead)
    }

    /// Drop the ready blocks farthest from the playhead until the cache fits
    /// its budget or only pinned blocks remain.
    pub fn evict(&mut self) -> Vec<u32> {
        let mut evicted = Vec::new();
        while self.total_bytes > self.max_bytes {
            let victim = (0..self.block_count())
                .filter(|&i| self.slots[i as usize].is_some() && !self.is_pinned(i))
                .max_by_key(|&i| i.abs_diff(self.playhead));
            let Some(victim) = victim else { break };
            if let Some(block) = self.slots[victim as usize].take() {
                self.total_bytes -= block.size_in_bytes;
            }
            evicted.push(victim);
        }
        evicted
    }

    pub fn playhead(&self) -> u32 {
        self.playhead
    }

    pub fn set_playhead(&mut self, time: Time) -> Vec<u32> {
        self.playhead = self.index_for(time);
        self.evict()
    }

    fn fraction_at(&self, index: u32) -> f64 {
        let span = self.end.nanos_since(self.start);
        let offset = (index as u64).saturating_mul(self.block_duration_ns).min(span);
        offset as f64 / span as f64
    }

    pub fn progress(&self) -> Progress {
        let last = self.block_count().saturating_sub(1);
        let mut ranges = Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.is_none() {
                continue;
            }
            let i = i as u32;
            if self.end == self.start {
                ranges.push(Range::FULL);
                continue;
            }
            let end = if i == last { 1.0 } else { self.fraction_at(i + 1) };
            ranges.push(Range::new(self.fraction_at(i), end));
        }
        Progress {
            fully_loaded_fraction_ranges: normalize_ranges(ranges),
            block_cache: Some(BlockCacheSnapshot {
                start_time: self.start,
                blocks: self
                    .slots
                    .iter()
                    .map(|s| s.as_ref().map(|b| b.descriptor()))
                    .collect(),
            }),
        }
    }
}
