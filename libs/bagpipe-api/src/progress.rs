use std::collections::BTreeMap;

use crate::time::Time;

/// A fractional range of the timeline, `0 <= start <= end <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Range {
    pub start: f64,
    pub end: f64,
}

impl Range {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub const FULL: Range = Range { start: 0.0, end: 1.0 };

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Sort, clamp to `[0, 1]`, drop empty ranges and union overlapping or
/// touching ones.
pub fn normalize_ranges(mut ranges: Vec<Range>) -> Vec<Range> {
    for r in &mut ranges {
        r.start = r.start.clamp(0.0, 1.0);
        r.end = r.end.clamp(0.0, 1.0);
    }
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut out: Vec<Range> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match out.last_mut() {
            Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
            _ => out.push(r),
        }
    }
    out
}

/// Intersection of two range sets.
pub fn intersect_ranges(a: &[Range], b: &[Range]) -> Vec<Range> {
    let a = normalize_ranges(a.to_vec());
    let b = normalize_ranges(b.to_vec());

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let start = a[i].start.max(b[j].start);
        let end = a[i].end.min(b[j].end);
        if start < end {
            out.push(Range { start, end });
        }
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// What one cache block holds.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockDescriptor {
    pub message_count_by_topic: BTreeMap<String, u64>,
    pub size_in_bytes: u64,
}

impl BlockDescriptor {
    fn absorb(&mut self, other: &BlockDescriptor) {
        for (topic, count) in &other.message_count_by_topic {
            *self.message_count_by_topic.entry(topic.clone()).or_default() += count;
        }
        self.size_in_bytes += other.size_in_bytes;
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BlockCacheSnapshot {
    pub start_time: Time,
    /// `None` for blocks that are not loaded.
    pub blocks: Vec<Option<BlockDescriptor>>,
}

/// Block-index-wise union of several snapshots.
pub fn union_block_caches<'a>(
    snapshots: impl IntoIterator<Item = &'a BlockCacheSnapshot>,
) -> Option<BlockCacheSnapshot> {
    let mut merged: Option<BlockCacheSnapshot> = None;
    for snapshot in snapshots {
        let target = merged.get_or_insert_with(|| BlockCacheSnapshot {
            start_time: snapshot.start_time,
            blocks: Vec::new(),
        });
        target.start_time = target.start_time.min(snapshot.start_time);
        if target.blocks.len() < snapshot.blocks.len() {
            target.blocks.resize(snapshot.blocks.len(), None);
        }
        for (slot, block) in target.blocks.iter_mut().zip(&snapshot.blocks) {
            if let Some(block) = block {
                slot.get_or_insert_with(BlockDescriptor::default).absorb(block);
            }
        }
    }
    merged
}

/// How much of the timeline is immediately servable.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Progress {
    pub fully_loaded_fraction_ranges: Vec<Range>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_cache: Option<BlockCacheSnapshot>,
}

impl Progress {
    /// Everything is loaded.
    pub fn complete() -> Self {
        Self {
            fully_loaded_fraction_ranges: vec![Range::FULL],
            block_cache: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        normalize_ranges(self.fully_loaded_fraction_ranges.clone()) == vec![Range::FULL]
    }

    /// Loaded fraction of the whole timeline.
    pub fn loaded_fraction(&self) -> f64 {
        normalize_ranges(self.fully_loaded_fraction_ranges.clone())
            .iter()
            .map(|r| r.end - r.start)
            .sum()
    }
}
