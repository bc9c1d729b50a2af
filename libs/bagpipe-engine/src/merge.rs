use std::cmp::Reverse;
use std::collections::BinaryHeap;

use bagpipe_api::message::MessageEvent;
use bagpipe_api::time::Time;

/// Streaming k-way merge of time-ordered inputs.
///
/// Output is ordered by receive time; equal times keep input order (lower
/// input index first, then position within the input).
pub struct MergeByTime<I: Iterator<Item = MessageEvent>> {
    inputs: Vec<I>,
    heads: Vec<Option<MessageEvent>>,
    heap: BinaryHeap<Reverse<(Time, usize)>>,
}

impl<I: Iterator<Item = MessageEvent>> MergeByTime<I> {
    pub fn new(inputs: impl IntoIterator<Item = I>) -> Self {
        let mut inputs: Vec<I> = inputs.into_iter().collect();
        let mut heads = Vec::with_capacity(inputs.len());
        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (i, input) in inputs.iter_mut().enumerate() {
            let head = input.next();
            if let Some(event) = &head {
                heap.push(Reverse((event.receive_time, i)));
            }
            heads.push(head);
        }
        Self { inputs, heads, heap }
    }
}

impl<I: Iterator<Item = MessageEvent>> Iterator for MergeByTime<I> {
    type Item = MessageEvent;

    fn next(&mut self) -> Option<MessageEvent> {
        let Reverse((_, i)) = self.heap.pop()?;
        let event = self.heads[i].take()?;
        if let Some(next) = self.inputs[i].next() {
            self.heap.push(Reverse((next.receive_time, i)));
            self.heads[i] = Some(next);
        }
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), None)
    }
}

/// Merge time-ordered lists into one time-ordered list.
pub fn merge_by_time(lists: Vec<Vec<MessageEvent>>) -> Vec<MessageEvent> {
    let total = lists.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(total);
    out.extend(MergeByTime::new(lists.into_iter().map(Vec::into_iter)));
    out
}
