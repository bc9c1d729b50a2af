use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bagpipe_api::message::IteratorResult;
use bagpipe_api::source::MessageIterator;
use bagpipe_api::time::Time;

/// Consumer handle over a [`MessageIterator`].
///
/// The iterator runs in its own producer task and feeds a bounded channel,
/// so every call here can be dropped mid-await without losing the iterator.
/// The producer closes the iterator when it stops, whatever the reason.
pub struct MessageCursor {
    rx: mpsc::Receiver<IteratorResult>,
    /// First item at or after a `read_until` target.
    held: Option<IteratorResult>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MessageCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCursor")
            .field("held", &self.held.is_some())
            .field("ended", &self.cancel.is_cancelled())
            .finish()
    }
}

impl MessageCursor {
    /// Start the producer task. `capacity` bounds the items buffered ahead
    /// of the consumer.
    pub fn spawn(iter: Box<dyn MessageIterator>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(produce(iter, tx, cancel.clone()));
        Self {
            rx,
            held: None,
            cancel,
            task: Some(task),
        }
    }

    /// Next item, or `None` once the iterator is exhausted or the cursor
    /// has ended.
    pub async fn next(&mut self) -> Option<IteratorResult> {
        if let Some(item) = self.held.take() {
            return Some(item);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Wait for one item, then collect whatever else arrives within
    /// `budget`. `None` once exhausted.
    pub async fn next_batch(&mut self, budget: Duration) -> Option<Vec<IteratorResult>> {
        let deadline = tokio::time::Instant::now() + budget;
        let first = self.next().await?;
        let mut batch = vec![first];
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => batch.push(item),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
        Some(batch)
    }

    /// Every item strictly before `end`. The first item at or after `end`
    /// is kept for the next call. `None` once exhausted.
    ///
    /// Items without a time (problems) are returned with whatever precedes
    /// them.
    pub async fn read_until(&mut self, end: Time) -> Option<Vec<IteratorResult>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            if item.time().is_some_and(|t| t >= end) {
                self.held = Some(item);
                return Some(out);
            }
            out.push(item);
        }
        if out.is_empty() { None } else { Some(out) }
    }

    /// Stop the producer and wait until it has closed the iterator.
    ///
    /// Safe to call repeatedly.
    pub async fn end(&mut self) {
        self.cancel.cancel();
        self.held = None;
        self.rx.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "cursor producer task failed");
            }
        }
    }

    pub fn is_ended(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for MessageCursor {
    fn drop(&mut self) {
        // The producer still closes the iterator on its own.
        self.cancel.cancel();
    }
}

async fn produce(
    mut iter: Box<dyn MessageIterator>,
    tx: mpsc::Sender<IteratorResult>,
    cancel: CancellationToken,
) {
    let mut produced = 0u64;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = iter.next() => item,
        };
        let Some(item) = item else {
            tracing::debug!(produced, "iterator exhausted");
            break;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(item) => {
                if sent.is_err() {
                    break;
                }
            }
        }
        produced += 1;
    }
    iter.close().await;
    tracing::debug!(produced, cancelled = cancel.is_cancelled(), "cursor producer stopped");
}
