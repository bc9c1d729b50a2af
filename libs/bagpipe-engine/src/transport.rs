//! Request/response access to a cursor living on another task.
//!
//! [`CursorServer`] owns the [`MessageCursor`]; any number of
//! [`CursorProxy`] clones talk to it over a channel, one call at a time.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use bagpipe_api::error::SourceError;
use bagpipe_api::message::IteratorResult;
use bagpipe_api::time::Time;

use crate::cursor::MessageCursor;

const REQUEST_QUEUE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMethod {
    Next,
    NextBatch { budget_ms: u64 },
    ReadUntil(Time),
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CursorRequest {
    pub method: CursorMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CursorResponse {
    Item(Option<IteratorResult>),
    Batch(Option<Vec<IteratorResult>>),
    Ended,
}

type Reply = oneshot::Sender<Result<CursorResponse, SourceError>>;

/// Serves cursor calls until every proxy is gone, then ends the cursor.
pub struct CursorServer {
    cursor: MessageCursor,
    requests: mpsc::Receiver<(CursorRequest, Reply)>,
}

impl CursorServer {
    pub fn new(cursor: MessageCursor) -> (Self, CursorProxy) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        (
            Self {
                cursor,
                requests: rx,
            },
            CursorProxy { tx },
        )
    }

    /// Run the server on its own task.
    pub fn spawn(cursor: MessageCursor) -> (JoinHandle<()>, CursorProxy) {
        let (server, proxy) = Self::new(cursor);
        (tokio::spawn(server.run()), proxy)
    }

    pub async fn run(mut self) {
        while let Some((request, reply)) = self.requests.recv().await {
            let response = self.handle(request.method).await;
            if reply.send(Ok(response)).is_err() {
                tracing::debug!(method = ?request.method, "cursor caller went away before reply");
            }
        }
        self.cursor.end().await;
        tracing::debug!("cursor server stopped");
    }

    async fn handle(&mut self, method: CursorMethod) -> CursorResponse {
        match method {
            CursorMethod::Next => CursorResponse::Item(self.cursor.next().await),
            CursorMethod::NextBatch { budget_ms } => CursorResponse::Batch(
                self.cursor
                    .next_batch(Duration::from_millis(budget_ms))
                    .await,
            ),
            CursorMethod::ReadUntil(end) => CursorResponse::Batch(self.cursor.read_until(end).await),
            CursorMethod::End => {
                self.cursor.end().await;
                CursorResponse::Ended
            }
        }
    }
}

/// Caller side of a [`CursorServer`]. Mirrors the cursor's calls.
#[derive(Debug, Clone)]
pub struct CursorProxy {
    tx: mpsc::Sender<(CursorRequest, Reply)>,
}

impl CursorProxy {
    pub async fn call(&self, method: CursorMethod) -> Result<CursorResponse, SourceError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((CursorRequest { method }, reply_tx))
            .await
            .map_err(|_| SourceError::logic("cursor server is gone"))?;
        reply_rx
            .await
            .map_err(|_| SourceError::logic("cursor server dropped the request"))?
    }

    pub async fn next(&self) -> Result<Option<IteratorResult>, SourceError> {
        match self.call(CursorMethod::Next).await? {
            CursorResponse::Item(item) => Ok(item),
            other => Err(unexpected(other)),
        }
    }

    pub async fn next_batch(&self, budget: Duration) -> Result<Option<Vec<IteratorResult>>, SourceError> {
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        match self.call(CursorMethod::NextBatch { budget_ms }).await? {
            CursorResponse::Batch(batch) => Ok(batch),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read_until(&self, end: Time) -> Result<Option<Vec<IteratorResult>>, SourceError> {
        match self.call(CursorMethod::ReadUntil(end)).await? {
            CursorResponse::Batch(batch) => Ok(batch),
            other => Err(unexpected(other)),
        }
    }

    /// End the remote cursor. A server that is already gone counts as ended.
    pub async fn end(&self) -> Result<(), SourceError> {
        match self.call(CursorMethod::End).await {
            Ok(CursorResponse::Ended) => Ok(()),
            Ok(other) => Err(unexpected(other)),
            Err(e) => {
                tracing::debug!(error = %e, "cursor already gone");
                Ok(())
            }
        }
    }
}

fn unexpected(response: CursorResponse) -> SourceError {
    SourceError::logic(format!("unexpected cursor response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bagpipe_api::schema::SchemaTable;
    use bagpipe_api::source::{GetMessagesArgs, LogSource};
    use bagpipe_api::subscription::TopicsByFormat;
    use bagpipe_api::topic::Topic;

    use super::*;
    use crate::memory_source::{MemoryLogSource, MemoryRecord};

    fn cursor() -> MessageCursor {
        let source = Arc::new(MemoryLogSource::new(
            "leaf",
            vec![Topic::new("/a", None, "json")],
            SchemaTable::new(),
            (0..4)
                .map(|i| MemoryRecord::new("/a", Time::new(i, 0), b"{}".to_vec()))
                .collect(),
        ));
        let iter = source.message_iterator(GetMessagesArgs {
            start: Time::ZERO,
            end: Time::new(3, 0),
            topics: TopicsByFormat::raw(["/a"]),
        });
        MessageCursor::spawn(iter, 4)
    }

    #[tokio::test]
    async fn test_proxy_mirrors_cursor_calls() {
        let (task, proxy) = CursorServer::spawn(cursor());

        let first = proxy.next().await.unwrap().unwrap();
        assert_eq!(first.time(), Some(Time::ZERO));

        let rest = proxy.read_until(Time::new(2, 0)).await.unwrap().unwrap();
        let times: Vec<Time> = rest
            .iter()
            .filter_map(|r| r.as_message().map(|m| m.receive_time))
            .collect();
        assert_eq!(times, vec![Time::new(1, 0)]);

        proxy.end().await.unwrap();
        assert_eq!(proxy.next().await.unwrap(), None);

        drop(proxy);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_server_exit_fail() {
        let (server, proxy) = CursorServer::new(cursor());
        drop(server);
        let err = proxy.next().await.unwrap_err();
        assert_eq!(err.kind, bagpipe_api::error::ErrorKind::Logic);
        proxy.end().await.unwrap();
    }
}
