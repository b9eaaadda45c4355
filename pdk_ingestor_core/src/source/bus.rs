//! Message bus sources.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::{
    error::SourceError,
    metrics::PipelineMetrics,
    retry::RetryPolicy,
    source::{
        Frame, Origin, Payload,
        offsets::{CommitOffset, OffsetTracker, TopicPartition},
    },
};

/// A message read from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Bytes,
}

/// Why offsets are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// Regular commit while the pipeline runs. May complete in the background.
    Periodic,
    /// Last commit before the session ends. Must reach the broker before returning.
    Final,
}

/// A consumer session on a message bus.
///
/// `recv` must be cancel safe, it is raced against the shutdown signal.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Returns the next message, or `None` once the consumer is exhausted.
    async fn recv(&self) -> Result<Option<Message>, SourceError>;

    /// Commits the next offset to consume for each partition.
    async fn commit(&self, offsets: &[CommitOffset], kind: CommitKind) -> Result<(), SourceError>;
}

/// Emits one frame per message and tracks its offset.
pub struct BusSource {
    consumer: Arc<dyn MessageConsumer>,
    tracker: OffsetTracker,
    retry: RetryPolicy,
}

/// Commits the offsets of completed messages.
#[derive(Clone)]
pub struct OffsetCommitter {
    consumer: Arc<dyn MessageConsumer>,
    tracker: OffsetTracker,
}

impl BusSource {
    pub fn new(consumer: Arc<dyn MessageConsumer>) -> Self {
        Self {
            consumer,
            tracker: OffsetTracker::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the policy used when the consumer fails with a transient error.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut attempts = 0;
        let message = loop {
            attempts += 1;
            match self.consumer.recv().await {
                Ok(Some(message)) => break message,
                Ok(None) => return Ok(None),
                Err(err) if err.is_retryable() && self.retry.should_retry(attempts) => {
                    let delay = self.retry.backoff(attempts);
                    warn!(error = %err, attempts, ?delay, "consumer error, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        };

        let ack = self
            .tracker
            .register(&message.topic, message.partition, message.offset);

        Ok(Some(Frame {
            origin: Origin::Message {
                topic: message.topic,
                partition: message.partition,
                offset: message.offset,
            },
            payload: Payload::Bytes(message.payload),
            ack: Some(ack),
        }))
    }

    pub fn committer(&self) -> OffsetCommitter {
        OffsetCommitter {
            consumer: self.consumer.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl OffsetCommitter {
    /// Commits every offset that became ready since the last call.
    pub async fn commit(&self, metrics: &PipelineMetrics) -> Result<(), SourceError> {
        self.commit_with(metrics, CommitKind::Periodic).await
    }

    /// Commits the remaining ready offsets, waiting for the broker.
    pub async fn commit_final(&self, metrics: &PipelineMetrics) -> Result<(), SourceError> {
        self.commit_with(metrics, CommitKind::Final).await
    }

    async fn commit_with(
        &self,
        metrics: &PipelineMetrics,
        kind: CommitKind,
    ) -> Result<(), SourceError> {
        let ready = self.tracker.ready();
        if ready.is_empty() {
            return Ok(());
        }

        self.consumer.commit(&ready, kind).await?;
        self.tracker.mark_committed(&ready);
        metrics.offsets_committed.add(ready.len() as u64);

        for offset in &ready {
            debug!(topic = %offset.topic, partition = offset.partition, offset = offset.offset, "committed offset");
        }

        Ok(())
    }

    pub fn tracker(&self) -> &OffsetTracker {
        &self.tracker
    }
}

/// In-memory message bus consumer.
///
/// Offsets are assigned per partition, starting at 0. The consumer waits for
/// more messages until it is closed.
#[derive(Default)]
pub struct MemoryConsumer {
    inner: Mutex<MemoryConsumerState>,
    notify: Notify,
}

#[derive(Default)]
struct MemoryConsumerState {
    queue: VecDeque<Message>,
    next_offsets: BTreeMap<TopicPartition, i64>,
    committed: BTreeMap<TopicPartition, i64>,
    commits: Vec<CommitKind>,
    delivered: usize,
    closed: bool,
}

impl MemoryConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns its offset.
    pub fn send(&self, topic: &str, partition: i32, payload: impl Into<Bytes>) -> i64 {
        let offset = {
            let mut inner = self.lock();
            let next = inner
                .next_offsets
                .entry(TopicPartition::new(topic, partition))
                .or_insert(0);
            let offset = *next;
            *next += 1;
            inner.queue.push_back(Message {
                topic: topic.to_string(),
                partition,
                offset,
                payload: payload.into(),
            });
            offset
        };
        self.notify.notify_one();
        offset
    }

    /// Ends the session once every queued message is delivered.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// The last offset committed for a partition.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock()
            .committed
            .get(&TopicPartition::new(topic, partition))
            .copied()
    }

    /// Kinds of the commits received so far, in order.
    pub fn commits(&self) -> Vec<CommitKind> {
        self.lock().commits.clone()
    }

    /// Messages handed to the pipeline so far.
    pub fn delivered(&self) -> usize {
        self.lock().delivered
    }

    fn lock(&self) -> MutexGuard<'_, MemoryConsumerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn recv(&self) -> Result<Option<Message>, SourceError> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(message) = inner.queue.pop_front() {
                    inner.delivered += 1;
                    return Ok(Some(message));
                }
                if inner.closed {
                    return Ok(None);
                }
            }
            self.notify.notified().await;
        }
    }

    async fn commit(
        &self,
        offsets: &[CommitOffset],
        kind: CommitKind,
    ) -> Result<(), SourceError> {
        let mut inner = self.lock();
        inner.commits.push(kind);
        for offset in offsets {
            let committed = inner
                .committed
                .entry(TopicPartition::new(offset.topic.clone(), offset.partition))
                .or_insert(offset.offset);
            *committed = (*committed).max(offset.offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_consumer_assigns_offsets() {
        let consumer = Arc::new(MemoryConsumer::new());
        assert_eq!(consumer.send("t", 0, "a"), 0);
        assert_eq!(consumer.send("t", 1, "b"), 0);
        assert_eq!(consumer.send("t", 0, "c"), 1);
        consumer.close();

        let mut source = BusSource::new(consumer.clone());
        let mut origins = Vec::new();
        while let Some(frame) = source.next_frame().await.unwrap() {
            origins.push(frame.origin);
        }

        assert_eq!(
            origins,
            vec![
                Origin::message("t", 0, 0),
                Origin::message("t", 1, 0),
                Origin::message("t", 0, 1),
            ]
        );
        assert_eq!(consumer.delivered(), 3);
    }

    #[tokio::test]
    async fn test_commits_acknowledged_messages() {
        let consumer = Arc::new(MemoryConsumer::new());
        consumer.send("t", 0, "a");
        consumer.send("t", 0, "b");
        consumer.close();

        let metrics = PipelineMetrics::default();
        let mut source = BusSource::new(consumer.clone());
        let committer = source.committer();

        let first = source.next_frame().await.unwrap().unwrap();
        let second = source.next_frame().await.unwrap().unwrap();

        first.ack.unwrap().ack();
        committer.commit(&metrics).await.unwrap();
        assert_eq!(consumer.committed("t", 0), Some(1));

        drop(second);
        committer.commit(&metrics).await.unwrap();
        assert_eq!(consumer.committed("t", 0), Some(1));
        assert_eq!(metrics.offsets_committed.get(), 1);
        assert_eq!(consumer.commits(), vec![CommitKind::Periodic]);
    }

    #[tokio::test]
    async fn test_final_commit_waits_for_broker() {
        let consumer = Arc::new(MemoryConsumer::new());
        consumer.send("t", 0, "a");
        consumer.send("t", 0, "b");
        consumer.close();

        let metrics = PipelineMetrics::default();
        let mut source = BusSource::new(consumer.clone());
        let committer = source.committer();

        source.next_frame().await.unwrap().unwrap().ack.unwrap().ack();
        committer.commit(&metrics).await.unwrap();
        source.next_frame().await.unwrap().unwrap().ack.unwrap().ack();
        committer.commit_final(&metrics).await.unwrap();

        assert_eq!(consumer.committed("t", 0), Some(2));
        assert_eq!(
            consumer.commits(),
            vec![CommitKind::Periodic, CommitKind::Final]
        );

        // Nothing left to commit, the broker is not called again.
        committer.commit_final(&metrics).await.unwrap();
        assert_eq!(consumer.commits().len(), 2);
    }

    #[tokio::test]
    async fn test_recv_waits_for_messages() {
        let consumer = Arc::new(MemoryConsumer::new());
        let receiver = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.recv().await })
        };

        tokio::task::yield_now().await;
        consumer.send("t", 0, "late");

        let message = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(message.payload, Bytes::from("late"));
    }
}
