//! Offset tracking for at-least-once delivery.
//!
//! Every message admitted from a bus source is registered with the tracker and
//! gets an [`AckHandle`]. The handle is cloned into every mutation derived from
//! the message. The message completes once every clone is gone; it succeeds
//! only if every clone was acknowledged. Per partition, the tracker commits the
//! offset following the longest run of completed messages. A failed message
//! stops the partition's commits for good, so it is delivered again on the
//! next run.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::DashMap;
use tracing::warn;

/// A topic partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

/// An offset to commit: the next offset to consume from the partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Clone, Default)]
pub struct OffsetTracker {
    partitions: Arc<DashMap<TopicPartition, PartitionOffsets>>,
}

/// Acknowledges the processing of a message.
///
/// Dropping a handle without calling [`AckHandle::ack`] fails the message.
pub struct AckHandle {
    completion: Arc<Completion>,
    acked: bool,
}

struct Completion {
    tracker: OffsetTracker,
    partition: TopicPartition,
    offset: i64,
    failed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OffsetState {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    states: BTreeMap<i64, OffsetState>,
    /// Next offset to commit, once every offset before it completed.
    committable: Option<i64>,
    committed: Option<i64>,
    /// Set once a message failed. States are no longer kept after that,
    /// only the number of messages still in flight.
    blocked: bool,
    in_flight: usize,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a message and returns its acknowledgement handle.
    pub fn register(&self, topic: &str, partition: i32, offset: i64) -> AckHandle {
        let partition = TopicPartition::new(topic, partition);
        {
            let mut offsets = self.partitions.entry(partition.clone()).or_default();
            if offsets.blocked {
                offsets.in_flight += 1;
            } else {
                offsets.states.insert(offset, OffsetState::Pending);
            }
        }

        AckHandle {
            completion: Arc::new(Completion {
                tracker: self.clone(),
                partition,
                offset,
                failed: AtomicBool::new(false),
            }),
            acked: false,
        }
    }

    /// Offsets that can be committed and were not committed yet.
    pub fn ready(&self) -> Vec<CommitOffset> {
        let mut ready = self
            .partitions
            .iter()
            .filter_map(|entry| {
                let offsets = entry.value();
                let offset = offsets.committable?;
                (offsets.committed < Some(offset)).then(|| CommitOffset {
                    topic: entry.key().topic.clone(),
                    partition: entry.key().partition,
                    offset,
                })
            })
            .collect::<Vec<_>>();
        ready.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        ready
    }

    /// Records offsets acknowledged by the source.
    pub fn mark_committed(&self, offsets: &[CommitOffset]) {
        for commit in offsets {
            let key = TopicPartition::new(commit.topic.clone(), commit.partition);
            if let Some(mut partition) = self.partitions.get_mut(&key) {
                partition.committed = partition.committed.max(Some(commit.offset));
            }
        }
    }

    /// Returns the number of messages that are registered and not completed.
    pub fn pending(&self) -> usize {
        self.partitions
            .iter()
            .map(|p| {
                p.in_flight
                    + p.states
                        .values()
                        .filter(|s| **s == OffsetState::Pending)
                        .count()
            })
            .sum()
    }

    fn complete(&self, partition: &TopicPartition, offset: i64, success: bool) {
        let Some(mut offsets) = self.partitions.get_mut(partition) else {
            return;
        };

        if offsets.blocked {
            offsets.in_flight = offsets.in_flight.saturating_sub(1);
            return;
        }

        if !success {
            warn!(%partition, offset, "message failed, offsets of this partition are no longer committed");
            offsets.blocked = true;
            offsets.states.remove(&offset);
            offsets.in_flight = offsets
                .states
                .values()
                .filter(|s| **s == OffsetState::Pending)
                .count();
            offsets.states.clear();
            return;
        }

        offsets.states.insert(offset, OffsetState::Done);
        while let Some(entry) = offsets.states.first_entry() {
            if *entry.get() != OffsetState::Done {
                break;
            }
            let (offset, _) = entry.remove_entry();
            offsets.committable = Some(offset + 1);
        }
    }
}

impl AckHandle {
    /// Marks this part of the message as processed.
    pub fn ack(mut self) {
        self.acked = true;
    }

    pub fn offset(&self) -> i64 {
        self.completion.offset
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.completion.partition
    }
}

impl Clone for AckHandle {
    /// Returns a new, unacknowledged handle on the same message.
    fn clone(&self) -> Self {
        Self {
            completion: self.completion.clone(),
            acked: false,
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if !self.acked {
            self.completion.failed.store(true, Ordering::Release);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        let success = !self.failed.load(Ordering::Acquire);
        self.tracker.complete(&self.partition, self.offset, success);
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("partition", &self.completion.partition)
            .field("offset", &self.completion.offset)
            .field("acked", &self.acked)
            .finish()
    }
}
