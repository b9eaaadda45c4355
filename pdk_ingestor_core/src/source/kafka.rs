//! Kafka consumer.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::{
    ClientConfig, Message as _, Offset, TopicPartitionList,
    consumer::{CommitMode, Consumer, StreamConsumer},
};
use tracing::info;

use crate::{
    error::SourceError,
    source::{CommitKind, CommitOffset, Message, MessageConsumer},
};

/// Kafka consumer group session.
///
/// Offsets are only committed explicitly, once their messages are applied.
/// The final commit is synchronous so it reaches the broker before the
/// consumer leaves the group.
pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
}

impl KafkaConsumer {
    pub fn new(brokers: &str, group: &str, topics: &[String]) -> Result<Self, SourceError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|err| SourceError::Consumer {
                message: err.to_string(),
            })?;

        let topics = topics.iter().map(String::as_str).collect::<Vec<_>>();
        consumer
            .subscribe(&topics)
            .map_err(|err| SourceError::Consumer {
                message: err.to_string(),
            })?;

        info!(brokers, group, ?topics, "subscribed to kafka topics");

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

#[async_trait]
impl MessageConsumer for KafkaConsumer {
    async fn recv(&self) -> Result<Option<Message>, SourceError> {
        let message = self
            .consumer
            .recv()
            .await
            .map_err(|err| SourceError::Consumer {
                message: err.to_string(),
            })?;

        Ok(Some(Message {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: Bytes::copy_from_slice(message.payload().unwrap_or_default()),
        }))
    }

    async fn commit(
        &self,
        offsets: &[CommitOffset],
        kind: CommitKind,
    ) -> Result<(), SourceError> {
        let mut list = TopicPartitionList::new();
        for offset in offsets {
            list.add_partition_offset(&offset.topic, offset.partition, Offset::Offset(offset.offset))
                .map_err(|err| SourceError::Commit {
                    message: err.to_string(),
                })?;
        }

        let commit_err = |message: String| SourceError::Commit { message };
        match kind {
            CommitKind::Periodic => self
                .consumer
                .commit(&list, CommitMode::Async)
                .map_err(|err| commit_err(err.to_string())),
            CommitKind::Final => {
                let consumer = self.consumer.clone();
                tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
                    .await
                    .map_err(|err| commit_err(err.to_string()))?
                    .map_err(|err| commit_err(err.to_string()))
            }
        }
    }
}
