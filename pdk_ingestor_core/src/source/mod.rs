//! Frame sources.
//!
//! A source produces a lazy sequence of byte frames: the body of a locator, or
//! the payload of a bus message. Frames of bus messages carry an
//! acknowledgement handle that must be acknowledged once every mutation of
//! the message has been applied.
use std::{fmt, io};

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream::BoxStream};

use crate::{error::SourceError, metrics::PipelineMetrics};

mod bus;
#[cfg(feature = "kafka")]
mod kafka;
pub mod offsets;
mod url;

#[cfg(feature = "kafka")]
pub use self::kafka::KafkaConsumer;
pub use self::{
    bus::{BusSource, CommitKind, MemoryConsumer, Message, MessageConsumer, OffsetCommitter},
    offsets::{AckHandle, CommitOffset, OffsetTracker, TopicPartition},
    url::{FetchOptions, UrlSource, parse_locators, read_locators},
};

/// Where a frame comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    Locator(String),
    Message {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

/// The bytes of a frame.
pub enum Payload {
    Bytes(Bytes),
    /// A body that is still being read.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

pub struct Frame {
    pub origin: Origin,
    pub payload: Payload,
    /// Set for frames whose processing must be acknowledged.
    pub ack: Option<AckHandle>,
}

pub enum Source {
    Urls(UrlSource),
    Bus(BusSource),
}

impl Origin {
    pub fn message(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Origin::Message {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// The bus partition of the frame, used to route frames to workers.
    pub fn partition(&self) -> Option<(&str, i32)> {
        match self {
            Origin::Message {
                topic, partition, ..
            } => Some((topic, *partition)),
            Origin::Locator(_) => None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Locator(locator) => write!(f, "{locator}"),
            Origin::Message {
                topic,
                partition,
                offset,
            } => write!(f, "{topic}/{partition}@{offset}"),
        }
    }
}

impl Payload {
    /// Reads the whole payload.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(buffer.freeze())
            }
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("origin", &self.origin)
            .field("payload", &self.payload)
            .field("ack", &self.ack)
            .finish()
    }
}

impl Source {
    /// Returns the next frame, or `None` once the source is exhausted.
    ///
    /// Cancel safe.
    pub async fn next_frame(
        &mut self,
        metrics: &PipelineMetrics,
    ) -> Result<Option<Frame>, SourceError> {
        match self {
            Source::Urls(source) => source.next_frame(metrics).await,
            Source::Bus(source) => source.next_frame().await,
        }
    }

    /// The offset committer of bus sources.
    pub fn committer(&self) -> Option<OffsetCommitter> {
        match self {
            Source::Urls(_) => None,
            Source::Bus(source) => Some(source.committer()),
        }
    }
}

impl From<UrlSource> for Source {
    fn from(source: UrlSource) -> Self {
        Source::Urls(source)
    }
}

impl From<BusSource> for Source {
    fn from(source: BusSource) -> Self {
        Source::Bus(source)
    }
}
