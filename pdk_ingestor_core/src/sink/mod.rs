//! Sinks apply batches to the index.
use async_trait::async_trait;

use crate::{error::SinkError, mutation::Batch};

pub mod memory;

pub use self::memory::MemorySink;

/// Applies batches of mutations.
///
/// A batch either applies entirely or the call fails. Batches may be applied
/// again after a failure, so applying the same mutation twice must leave the
/// index unchanged.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn apply(&self, batch: &Batch) -> Result<(), SinkError>;
}
