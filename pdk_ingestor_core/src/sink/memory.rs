//! In-memory sink with set semantics.
//!
//! Used by tests and dry runs. Failures can be injected and the sink can be
//! blocked to hold back the pipeline. A discarding sink only counts what it
//! applies, so long dry runs keep a constant footprint.
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{
    error::SinkError,
    mutation::{Batch, Bit, Ref},
    sink::Sink,
};

/// The state of the index, as seen by the in-memory sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    /// Set bits, by field, row and column.
    pub bits: BTreeSet<(String, Ref, Ref)>,
    /// Integer values, by field and column.
    pub values: BTreeMap<(String, Ref), i64>,
    /// Timestamps of set bits.
    pub timestamps: BTreeSet<(String, Ref, Ref, i64)>,
}

#[derive(Debug, Default)]
struct Inner {
    state: MemoryState,
    batches: Vec<Batch>,
    attempts: usize,
    applied: u64,
    failures: VecDeque<bool>,
}

#[derive(Debug)]
pub struct MemorySink {
    inner: Mutex<Inner>,
    blocked: watch::Sender<bool>,
    retain: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            inner: Mutex::default(),
            blocked: watch::Sender::new(false),
            retain: true,
        }
    }

    /// Creates a sink that counts applied mutations without keeping them.
    pub fn discarding() -> Self {
        Self {
            retain: false,
            ..Self::new()
        }
    }

    /// Fails the next `count` attempts with a retryable error.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures.extend(std::iter::repeat_n(true, count));
    }

    /// Fails the next attempt with a permanent error.
    pub fn reject_next(&self) {
        self.lock().failures.push_back(false);
    }

    /// Blocks every attempt until [`MemorySink::unblock`] is called.
    pub fn block(&self) {
        self.blocked.send_replace(true);
    }

    pub fn unblock(&self) {
        self.blocked.send_replace(false);
    }

    pub fn state(&self) -> MemoryState {
        self.lock().state.clone()
    }

    /// Batches applied so far, in order.
    pub fn batches(&self) -> Vec<Batch> {
        self.lock().batches.clone()
    }

    /// Mutations of successfully applied batches.
    pub fn applied(&self) -> u64 {
        self.lock().applied
    }

    /// Calls to `apply`, failed ones included.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    /// Returns `true` if the sink holds the given bit.
    pub fn contains(&self, field: &str, row: impl Into<Ref>, column: impl Into<Ref>) -> bool {
        self.lock()
            .state
            .bits
            .contains(&(field.to_string(), row.into(), column.into()))
    }

    /// Rows set in `field`, with their columns.
    pub fn rows(&self, field: &str) -> Vec<(Ref, Ref)> {
        self.lock()
            .state
            .bits
            .iter()
            .filter(|(f, _, _)| f == field)
            .map(|(_, row, column)| (row.clone(), column.clone()))
            .collect()
    }

    pub fn value(&self, field: &str, column: impl Into<Ref>) -> Option<i64> {
        self.lock()
            .state
            .values
            .get(&(field.to_string(), column.into()))
            .copied()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn apply(&self, batch: &Batch) -> Result<(), SinkError> {
        let mut blocked = self.blocked.subscribe();
        // The sender lives as long as the sink, the wait cannot fail.
        let _ = blocked.wait_for(|blocked| !*blocked).await;

        let mut inner = self.lock();
        inner.attempts += 1;

        if let Some(retryable) = inner.failures.pop_front() {
            return Err(if retryable {
                SinkError::Unavailable {
                    message: "injected failure".to_string(),
                }
            } else {
                SinkError::Rejected {
                    message: "injected rejection".to_string(),
                }
            });
        }

        inner.applied += batch.mutations.len() as u64;
        if !self.retain {
            return Ok(());
        }

        for mutation in &batch.mutations {
            let field = mutation.field.name.clone();
            match &mutation.bit {
                Bit::Row(row) => {
                    if let Some(ts) = mutation.timestamp {
                        inner.state.timestamps.insert((
                            field.clone(),
                            row.clone(),
                            mutation.column.clone(),
                            ts,
                        ));
                    }
                    inner
                        .state
                        .bits
                        .insert((field, row.clone(), mutation.column.clone()));
                }
                Bit::Value(value) => {
                    inner
                        .state
                        .values
                        .insert((field, mutation.column.clone()), *value);
                }
            }
        }
        inner.batches.push(batch.clone());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{FieldKind, FieldTarget, Mutation};

    fn batch() -> Batch {
        let field = FieldTarget::new("f", FieldKind::Set { keys: true });
        Batch {
            field: field.clone(),
            mutations: vec![Mutation {
                field,
                bit: Bit::Row(Ref::from("r")),
                column: Ref::Id(1),
                timestamp: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let sink = MemorySink::new();
        sink.apply(&batch()).await.unwrap();
        let first = sink.state();
        sink.apply(&batch()).await.unwrap();
        assert_eq!(sink.state(), first);
        assert!(sink.contains("f", "r", 1u64));
        assert_eq!(sink.batches().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let sink = MemorySink::new();
        sink.fail_next(1);
        sink.reject_next();

        let err = sink.apply(&batch()).await.unwrap_err();
        assert!(err.is_retryable());
        let err = sink.apply(&batch()).await.unwrap_err();
        assert!(!err.is_retryable());
        sink.apply(&batch()).await.unwrap();

        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_discarding_sink_keeps_nothing() {
        let sink = MemorySink::discarding();
        sink.fail_next(1);
        for _ in 0..100 {
            let _ = sink.apply(&batch()).await;
        }

        assert_eq!(sink.attempts(), 100);
        assert_eq!(sink.applied(), 99);
        assert!(sink.batches().is_empty());
        assert_eq!(sink.state(), MemoryState::default());
    }
}
