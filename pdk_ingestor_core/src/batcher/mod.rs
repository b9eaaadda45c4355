//! Per-field batchers.
//!
//! Mutations are routed to one task per target field. A task collects
//! mutations into a batch and hands it to the sink when the batch is full,
//! when the flush interval elapses since its first mutation, or when its
//! channel closes. Failed batches are retried with backoff and dead-lettered
//! once the retry budget is spent.
use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{
    sync::{Semaphore, mpsc},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, warn};

use crate::{
    error::SinkError,
    metrics::PipelineMetrics,
    mutation::{Batch, FieldTarget, Mutation},
    retry::RetryPolicy,
    sink::Sink,
    source::AckHandle,
};

mod dead_letter;

pub use self::dead_letter::DeadLetterFile;

const MAX_CHANNEL_CAPACITY: usize = 65_536;

/// A mutation together with the acknowledgement of the message it comes from.
#[derive(Debug)]
pub struct TrackedMutation {
    pub mutation: Mutation,
    pub ack: Option<AckHandle>,
}

#[derive(Debug, Clone)]
pub struct BatcherOptions {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    /// Concurrent sink calls, across all fields.
    pub sink_concurrency: usize,
    /// Deadline of the last attempt made on a batch once shutdown begins.
    pub shutdown_flush_timeout: Duration,
}

/// The batchers of a pipeline run.
pub struct Batchers {
    senders: DashMap<FieldTarget, mpsc::Sender<TrackedMutation>>,
    tasks: TaskTracker,
    shared: Arc<Shared>,
}

struct Shared {
    sink: Arc<dyn Sink>,
    permits: Semaphore,
    options: BatcherOptions,
    metrics: Arc<PipelineMetrics>,
    dead_letter: Option<DeadLetterFile>,
    ct: CancellationToken,
}

enum DeliveryError {
    Sink(SinkError),
    Shutdown,
}

impl Default for BatcherOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            flush_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            sink_concurrency: 4,
            shutdown_flush_timeout: Duration::from_secs(5),
        }
    }
}

impl BatcherOptions {
    /// Capacity of the channel of each field.
    pub fn channel_capacity(&self) -> usize {
        self.batch_size
            .saturating_mul(2)
            .clamp(1, MAX_CHANNEL_CAPACITY)
    }
}

impl Batchers {
    pub fn new(
        sink: Arc<dyn Sink>,
        options: BatcherOptions,
        metrics: Arc<PipelineMetrics>,
        dead_letter: Option<DeadLetterFile>,
        ct: CancellationToken,
    ) -> Self {
        let permits = Semaphore::new(options.sink_concurrency.max(1));
        Self {
            senders: DashMap::new(),
            tasks: TaskTracker::new(),
            shared: Arc::new(Shared {
                sink,
                permits,
                options,
                metrics,
                dead_letter,
                ct,
            }),
        }
    }

    /// Sends a mutation to the batcher of its field, waiting while the
    /// batcher is full.
    ///
    /// The mutation is dropped, failing its acknowledgement, if the batcher
    /// already stopped.
    pub async fn send(&self, tracked: TrackedMutation) {
        let sender = self.sender(&tracked.mutation.field);
        if sender.send(tracked).await.is_err() {
            debug!("batcher stopped, dropping mutation");
        }
    }

    /// Closes every batcher and waits until their last batch is delivered.
    pub async fn close(&self) {
        self.senders.clear();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Number of fields that received mutations.
    pub fn fields(&self) -> usize {
        self.senders.len()
    }

    fn sender(&self, field: &FieldTarget) -> mpsc::Sender<TrackedMutation> {
        if let Some(sender) = self.senders.get(field) {
            return sender.clone();
        }

        self.senders
            .entry(field.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.shared.options.channel_capacity());
                debug!(%field, "starting batcher");
                self.tasks
                    .spawn(run_batcher(field.clone(), rx, self.shared.clone()));
                tx
            })
            .clone()
    }
}

async fn run_batcher(
    field: FieldTarget,
    mut rx: mpsc::Receiver<TrackedMutation>,
    shared: Arc<Shared>,
) {
    let batch_size = shared.options.batch_size.max(1);
    let mut pending = Vec::with_capacity(batch_size);
    let flush_timer = tokio::time::sleep(shared.options.flush_interval);
    tokio::pin!(flush_timer);

    loop {
        tokio::select! {
            biased;
            _ = shared.ct.cancelled() => {
                rx.close();
                if !pending.is_empty() {
                    shared.flush_before_shutdown(&field, std::mem::take(&mut pending)).await;
                }
                break;
            }
            _ = &mut flush_timer, if !pending.is_empty() => {
                shared.deliver(&field, std::mem::take(&mut pending)).await;
            }
            tracked = rx.recv() => {
                let Some(tracked) = tracked else {
                    if !pending.is_empty() {
                        shared.deliver(&field, std::mem::take(&mut pending)).await;
                    }
                    break;
                };

                if pending.is_empty() {
                    flush_timer
                        .as_mut()
                        .reset(Instant::now() + shared.options.flush_interval);
                }
                pending.push(tracked);

                if pending.len() >= batch_size {
                    shared.deliver(&field, std::mem::take(&mut pending)).await;
                }
            }
        }
    }

    debug!(%field, "batcher stopped");
}

impl Shared {
    async fn deliver(&self, field: &FieldTarget, pending: Vec<TrackedMutation>) {
        let (batch, acks) = into_batch(field, pending);
        match self.apply_with_retry(&batch).await {
            Ok(()) => self.applied(&batch, acks),
            Err(DeliveryError::Sink(err)) => self.dead_letter(&batch, err).await,
            Err(DeliveryError::Shutdown) => self.abandoned(&batch),
        }
    }

    async fn flush_before_shutdown(&self, field: &FieldTarget, pending: Vec<TrackedMutation>) {
        let (batch, acks) = into_batch(field, pending);
        match self.apply_before_shutdown(&batch).await {
            Ok(()) => self.applied(&batch, acks),
            Err(_) => self.abandoned(&batch),
        }
    }

    async fn apply_with_retry(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let mut attempts = 0;
        loop {
            attempts += 1;

            let result = tokio::select! {
                result = self.apply_once(batch) => result,
                _ = self.ct.cancelled() => {
                    return self.apply_before_shutdown(batch).await;
                }
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if !err.is_retryable() || !self.options.retry.should_retry(attempts) {
                return Err(DeliveryError::Sink(err));
            }

            self.metrics.sink_retries.incr();
            let delay = self.options.retry.backoff(attempts);
            warn!(field = %batch.field, attempts, error = %err, ?delay, "failed to apply batch, retrying");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.ct.cancelled() => {
                    return self.apply_before_shutdown(batch).await;
                }
            }
        }
    }

    /// Makes a single attempt, bounded by the shutdown flush timeout.
    async fn apply_before_shutdown(&self, batch: &Batch) -> Result<(), DeliveryError> {
        match tokio::time::timeout(
            self.options.shutdown_flush_timeout,
            self.apply_once(batch),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(field = %batch.field, error = %err, "failed to apply batch during shutdown");
                Err(DeliveryError::Shutdown)
            }
            Err(_) => Err(DeliveryError::Shutdown),
        }
    }

    async fn apply_once(&self, batch: &Batch) -> Result<(), SinkError> {
        let Ok(_permit) = self.permits.acquire().await else {
            return Err(SinkError::Unavailable {
                message: "sink permits closed".to_string(),
            });
        };
        self.sink.apply(batch).await
    }

    fn applied(&self, batch: &Batch, acks: Vec<AckHandle>) {
        debug!(field = %batch.field, mutations = batch.len(), "applied batch");
        self.metrics.batches_applied.incr();
        for ack in acks {
            ack.ack();
        }
    }

    async fn dead_letter(&self, batch: &Batch, err: SinkError) {
        warn!(field = %batch.field, mutations = batch.len(), error = %err, "dead-lettering batch");
        self.metrics.batches_dead_lettered.incr();
        if let Some(file) = &self.dead_letter {
            file.append(batch, &err).await;
        }
    }

    fn abandoned(&self, batch: &Batch) {
        warn!(field = %batch.field, mutations = batch.len(), "batch not applied before shutdown");
    }
}

fn into_batch(field: &FieldTarget, pending: Vec<TrackedMutation>) -> (Batch, Vec<AckHandle>) {
    let mut batch = Batch::new(field.clone());
    batch.mutations.reserve(pending.len());
    let mut acks = Vec::with_capacity(pending.len());
    for tracked in pending {
        batch.mutations.push(tracked.mutation);
        acks.extend(tracked.ack);
    }
    (batch, acks)
}
