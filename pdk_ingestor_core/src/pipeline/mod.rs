//! Pipeline orchestration.
//!
//! The source is read on the calling task. Frames are queued to a pool of
//! workers that decode them, map their records and send the mutations to the
//! per-field batchers. Frames of a bus partition always go to the same worker.
//! Offsets of bus sources are committed periodically and once more when the
//! pipeline drained.
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    batcher::{Batchers, DeadLetterFile},
    decoder::Decoder,
    error::{PipelineError, Result},
    mapper::Mapper,
    metrics::{PipelineMetrics, PipelineReport},
    sink::Sink,
    source::{Frame, OffsetCommitter, Source},
};

mod options;
mod worker;

pub use self::options::PipelineOptions;
use self::worker::{Admission, Worker};

pub struct Pipeline {
    source: Source,
    decoder: Arc<Decoder>,
    mapper: Arc<Mapper>,
    sink: Arc<dyn Sink>,
    options: PipelineOptions,
    metrics: Arc<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(
        source: impl Into<Source>,
        decoder: impl Into<Decoder>,
        mapper: Mapper,
        sink: Arc<dyn Sink>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source: source.into(),
            decoder: Arc::new(decoder.into()),
            mapper: Arc::new(mapper),
            sink,
            options,
            metrics: Arc::new(PipelineMetrics::default()),
        }
    }

    /// Counters of the run, updated while it progresses.
    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Runs the pipeline until the source is exhausted, the record cap is
    /// reached or `ct` is cancelled.
    pub async fn run(self, ct: CancellationToken) -> Result<PipelineReport> {
        let Pipeline {
            mut source,
            decoder,
            mapper,
            sink,
            options,
            metrics,
        } = self;

        options.validate()?;

        let dead_letter = match &options.dead_letter_file {
            Some(path) => Some(DeadLetterFile::open(path).await?),
            None => None,
        };

        info!(
            concurrency = options.concurrency,
            batch_size = options.batcher.batch_size,
            max_msgs = options.max_msgs,
            "starting pipeline"
        );

        let batchers = Arc::new(Batchers::new(
            sink,
            options.batcher.clone(),
            metrics.clone(),
            dead_letter,
            ct.clone(),
        ));
        let admission = Arc::new(Admission::new(options.max_msgs));
        let fail_on_read_error = match &source {
            Source::Urls(source) => source.require_all(),
            Source::Bus(_) => false,
        };

        let mut senders = Vec::with_capacity(options.concurrency);
        let mut workers = JoinSet::new();
        for _ in 0..options.concurrency {
            let (tx, rx) = mpsc::channel(options.worker_capacity());
            senders.push(tx);
            let worker = Worker {
                decoder: decoder.clone(),
                mapper: mapper.clone(),
                batchers: batchers.clone(),
                metrics: metrics.clone(),
                admission: admission.clone(),
                fail_on_read_error,
                ct: ct.clone(),
            };
            workers.spawn(worker.run(rx));
        }

        let committer = source.committer();
        let stop_committer = CancellationToken::new();
        let commit_task = committer.clone().map(|committer| {
            tokio::spawn(run_committer(
                committer,
                metrics.clone(),
                options.commit_interval,
                stop_committer.clone(),
            ))
        });

        let source_result = feed(&mut source, senders, &metrics, &admission, &ct).await;

        let drain = async {
            let mut result = Ok(());
            while let Some(joined) = workers.join_next().await {
                let outcome = joined
                    .map_err(|source| PipelineError::Task { source })
                    .and_then(|outcome| outcome);
                if let Err(err) = outcome {
                    warn!(error = %err, "worker failed");
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
            batchers.close().await;
            result
        };

        let drained = tokio::select! {
            result = drain => result,
            _ = shutdown_deadline(&ct, options.shutdown_timeout) => {
                Err(PipelineError::ShutdownTimeout {
                    timeout_ms: options.shutdown_timeout.as_millis(),
                })
            }
        };

        stop_committer.cancel();
        if let Some(task) = commit_task {
            task.await.map_err(|source| PipelineError::Task { source })?;
        }
        if let Some(committer) = &committer {
            if let Err(err) = committer.commit_final(&metrics).await {
                warn!(error = %err, "failed to commit offsets");
            }
            let pending = committer.tracker().pending();
            if pending > 0 {
                debug!(pending, "messages left uncommitted");
            }
        }

        source_result?;
        drained?;

        let report = metrics.report();
        info!(
            frames = report.frames,
            records = report.records,
            malformed_records = report.malformed_records,
            mapping_errors = report.mapping_errors,
            mutations = report.mutations,
            batches_applied = report.batches_applied,
            batches_dead_lettered = report.batches_dead_lettered,
            offsets_committed = report.offsets_committed,
            "pipeline finished"
        );

        Ok(report)
    }
}

/// Reads frames until the source is exhausted, the record cap is reached or
/// the pipeline is cancelled. Closes the worker queues on return.
async fn feed(
    source: &mut Source,
    senders: Vec<mpsc::Sender<Frame>>,
    metrics: &PipelineMetrics,
    admission: &Admission,
    ct: &CancellationToken,
) -> Result<()> {
    let mut next_worker = 0;

    loop {
        let frame = tokio::select! {
            biased;
            _ = ct.cancelled() => {
                debug!("pipeline cancelled, no longer reading frames");
                return Ok(());
            }
            _ = admission.exhausted() => {
                info!("record cap reached, no longer reading frames");
                return Ok(());
            }
            frame = source.next_frame(metrics) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(source) => return Err(PipelineError::Source { source }),
        };
        metrics.frames.incr();

        let worker = match frame.origin.partition() {
            Some(partition) => {
                let mut hasher = DefaultHasher::new();
                partition.hash(&mut hasher);
                (hasher.finish() % senders.len() as u64) as usize
            }
            None => {
                next_worker = (next_worker + 1) % senders.len();
                next_worker
            }
        };

        tokio::select! {
            biased;
            _ = ct.cancelled() => return Ok(()),
            sent = senders[worker].send(frame) => {
                if sent.is_err() {
                    debug!("worker stopped, no longer reading frames");
                    return Ok(());
                }
            }
        }
    }
}

async fn run_committer(
    committer: OffsetCommitter,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = committer.commit(&metrics).await {
                    warn!(error = %err, "failed to commit offsets");
                }
            }
        }
    }
}

/// Completes `timeout` after `ct` is cancelled.
async fn shutdown_deadline(ct: &CancellationToken, timeout: Duration) {
    ct.cancelled().await;
    tokio::time::sleep(timeout).await;
}
