//! Fused decode and map workers.
use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use pdk_schema::SchemaDescriptor;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    batcher::{Batchers, TrackedMutation},
    decoder::{Decoder, DelimitedDecoder},
    error::{DecodeError, PipelineError, SourceError},
    mapper::Mapper,
    metrics::PipelineMetrics,
    record::Record,
    source::{AckHandle, Frame, Origin, Payload},
};

/// Caps the number of records admitted by the workers.
pub struct Admission {
    max: u64,
    admitted: AtomicU64,
    exhausted: CancellationToken,
}

pub struct Worker {
    pub decoder: Arc<Decoder>,
    pub mapper: Arc<Mapper>,
    pub batchers: Arc<Batchers>,
    pub metrics: Arc<PipelineMetrics>,
    pub admission: Arc<Admission>,
    /// Fail the run when a body cannot be read to the end.
    pub fail_on_read_error: bool,
    pub ct: CancellationToken,
}

/// How far the records of a frame went.
enum Progress {
    Continue,
    /// The remaining records of the frame are discarded.
    Stop,
}

impl Admission {
    /// Creates the gate. A `max` of 0 admits every record.
    pub fn new(max: u64) -> Self {
        Self {
            max,
            admitted: AtomicU64::new(0),
            exhausted: CancellationToken::new(),
        }
    }

    /// Admits one record, returning `false` once the cap is reached.
    pub fn try_admit(&self) -> bool {
        if self.max == 0 {
            return true;
        }

        let admitted = self
            .admitted
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max).then_some(n + 1)
            });

        match admitted {
            Ok(n) => {
                if n + 1 == self.max {
                    debug!(max = self.max, "record cap reached");
                    self.exhausted.cancel();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Completes once the cap is reached.
    pub async fn exhausted(&self) {
        self.exhausted.cancelled().await
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.is_cancelled()
    }
}

impl Worker {
    pub async fn run(self, mut rx: mpsc::Receiver<Frame>) -> Result<(), PipelineError> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.ct.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            self.process(frame).await?;
        }

        Ok(())
    }

    async fn process(&self, frame: Frame) -> Result<(), PipelineError> {
        let Frame {
            origin,
            payload,
            ack,
        } = frame;

        let complete = match (payload, self.decoder.streaming()) {
            (Payload::Stream(stream), Some(decoder)) => {
                self.process_stream(&origin, stream, decoder, &ack).await?
            }
            (payload, _) => {
                let bytes = match payload.into_bytes().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        self.read_failed(&origin, err)?;
                        return Ok(());
                    }
                };
                self.process_bytes(&origin, &bytes, &ack).await
            }
        };

        // A frame is acknowledged once every record was admitted and mapped,
        // and its mutations were applied.
        if let Some(ack) = ack.filter(|_| complete) {
            ack.ack();
        }

        Ok(())
    }

    async fn process_bytes(&self, origin: &Origin, bytes: &[u8], ack: &Option<AckHandle>) -> bool {
        let decoded = match self.decoder.decode(bytes).await {
            Ok(decoded) => decoded,
            Err(err) => {
                self.metrics.schema_errors.incr();
                warn!(%origin, error = %err, "failed to decode frame");
                return false;
            }
        };

        matches!(
            self.map_records(origin, &decoded.descriptor, decoded.records, ack)
                .await,
            Progress::Continue
        )
    }

    async fn process_stream(
        &self,
        origin: &Origin,
        mut stream: BoxStream<'static, io::Result<Bytes>>,
        decoder: &DelimitedDecoder,
        ack: &Option<AckHandle>,
    ) -> Result<bool, PipelineError> {
        let descriptor = decoder.descriptor();
        let mut frame = decoder.frame();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    self.read_failed(origin, err)?;
                    return Ok(false);
                }
            };

            let records = frame.push(&chunk);
            if let Progress::Stop = self.map_records(origin, descriptor, records, ack).await {
                return Ok(false);
            }
        }

        let records = frame.finish();
        Ok(matches!(
            self.map_records(origin, descriptor, records, ack).await,
            Progress::Continue
        ))
    }

    async fn map_records(
        &self,
        origin: &Origin,
        descriptor: &SchemaDescriptor,
        records: Vec<Result<Record, DecodeError>>,
        ack: &Option<AckHandle>,
    ) -> Progress {
        for record in records {
            if self.ct.is_cancelled() {
                return Progress::Stop;
            }

            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    self.metrics.malformed_records.incr();
                    debug!(%origin, error = %err, "skipping malformed record");
                    continue;
                }
            };

            if !self.admission.try_admit() {
                return Progress::Stop;
            }
            self.metrics.records.incr();

            let mapped = match self.mapper.map(descriptor, &record) {
                Ok(mapped) => mapped,
                Err(err) => {
                    self.metrics.malformed_records.incr();
                    debug!(%origin, error = %err, "skipping record without column");
                    continue;
                }
            };

            if !mapped.errors.is_empty() {
                self.metrics.mapping_errors.add(mapped.errors.len() as u64);
                for err in &mapped.errors {
                    debug!(%origin, column = %mapped.column, error = %err, "dropping field");
                }
            }

            self.metrics.mutations.add(mapped.mutations.len() as u64);
            for mutation in mapped.mutations {
                self.batchers
                    .send(TrackedMutation {
                        mutation,
                        ack: ack.clone(),
                    })
                    .await;
            }
        }

        Progress::Continue
    }

    fn read_failed(&self, origin: &Origin, err: io::Error) -> Result<(), PipelineError> {
        self.metrics.fetch_failures.incr();
        let err = SourceError::Io {
            locator: origin.to_string(),
            source: err,
        };

        if self.fail_on_read_error {
            return Err(PipelineError::Source { source: err });
        }

        warn!(error = %err, "failed to read frame, skipping the rest of it");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_cap() {
        let admission = Admission::new(2);
        assert!(admission.try_admit());
        assert!(!admission.is_exhausted());
        assert!(admission.try_admit());
        assert!(admission.is_exhausted());
        assert!(!admission.try_admit());
    }

    #[test]
    fn test_admission_unlimited() {
        let admission = Admission::new(0);
        for _ in 0..1000 {
            assert!(admission.try_admit());
        }
        assert!(!admission.is_exhausted());
    }
}
