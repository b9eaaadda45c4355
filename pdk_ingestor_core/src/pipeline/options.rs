use std::{path::PathBuf, time::Duration};

use crate::{
    batcher::BatcherOptions,
    error::{ConfigError, InvalidOptionSnafu},
};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Decode and map workers.
    pub concurrency: usize,
    /// Frames queued ahead of the workers, split evenly across them.
    pub buffer_size: usize,
    /// Records admitted before the pipeline stops reading. 0 is unlimited.
    pub max_msgs: u64,
    pub batcher: BatcherOptions,
    pub commit_interval: Duration,
    /// Time given to the pipeline to drain once it is cancelled.
    pub shutdown_timeout: Duration,
    pub dead_letter_file: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            buffer_size: 1_000_000,
            max_msgs: 0,
            batcher: BatcherOptions::default(),
            commit_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
            dead_letter_file: None,
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |name: &'static str, value: usize| {
            if value == 0 {
                return InvalidOptionSnafu {
                    name,
                    message: "must be greater than 0",
                }
                .fail();
            }
            Ok(())
        };

        positive("concurrency", self.concurrency)?;
        positive("buffer-size", self.buffer_size)?;
        positive("batch-size", self.batcher.batch_size)?;
        positive("sink-concurrency", self.batcher.sink_concurrency)?;

        if self.batcher.flush_interval.is_zero() {
            return InvalidOptionSnafu {
                name: "flush-interval-ms",
                message: "must be greater than 0",
            }
            .fail();
        }

        if self.commit_interval.is_zero() {
            return InvalidOptionSnafu {
                name: "commit-interval-ms",
                message: "must be greater than 0",
            }
            .fail();
        }

        Ok(())
    }

    /// Capacity of the frame queue of each worker.
    pub fn worker_capacity(&self) -> usize {
        (self.buffer_size / self.concurrency.max(1)).max(1)
    }
}
