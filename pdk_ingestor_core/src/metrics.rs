use std::sync::atomic::{AtomicU64, Ordering};

use pdk_observability::Counter;

/// Counters of a pipeline run.
///
/// Every counter is kept in process, for the run report, and exported as an
/// OpenTelemetry counter.
pub struct PipelineMetrics {
    pub frames: Stat,
    pub records: Stat,
    pub malformed_records: Stat,
    pub mapping_errors: Stat,
    pub schema_errors: Stat,
    pub mutations: Stat,
    pub batches_applied: Stat,
    pub batches_dead_lettered: Stat,
    pub sink_retries: Stat,
    pub fetch_failures: Stat,
    pub offsets_committed: Stat,
}

pub struct Stat {
    value: AtomicU64,
    counter: Counter<u64>,
}

/// Final counters of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub frames: u64,
    /// Records admitted by the decoders.
    pub records: u64,
    pub malformed_records: u64,
    pub mapping_errors: u64,
    pub schema_errors: u64,
    pub mutations: u64,
    pub batches_applied: u64,
    pub batches_dead_lettered: u64,
    pub sink_retries: u64,
    pub fetch_failures: u64,
    pub offsets_committed: u64,
}

impl Stat {
    fn new(counter: Counter<u64>) -> Self {
        Self {
            value: AtomicU64::new(0),
            counter,
        }
    }

    pub fn add(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.value.fetch_add(n, Ordering::Relaxed);
        self.counter.add(n, &[]);
    }

    pub fn incr(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

impl PipelineMetrics {
    pub fn report(&self) -> PipelineReport {
        PipelineReport {
            frames: self.frames.get(),
            records: self.records.get(),
            malformed_records: self.malformed_records.get(),
            mapping_errors: self.mapping_errors.get(),
            schema_errors: self.schema_errors.get(),
            mutations: self.mutations.get(),
            batches_applied: self.batches_applied.get(),
            batches_dead_lettered: self.batches_dead_lettered.get(),
            sink_retries: self.sink_retries.get(),
            fetch_failures: self.fetch_failures.get(),
            offsets_committed: self.offsets_committed.get(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        let meter = pdk_observability::meter("ingestion");
        let stat = |name: &'static str, unit: &'static str, description: &'static str| {
            Stat::new(
                meter
                    .u64_counter(name)
                    .with_unit(unit)
                    .with_description(description)
                    .build(),
            )
        };

        Self {
            frames: stat("pdk.frames", "{frame}", "frames read from the source"),
            records: stat("pdk.records", "{record}", "records admitted by the decoders"),
            malformed_records: stat(
                "pdk.records.malformed",
                "{record}",
                "records that could not be decoded or assigned a column",
            ),
            mapping_errors: stat(
                "pdk.mapping.errors",
                "{field}",
                "fields dropped by the mapper",
            ),
            schema_errors: stat(
                "pdk.schema.errors",
                "{frame}",
                "frames whose schema could not be resolved",
            ),
            mutations: stat("pdk.mutations", "{mutation}", "mutations sent to the batchers"),
            batches_applied: stat("pdk.batches.applied", "{batch}", "batches applied to the sink"),
            batches_dead_lettered: stat(
                "pdk.batches.dead_lettered",
                "{batch}",
                "batches given up after retries",
            ),
            sink_retries: stat("pdk.sink.retries", "{attempt}", "sink attempts that were retried"),
            fetch_failures: stat(
                "pdk.fetch.failures",
                "{locator}",
                "locators that could not be fetched",
            ),
            offsets_committed: stat(
                "pdk.offsets.committed",
                "{commit}",
                "partition offsets committed to the source",
            ),
        }
    }
}
