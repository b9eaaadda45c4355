use std::sync::Arc;

use clap::Args;
use pdk_ingestor_core::{AvroDecoder, BusSource, MessageConsumer, Pipeline};
use pdk_registry::{HttpSchemaRegistry, SchemaCache};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    args::{IndexArgs, PipelineArgs, finish},
    error::{PipelineSnafu, Result},
};

#[derive(Debug, Args)]
pub struct KafkaArgs {
    /// Topics to consume
    #[arg(long, value_delimiter = ',', required = true)]
    pub topics: Vec<String>,
    /// Kafka bootstrap servers
    #[arg(long, default_value = "localhost:9092")]
    pub brokers: String,
    /// Consumer group
    #[arg(long, default_value = "pdk")]
    pub group: String,
    /// Schema registry URL
    #[arg(long, default_value = "http://localhost:8081")]
    pub registry_url: String,
    #[clap(flatten)]
    pub pipeline: PipelineArgs,
    #[clap(flatten)]
    pub index: IndexArgs,
}

impl KafkaArgs {
    pub async fn run(self, ct: CancellationToken) -> Result<()> {
        let mapper = self.index.mapper()?;
        let consumer = self.consumer()?;

        let registry = HttpSchemaRegistry::new(&self.registry_url);
        let decoder = AvroDecoder::new(SchemaCache::new(Arc::new(registry)));
        info!(registry = %self.registry_url, topics = ?self.topics, "consuming avro messages");

        let source = BusSource::new(consumer).with_retry(self.pipeline.retry());
        let sink = self.index.sink(&mapper).await?;
        let report = Pipeline::new(source, decoder, mapper, sink, self.pipeline.options())
            .run(ct)
            .await
            .context(PipelineSnafu {})?;

        finish(report)
    }

    #[cfg(feature = "kafka")]
    fn consumer(&self) -> Result<Arc<dyn MessageConsumer>> {
        use pdk_ingestor_core::source::KafkaConsumer;

        use crate::error::SourceSnafu;

        let consumer = KafkaConsumer::new(&self.brokers, &self.group, &self.topics)
            .context(SourceSnafu {})?;
        Ok(Arc::new(consumer))
    }

    #[cfg(not(feature = "kafka"))]
    fn consumer(&self) -> Result<Arc<dyn MessageConsumer>> {
        crate::error::InvalidArgumentSnafu {
            name: "brokers",
            message: "pdk was built without kafka support",
        }
        .fail()
    }
}
