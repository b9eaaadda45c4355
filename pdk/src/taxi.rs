use std::{path::PathBuf, sync::Arc};

use clap::Args;
use pdk_ingestor_core::{
    DelimitedDecoder, DelimitedOptions, FetchOptions, Header, Pipeline, UrlSource,
    decoder::delimited::positional_names, source::read_locators,
};
use pdk_schema::{SchemaDescriptor, taxi};
use snafu::ResultExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    args::{IndexArgs, PipelineArgs, finish},
    error::{InvalidArgumentSnafu, PipelineSnafu, Result, SchemaSnafu, SourceSnafu},
};

#[derive(Debug, Args)]
pub struct TaxiArgs {
    /// File listing one URL or path per line
    #[arg(long)]
    pub url_file: PathBuf,
    /// Files fetched in parallel
    #[arg(long, default_value_t = 8)]
    pub fetch_concurrency: usize,
    /// Read each file completely before decoding it
    #[arg(long)]
    pub use_read_all: bool,
    /// Fail if any file cannot be fetched
    #[arg(long)]
    pub require_all: bool,
    /// JSON field descriptor, the taxi trip columns if not set
    #[arg(long)]
    pub schema_file: Option<PathBuf>,
    /// Field delimiter
    #[arg(long, default_value_t = ',')]
    pub delimiter: char,
    /// Files have no header row
    #[arg(long)]
    pub no_header: bool,
    #[clap(flatten)]
    pub pipeline: PipelineArgs,
    #[clap(flatten)]
    pub index: IndexArgs,
}

impl TaxiArgs {
    pub async fn run(self, ct: CancellationToken) -> Result<()> {
        let delimiter = u8::try_from(self.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                InvalidArgumentSnafu {
                    name: "delimiter",
                    message: format!("{:?} is not an ASCII character", self.delimiter),
                }
                .build()
            })?;

        let (descriptor, header, default_key) = match &self.schema_file {
            Some(path) => {
                let descriptor = SchemaDescriptor::from_path(path).context(SchemaSnafu {})?;
                let header = if self.no_header {
                    Header::Positional {
                        names: positional_names(&descriptor),
                        skip_first_row: false,
                    }
                } else {
                    Header::FirstRow
                };
                (descriptor, header, None)
            }
            None => {
                let header = Header::Positional {
                    names: taxi::column_names(),
                    skip_first_row: !self.no_header,
                };
                (taxi::descriptor(), header, Some(taxi::primary_key_fields()))
            }
        };

        let mapper = self.index.mapper_or(default_key)?;

        let locators = read_locators(&self.url_file).await.context(SourceSnafu {})?;
        info!(locators = locators.len(), url_file = %self.url_file.display(), "loaded url file");

        let source = UrlSource::new(
            locators,
            FetchOptions {
                concurrency: self.fetch_concurrency,
                use_read_all: self.use_read_all,
                require_all: self.require_all,
                retry: self.pipeline.retry(),
            },
        );
        let decoder = DelimitedDecoder::new(
            Arc::new(descriptor),
            DelimitedOptions { delimiter, header },
        );

        let sink = self.index.sink(&mapper).await?;
        let report = Pipeline::new(source, decoder, mapper, sink, self.pipeline.options())
            .run(ct)
            .await
            .context(PipelineSnafu {})?;

        finish(report)
    }
}
